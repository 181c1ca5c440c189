pub mod count_tokens;
pub mod generate_content;
pub mod get_model;
pub mod list_models;
pub mod stream_content;
pub mod types;

pub use count_tokens::*;
pub use generate_content::*;
pub use get_model::*;
pub use list_models::*;
pub use stream_content::*;
pub use types::*;

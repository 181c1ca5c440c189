pub mod count_tokens;
pub mod create_message;
pub mod error;
pub mod get_model;
pub mod list_models;
pub mod types;

pub use count_tokens::*;
pub use create_message::*;
pub use error::*;
pub use get_model::*;
pub use list_models::*;
pub use types::*;

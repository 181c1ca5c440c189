pub mod cancel_response;
pub mod compact_response;
pub mod count_tokens;
pub mod create_chat_completions;
pub mod create_response;
pub mod delete_response;
pub mod get_model;
pub mod get_response;
pub mod list_input_items;
pub mod list_models;
pub mod list_response_items;
pub mod trace_summarize;
pub mod types;

pub use cancel_response::*;
pub use compact_response::*;
pub use count_tokens::*;
pub use create_chat_completions::*;
pub use create_response::*;
pub use delete_response::*;
pub use get_model::*;
pub use get_response::*;
pub use list_input_items::*;
pub use list_models::*;
pub use list_response_items::*;
pub use trace_summarize::*;
pub use types::*;

pub mod claude2gemini;
pub mod claude2openai_chat_completions;
pub mod claude2openai_response;
pub mod gemini2claude;
pub mod gemini2openai_chat_completions;
pub mod gemini2openai_response;
pub mod openai_chat_completions2claude;
pub mod openai_chat_completions2gemini;
pub mod openai_chat_completions2openai_response;
pub mod openai_response2claude;
pub mod openai_response2gemini;
pub mod openai_response2openai_chat_completions;

pub use claude2gemini::*;
pub use claude2openai_chat_completions::*;
pub use claude2openai_response::*;
pub use gemini2claude::*;
pub use gemini2openai_chat_completions::*;
pub use gemini2openai_response::*;
pub use openai_chat_completions2claude::*;
pub use openai_chat_completions2gemini::*;
pub use openai_chat_completions2openai_response::*;
pub use openai_response2claude::*;
pub use openai_response2gemini::*;
pub use openai_response2openai_chat_completions::*;

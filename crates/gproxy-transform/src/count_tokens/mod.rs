pub mod claude2gemini;
pub mod claude2openai;
pub mod gemini2claude;
pub mod gemini2openai;
pub mod openai2claude;
pub mod openai2gemini;

pub use claude2gemini::*;
pub use claude2openai::*;
pub use gemini2claude::*;
pub use gemini2openai::*;
pub use openai2claude::*;
pub use openai2gemini::*;

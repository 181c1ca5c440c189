pub mod aistudio;
pub mod antigravity;
pub mod claude;
pub mod claudecode;
pub mod codex;
pub mod custom;
pub mod deepseek;
pub mod geminicli;
pub mod http_client;
pub mod nvidia;
pub mod oauth_common;
pub mod openai;
pub mod vertex;
pub mod vertexexpress;

pub use aistudio::*;
pub use antigravity::*;
pub use claude::*;
pub use claudecode::*;
pub use codex::*;
pub use custom::*;
pub use deepseek::*;
pub use geminicli::*;
pub use http_client::*;
pub use nvidia::*;
pub use oauth_common::*;
pub use openai::*;
pub use vertex::*;
pub use vertexexpress::*;

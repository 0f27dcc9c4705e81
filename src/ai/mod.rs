pub mod client;
pub mod openai;
pub mod types;

pub use client::{LLMClient, TokenStream};
pub use openai::{OpenAiClient, OpenAiConfig};
pub use types::{ChatMessage, CompletionRequest, Role};

use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

use super::types::CompletionRequest;

/// Result type for LLM transport operations.
///
/// Failures are plain strings: the orchestrator turns every transport error
/// into a conversation message rather than aborting the run.
pub type Result<T> = std::result::Result<T, String>;

/// A stream of assistant content fragments, in generation order.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Trait for LLM transports.
///
/// Implementations produce the assistant message as a token stream; the
/// caller accumulates fragments into the full response and decides when to
/// stop consuming (e.g. on cancellation, keeping what was received).
#[async_trait]
pub trait LLMClient: Send + Sync {
    /// Start a streaming completion for the given request.
    async fn stream_completion(&self, request: CompletionRequest) -> Result<TokenStream>;

    /// Transport name for logging.
    fn client_name(&self) -> &str;
}

use async_trait::async_trait;

use crate::error::Result;

// =============================================================================
// ChatModel Trait
// =============================================================================

/// Dyn-compatible single-turn chat completion.
///
/// Implemented by [`crate::Claude`] and [`crate::OpenAi`]. Each call issues
/// exactly one HTTP request; retry and timeout policy belong to the caller.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Send a system prompt and one user message, return the text reply.
    async fn chat_completion(&self, system: &str, user: &str) -> Result<String>;

    /// Model identifier, used for logging.
    fn model_name(&self) -> &str;
}

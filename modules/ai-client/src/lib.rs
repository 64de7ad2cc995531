//! Provider-agnostic chat-completion client.
//!
//! Two providers share one call surface: [`Claude`] (Anthropic Messages API)
//! and [`OpenAi`] (any OpenAI-compatible `/chat/completions` endpoint, which
//! also covers OpenRouter and local gateways via `with_base_url`).
//!
//! Callers that only need "system + user → text" depend on the [`ChatModel`]
//! trait and receive an `Arc<dyn ChatModel>`.

pub mod claude;
pub mod error;
pub mod openai;
pub mod traits;
pub mod util;

pub use claude::Claude;
pub use error::{AiError, Result};
pub use openai::OpenAi;
pub use traits::ChatModel;
pub use util::{strip_code_blocks, truncate_to_char_boundary};

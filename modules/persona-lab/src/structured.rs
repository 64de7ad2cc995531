//! Parse JSON out of model output, with at most one repair round-trip.

use ai_client::{strip_code_blocks, truncate_to_char_boundary};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, warn};

use crate::traits::Repairer;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Malformed structured output: {error} (input: {preview})")]
    Malformed { error: String, preview: String },

    #[error("Repair failed: {0}")]
    RepairFailed(String),

    #[error("Still malformed after repair: {0}")]
    StillMalformed(String),
}

fn parse_once<T: DeserializeOwned>(text: &str) -> Result<T, serde_json::Error> {
    let stripped = strip_code_blocks(text);
    match serde_json::from_str(stripped) {
        Ok(value) => Ok(value),
        Err(e) => match embedded_json(stripped) {
            Some(inner) => serde_json::from_str(inner).map_err(|_| e),
            None => Err(e),
        },
    }
}

/// The outermost `{...}` or `[...]` span, for replies that wrap JSON in prose.
fn embedded_json(text: &str) -> Option<&str> {
    let start = text.find(['{', '['])?;
    let close = if text[start..].starts_with('{') { '}' } else { ']' };
    let end = text.rfind(close)?;
    (end > start).then(|| &text[start..=end])
}

/// Deserialize `text` as `T`.
///
/// Code fences are stripped first. If parsing fails and a repairer is given,
/// the repairer is called exactly once and its output parsed; a second
/// failure is final.
pub async fn parse_structured<T: DeserializeOwned>(
    text: &str,
    repairer: Option<&dyn Repairer>,
) -> Result<T, ParseError> {
    let first_error = match parse_once(text) {
        Ok(value) => return Ok(value),
        Err(e) => e,
    };

    let Some(repairer) = repairer else {
        return Err(ParseError::Malformed {
            error: first_error.to_string(),
            preview: truncate_to_char_boundary(text.trim(), 120).to_string(),
        });
    };

    debug!(error = %first_error, "Structured output malformed, attempting repair");

    let repaired = repairer
        .repair(text)
        .await
        .map_err(|e| ParseError::RepairFailed(e.to_string()))?;

    parse_once(&repaired).map_err(|e| {
        warn!(error = %e, "Structured output still malformed after repair");
        ParseError::StillMalformed(e.to_string())
    })
}

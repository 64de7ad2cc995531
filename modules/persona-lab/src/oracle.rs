//! Oracle client. One judging call: shown a numbered feed of items, a
//! persona picks exactly one.

use std::collections::BTreeSet;
use std::sync::{Arc, LazyLock};

use ai_client::{AiError, ChatModel};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::types::Persona;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OracleError {
    /// Transport failure, timeout or rate limit. The caller may retry.
    #[error("Oracle unavailable: {0}")]
    Unavailable(String),

    /// The answer did not encode exactly one in-range position.
    #[error("Ambiguous oracle response: {0}")]
    AmbiguousResponse(String),

    /// The request itself was unusable (too few items, empty persona, or the
    /// provider rejected it outright). Retrying cannot help.
    #[error("Invalid oracle request: {0}")]
    InvalidRequest(String),
}

impl OracleError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, OracleError::Unavailable(_))
    }
}

/// The judging capability. One call to `judge` is one external judgement;
/// implementations never retry internally.
#[async_trait]
pub trait Oracle: Send + Sync {
    /// Returns the 1-based position of the chosen item.
    async fn judge(&self, display: &[String], persona: &Persona) -> Result<usize, OracleError>;
}

/// Reject requests that cannot produce a meaningful judgement.
pub fn validate_request(display: &[String], persona: &Persona) -> Result<(), OracleError> {
    if display.len() < 2 {
        return Err(OracleError::InvalidRequest(format!(
            "need at least 2 items to compare, got {}",
            display.len()
        )));
    }
    if persona.as_str().trim().is_empty() {
        return Err(OracleError::InvalidRequest("persona is empty".to_string()));
    }
    Ok(())
}

// =============================================================================
// Response parsing
// =============================================================================

/// How strictly a free-text answer is mapped to a position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseParsing {
    /// Exactly one distinct double-quoted number, e.g. `"3"`.
    #[default]
    Strict,
    /// A quoted number if there is exactly one; otherwise exactly one distinct
    /// in-range number anywhere in the text.
    Lenient,
}

/// A quoted span. Spans are matched left to right in open/close pairs, so the
/// text between two quoted words is never read as a span of its own.
static QUOTED_SPAN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"["“”]([^"“”]*)["“”]"#).expect("valid regex"));
static BARE_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d+)\b").expect("valid regex"));

fn distinct_numbers(re: &Regex, text: &str) -> BTreeSet<usize> {
    re.captures_iter(text)
        .filter_map(|c| c.get(1)?.as_str().parse::<usize>().ok())
        .collect()
}

/// Numbers whose quoted span holds nothing but digits.
fn quoted_numbers(text: &str) -> BTreeSet<usize> {
    QUOTED_SPAN
        .captures_iter(text)
        .filter_map(|c| {
            let span = c.get(1)?.as_str().trim();
            if span.is_empty() || !span.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            span.parse::<usize>().ok()
        })
        .collect()
}

/// Map an oracle answer to a 1-based position in a display of `len` items.
pub fn parse_selection(
    response: &str,
    len: usize,
    parsing: ResponseParsing,
) -> Result<usize, OracleError> {
    let quoted = quoted_numbers(response);

    if quoted.len() == 1 {
        let position = *quoted.iter().next().unwrap_or(&0);
        if (1..=len).contains(&position) {
            return Ok(position);
        }
        if parsing == ResponseParsing::Strict {
            return Err(OracleError::AmbiguousResponse(format!(
                "position {position} out of range 1..={len}"
            )));
        }
    }

    match parsing {
        ResponseParsing::Strict => Err(OracleError::AmbiguousResponse(if quoted.is_empty() {
            format!("no quoted position in {:?}", preview(response))
        } else {
            format!("several quoted positions in {:?}", preview(response))
        })),
        ResponseParsing::Lenient => {
            let in_range: Vec<usize> = distinct_numbers(&BARE_NUMBER, response)
                .into_iter()
                .filter(|p| (1..=len).contains(p))
                .collect();
            match in_range.as_slice() {
                [position] => Ok(*position),
                [] => Err(OracleError::AmbiguousResponse(format!(
                    "no in-range position in {:?}",
                    preview(response)
                ))),
                _ => Err(OracleError::AmbiguousResponse(format!(
                    "several in-range positions in {:?}",
                    preview(response)
                ))),
            }
        }
    }
}

fn preview(response: &str) -> &str {
    ai_client::truncate_to_char_boundary(response.trim(), 80)
}

// =============================================================================
// LlmOracle
// =============================================================================

/// Oracle backed by a chat model role-playing the persona in front of a feed.
pub struct LlmOracle {
    model: Arc<dyn ChatModel>,
    parsing: ResponseParsing,
}

impl LlmOracle {
    pub fn new(model: Arc<dyn ChatModel>, parsing: ResponseParsing) -> Self {
        Self { model, parsing }
    }
}

pub(crate) fn render_feed(display: &[String]) -> String {
    display
        .iter()
        .enumerate()
        .map(|(i, item)| format!("{}. {}", i + 1, item))
        .collect::<Vec<_>>()
        .join("\n")
}

fn judge_system(persona: &Persona) -> String {
    format!(
        "You are {persona}\n\
         Stay in character. You are browsing your feed and decide what to open \
         purely on what you see listed."
    )
}

fn judge_user(display: &[String]) -> String {
    format!(
        "These items are showing in your feed:\n\
         <items>\n{}\n</items>\n\n\
         Which one do you click? Respond with only one number inside \"\", nothing else.\n\
         e.g. \"<selected_item_number>\"",
        render_feed(display)
    )
}

fn map_transport_error(e: AiError) -> OracleError {
    match e {
        e if e.is_transient() => OracleError::Unavailable(e.to_string()),
        AiError::EmptyResponse(_) | AiError::Parse(_) => {
            OracleError::AmbiguousResponse(e.to_string())
        }
        e => OracleError::InvalidRequest(e.to_string()),
    }
}

#[async_trait]
impl Oracle for LlmOracle {
    async fn judge(&self, display: &[String], persona: &Persona) -> Result<usize, OracleError> {
        validate_request(display, persona)?;

        let response = self
            .model
            .chat_completion(&judge_system(persona), &judge_user(display))
            .await
            .map_err(map_transport_error)?;

        let items = display.len();
        debug!(
            model = self.model.model_name(),
            items,
            response = preview(&response),
            "Oracle answered"
        );

        parse_selection(&response, display.len(), self.parsing)
    }
}

use thiserror::Error;

pub type Result<T> = std::result::Result<T, AiError>;

#[derive(Debug, Error)]
pub enum AiError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Empty response from {0}")]
    EmptyResponse(&'static str),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl AiError {
    /// Whether a retry of the same request could plausibly succeed.
    ///
    /// Rate limits, request timeouts and 5xx responses are transient; auth
    /// failures, bad requests and unparseable bodies are not.
    pub fn is_transient(&self) -> bool {
        match self {
            AiError::Network(_) | AiError::Timeout(_) => true,
            AiError::Api { status, .. } => {
                matches!(*status, 408 | 409 | 429) || (500..=599).contains(status)
            }
            AiError::EmptyResponse(_) | AiError::Parse(_) | AiError::Config(_) => false,
        }
    }
}

impl From<reqwest::Error> for AiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AiError::Timeout(err.to_string())
        } else if err.is_decode() {
            AiError::Parse(err.to_string())
        } else {
            AiError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for AiError {
    fn from(err: serde_json::Error) -> Self {
        AiError::Parse(err.to_string())
    }
}

impl From<reqwest::header::InvalidHeaderValue> for AiError {
    fn from(err: reqwest::header::InvalidHeaderValue) -> Self {
        AiError::Config(format!("invalid header value: {err}"))
    }
}

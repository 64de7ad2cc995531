mod client;
pub(crate) mod types;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{AiError, Result};
use crate::traits::ChatModel;

use client::ClaudeClient;
use types::*;

// =============================================================================
// Claude Agent
// =============================================================================

#[derive(Clone)]
pub struct Claude {
    api_key: String,
    pub(crate) model: String,
    http: reqwest::Client,
    base_url: Option<String>,
    temperature: Option<f32>,
    max_tokens: u32,
    request_timeout: Option<Duration>,
}

impl Claude {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            http: reqwest::Client::new(),
            base_url: None,
            temperature: Some(0.0),
            max_tokens: 4096,
            request_timeout: None,
        }
    }

    pub fn from_env(model: impl Into<String>) -> Result<Self> {
        let api_key = std::env::var("ANTHROPIC_API_KEY").map_err(|_| {
            AiError::Config("ANTHROPIC_API_KEY environment variable not set".to_string())
        })?;
        Ok(Self::new(api_key, model))
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Sampling temperature. `None` leaves the provider default in place.
    pub fn with_temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub(crate) fn client(&self) -> ClaudeClient<'_> {
        let mut client = ClaudeClient::new(&self.api_key, &self.http);
        if let Some(ref url) = self.base_url {
            client = client.with_base_url(url);
        }
        if let Some(timeout) = self.request_timeout {
            client = client.with_timeout(timeout);
        }
        client
    }

    pub(crate) fn request(&self, system: &str, user: &str) -> ChatRequest {
        let request = ChatRequest::new(&self.model)
            .system(system)
            .message(WireMessage::user(user))
            .max_tokens(self.max_tokens);
        match self.temperature {
            Some(t) => request.temperature(t),
            None => request,
        }
    }
}

#[async_trait]
impl ChatModel for Claude {
    async fn chat_completion(&self, system: &str, user: &str) -> Result<String> {
        let request = self.request(system, user);

        let response = self.client().chat(&request).await?;

        response.text().ok_or(AiError::EmptyResponse("Claude"))
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

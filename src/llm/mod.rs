//! Text-generation collaborator interface.
//!
//! The pipeline treats generation as an opaque capability:
//! `generate(prompt, temperature) -> text`. The default implementation is a
//! client for OpenAI-compatible chat-completion APIs; tests substitute a
//! stub. Failures surface as stage execution errors and are retried by the
//! orchestrator.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::error::LlmError;

/// Opaque text-generation capability consumed by stages.
#[async_trait]
pub trait GenerationService: Send + Sync {
    /// Generates a completion for the prompt at the given temperature.
    async fn generate(&self, prompt: &str, temperature: f64) -> Result<String, LlmError>;
}

/// A message in a chat-completion conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Role of the sender ("system", "user", "assistant").
    pub role: String,
    /// Message content.
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Chat-completion request body.
#[derive(Debug, Clone, Serialize)]
struct CompletionRequest {
    model: String,
    messages: Vec<Message>,
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

/// A single generated choice.
#[derive(Debug, Clone, Deserialize)]
struct Choice {
    message: Message,
}

/// Chat-completion response body.
#[derive(Debug, Clone, Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

/// Client for OpenAI-compatible chat-completion APIs.
pub struct HttpGenerationClient {
    /// Base URL, e.g. `http://localhost:4000`.
    api_base: String,
    /// Optional bearer token.
    api_key: Option<String>,
    /// Model identifier sent with every request.
    model: String,
    http_client: Client,
}

impl HttpGenerationClient {
    /// Creates a client with explicit configuration.
    pub fn new(api_base: impl Into<String>, api_key: Option<String>, model: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
            api_key,
            model: model.into(),
            http_client: Client::builder()
                .timeout(Duration::from_secs(120))
                .build()
                .unwrap_or_default(),
        }
    }

    /// Creates a client from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `FLOWFORGE_API_BASE`: base URL for the API (required)
    /// - `FLOWFORGE_API_KEY`: optional bearer token
    /// - `FLOWFORGE_MODEL`: model identifier (default: `gpt-4o-mini`)
    ///
    /// # Errors
    ///
    /// Returns `LlmError::MissingApiBase` if the base URL is not set.
    pub fn from_env() -> Result<Self, LlmError> {
        let api_base = env::var("FLOWFORGE_API_BASE").map_err(|_| LlmError::MissingApiBase)?;
        let api_key = env::var("FLOWFORGE_API_KEY").ok();
        let model = env::var("FLOWFORGE_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
        Ok(Self::new(api_base, api_key, model))
    }

    fn completions_url(&self) -> String {
        format!("{}/v1/chat/completions", self.api_base.trim_end_matches('/'))
    }
}

#[async_trait]
impl GenerationService for HttpGenerationClient {
    async fn generate(&self, prompt: &str, temperature: f64) -> Result<String, LlmError> {
        let request = CompletionRequest {
            model: self.model.clone(),
            messages: vec![Message::user(prompt)],
            temperature,
            max_tokens: None,
        };

        let mut builder = self.http_client.post(self.completions_url()).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(LlmError::ApiError {
                code: status.as_u16(),
                message,
            });
        }

        let completion: CompletionResponse = response
            .json()
            .await
            .map_err(|e| LlmError::ParseError(e.to_string()))?;

        completion
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or(LlmError::EmptyCompletion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completions_url_normalizes_trailing_slash() {
        let a = HttpGenerationClient::new("http://localhost:4000", None, "m");
        let b = HttpGenerationClient::new("http://localhost:4000/", None, "m");
        assert_eq!(a.completions_url(), b.completions_url());
        assert_eq!(a.completions_url(), "http://localhost:4000/v1/chat/completions");
    }

    #[test]
    fn test_request_serializes_without_max_tokens() {
        let request = CompletionRequest {
            model: "m".into(),
            messages: vec![Message::user("hi")],
            temperature: 0.2,
            max_tokens: None,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("max_tokens").is_none());
        assert_eq!(json["messages"][0]["role"], "user");
    }

    #[test]
    fn test_from_env_requires_api_base() {
        // Only checked when the variable is genuinely absent.
        if env::var("FLOWFORGE_API_BASE").is_err() {
            assert!(matches!(
                HttpGenerationClient::from_env(),
                Err(LlmError::MissingApiBase)
            ));
        }
    }
}

//! Datetune LLM - the language model capability used by extraction and refinement
//!
//! - client: OpenAI-compatible (and Azure OpenAI) chat completions client
//!
//! Everything above this crate talks to the model through [`LanguageModel`],
//! so tests can swap in a stub without touching the network.

pub mod client;

pub use client::{ChatClient, ChatSettings};

use async_trait::async_trait;

/// Shape of the completion the caller expects back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFormat {
    /// Free-form text
    Text,
    /// Model is constrained to emit a single JSON object
    JsonObject,
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// The provider refused the request on content-policy grounds.
    /// Retrying the same input will not help.
    #[error("content policy violation: {0}")]
    ContentPolicy(String),
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },
    #[error("model returned no content")]
    EmptyResponse,
    #[error("unexpected response body: {0}")]
    Decode(String),
}

impl LlmError {
    pub fn is_content_policy(&self) -> bool {
        matches!(self, LlmError::ContentPolicy(_))
    }
}

/// A chat-style completion capability.
///
/// One handle is created per process and shared (`Arc<dyn LanguageModel>`)
/// between every worker that needs it.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        format: ResponseFormat,
    ) -> Result<String, LlmError>;
}

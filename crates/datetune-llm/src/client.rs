//! Chat completions client
//!
//! Speaks the OpenAI `/chat/completions` protocol. When an API version is
//! configured the request is routed the Azure OpenAI way instead: the model
//! name becomes the deployment in the path and the key travels in `api-key`.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::{LanguageModel, LlmError, ResponseFormat};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Markers providers put in error bodies and finish reasons for policy refusals
const CONTENT_POLICY_MARKERS: &[&str] = &["content_filter", "ResponsibleAIPolicyViolation"];

/// Connection settings for a chat completions endpoint
#[derive(Debug, Clone)]
pub struct ChatSettings {
    /// Base URL, e.g. `https://api.openai.com/v1` or `https://my-resource.openai.azure.com`
    pub api_url: String,
    pub api_key: Option<String>,
    /// Model name, or deployment name on Azure
    pub model: String,
    /// Azure `api-version` query parameter; `None` means plain OpenAI routing
    pub api_version: Option<String>,
    pub timeout: Duration,
    pub temperature: Option<f32>,
}

impl ChatSettings {
    pub fn new(api_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            api_key: None,
            model: model.into(),
            api_version: None,
            timeout: DEFAULT_TIMEOUT,
            temperature: None,
        }
    }

    fn is_azure(&self) -> bool {
        self.api_version.is_some()
    }

    fn completions_url(&self) -> String {
        let base = self.api_url.trim_end_matches('/');
        match &self.api_version {
            Some(version) => format!(
                "{}/openai/deployments/{}/chat/completions?api-version={}",
                base, self.model, version
            ),
            None => format!("{}/chat/completions", base),
        }
    }
}

#[derive(Clone)]
pub struct ChatClient {
    client: reqwest::Client,
    settings: Arc<ChatSettings>,
}

impl ChatClient {
    pub fn new(settings: ChatSettings) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .user_agent(concat!("datetune/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            settings: Arc::new(settings),
        })
    }

    fn request_body(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        format: ResponseFormat,
    ) -> serde_json::Value {
        let mut body = serde_json::json!({
            "messages": [
                { "role": "system", "content": system_prompt },
                { "role": "user", "content": user_prompt }
            ],
        });

        if !self.settings.is_azure() {
            body["model"] = serde_json::json!(self.settings.model);
        }
        if let Some(temperature) = self.settings.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }
        if format == ResponseFormat::JsonObject {
            body["response_format"] = serde_json::json!({ "type": "json_object" });
        }

        body
    }
}

#[async_trait]
impl LanguageModel for ChatClient {
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        format: ResponseFormat,
    ) -> Result<String, LlmError> {
        let url = self.settings.completions_url();
        let body = self.request_body(system_prompt, user_prompt, format);

        debug!("Chat completion request to {} ({:?})", url, format);

        let mut request = self.client.post(&url).json(&body);
        if let Some(ref key) = self.settings.api_key {
            request = if self.settings.is_azure() {
                request.header("api-key", key.as_str())
            } else {
                request.header("Authorization", format!("Bearer {}", key))
            };
        }

        let response = request.send().await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            warn!("Chat API error {}: {}", status, error_text);
            return Err(classify_error_body(status.as_u16(), error_text));
        }

        let text = response.text().await?;
        extract_content(&text)
    }
}

/// Map a non-success response body to an error, separating policy refusals
/// from everything else.
pub(crate) fn classify_error_body(status: u16, body: String) -> LlmError {
    if mentions_content_policy(&body) {
        LlmError::ContentPolicy(body)
    } else {
        LlmError::Api {
            status,
            message: body,
        }
    }
}

fn mentions_content_policy(text: &str) -> bool {
    CONTENT_POLICY_MARKERS.iter().any(|m| text.contains(m))
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

/// Pull the first choice's message content out of a successful completion body.
pub(crate) fn extract_content(body: &str) -> Result<String, LlmError> {
    let completion: ChatCompletion =
        serde_json::from_str(body).map_err(|e| LlmError::Decode(e.to_string()))?;

    let choice = completion
        .choices
        .into_iter()
        .next()
        .ok_or(LlmError::EmptyResponse)?;

    if let Some(reason) = choice.finish_reason.as_deref() {
        if mentions_content_policy(reason) {
            return Err(LlmError::ContentPolicy(format!("finish_reason={}", reason)));
        }
    }

    choice
        .message
        .and_then(|m| m.content)
        .ok_or(LlmError::EmptyResponse)
}

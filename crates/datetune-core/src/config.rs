use anyhow::{Context, Result};
use datetune_llm::ChatSettings;
use std::time::Duration;

/// Connection settings for the language model, read from the environment
#[derive(Debug, Clone)]
pub struct Config {
    pub llm_api_url: String,
    pub llm_api_key: Option<String>,
    /// Model name, or the deployment name when talking to Azure OpenAI
    pub llm_model: String,
    /// If set, requests are routed the Azure OpenAI way with this `api-version`
    pub llm_api_version: Option<String>,
    pub llm_timeout: Duration,
    pub llm_temperature: Option<f32>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            llm_api_url: std::env::var("LLM_API_URL")
                .unwrap_or_else(|_| "http://localhost:8089/v1".to_string()),
            llm_api_key: std::env::var("LLM_API_KEY").ok(),
            llm_model: std::env::var("LLM_MODEL").unwrap_or_else(|_| "gpt-4o".to_string()),
            llm_api_version: std::env::var("LLM_API_VERSION")
                .ok()
                .filter(|v| !v.trim().is_empty()),

            llm_timeout: Duration::from_secs(
                std::env::var("LLM_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "120".to_string())
                    .parse()
                    .context("LLM_TIMEOUT_SECS must be a whole number of seconds")?,
            ),
            llm_temperature: std::env::var("LLM_TEMPERATURE")
                .ok()
                .map(|t| t.parse())
                .transpose()
                .context("LLM_TEMPERATURE must be a number")?,
        })
    }

    pub fn chat_settings(&self) -> ChatSettings {
        ChatSettings {
            api_url: self.llm_api_url.clone(),
            api_key: self.llm_api_key.clone(),
            model: self.llm_model.clone(),
            api_version: self.llm_api_version.clone(),
            timeout: self.llm_timeout,
            temperature: self.llm_temperature,
        }
    }
}

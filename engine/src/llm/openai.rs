//! OpenAI-compatible provider for remote inference

use async_trait::async_trait;
use reqwest::Client;
use sdk::errors::CoreError;
use sdk::types::{InferenceRequest, InferenceResponse, TokenUsage};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::InferenceProvider;
use crate::config::OpenAiConfig;

pub struct OpenAiProvider {
    config: OpenAiConfig,
    client: Client,
    api_key: Option<String>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: ChatUsage,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Deserialize, Default)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

impl OpenAiProvider {
    pub fn new(config: OpenAiConfig) -> Self {
        let api_key = if config.api_key_env.is_empty() {
            None
        } else {
            std::env::var(&config.api_key_env).ok()
        };
        Self {
            config,
            client: Client::builder()
                .timeout(Duration::from_secs(120))
                .build()
                .unwrap_or_default(),
            api_key,
        }
    }
}

#[async_trait]
impl InferenceProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(&self, request: &InferenceRequest) -> Result<InferenceResponse, CoreError> {
        let key = self.api_key.as_ref().ok_or_else(|| {
            CoreError::DependencyUnavailable(format!(
                "openai: API key environment variable '{}' is not set",
                self.config.api_key_env
            ))
        })?;

        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let body = serde_json::json!({
            "model": self.config.model,
            "messages": [{"role": "user", "content": request.prompt}],
            "temperature": request.parameters.temperature,
            "max_tokens": request.parameters.max_tokens,
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(key)
            .json(&body)
            .send()
            .await
            .map_err(|e| CoreError::DependencyUnavailable(format!("openai: {}", e)))?;
        if !response.status().is_success() {
            return Err(CoreError::DependencyUnavailable(format!(
                "openai returned {}",
                response.status()
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| CoreError::DependencyUnavailable(format!("openai response: {}", e)))?;
        let completion = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| {
                CoreError::DependencyUnavailable("openai response had no choices".to_string())
            })?;

        debug!(
            model = %self.config.model,
            prompt_tokens = parsed.usage.prompt_tokens,
            completion_tokens = parsed.usage.completion_tokens,
            "OpenAI completion finished"
        );
        Ok(InferenceResponse {
            completion,
            token_usage: TokenUsage {
                prompt_tokens: parsed.usage.prompt_tokens,
                completion_tokens: parsed.usage.completion_tokens,
            },
        })
    }

    async fn health_check(&self) -> bool {
        self.api_key.is_some()
    }
}

//! Ollama provider for local inference

use async_trait::async_trait;
use reqwest::Client;
use sdk::errors::CoreError;
use sdk::types::{InferenceRequest, InferenceResponse, TokenUsage};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::InferenceProvider;
use crate::config::OllamaConfig;

pub struct OllamaProvider {
    config: OllamaConfig,
    client: Client,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
    #[serde(default)]
    prompt_eval_count: u32,
    #[serde(default)]
    eval_count: u32,
}

impl OllamaProvider {
    pub fn new(config: OllamaConfig) -> Self {
        Self {
            config,
            client: Client::builder()
                .timeout(Duration::from_secs(120))
                .build()
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl InferenceProvider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn complete(&self, request: &InferenceRequest) -> Result<InferenceResponse, CoreError> {
        let url = format!("{}/api/generate", self.config.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.config.model,
            "prompt": request.prompt,
            "stream": false,
            "options": {
                "temperature": request.parameters.temperature,
                "num_predict": request.parameters.max_tokens,
            },
        });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| CoreError::DependencyUnavailable(format!("ollama: {}", e)))?;
        if !response.status().is_success() {
            return Err(CoreError::DependencyUnavailable(format!(
                "ollama returned {}",
                response.status()
            )));
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| CoreError::DependencyUnavailable(format!("ollama response: {}", e)))?;

        debug!(
            model = %self.config.model,
            prompt_tokens = parsed.prompt_eval_count,
            completion_tokens = parsed.eval_count,
            "Ollama completion finished"
        );
        Ok(InferenceResponse {
            completion: parsed.response,
            token_usage: TokenUsage {
                prompt_tokens: parsed.prompt_eval_count,
                completion_tokens: parsed.eval_count,
            },
        })
    }

    async fn health_check(&self) -> bool {
        let url = format!("{}/api/tags", self.config.base_url.trim_end_matches('/'));
        match self.client.get(&url).send().await {
            Ok(r) => r.status().is_success(),
            Err(_) => false,
        }
    }
}

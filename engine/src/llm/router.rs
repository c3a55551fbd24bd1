//! Inference Router
//!
//! Orders the configured providers with the preferred one first and
//! fails over down the list when a provider is unreachable. Every
//! attempt runs under a per-request deadline so a hung backend cannot
//! stall a task past its budget.

use sdk::errors::CoreError;
use sdk::types::{InferenceRequest, InferenceResponse};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::{ollama::OllamaProvider, openai::OpenAiProvider, InferenceProvider};
use crate::config::InferenceConfig;

pub struct InferenceRouter {
    providers: Vec<Arc<dyn InferenceProvider>>,
}

impl InferenceRouter {
    /// Build a router from configuration, preferred provider first
    pub fn from_config(config: &InferenceConfig) -> Self {
        let ollama: Arc<dyn InferenceProvider> =
            Arc::new(OllamaProvider::new(config.ollama.clone()));
        let openai: Arc<dyn InferenceProvider> =
            Arc::new(OpenAiProvider::new(config.openai.clone()));

        let providers = if config.default_provider == "openai" {
            vec![openai, ollama]
        } else {
            vec![ollama, openai]
        };
        Self { providers }
    }

    /// Build a router over explicit providers, tried in order
    pub fn new(providers: Vec<Arc<dyn InferenceProvider>>) -> Self {
        Self { providers }
    }

    /// Run a completion, failing over across providers
    ///
    /// Only `DependencyUnavailable` triggers failover; any other error
    /// means the request itself is bad and retrying elsewhere would
    /// repeat it.
    pub async fn complete(
        &self,
        request: &InferenceRequest,
        deadline: Duration,
    ) -> Result<InferenceResponse, CoreError> {
        let mut last_failure = None;

        for provider in &self.providers {
            debug!(provider = %provider.name(), "Attempting inference");
            match tokio::time::timeout(deadline, provider.complete(request)).await {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(CoreError::DependencyUnavailable(reason))) => {
                    warn!(
                        provider = %provider.name(),
                        reason = %reason,
                        "Provider unavailable, failing over"
                    );
                    last_failure = Some(reason);
                }
                Ok(Err(other)) => return Err(other),
                Err(_) => {
                    warn!(
                        provider = %provider.name(),
                        deadline_ms = deadline.as_millis() as u64,
                        "Provider timed out, failing over"
                    );
                    last_failure = Some(format!("{} timed out", provider.name()));
                }
            }
        }

        Err(CoreError::DependencyUnavailable(
            last_failure.unwrap_or_else(|| "no inference providers configured".to_string()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StaticProvider {
        name: &'static str,
        reply: Result<String, CoreError>,
        calls: AtomicUsize,
    }

    impl StaticProvider {
        fn ok(name: &'static str, reply: &str) -> Arc<Self> {
            Arc::new(Self {
                name,
                reply: Ok(reply.to_string()),
                calls: AtomicUsize::new(0),
            })
        }

        fn down(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                reply: Err(CoreError::DependencyUnavailable("down".to_string())),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl InferenceProvider for StaticProvider {
        fn name(&self) -> &str {
            self.name
        }

        async fn complete(
            &self,
            _request: &InferenceRequest,
        ) -> Result<InferenceResponse, CoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.reply {
                Ok(text) => Ok(InferenceResponse {
                    completion: text.clone(),
                    token_usage: Default::default(),
                }),
                Err(_) => Err(CoreError::DependencyUnavailable("down".to_string())),
            }
        }

        async fn health_check(&self) -> bool {
            self.reply.is_ok()
        }
    }

    fn request() -> InferenceRequest {
        InferenceRequest {
            prompt: "hello".to_string(),
            parameters: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_first_healthy_provider_wins() {
        let first = StaticProvider::ok("first", "from-first");
        let second = StaticProvider::ok("second", "from-second");
        let router = InferenceRouter::new(vec![first.clone(), second.clone()]);

        let response = router
            .complete(&request(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(response.completion, "from-first");
        assert_eq!(second.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failover_to_second_provider() {
        let first = StaticProvider::down("first");
        let second = StaticProvider::ok("second", "from-second");
        let router = InferenceRouter::new(vec![first.clone(), second]);

        let response = router
            .complete(&request(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(response.completion, "from-second");
        assert_eq!(first.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_all_down_is_dependency_unavailable() {
        let router =
            InferenceRouter::new(vec![StaticProvider::down("a"), StaticProvider::down("b")]);

        let err = router
            .complete(&request(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::DependencyUnavailable(_)));
    }

    #[tokio::test]
    async fn test_empty_router_reports_unavailable() {
        let router = InferenceRouter::new(vec![]);
        let err = router
            .complete(&request(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::DependencyUnavailable(_)));
    }
}

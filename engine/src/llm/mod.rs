//! Inference Provider Abstraction Layer
//!
//! A common interface over the inference backends (Ollama locally,
//! OpenAI-compatible remotely). The InferenceProvider trait defines the
//! contract all backends implement, so the router can fail over between
//! them transparently. Backend failures surface as
//! `DependencyUnavailable` and are retryable by policy.

use async_trait::async_trait;
use sdk::errors::CoreError;
use sdk::types::{InferenceRequest, InferenceResponse};

pub mod ollama;
pub mod openai;
pub mod router;

pub use router::InferenceRouter;

#[async_trait]
pub trait InferenceProvider: Send + Sync {
    /// Provider name for logs and routing decisions
    fn name(&self) -> &str;

    /// Run one completion to the end
    async fn complete(&self, request: &InferenceRequest) -> Result<InferenceResponse, CoreError>;

    /// Cheap reachability probe
    async fn health_check(&self) -> bool;
}

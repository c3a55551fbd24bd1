//! Drover Engine Library
//!
//! Core of the agent task-orchestration engine. It is used by both the
//! main binary and integration tests.

/// Configuration management module
pub mod config;

/// Database persistence module
pub mod db;

/// Tool catalog, grants, and the execution ledger
pub mod registry;

/// Isolated command execution
pub mod sandbox;

/// Scoped memory storage and retrieval
pub mod memory;

/// Inference provider abstraction layer
pub mod llm;

/// Task routing and fan-out
pub mod orchestrator;

/// Telemetry and Observability
pub mod telemetry;

/// CLI interface module
pub mod cli;

use std::sync::Arc;

use config::Config;
use db::Database;
use llm::InferenceRouter;
use memory::embedding::{EmbeddingProvider, HttpEmbeddingProvider};
use memory::MemoryGuild;
use orchestrator::Orchestrator;
use registry::ToolRegistry;
use sandbox::SandboxManager;
use sdk::errors::CoreError;

/// All engine components wired together from one configuration
pub struct Engine {
    pub db: Arc<Database>,
    pub registry: Arc<ToolRegistry>,
    pub sandbox: Arc<SandboxManager>,
    pub guild: Arc<MemoryGuild>,
    pub router: Arc<InferenceRouter>,
    pub orchestrator: Arc<Orchestrator>,
}

impl Engine {
    /// Bring up the engine over the configured data directory
    ///
    /// The relational store is mandatory; the embedding backend is
    /// attached only when enabled and its absence is not an error.
    pub async fn bootstrap(config: &Config) -> Result<Self, CoreError> {
        let db = Arc::new(
            Database::new(&config.db_path())
                .await
                .map_err(|e| CoreError::Database(e.to_string()))?,
        );

        let registry = Arc::new(ToolRegistry::new(Arc::clone(&db)));
        let sandbox = Arc::new(SandboxManager::new(
            config.sandbox_root(),
            config.sandbox.clone(),
        ));
        sandbox.cleanup_orphans().await?;

        let embedder: Option<Arc<dyn EmbeddingProvider>> = if config.memory.embedding.enabled {
            Some(Arc::new(HttpEmbeddingProvider::new(
                &config.memory.embedding,
            )?))
        } else {
            None
        };
        let guild = Arc::new(MemoryGuild::new(
            Arc::clone(&db),
            config.memory.clone(),
            embedder,
        ));

        let router = Arc::new(InferenceRouter::from_config(&config.inference));
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&registry),
            Arc::clone(&sandbox),
            Arc::clone(&guild),
            Arc::clone(&router),
            config.routing.clone(),
        ));

        Ok(Self {
            db,
            registry,
            sandbox,
            guild,
            router,
            orchestrator,
        })
    }
}

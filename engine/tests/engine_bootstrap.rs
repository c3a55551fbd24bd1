//! Bootstrap tests: one configuration brings up the whole engine over a
//! fresh data directory.

use drover_engine::config::Config;
use drover_engine::Engine;
use sdk::types::{PermissionLevel, TaskSpec, TaskStatus};
use tempfile::TempDir;

fn test_config(temp: &TempDir) -> Config {
    let mut config = Config::default();
    config.core.data_dir = temp.path().to_path_buf();
    config
}

#[tokio::test]
async fn test_bootstrap_creates_store_and_sandbox_root() {
    let temp = TempDir::new().unwrap();
    let engine = Engine::bootstrap(&test_config(&temp)).await.unwrap();

    assert!(temp.path().join("drover.db").exists());

    // The registry is live immediately
    let tools = engine
        .registry
        .list_by_capability("anything", None, 10)
        .await
        .unwrap();
    assert!(tools.is_empty());

    engine.db.close().await.unwrap();
}

#[tokio::test]
async fn test_bootstrap_sweeps_stale_workspaces() {
    let temp = TempDir::new().unwrap();
    let stale = temp.path().join("sandboxes").join("left-over-run");
    std::fs::create_dir_all(&stale).unwrap();

    let engine = Engine::bootstrap(&test_config(&temp)).await.unwrap();
    assert!(!stale.exists());
    engine.db.close().await.unwrap();
}

#[tokio::test]
async fn test_engine_survives_restart_with_same_data_dir() {
    let temp = TempDir::new().unwrap();
    let config = test_config(&temp);

    let tool_id = {
        let engine = Engine::bootstrap(&config).await.unwrap();
        let spec = drover_engine::db::ToolSpec {
            name: "echo".to_string(),
            version: "1".to_string(),
            description: String::new(),
            capabilities: vec!["text".to_string()],
            input_schema: serde_json::json!({"type": "object"}),
            output_schema: serde_json::json!({"type": "object"}),
            required_permission: PermissionLevel::Read,
            dispatch_target: "builtin:echo".to_string(),
        };
        let id = engine.registry.register(&spec).await.unwrap();
        engine
            .registry
            .grant("alice", &id, PermissionLevel::Read)
            .await
            .unwrap();
        engine.db.close().await.unwrap();
        id
    };

    // Second bootstrap sees the catalog and grants from the first
    let engine = Engine::bootstrap(&config).await.unwrap();
    let tool = engine.registry.resolve("alice", &tool_id).await.unwrap();
    assert_eq!(tool.name, "echo");
    engine.db.close().await.unwrap();
}

#[tokio::test]
async fn test_degraded_memory_is_default() {
    let temp = TempDir::new().unwrap();
    let engine = Engine::bootstrap(&test_config(&temp)).await.unwrap();

    let scope = engine.guild.create_scope("default", None).await.unwrap();
    let outcome = engine
        .orchestrator
        .submit({
            let mut task = TaskSpec::new("store and recall", &scope, "alice");
            task.deadline_ms = 10_000;
            task
        })
        .await
        .unwrap();

    // No inference backend is reachable in tests, so the direct path
    // fails, but the failure is classified and the outcome recorded
    assert_eq!(outcome.status, TaskStatus::Failed);
    assert_eq!(
        outcome.error_kind.as_deref(),
        Some("dependency_unavailable")
    );
    engine.db.close().await.unwrap();
}

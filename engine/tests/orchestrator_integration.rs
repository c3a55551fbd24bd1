//! End-to-end tests for task routing: registry, sandbox, memory, and
//! inference wired together the way the binary wires them.

use async_trait::async_trait;
use drover_engine::config::{MemoryConfig, RoutingConfig, SandboxConfig};
use drover_engine::db::{Database, ExecutionStatus, ToolSpec};
use drover_engine::llm::{InferenceProvider, InferenceRouter};
use drover_engine::memory::MemoryGuild;
use drover_engine::orchestrator::Orchestrator;
use drover_engine::registry::ToolRegistry;
use drover_engine::sandbox::SandboxManager;
use sdk::errors::CoreError;
use sdk::types::{
    InferenceRequest, InferenceResponse, MergePolicy, PermissionLevel, SandboxLimits, SandboxSpec,
    StrategyHint, TaskSpec, TaskStatus, ToolInput,
};
use std::sync::Arc;
use tempfile::TempDir;

struct EchoProvider;

#[async_trait]
impl InferenceProvider for EchoProvider {
    fn name(&self) -> &str {
        "echo-test"
    }

    async fn complete(&self, request: &InferenceRequest) -> Result<InferenceResponse, CoreError> {
        Ok(InferenceResponse {
            completion: format!("answer: {}", request.prompt),
            token_usage: Default::default(),
        })
    }

    async fn health_check(&self) -> bool {
        true
    }
}

struct Harness {
    _temp: TempDir,
    registry: Arc<ToolRegistry>,
    guild: Arc<MemoryGuild>,
    orchestrator: Arc<Orchestrator>,
}

async fn harness_with(routing: RoutingConfig) -> Harness {
    let temp = TempDir::new().unwrap();
    let db = Arc::new(Database::new(&temp.path().join("test.db")).await.unwrap());

    let registry = Arc::new(ToolRegistry::new(Arc::clone(&db)));
    let sandbox = Arc::new(SandboxManager::new(
        temp.path().join("sandboxes"),
        SandboxConfig::default(),
    ));
    let guild = Arc::new(MemoryGuild::new(
        Arc::clone(&db),
        MemoryConfig::default(),
        None,
    ));
    let router = Arc::new(InferenceRouter::new(vec![Arc::new(EchoProvider)]));
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&registry),
        sandbox,
        Arc::clone(&guild),
        router,
        routing,
    ));

    Harness {
        _temp: temp,
        registry,
        guild,
        orchestrator,
    }
}

async fn harness() -> Harness {
    harness_with(RoutingConfig::default()).await
}

fn echo_tool_spec() -> ToolSpec {
    ToolSpec {
        name: "echo".to_string(),
        version: "1".to_string(),
        description: "echoes its input".to_string(),
        capabilities: vec!["text".to_string()],
        input_schema: serde_json::json!({"type": "object"}),
        output_schema: serde_json::json!({"type": "object"}),
        required_permission: PermissionLevel::Execute,
        dispatch_target: "builtin:echo".to_string(),
    }
}

fn tool_task(scope: &str, tool_id: &str) -> TaskSpec {
    let mut task = TaskSpec::new("echo something back", scope, "alice");
    task.strategy_hint = Some(StrategyHint::Tool);
    task.tool_id = Some(tool_id.to_string());
    task.tool_input = Some(ToolInput::new("echo").with_param("text", serde_json::json!("hi")));
    task
}

#[tokio::test]
async fn test_tool_task_end_to_end() {
    let h = harness().await;
    let scope = h.guild.create_scope("work", None).await.unwrap();
    let tool_id = h.registry.register(&echo_tool_spec()).await.unwrap();
    h.registry
        .grant("alice", &tool_id, PermissionLevel::Execute)
        .await
        .unwrap();

    let outcome = h
        .orchestrator
        .submit(tool_task(&scope, &tool_id))
        .await
        .unwrap();

    assert_eq!(outcome.status, TaskStatus::Succeeded);
    assert_eq!(outcome.execution_ids.len(), 1);
    assert!(outcome.result.contains("echo"));

    // The ledger holds the finished execution
    let rec = h
        .registry
        .execution(&outcome.execution_ids[0])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(rec.status, ExecutionStatus::Succeeded);
    assert_eq!(rec.principal, "alice");
}

#[tokio::test]
async fn test_permission_denied_leaves_no_execution() {
    let h = harness().await;
    let scope = h.guild.create_scope("work", None).await.unwrap();
    let tool_id = h.registry.register(&echo_tool_spec()).await.unwrap();
    // No grant for alice

    let outcome = h
        .orchestrator
        .submit(tool_task(&scope, &tool_id))
        .await
        .unwrap();

    assert_eq!(outcome.status, TaskStatus::Failed);
    assert_eq!(outcome.error_kind.as_deref(), Some("permission_denied"));
    assert!(outcome.execution_ids.is_empty());
}

#[tokio::test]
async fn test_revoked_grant_stops_invocations() {
    let h = harness().await;
    let scope = h.guild.create_scope("work", None).await.unwrap();
    let tool_id = h.registry.register(&echo_tool_spec()).await.unwrap();
    h.registry
        .grant("alice", &tool_id, PermissionLevel::Execute)
        .await
        .unwrap();

    let first = h
        .orchestrator
        .submit(tool_task(&scope, &tool_id))
        .await
        .unwrap();
    assert_eq!(first.status, TaskStatus::Succeeded);

    h.registry.revoke("alice", &tool_id).await.unwrap();
    let second = h
        .orchestrator
        .submit(tool_task(&scope, &tool_id))
        .await
        .unwrap();
    assert_eq!(second.status, TaskStatus::Failed);
    assert_eq!(second.error_kind.as_deref(), Some("permission_denied"));
}

#[tokio::test]
async fn test_direct_task_uses_inference() {
    let h = harness().await;
    let scope = h.guild.create_scope("chat", None).await.unwrap();

    let task = TaskSpec::new("what is two plus two", &scope, "alice");
    let outcome = h.orchestrator.submit(task).await.unwrap();

    assert_eq!(outcome.status, TaskStatus::Succeeded);
    assert_eq!(outcome.result, "answer: what is two plus two");
    assert!(outcome.execution_ids.is_empty());
}

#[tokio::test]
async fn test_sandbox_task_times_out_and_is_ledgered() {
    let h = harness().await;
    let scope = h.guild.create_scope("work", None).await.unwrap();

    let mut task = TaskSpec::new("run a slow command", &scope, "alice");
    task.strategy_hint = Some(StrategyHint::Sandbox);
    task.sandbox = Some(SandboxSpec {
        command: "sleep".to_string(),
        args: vec!["30".to_string()],
        limits: SandboxLimits {
            wall_clock_ms: 200,
            ..Default::default()
        },
    });

    let started = std::time::Instant::now();
    let outcome = h.orchestrator.submit(task).await.unwrap();

    assert_eq!(outcome.status, TaskStatus::TimedOut);
    assert!(started.elapsed() < std::time::Duration::from_secs(10));

    let rec = h
        .registry
        .execution(&outcome.execution_ids[0])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(rec.status, ExecutionStatus::TimedOut);
    assert!(rec.tool_id.starts_with("sandbox:"));
}

#[tokio::test]
async fn test_network_capability_denied_fails_task() {
    let h = harness().await;
    let scope = h.guild.create_scope("work", None).await.unwrap();

    let mut task = TaskSpec::new("reach the network", &scope, "alice");
    task.strategy_hint = Some(StrategyHint::Sandbox);
    task.sandbox = Some(SandboxSpec {
        command: "curl".to_string(),
        args: vec!["example.com".to_string()],
        limits: SandboxLimits {
            network: true,
            ..Default::default()
        },
    });

    let outcome = h.orchestrator.submit(task).await.unwrap();
    assert_eq!(outcome.status, TaskStatus::Failed);
    assert_eq!(outcome.error_kind.as_deref(), Some("capability_denied"));
}

#[tokio::test]
async fn test_fanout_concat_merges_in_order() {
    let h = harness().await;
    let scope = h.guild.create_scope("work", None).await.unwrap();

    let mut parent = TaskSpec::new("answer both questions", &scope, "alice");
    parent.merge_policy = MergePolicy::Concat;
    parent.subtasks = vec![
        TaskSpec::new("first question", &scope, "alice"),
        TaskSpec::new("second question", &scope, "alice"),
    ];

    let outcome = h.orchestrator.submit(parent).await.unwrap();
    assert_eq!(outcome.status, TaskStatus::Succeeded);

    let parts: Vec<String> = serde_json::from_str(&outcome.result).unwrap();
    assert_eq!(
        parts,
        vec!["answer: first question", "answer: second question"]
    );
}

#[tokio::test]
async fn test_fanout_first_success_tolerates_failures() {
    let h = harness().await;
    let scope = h.guild.create_scope("work", None).await.unwrap();
    let tool_id = h.registry.register(&echo_tool_spec()).await.unwrap();
    // Alice holds no grant, so the tool subtask fails

    let mut parent = TaskSpec::new("try a few angles", &scope, "alice");
    parent.merge_policy = MergePolicy::FirstSuccess;
    parent.subtasks = vec![
        tool_task(&scope, &tool_id),
        TaskSpec::new("fallback question", &scope, "alice"),
    ];

    let outcome = h.orchestrator.submit(parent).await.unwrap();
    assert_eq!(outcome.status, TaskStatus::Succeeded);
    assert_eq!(outcome.result, "answer: fallback question");
}

#[tokio::test]
async fn test_fanout_majority_survives_one_failure() {
    let h = harness().await;
    let scope = h.guild.create_scope("work", None).await.unwrap();
    let tool_id = h.registry.register(&echo_tool_spec()).await.unwrap();
    // Alice holds no grant, so the single tool subtask fails

    let mut parent = TaskSpec::new("vote on it", &scope, "alice");
    parent.merge_policy = MergePolicy::Majority;
    parent.subtasks = vec![
        TaskSpec::new("first opinion", &scope, "alice"),
        tool_task(&scope, &tool_id),
        TaskSpec::new("second opinion", &scope, "alice"),
    ];

    let outcome = h.orchestrator.submit(parent).await.unwrap();
    assert_eq!(outcome.status, TaskStatus::Succeeded);

    let parts: Vec<String> = serde_json::from_str(&outcome.result).unwrap();
    assert_eq!(parts, vec!["answer: first opinion", "answer: second opinion"]);
}

#[tokio::test]
async fn test_fanout_majority_fails_without_majority() {
    let h = harness().await;
    let scope = h.guild.create_scope("work", None).await.unwrap();
    let tool_id = h.registry.register(&echo_tool_spec()).await.unwrap();

    let mut parent = TaskSpec::new("vote on it", &scope, "alice");
    parent.merge_policy = MergePolicy::Majority;
    parent.subtasks = vec![
        TaskSpec::new("only success", &scope, "alice"),
        tool_task(&scope, &tool_id),
        tool_task(&scope, &tool_id),
    ];

    let outcome = h.orchestrator.submit(parent).await.unwrap();
    assert_eq!(outcome.status, TaskStatus::Failed);
    assert_eq!(outcome.error_kind.as_deref(), Some("permission_denied"));
}

#[tokio::test]
async fn test_fanout_depth_cap() {
    let routing = RoutingConfig {
        max_fanout_depth: 1,
        ..Default::default()
    };
    let h = harness_with(routing).await;
    let scope = h.guild.create_scope("work", None).await.unwrap();

    // Two levels of nesting against a cap of one
    let mut inner = TaskSpec::new("inner", &scope, "alice");
    inner.subtasks = vec![TaskSpec::new("leaf", &scope, "alice")];
    let mut outer = TaskSpec::new("outer", &scope, "alice");
    outer.subtasks = vec![inner];

    let outcome = h.orchestrator.submit(outer).await.unwrap();
    assert_eq!(outcome.status, TaskStatus::Failed);
    assert_eq!(outcome.error_kind.as_deref(), Some("resource_exhausted"));
}

#[tokio::test]
async fn test_outcome_recorded_in_scope_memory() {
    let h = harness().await;
    let scope = h.guild.create_scope("work", None).await.unwrap();

    let outcome = h
        .orchestrator
        .submit(TaskSpec::new("remember this run", &scope, "alice"))
        .await
        .unwrap();
    assert_eq!(outcome.status, TaskStatus::Succeeded);

    let recalled = h
        .guild
        .retrieve(&scope, "remember this run", Some(5))
        .await
        .unwrap();
    let summary = recalled
        .items
        .iter()
        .find(|i| i.record.category == "task_outcome")
        .expect("task outcome recorded");
    assert!(summary.record.tags.iter().any(|t| t == "succeeded"));
}

#[tokio::test]
async fn test_validation_rejected_at_submission() {
    let h = harness().await;

    // Empty goal
    let err = h
        .orchestrator
        .submit(TaskSpec::new("", "scope", "alice"))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Validation(_)));

    // Tool hint without an attached tool
    let mut task = TaskSpec::new("use a tool", "scope", "alice");
    task.strategy_hint = Some(StrategyHint::Tool);
    let err = h.orchestrator.submit(task).await.unwrap_err();
    assert!(matches!(err, CoreError::Validation(_)));

    // Malformed subtask caught before anything runs
    let mut parent = TaskSpec::new("parent", "scope", "alice");
    parent.subtasks = vec![TaskSpec::new("", "scope", "alice")];
    let err = h.orchestrator.submit(parent).await.unwrap_err();
    assert!(matches!(err, CoreError::Validation(_)));
}

#[tokio::test]
async fn test_unknown_scope_fails_task() {
    let h = harness().await;
    let outcome = h
        .orchestrator
        .submit(TaskSpec::new("work in a ghost scope", "no-such-scope", "alice"))
        .await
        .unwrap();
    assert_eq!(outcome.status, TaskStatus::Failed);
    assert_eq!(outcome.error_kind.as_deref(), Some("not_found"));
}

#[tokio::test]
async fn test_detached_submission_returns_immediately() {
    let h = harness().await;
    let scope = h.guild.create_scope("work", None).await.unwrap();

    let (task_id, handle) = h
        .orchestrator
        .submit_detached(TaskSpec::new("run in the background", &scope, "alice"))
        .unwrap();
    assert!(!task_id.is_empty());

    // The handle resolves when the task lands, well inside the default
    // two minute deadline
    let outcome = tokio::time::timeout(std::time::Duration::from_secs(10), handle)
        .await
        .expect("detached task did not finish promptly")
        .unwrap();
    assert_eq!(outcome.task_id, task_id);
    assert_eq!(outcome.status, TaskStatus::Succeeded);

    // The durable summary is in place by the time the handle resolves
    let recalled = h
        .guild
        .retrieve(&scope, "run in the background", Some(5))
        .await
        .unwrap();
    assert!(recalled
        .items
        .iter()
        .any(|i| i.record.category == "task_outcome"));
}

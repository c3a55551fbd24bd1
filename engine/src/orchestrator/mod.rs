//! Orchestrator / Task Router
//!
//! Takes a task, scores its complexity, picks an execution strategy,
//! and drives it to a terminal outcome. Tasks themselves are ephemeral;
//! everything durable about a run lives in execution records and in a
//! task_outcome memory record written when the task finishes. Fan-out
//! is bounded by a worker semaphore and a recursion depth cap, and a
//! task never outlives its deadline.

pub mod scoring;

use sdk::errors::{CoreError, DroverErrorExt};
use sdk::types::{
    InferenceRequest, MergePolicy, ResourceUsage, StrategyHint, TaskOutcome, TaskSpec, TaskStatus,
    ToolInput,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RoutingConfig;
use crate::db::{ExecutionStatus, Tool};
use crate::llm::InferenceRouter;
use crate::memory::{MemoryGuild, StoreRequest};
use crate::registry::ToolRegistry;
use crate::sandbox::{SandboxManager, Termination};
use scoring::{complexity_score, select_strategy, HistorySignal, Strategy};

/// What a tool dispatch produced, before it is folded into the ledger
struct Dispatched {
    output: serde_json::Value,
    status: ExecutionStatus,
    usage: ResourceUsage,
}

pub struct Orchestrator {
    registry: Arc<ToolRegistry>,
    sandbox: Arc<SandboxManager>,
    guild: Arc<MemoryGuild>,
    router: Arc<InferenceRouter>,
    config: RoutingConfig,
    workers: Arc<Semaphore>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<ToolRegistry>,
        sandbox: Arc<SandboxManager>,
        guild: Arc<MemoryGuild>,
        router: Arc<InferenceRouter>,
        config: RoutingConfig,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(config.max_workers.max(1)));
        Self {
            registry,
            sandbox,
            guild,
            router,
            config,
            workers,
        }
    }

    /// Run a task to completion and return its outcome
    pub async fn submit(self: &Arc<Self>, task: TaskSpec) -> Result<TaskOutcome, CoreError> {
        validate_task(&task)?;
        let task_id = Uuid::new_v4().to_string();
        let deadline = Instant::now() + Duration::from_millis(task.deadline_ms);
        info!(task_id = %task_id, goal = %truncate(&task.goal, 80), "Task submitted");
        Ok(Arc::clone(self).run_task(task_id, task, 0, deadline).await)
    }

    /// Submit a task without waiting for it
    ///
    /// Returns the task id immediately, plus the handle of the spawned
    /// run for callers that need to keep the runtime alive until the
    /// task lands. The outcome itself is observable through execution
    /// records and the task_outcome memory record.
    pub fn submit_detached(
        self: &Arc<Self>,
        task: TaskSpec,
    ) -> Result<(String, tokio::task::JoinHandle<TaskOutcome>), CoreError> {
        validate_task(&task)?;
        let task_id = Uuid::new_v4().to_string();
        let deadline = Instant::now() + Duration::from_millis(task.deadline_ms);
        let this = Arc::clone(self);
        let id = task_id.clone();
        info!(task_id = %task_id, "Task submitted detached");
        let handle = tokio::spawn(async move {
            let outcome = this.run_task(id, task, 0, deadline).await;
            debug!(
                task_id = %outcome.task_id,
                status = ?outcome.status,
                "Detached task finished"
            );
            outcome
        });
        Ok((task_id, handle))
    }

    fn run_task(
        self: Arc<Self>,
        task_id: String,
        task: TaskSpec,
        depth: u32,
        deadline: Instant,
    ) -> futures::future::BoxFuture<'static, TaskOutcome> {
        Box::pin(async move {
            let outcome = Arc::clone(&self)
                .route(&task_id, &task, depth, deadline)
                .await;
            self.record_outcome(&task, &outcome).await;
            outcome
        })
    }

    async fn route(
        self: Arc<Self>,
        task_id: &str,
        task: &TaskSpec,
        depth: u32,
        deadline: Instant,
    ) -> TaskOutcome {
        if depth > self.config.max_fanout_depth {
            return failed(
                task_id,
                &CoreError::ResourceExhausted(format!(
                    "fan-out depth {} exceeds the limit of {}",
                    depth, self.config.max_fanout_depth
                )),
            );
        }
        if remaining(deadline).is_zero() {
            return timed_out(task_id, task.deadline_ms);
        }

        let history = match self.history_signal(task).await {
            Ok(signal) => signal,
            Err(e) => return failed(task_id, &e),
        };
        let score = complexity_score(task, &history);
        let strategy = select_strategy(task, score, &self.config);
        debug!(
            task_id = %task_id,
            score = score,
            strategy = ?strategy,
            related = history.related,
            "Routed task"
        );

        match strategy {
            Strategy::Direct => self.run_direct(task_id, task, deadline).await,
            Strategy::Tool => self.run_tool(task_id, task, deadline).await,
            Strategy::Sandbox => self.run_sandbox(task_id, task, deadline).await,
            Strategy::Decompose => self.run_fanout(task_id, task, depth, deadline).await,
        }
    }

    /// Past task_outcome records for similar goals in this scope
    async fn history_signal(&self, task: &TaskSpec) -> Result<HistorySignal, CoreError> {
        let result = match self.guild.retrieve(&task.scope_id, &task.goal, Some(8)).await {
            Ok(result) => result,
            // A missing scope fails the task; a degraded or empty guild
            // just means no signal
            Err(e @ CoreError::NotFound(_)) => return Err(e),
            Err(_) => return Ok(HistorySignal::default()),
        };

        let mut signal = HistorySignal::default();
        for item in &result.items {
            if item.record.category != "task_outcome" {
                continue;
            }
            signal.related += 1;
            if item.record.tags.iter().any(|t| t == "failed" || t == "timed_out") {
                signal.failed += 1;
            }
        }
        Ok(signal)
    }

    async fn run_direct(&self, task_id: &str, task: &TaskSpec, deadline: Instant) -> TaskOutcome {
        let _permit = self.workers.acquire().await;
        let request = InferenceRequest {
            prompt: task.goal.clone(),
            parameters: Default::default(),
        };

        let mut attempt = 0;
        loop {
            let left = remaining(deadline);
            if left.is_zero() {
                return timed_out(task_id, task.deadline_ms);
            }
            match self.router.complete(&request, left).await {
                Ok(response) => {
                    return TaskOutcome {
                        task_id: task_id.to_string(),
                        status: TaskStatus::Succeeded,
                        result: response.completion,
                        execution_ids: vec![],
                        error_kind: None,
                    }
                }
                Err(e) if e.is_transient() && attempt < self.config.tool_retry_limit => {
                    attempt += 1;
                    warn!(task_id = %task_id, attempt = attempt, error = %e, "Retrying inference");
                    tokio::time::sleep(self.backoff(attempt).min(remaining(deadline))).await;
                }
                Err(e) => return failed(task_id, &e),
            }
        }
    }

    async fn run_tool(&self, task_id: &str, task: &TaskSpec, deadline: Instant) -> TaskOutcome {
        let _permit = self.workers.acquire().await;
        let Some(tool_id) = task.tool_id.as_deref() else {
            return failed(
                task_id,
                &CoreError::Validation("Tool path selected without an attached tool".to_string()),
            );
        };
        let Some(tool_input) = task.tool_input.clone() else {
            return failed(
                task_id,
                &CoreError::Validation(format!(
                    "Tool '{}' attached without input",
                    tool_id
                )),
            );
        };
        let input_json = match serde_json::to_value(&tool_input) {
            Ok(serde_json::Value::Object(map)) => serde_json::Value::Object(map),
            _ => return failed(task_id, &CoreError::Validation("Unserializable tool input".to_string())),
        };

        let mut execution_ids = Vec::new();
        let mut attempt = 0;
        loop {
            if remaining(deadline).is_zero() {
                return TaskOutcome {
                    execution_ids,
                    ..timed_out(task_id, task.deadline_ms)
                };
            }

            // Resolution and the ledger entry run per attempt so a
            // revoked grant stops retries immediately
            let tool = match self.registry.resolve(&task.principal, tool_id).await {
                Ok(tool) => tool,
                Err(e) => {
                    return TaskOutcome {
                        execution_ids,
                        ..failed(task_id, &e)
                    }
                }
            };
            let execution_id = match self
                .registry
                .begin_execution(&task.principal, tool_id, &input_json)
                .await
            {
                Ok(id) => id,
                Err(e) => {
                    return TaskOutcome {
                        execution_ids,
                        ..failed(task_id, &e)
                    }
                }
            };
            execution_ids.push(execution_id.clone());

            match self.dispatch(&tool, &tool_input, remaining(deadline)).await {
                Ok(dispatched) => {
                    let error_kind = status_error_kind(dispatched.status);
                    if let Err(e) = self
                        .registry
                        .finish_execution(
                            &execution_id,
                            dispatched.status,
                            Some(&dispatched.output),
                            error_kind,
                            &dispatched.usage,
                        )
                        .await
                    {
                        warn!(execution_id = %execution_id, error = %e, "Failed to close execution");
                    }
                    return TaskOutcome {
                        task_id: task_id.to_string(),
                        status: match dispatched.status {
                            ExecutionStatus::Succeeded => TaskStatus::Succeeded,
                            ExecutionStatus::TimedOut => TaskStatus::TimedOut,
                            _ => TaskStatus::Failed,
                        },
                        result: dispatched.output.to_string(),
                        execution_ids,
                        error_kind: error_kind.map(str::to_string),
                    };
                }
                Err(e) => {
                    if let Err(close_err) = self
                        .registry
                        .finish_execution(
                            &execution_id,
                            ExecutionStatus::Failed,
                            None,
                            Some(e.kind()),
                            &ResourceUsage::default(),
                        )
                        .await
                    {
                        warn!(execution_id = %execution_id, error = %close_err, "Failed to close execution");
                    }
                    if e.is_transient() && attempt < self.config.tool_retry_limit {
                        attempt += 1;
                        warn!(task_id = %task_id, attempt = attempt, error = %e, "Retrying tool dispatch");
                        tokio::time::sleep(self.backoff(attempt).min(remaining(deadline))).await;
                        continue;
                    }
                    return TaskOutcome {
                        execution_ids,
                        ..failed(task_id, &e)
                    };
                }
            }
        }
    }

    /// Route an invocation to where the tool actually lives
    async fn dispatch(
        &self,
        tool: &Tool,
        input: &ToolInput,
        left: Duration,
    ) -> Result<Dispatched, CoreError> {
        let (scheme, target) = tool.dispatch_target.split_once(':').ok_or_else(|| {
            CoreError::Validation(format!(
                "Tool '{}' has a malformed dispatch target",
                tool.name
            ))
        })?;

        match scheme {
            "builtin" if target == "echo" => Ok(Dispatched {
                output: serde_json::json!({
                    "method": input.method,
                    "params": input.params,
                }),
                status: ExecutionStatus::Succeeded,
                usage: ResourceUsage::default(),
            }),
            "inference" => {
                let prompt = input
                    .param_str("prompt")
                    .ok_or_else(|| {
                        CoreError::Validation("Inference tool input has no 'prompt'".to_string())
                    })?
                    .to_string();
                let response = self
                    .router
                    .complete(
                        &InferenceRequest {
                            prompt,
                            parameters: Default::default(),
                        },
                        left,
                    )
                    .await?;
                Ok(Dispatched {
                    output: serde_json::json!({"completion": response.completion}),
                    status: ExecutionStatus::Succeeded,
                    usage: ResourceUsage::default(),
                })
            }
            "cmd" => {
                let args: Vec<String> = input
                    .params
                    .get("args")
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
                    .unwrap_or_default();
                let spec = sdk::types::SandboxSpec {
                    command: target.to_string(),
                    args,
                    limits: sdk::types::SandboxLimits {
                        wall_clock_ms: (left.as_millis() as u64).max(1),
                        ..Default::default()
                    },
                };
                let run_id = Uuid::new_v4().to_string();
                let report = self.sandbox.run(&run_id, &spec).await?;
                Ok(Dispatched {
                    output: serde_json::json!({
                        "exit_status": report.outcome.exit_status,
                        "stdout": report.outcome.stdout,
                        "stderr": report.outcome.stderr,
                    }),
                    status: termination_status(report.termination),
                    usage: report.outcome.resource_usage,
                })
            }
            other => Err(CoreError::Validation(format!(
                "Tool '{}' has unknown dispatch scheme '{}'",
                tool.name, other
            ))),
        }
    }

    async fn run_sandbox(&self, task_id: &str, task: &TaskSpec, deadline: Instant) -> TaskOutcome {
        let _permit = self.workers.acquire().await;
        let Some(mut spec) = task.sandbox.clone() else {
            return failed(
                task_id,
                &CoreError::Validation(
                    "Sandbox path selected without an attached command".to_string(),
                ),
            );
        };
        // The task deadline caps the run's own wall clock
        let left_ms = (remaining(deadline).as_millis() as u64).max(1);
        spec.limits.wall_clock_ms = spec.limits.wall_clock_ms.min(left_ms).max(1);

        let run_id = Uuid::new_v4().to_string();
        let ledger_input = serde_json::json!({
            "command": spec.command,
            "args": spec.args,
        });
        let execution_id = match self
            .open_sandbox_ledger(task, &spec, &ledger_input)
            .await
        {
            Ok(id) => id,
            Err(e) => return failed(task_id, &e),
        };

        match self.sandbox.run(&run_id, &spec).await {
            Ok(report) => {
                let status = termination_status(report.termination);
                let output = serde_json::json!({
                    "exit_status": report.outcome.exit_status,
                    "stdout": report.outcome.stdout,
                    "stderr": report.outcome.stderr,
                });
                let error_kind = status_error_kind(status);
                if let Err(e) = self
                    .registry
                    .finish_execution(
                        &execution_id,
                        status,
                        Some(&output),
                        error_kind,
                        &report.outcome.resource_usage,
                    )
                    .await
                {
                    warn!(execution_id = %execution_id, error = %e, "Failed to close execution");
                }
                TaskOutcome {
                    task_id: task_id.to_string(),
                    status: match status {
                        ExecutionStatus::Succeeded => TaskStatus::Succeeded,
                        ExecutionStatus::TimedOut => TaskStatus::TimedOut,
                        _ => TaskStatus::Failed,
                    },
                    result: output.to_string(),
                    execution_ids: vec![execution_id],
                    error_kind: error_kind.map(str::to_string),
                }
            }
            Err(e) => {
                if let Err(close_err) = self
                    .registry
                    .finish_execution(
                        &execution_id,
                        ExecutionStatus::Failed,
                        None,
                        Some(e.kind()),
                        &ResourceUsage::default(),
                    )
                    .await
                {
                    warn!(execution_id = %execution_id, error = %close_err, "Failed to close execution");
                }
                TaskOutcome {
                    execution_ids: vec![execution_id],
                    ..failed(task_id, &e)
                }
            }
        }
    }

    /// Sandbox runs go through the same ledger as tool invocations,
    /// keyed by a synthetic sandbox target instead of a catalog id
    async fn open_sandbox_ledger(
        &self,
        task: &TaskSpec,
        spec: &sdk::types::SandboxSpec,
        input: &serde_json::Value,
    ) -> Result<String, CoreError> {
        let execution_id = Uuid::new_v4().to_string();
        let tool_id = format!("sandbox:{}", spec.command);
        self.registry
            .ledger_sandbox_run(&execution_id, &tool_id, &task.principal, input)
            .await?;
        Ok(execution_id)
    }

    async fn run_fanout(
        self: Arc<Self>,
        task_id: &str,
        task: &TaskSpec,
        depth: u32,
        deadline: Instant,
    ) -> TaskOutcome {
        if depth + 1 > self.config.max_fanout_depth {
            return failed(
                task_id,
                &CoreError::ResourceExhausted(format!(
                    "fan-out depth {} exceeds the limit of {}",
                    depth + 1,
                    self.config.max_fanout_depth
                )),
            );
        }

        let futures: Vec<_> = task
            .subtasks
            .iter()
            .cloned()
            .map(|sub| {
                let child_id = Uuid::new_v4().to_string();
                let child_deadline = deadline
                    .min(Instant::now() + Duration::from_millis(sub.deadline_ms));
                Arc::clone(&self).run_task(child_id, sub, depth + 1, child_deadline)
            })
            .collect();
        let children = futures::future::join_all(futures).await;

        let execution_ids: Vec<String> = children
            .iter()
            .flat_map(|c| c.execution_ids.iter().cloned())
            .collect();
        let (status, result, error_kind) = merge(task.merge_policy, &children);

        TaskOutcome {
            task_id: task_id.to_string(),
            status,
            result,
            execution_ids,
            error_kind,
        }
    }

    /// Write the durable summary of a finished task. Failure to record
    /// is logged, never propagated over the outcome.
    async fn record_outcome(&self, task: &TaskSpec, outcome: &TaskOutcome) {
        let status_tag = match outcome.status {
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::TimedOut => "timed_out",
        };
        let request = StoreRequest {
            scope_id: task.scope_id.clone(),
            key: None,
            category: "task_outcome".to_string(),
            content: format!("Task '{}' {}", truncate(&task.goal, 120), status_tag),
            tags: vec!["task_outcome".to_string(), status_tag.to_string()],
            importance: 0.6,
            execution_id: outcome.execution_ids.last().cloned(),
        };
        if let Err(e) = self.guild.store(request).await {
            warn!(task_id = %outcome.task_id, error = %e, "Failed to record task outcome");
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.config.tool_retry_backoff_ms * u64::from(attempt))
    }
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut cut = max;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}...", &s[..cut])
    }
}

fn failed(task_id: &str, error: &CoreError) -> TaskOutcome {
    TaskOutcome {
        task_id: task_id.to_string(),
        status: TaskStatus::Failed,
        result: String::new(),
        execution_ids: vec![],
        error_kind: Some(error.kind().to_string()),
    }
}

fn timed_out(task_id: &str, deadline_ms: u64) -> TaskOutcome {
    TaskOutcome {
        task_id: task_id.to_string(),
        status: TaskStatus::TimedOut,
        result: String::new(),
        execution_ids: vec![],
        error_kind: Some(CoreError::Timeout(deadline_ms).kind().to_string()),
    }
}

fn termination_status(termination: Termination) -> ExecutionStatus {
    match termination {
        Termination::Exited(0) => ExecutionStatus::Succeeded,
        Termination::Exited(_) => ExecutionStatus::Failed,
        Termination::TimedOut => ExecutionStatus::TimedOut,
        Termination::Killed => ExecutionStatus::Killed,
    }
}

fn status_error_kind(status: ExecutionStatus) -> Option<&'static str> {
    match status {
        ExecutionStatus::Succeeded => None,
        ExecutionStatus::TimedOut => Some("timeout"),
        ExecutionStatus::Killed => Some("killed"),
        _ => Some("execution_failed"),
    }
}

/// Fold child outcomes into one result per the declared policy
fn merge(
    policy: MergePolicy,
    children: &[TaskOutcome],
) -> (TaskStatus, String, Option<String>) {
    let succeeded: Vec<&TaskOutcome> = children
        .iter()
        .filter(|c| c.status == TaskStatus::Succeeded)
        .collect();
    let first_error = children
        .iter()
        .find(|c| c.status != TaskStatus::Succeeded)
        .and_then(|c| c.error_kind.clone());

    match policy {
        MergePolicy::Concat => {
            let results: Vec<&str> = succeeded.iter().map(|c| c.result.as_str()).collect();
            let merged = serde_json::to_string(&results).unwrap_or_default();
            if succeeded.len() == children.len() {
                (TaskStatus::Succeeded, merged, None)
            } else {
                (TaskStatus::Failed, merged, first_error)
            }
        }
        MergePolicy::Majority => {
            let results: Vec<&str> = succeeded.iter().map(|c| c.result.as_str()).collect();
            let merged = serde_json::to_string(&results).unwrap_or_default();
            if succeeded.len() * 2 > children.len() {
                (TaskStatus::Succeeded, merged, None)
            } else {
                (TaskStatus::Failed, merged, first_error)
            }
        }
        MergePolicy::FirstSuccess => match succeeded.first() {
            Some(winner) => (TaskStatus::Succeeded, winner.result.clone(), None),
            None => (TaskStatus::Failed, String::new(), first_error),
        },
    }
}

/// Submission-time validation, applied recursively down declared
/// subtasks so a malformed leaf is caught before anything runs
fn validate_task(task: &TaskSpec) -> Result<(), CoreError> {
    if task.goal.trim().is_empty() {
        return Err(CoreError::Validation("Task goal is empty".to_string()));
    }
    if task.scope_id.trim().is_empty() {
        return Err(CoreError::Validation("Task scope is empty".to_string()));
    }
    if task.principal.trim().is_empty() {
        return Err(CoreError::Validation("Task principal is empty".to_string()));
    }
    if task.deadline_ms == 0 {
        return Err(CoreError::Validation("Task deadline is zero".to_string()));
    }
    // Tools attach at creation: a tool-hinted task without one is
    // malformed rather than deferred
    if task.strategy_hint == Some(StrategyHint::Tool)
        && (task.tool_id.is_none() || task.tool_input.is_none())
    {
        return Err(CoreError::Validation(
            "Tool strategy requires an attached tool and input".to_string(),
        ));
    }
    if task.strategy_hint == Some(StrategyHint::Sandbox) && task.sandbox.is_none() {
        return Err(CoreError::Validation(
            "Sandbox strategy requires an attached command".to_string(),
        ));
    }
    for sub in &task.subtasks {
        validate_task(sub)?;
    }
    Ok(())
}

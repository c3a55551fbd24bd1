//! Boundary contract types
//!
//! Shared types for the four boundary contracts the core exposes and
//! consumes: inbound task submission, tool invocation, sandbox execution,
//! and inference. The exact wire format is an implementation choice; these
//! types pin down the required semantics.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Permission level bound to a (principal, tool) pair
///
/// Levels are totally ordered; a grant satisfies a requirement when its
/// level is greater than or equal to the tool's required level. The absence
/// of a grant is `None` — there is no implicit owner bypass.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum PermissionLevel {
    None,
    Read,
    Execute,
    Admin,
}

impl PermissionLevel {
    pub fn as_str(&self) -> &str {
        match self {
            PermissionLevel::None => "none",
            PermissionLevel::Read => "read",
            PermissionLevel::Execute => "execute",
            PermissionLevel::Admin => "admin",
        }
    }

    /// Parse a stored level string; unknown values collapse to `None` so a
    /// corrupted grant can never widen access.
    pub fn parse(s: &str) -> Self {
        match s {
            "read" => PermissionLevel::Read,
            "execute" => PermissionLevel::Execute,
            "admin" => PermissionLevel::Admin,
            _ => PermissionLevel::None,
        }
    }
}

impl std::fmt::Display for PermissionLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input to a tool invocation: `{tool_id, input}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInput {
    pub method: String,
    pub params: HashMap<String, serde_json::Value>,
}

impl ToolInput {
    /// Create a new ToolInput
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            params: HashMap::new(),
        }
    }

    /// Add a parameter
    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    /// Get a string parameter
    pub fn param_str(&self, key: &str) -> Option<String> {
        self.params
            .get(key)
            .and_then(|v| v.as_str())
            .map(String::from)
    }

    /// Get a bool parameter
    pub fn param_bool(&self, key: &str) -> Option<bool> {
        self.params.get(key).and_then(|v| v.as_bool())
    }
}

/// Output from a tool invocation: `{output | error, resource_usage}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutput {
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    #[serde(default)]
    pub resource_usage: ResourceUsage,
}

impl ToolOutput {
    /// Successful output
    pub fn ok(output: serde_json::Value, resource_usage: ResourceUsage) -> Self {
        Self {
            output: Some(output),
            error: None,
            resource_usage,
        }
    }

    /// Failed output
    pub fn err(error: impl Into<String>) -> Self {
        Self {
            output: None,
            error: Some(error.into()),
            resource_usage: ResourceUsage::default(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Resource usage summary attached to execution records
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// CPU time consumed, in milliseconds
    pub cpu_ms: u64,
    /// Peak resident memory observed, in bytes
    pub max_memory_bytes: u64,
    /// Wall-clock duration, in milliseconds
    pub wall_ms: u64,
}

/// Declared limits for a sandbox run
///
/// A run never outlives `wall_clock_ms`: the manager enforces a hard kill
/// independent of cooperative cancellation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxLimits {
    /// CPU budget in milliseconds
    pub cpu_ms: u64,
    /// Memory ceiling in bytes
    pub memory_bytes: u64,
    /// Wall-clock ceiling in milliseconds
    pub wall_clock_ms: u64,
    /// Whether the run may reach the network
    pub network: bool,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            cpu_ms: 30_000,
            memory_bytes: 256 * 1024 * 1024,
            wall_clock_ms: 30_000,
            network: false,
        }
    }
}

/// Sandbox contract request: `{code_or_command, limits}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSpec {
    /// Program to execute inside the isolated workspace
    pub command: String,
    /// Arguments passed verbatim (no shell interpretation)
    #[serde(default)]
    pub args: Vec<String>,
    /// Declared resource limits
    #[serde(default)]
    pub limits: SandboxLimits,
}

/// Sandbox contract response: `{exit_status, stdout, stderr, resource_usage}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxOutcome {
    pub exit_status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub resource_usage: ResourceUsage,
}

/// Inference contract request: `{prompt, parameters}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub prompt: String,
    #[serde(default)]
    pub parameters: InferenceParameters,
}

/// Tunable inference parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceParameters {
    pub temperature: f64,
    pub max_tokens: u32,
}

impl Default for InferenceParameters {
    fn default() -> Self {
        Self {
            temperature: 0.2,
            max_tokens: 1024,
        }
    }
}

/// Inference contract response: `{completion, token_usage}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceResponse {
    pub completion: String,
    pub token_usage: TokenUsage,
}

/// Token accounting for one inference round trip
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// Caller-supplied suggestion for the execution path. Advisory, except
/// `Sandbox` which is honored as an isolation request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StrategyHint {
    Direct,
    Tool,
    Sandbox,
}

/// How fan-out sub-results are combined into one task result
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Concatenate all successful sub-results in subtask order
    Concat,
    /// Succeed when a strict majority of subtasks succeed
    Majority,
    /// Succeed with the first successful sub-result
    FirstSuccess,
}

/// The unit of work submitted to the orchestrator
///
/// Ephemeral: a task exists only for the duration of scoring, dispatch, and
/// aggregation. Its outcome is durably represented by execution records and
/// memory records, never by the task object itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Natural-language or structured goal
    pub goal: String,
    /// Originating context scope
    pub scope_id: String,
    /// Principal on whose behalf the task runs
    pub principal: String,
    /// Optional explicit strategy hint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy_hint: Option<StrategyHint>,
    /// Tool to invoke when the tool path is selected
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_id: Option<String>,
    /// Tool input when the tool path is selected
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<ToolInput>,
    /// Command to run when the sandbox path is selected
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<SandboxSpec>,
    /// Pre-decomposed subtasks; a non-empty list marks the task decomposable
    #[serde(default)]
    pub subtasks: Vec<TaskSpec>,
    /// Merge policy for fan-out aggregation
    #[serde(default = "default_merge_policy")]
    pub merge_policy: MergePolicy,
    /// Deadline for the whole task, in milliseconds from submission
    #[serde(default = "default_deadline_ms")]
    pub deadline_ms: u64,
}

fn default_merge_policy() -> MergePolicy {
    MergePolicy::Concat
}

fn default_deadline_ms() -> u64 {
    120_000
}

impl TaskSpec {
    /// Create a minimal task with defaults
    pub fn new(
        goal: impl Into<String>,
        scope_id: impl Into<String>,
        principal: impl Into<String>,
    ) -> Self {
        Self {
            goal: goal.into(),
            scope_id: scope_id.into(),
            principal: principal.into(),
            strategy_hint: None,
            tool_id: None,
            tool_input: None,
            sandbox: None,
            subtasks: Vec::new(),
            merge_policy: MergePolicy::Concat,
            deadline_ms: default_deadline_ms(),
        }
    }

    /// A task is decomposable when it carries subtasks
    pub fn is_decomposable(&self) -> bool {
        !self.subtasks.is_empty()
    }
}

/// Terminal status of a routed task
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Succeeded,
    Failed,
    TimedOut,
}

/// Aggregated result returned to the caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: String,
    pub status: TaskStatus,
    pub result: String,
    /// Execution records this task produced
    pub execution_ids: Vec<String>,
    /// Error kind when the task did not succeed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
}

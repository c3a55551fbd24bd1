//! Task complexity scoring
//!
//! Produces a score in [0, 1] from the task itself plus what memory
//! remembers about similar work, then maps the score and the task's
//! shape to an execution strategy. Scoring is pure; the only outside
//! input is the pre-fetched history summary.

use sdk::types::{StrategyHint, TaskSpec};

use crate::config::RoutingConfig;

/// What past outcomes say about tasks like this one
#[derive(Debug, Clone, Copy, Default)]
pub struct HistorySignal {
    /// Related task_outcome records found
    pub related: usize,
    /// How many of those ended in failure
    pub failed: usize,
}

impl HistorySignal {
    pub fn failure_rate(&self) -> f64 {
        if self.related == 0 {
            0.0
        } else {
            self.failed as f64 / self.related as f64
        }
    }
}

/// Execution strategy chosen for a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Answer directly through an inference provider
    Direct,
    /// Invoke the attached tool through the registry
    Tool,
    /// Run the attached command in a sandbox
    Sandbox,
    /// Fan out into subtasks and merge
    Decompose,
}

/// Score a task's complexity
///
/// Factors, in decreasing weight: goal size, declared decomposition,
/// the caller's hint, and the failure rate of similar past tasks.
pub fn complexity_score(task: &TaskSpec, history: &HistorySignal) -> f64 {
    let size = (task.goal.len() as f64 / 400.0).min(1.0) * 0.4;

    let fanout = (task.subtasks.len() as f64 / 4.0).min(1.0) * 0.3;

    let hint = match task.strategy_hint {
        Some(StrategyHint::Sandbox) => 0.2,
        Some(StrategyHint::Tool) => 0.1,
        Some(StrategyHint::Direct) | None => 0.0,
    };

    let history_factor = history.failure_rate() * 0.1;

    (size + fanout + hint + history_factor).clamp(0.0, 1.0)
}

/// Map a scored task to a strategy
///
/// Shape wins over score: declared subtasks always decompose and a
/// sandbox hint is always honored as an isolation request. Between
/// those, the thresholds arbitrate: past the high threshold an attached
/// command isolates, past the low one an attached tool is used, and
/// anything cheaper goes straight to inference.
pub fn select_strategy(task: &TaskSpec, score: f64, config: &RoutingConfig) -> Strategy {
    if task.is_decomposable() {
        return Strategy::Decompose;
    }
    if task.strategy_hint == Some(StrategyHint::Sandbox) {
        return Strategy::Sandbox;
    }
    if task.sandbox.is_some() && (score >= config.high_threshold || task.tool_id.is_none()) {
        return Strategy::Sandbox;
    }
    if task.tool_id.is_some() {
        // Cheap tasks skip the tool unless the caller asked for it
        if score >= config.low_threshold || task.strategy_hint == Some(StrategyHint::Tool) {
            return Strategy::Tool;
        }
    }
    Strategy::Direct
}

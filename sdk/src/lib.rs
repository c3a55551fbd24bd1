//! Drover SDK
//!
//! Shared library providing the boundary contracts and error taxonomy for
//! the Drover task-orchestration core. This crate is used by the engine and
//! by external tool implementations that speak the invocation contract.

/// Error types and handling
pub mod errors;

/// Boundary contract types
pub mod types;

// Re-export commonly used types
pub use errors::{CoreError, DroverErrorExt};
pub use types::{
    InferenceParameters, InferenceRequest, InferenceResponse, MergePolicy, PermissionLevel,
    ResourceUsage, SandboxLimits, SandboxOutcome, SandboxSpec, StrategyHint, TaskOutcome, TaskSpec,
    TaskStatus, TokenUsage, ToolInput, ToolOutput,
};

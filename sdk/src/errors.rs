//! Error types and handling
//!
//! This module provides the error taxonomy used throughout the Drover core.
//! All errors implement the `DroverErrorExt` trait which provides
//! user-friendly hints, recoverability information, and the transience
//! classification that drives the orchestrator's retry policy.
//!
//! # Propagation policy
//!
//! `DependencyUnavailable` raised by a non-essential dependency (the
//! embedding/similarity backend) is recovered locally via degraded mode and
//! never surfaced as a task failure. Every other kind propagates to the
//! task's terminal execution record verbatim, with enough structure
//! (kind + context) for a caller to make an automated retry decision.

use crate::types::PermissionLevel;
use thiserror::Error;

/// Trait for Drover error extensions
///
/// Provides additional context for errors beyond the message itself. All
/// core errors implement this trait.
pub trait DroverErrorExt {
    /// Returns a user-friendly hint for the error
    ///
    /// The hint is safe to display to end users and does not contain
    /// payloads, file paths, or internal implementation details.
    fn user_hint(&self) -> &str;

    /// Returns whether the error is recoverable
    ///
    /// Recoverable errors can be retried or worked around. Non-recoverable
    /// errors typically require operator intervention.
    fn is_recoverable(&self) -> bool;

    /// Returns whether the error is transient
    ///
    /// Transient errors are network-classified failures that the
    /// orchestrator may retry with backoff. Permission and validation
    /// errors are never transient, and sandbox timeouts/kills are
    /// deliberately excluded: re-running unsafe code is a caller-level
    /// policy decision, not something the core does on its own.
    fn is_transient(&self) -> bool;
}

/// Main core error type
///
/// Each variant carries context-specific information. Variants map directly
/// onto the outcomes a caller can observe at the component boundaries:
/// registry resolution, sandbox provisioning and execution, memory guild
/// mutation, and task routing.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Malformed task or tool spec, rejected before any side effect
    #[error("Validation error: {0}")]
    Validation(String),

    /// The principal's grant level is insufficient for the operation
    #[error("Permission denied for principal '{principal}' on tool '{tool_id}': requires {required}, has {held}")]
    PermissionDenied {
        principal: String,
        tool_id: String,
        required: PermissionLevel,
        held: PermissionLevel,
    },

    /// Tool, scope, or record does not exist (or has been retired)
    #[error("Not found: {0}")]
    NotFound(String),

    /// A tool with the same (name, version) is already registered
    #[error("Duplicate tool: {name} v{version}")]
    DuplicateTool { name: String, version: String },

    /// Sandbox context allocation failed (resource exhaustion, workspace I/O)
    #[error("Provision error: {0}")]
    ProvisionError(String),

    /// A run requested a capability beyond its granted permission level
    #[error("Capability denied: {0}")]
    CapabilityDenied(String),

    /// The requested parent assignment would create an inheritance cycle
    #[error("Cycle detected: scope '{child}' cannot inherit from its descendant '{parent}'")]
    CycleDetected { child: String, parent: String },

    /// A deadline or wall-clock limit elapsed
    #[error("Timed out after {0} ms")]
    Timeout(u64),

    /// A declared resource limit (memory, CPU, output size) was exceeded
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A non-essential external collaborator is down
    /// (similarity/embedding backend or inference provider)
    #[error("Dependency unavailable: {0}")]
    DependencyUnavailable(String),

    // Ambient carriers
    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Stable machine-readable kind tag, suitable for persisting on an
    /// execution record and for automated retry decisions.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::PermissionDenied { .. } => "permission_denied",
            Self::NotFound(_) => "not_found",
            Self::DuplicateTool { .. } => "duplicate_tool",
            Self::ProvisionError(_) => "provision_error",
            Self::CapabilityDenied(_) => "capability_denied",
            Self::CycleDetected { .. } => "cycle_detected",
            Self::Timeout(_) => "timeout",
            Self::ResourceExhausted(_) => "resource_exhausted",
            Self::DependencyUnavailable(_) => "dependency_unavailable",
            Self::Database(_) => "database",
            Self::Io(_) => "io",
        }
    }
}

impl DroverErrorExt for CoreError {
    fn user_hint(&self) -> &str {
        match self {
            Self::Validation(_) => "The task or tool spec is malformed. Fix it and resubmit",
            Self::PermissionDenied { .. } => "The principal lacks a sufficient grant for this tool",
            Self::NotFound(_) => "The requested tool, scope, or record does not exist",
            Self::DuplicateTool { .. } => "A tool with this name and version is already registered",
            Self::ProvisionError(_) => "Sandbox provisioning failed. Check host resources",
            Self::CapabilityDenied(_) => "The run requested a capability it was not granted",
            Self::CycleDetected { .. } => "This inheritance link would create a cycle",
            Self::Timeout(_) => "The operation exceeded its deadline",
            Self::ResourceExhausted(_) => "A declared resource limit was exceeded",
            Self::DependencyUnavailable(_) => "An external collaborator is unavailable",
            Self::Database(_) => "Database operation failed. Check the data directory",
            Self::Io(_) => "File system operation failed",
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            // Rejections of well-formed intent: fix the input or grants first
            Self::Validation(_)
            | Self::PermissionDenied { .. }
            | Self::DuplicateTool { .. }
            | Self::CapabilityDenied(_)
            | Self::CycleDetected { .. } => false,

            // All other errors are potentially recoverable
            _ => true,
        }
    }

    fn is_transient(&self) -> bool {
        // Only network-classified failures: a local database or
        // filesystem error is deterministic and retrying it just
        // repeats the failure
        matches!(self, Self::DependencyUnavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_denied_never_transient() {
        let err = CoreError::PermissionDenied {
            principal: "agent-1".to_string(),
            tool_id: "tool-1".to_string(),
            required: PermissionLevel::Execute,
            held: PermissionLevel::Read,
        };
        assert!(!err.is_transient());
        assert!(!err.is_recoverable());
        assert_eq!(err.kind(), "permission_denied");
        assert!(err.to_string().contains("requires execute, has read"));
    }

    #[test]
    fn test_validation_never_transient() {
        let err = CoreError::Validation("empty goal".to_string());
        assert!(!err.is_transient());
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_timeout_not_transient() {
        // Sandbox timeouts are not retried by the core
        let err = CoreError::Timeout(5000);
        assert!(!err.is_transient());
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_dependency_unavailable_transient() {
        let err = CoreError::DependencyUnavailable("embedding backend down".to_string());
        assert!(err.is_transient());
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_local_failures_not_transient() {
        let err = CoreError::Database("disk image is malformed".to_string());
        assert!(!err.is_transient());

        let err = CoreError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "device gone",
        ));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_kind_tags_are_stable() {
        let err = CoreError::DuplicateTool {
            name: "echo".to_string(),
            version: "1".to_string(),
        };
        assert_eq!(err.kind(), "duplicate_tool");

        let err = CoreError::CycleDetected {
            child: "a".to_string(),
            parent: "b".to_string(),
        };
        assert_eq!(err.kind(), "cycle_detected");
    }
}

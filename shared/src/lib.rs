//! Shared data structures and utilities for the task orchestrator
//!
//! This crate contains the domain model, API types, configuration structures,
//! and the pure schedule-computation engine used by the control plane server.

pub mod api;
pub mod config;
pub mod defaults;
pub mod model;
pub mod schedule;
pub mod utils;

// Re-export commonly used types for convenience
pub use api::{ApiResponse, CompletionRequest, HeartbeatRequest};
pub use model::{
    ExecutionRecord, ExecutionStatus, ScheduleRecord, ScheduleType, TaskRecord, TaskSnapshot,
    TaskStatus, TaskType, TriggerMode,
};
pub use schedule::ScheduleSpec;
pub use utils::{container_name_for, current_timestamp, new_id};

/// Result type alias used throughout the shared crate
pub type Result<T> = anyhow::Result<T>;

/// Error taxonomy for the orchestrator
///
/// Each layer converts lower-level failures into one of these kinds. Only
/// `Transient` errors are retried internally; everything else is surfaced to
/// the caller with a human-readable reason.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    Permission(String),

    #[error("Transient infrastructure error: {0}")]
    Transient(String),

    #[error("Resource exhausted: {0}")]
    Exhaustion(String),

    #[error("Container error: {0}")]
    Container(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_carries_reason() {
        let err = OrchestratorError::Exhaustion("no free port in 50000-50002".to_string());
        assert_eq!(
            err.to_string(),
            "Resource exhausted: no free port in 50000-50002"
        );
    }
}

//! Utility functions for the task orchestrator
//!
//! Small helpers shared by the control plane modules: identifier generation
//! and validation, epoch timestamp handling, and container naming.

use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Generate a new opaque identifier (UUID v4, hyphenated)
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Validate an execution identifier reported by a container callback
///
/// Execution identifiers are UUID strings minted by the control plane; a
/// callback carrying anything else is malformed.
pub fn validate_execution_id(execution_id: &str) -> crate::Result<()> {
    if execution_id.is_empty() {
        return Err(crate::OrchestratorError::Validation(
            "Missing execution_id".to_string(),
        )
        .into());
    }

    Uuid::parse_str(execution_id).map_err(|_| {
        crate::OrchestratorError::Validation(format!(
            "Invalid execution_id format: {}",
            execution_id
        ))
    })?;

    Ok(())
}

/// Short form of an identifier, used when composing human-readable names
pub fn short_id(id: &str) -> &str {
    &id[..id.len().min(8)]
}

/// Deterministic container name for an execution
pub fn container_name_for(execution_id: &str) -> String {
    format!("task-{}", execution_id)
}

/// Get current Unix timestamp in seconds
pub fn current_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Current wall-clock time as a naive local datetime
///
/// Schedule arithmetic runs on naive local time; the conversion to epoch
/// seconds happens only at the persistence boundary.
pub fn now_naive() -> NaiveDateTime {
    Local::now().naive_local()
}

/// Convert a naive local datetime to epoch seconds
///
/// Ambiguous local times (DST transitions) resolve to the earlier instant.
pub fn epoch_from_naive(naive: NaiveDateTime) -> Option<i64> {
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt: DateTime<Local>| dt.timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_id_is_valid_execution_id() {
        let id = new_id();
        assert!(validate_execution_id(&id).is_ok());
    }

    #[test]
    fn test_validate_execution_id_rejects_garbage() {
        assert!(validate_execution_id("").is_err());
        assert!(validate_execution_id("not-a-uuid").is_err());
        assert!(validate_execution_id("task-12345").is_err());
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("0123456789abcdef"), "01234567");
        assert_eq!(short_id("abc"), "abc");
    }

    #[test]
    fn test_container_name_format() {
        let id = "a1b2c3d4-0000-0000-0000-000000000000";
        assert_eq!(
            container_name_for(id),
            "task-a1b2c3d4-0000-0000-0000-000000000000"
        );
    }

    #[test]
    fn test_epoch_from_naive_matches_wall_clock() {
        let epoch = epoch_from_naive(now_naive()).unwrap();
        // Sub-second precision is dropped in the conversion.
        assert!((epoch - Local::now().timestamp()).abs() <= 1);
    }
}

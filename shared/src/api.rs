//! API types and structures for control-plane and data-plane communication
//!
//! This module defines the request and response types used by the REST API:
//! the control surface consumed by users/UIs and the callback surface
//! consumed by collection containers.

use crate::model::{
    ExecutionRecord, ExecutionStatus, ExtractConfig, ScheduleType, TaskType, TriggerMode, UrlParam,
};
use serde::{Deserialize, Serialize};

/// Generic API response wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub status: String,
    pub message: Option<String>,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    /// Create a successful API response carrying data
    pub fn success(data: T) -> Self {
        Self {
            status: "success".to_string(),
            message: None,
            data: Some(data),
            error: None,
        }
    }

    /// Create a successful API response with a message and data
    pub fn message_with_data(message: impl Into<String>, data: T) -> Self {
        Self {
            status: "success".to_string(),
            message: Some(message.into()),
            data: Some(data),
            error: None,
        }
    }

    /// Create a successful API response carrying only a message
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            status: "success".to_string(),
            message: Some(message.into()),
            data: None,
            error: None,
        }
    }

    /// Create an error API response
    pub fn error(error_message: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            message: None,
            data: None,
            error: Some(error_message.into()),
        }
    }
}

/// A schedule specification as supplied by API callers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleSpecRequest {
    pub schedule_type: ScheduleType,
    #[serde(default = "empty_config")]
    pub schedule_config: serde_json::Value,
}

fn empty_config() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// Request body for POST /api/v1/tasks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCreateRequest {
    pub task_name: String,
    pub task_type: TaskType,
    #[serde(default)]
    pub trigger_mode: Option<TriggerMode>,
    pub base_url: Option<String>,
    #[serde(default)]
    pub base_url_params: Vec<UrlParam>,
    #[serde(default)]
    pub need_user_login: bool,
    pub extract_config: Option<ExtractConfig>,
    pub description: Option<String>,
    /// Required when the trigger mode is `auto`
    pub schedule: Option<ScheduleSpecRequest>,
}

/// Request body for PUT /api/v1/tasks/{task_id}
///
/// Only the supplied fields are changed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskUpdateRequest {
    pub task_name: Option<String>,
    pub base_url: Option<String>,
    pub base_url_params: Option<Vec<UrlParam>>,
    pub need_user_login: Option<bool>,
    pub extract_config: Option<ExtractConfig>,
    pub description: Option<String>,
    pub trigger_mode: Option<TriggerMode>,
    /// New schedule, required when switching the trigger mode to `auto`
    pub schedule: Option<ScheduleSpecRequest>,
}

/// Query parameters for GET /api/v1/tasks
#[derive(Debug, Clone, Deserialize)]
pub struct TaskListQuery {
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    pub status: Option<String>,
    pub task_name: Option<String>,
}

/// Query parameters for paged execution listings
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionListQuery {
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

fn default_page() -> u32 {
    1
}

fn default_page_size() -> u32 {
    20
}

/// A page of results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u32,
    pub page: u32,
    pub size: u32,
    pub pages: u32,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: u32, page: u32, size: u32) -> Self {
        let pages = if size == 0 { 0 } else { total.div_ceil(size) };
        Self {
            items,
            total,
            page,
            size,
            pages,
        }
    }
}

/// Request body for POST /api/v1/schedules
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleCreateRequest {
    pub task_id: String,
    pub schedule_type: ScheduleType,
    #[serde(default = "empty_config")]
    pub schedule_config: serde_json::Value,
}

/// An execution as returned by list endpoints, with the derived access URL
/// when the container publishes a port
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionView {
    #[serde(flatten)]
    pub execution: ExecutionRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_url: Option<String>,
}

/// Heartbeat request posted by a running container
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub execution_id: String,
    pub container_name: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub progress: Option<serde_json::Value>,
    /// Client-side epoch seconds, used to estimate network delay
    #[serde(default)]
    pub timestamp: Option<i64>,
}

/// Response body for the heartbeat endpoint
///
/// Heartbeat ingestion always answers HTTP 200; a malformed request is
/// reported in the body without failing the container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl HeartbeatResponse {
    pub fn ok(timestamp: i64, execution_id: impl Into<String>) -> Self {
        Self {
            status: "ok".to_string(),
            timestamp: Some(timestamp),
            execution_id: Some(execution_id.into()),
            message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            timestamp: None,
            execution_id: None,
            message: Some(message.into()),
        }
    }
}

/// The cached heartbeat record stored under `hb:<execution-id>`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    pub container_name: String,
    pub status: String,
    #[serde(default)]
    pub progress: Option<serde_json::Value>,
    /// Server receive time, epoch seconds
    pub last_heartbeat: i64,
    #[serde(default)]
    pub client_timestamp: Option<i64>,
    #[serde(default)]
    pub network_delay: Option<i64>,
}

/// Completion request posted by a container when it finishes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub execution_id: String,
    pub container_name: String,
    pub success: bool,
    #[serde(default)]
    pub result_data: Option<serde_json::Value>,
    #[serde(default)]
    pub error_message: Option<String>,
}

/// Live view of an execution combining the store row with cached heartbeat
/// data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStatusResponse {
    pub execution_id: String,
    pub status: ExecutionStatus,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub container_name: Option<String>,
    pub result_data: Option<serde_json::Value>,
    pub error_log: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub real_time_status: Option<String>,
}

/// Entry in the active-executions listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveExecutionView {
    pub execution_id: String,
    pub task_id: String,
    pub execution_name: String,
    pub status: ExecutionStatus,
    pub start_time: Option<i64>,
    pub container_name: Option<String>,
    pub is_alive: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<serde_json::Value>,
}

/// Execution statistics over a trailing window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatisticsResponse {
    pub period_days: u32,
    pub total_executions: u32,
    pub successful_executions: u32,
    pub failed_executions: u32,
    pub cancelled_executions: u32,
    pub current_running: u32,
    pub success_rate: f64,
    pub failure_rate: f64,
}

/// HTTP headers used for authentication and caller identity
pub mod headers {
    pub const API_KEY: &str = "X-API-Key";
    pub const USER_ID: &str = "X-User-Id";
    pub const ROLE: &str = "X-Role";
}

/// API endpoint paths
pub mod endpoints {
    pub const TASKS: &str = "/api/v1/tasks";
    pub const SCHEDULES: &str = "/api/v1/schedules";
    pub const HEARTBEAT: &str = "/api/v1/monitoring/heartbeat";
    pub const COMPLETION: &str = "/api/v1/monitoring/completion";
    pub const ACTIVE_EXECUTIONS: &str = "/api/v1/monitoring/executions/active";
    pub const STATISTICS: &str = "/api/v1/monitoring/statistics";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_response_helpers() {
        let success = ApiResponse::success(42);
        assert_eq!(success.status, "success");
        assert_eq!(success.data, Some(42));
        assert_eq!(success.error, None);

        let error: ApiResponse<()> = ApiResponse::error("broken");
        assert_eq!(error.status, "error");
        assert_eq!(error.error.as_deref(), Some("broken"));
    }

    #[test]
    fn test_heartbeat_request_optional_fields() {
        let json = r#"{"execution_id": "abc", "container_name": "task-abc"}"#;
        let req: HeartbeatRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.execution_id, "abc");
        assert!(req.status.is_none());
        assert!(req.progress.is_none());
        assert!(req.timestamp.is_none());
    }

    #[test]
    fn test_heartbeat_error_response_omits_timestamp() {
        let body = serde_json::to_string(&HeartbeatResponse::error("bad id")).unwrap();
        assert!(!body.contains("timestamp"));
        assert!(body.contains("bad id"));
    }

    #[test]
    fn test_page_computes_page_count() {
        let page: Page<u32> = Page::new(vec![1, 2, 3], 41, 1, 20);
        assert_eq!(page.pages, 3);
        let empty: Page<u32> = Page::new(vec![], 0, 1, 20);
        assert_eq!(empty.pages, 0);
    }

    #[test]
    fn test_schedule_spec_request_defaults_empty_config() {
        let json = r#"{"schedule_type": "immediate"}"#;
        let req: ScheduleSpecRequest = serde_json::from_str(json).unwrap();
        assert!(req.schedule_config.is_object());
    }
}

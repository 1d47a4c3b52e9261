//! Domain model for the task orchestrator
//!
//! This module defines the persistent entities (tasks, schedules, executions)
//! and their status enums. Every enum round-trips through the stable string
//! form used both in the store and on the wire.

use serde::{Deserialize, Serialize};

/// Kind of collection job a task describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskType {
    /// Browser/HTTP crawl performed by a crawler container
    #[serde(rename = "container-crawl")]
    ContainerCrawl,
    /// Structured pull from a remote API
    #[serde(rename = "api-pull")]
    ApiPull,
    /// Extract from a source database
    #[serde(rename = "db-extract")]
    DbExtract,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::ContainerCrawl => "container-crawl",
            TaskType::ApiPull => "api-pull",
            TaskType::DbExtract => "db-extract",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "container-crawl" => Some(TaskType::ContainerCrawl),
            "api-pull" => Some(TaskType::ApiPull),
            "db-extract" => Some(TaskType::DbExtract),
            _ => None,
        }
    }
}

/// Lifecycle status of a task
///
/// `Running` is only entered via the execution engine; `Active`/`Paused` are
/// user-controlled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Active,
    Paused,
    Running,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Active => "active",
            TaskStatus::Paused => "paused",
            TaskStatus::Running => "running",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(TaskStatus::Active),
            "paused" => Some(TaskStatus::Paused),
            "running" => Some(TaskStatus::Running),
            _ => None,
        }
    }
}

/// How a task's executions are initiated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerMode {
    /// Executions are started explicitly through the control API
    Manual,
    /// Executions are fired by the task's schedule
    Auto,
}

impl TriggerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerMode::Manual => "manual",
            TriggerMode::Auto => "auto",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "manual" => Some(TriggerMode::Manual),
            "auto" => Some(TriggerMode::Auto),
            _ => None,
        }
    }
}

/// Status of a single execution attempt
///
/// `Success`, `Failed`, and `Cancelled` are terminal and absorbing: once an
/// execution enters one of them, no later write may change its status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ExecutionStatus::Pending),
            "running" => Some(ExecutionStatus::Running),
            "success" => Some(ExecutionStatus::Success),
            "failed" => Some(ExecutionStatus::Failed),
            "cancelled" => Some(ExecutionStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Success | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

/// Recurrence rule kind attached to a task schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleType {
    #[serde(rename = "immediate")]
    Immediate,
    #[serde(rename = "once-at")]
    OnceAt,
    #[serde(rename = "interval")]
    Interval,
    #[serde(rename = "daily")]
    Daily,
    #[serde(rename = "weekly")]
    Weekly,
    #[serde(rename = "monthly")]
    Monthly,
    #[serde(rename = "cron")]
    Cron,
}

impl ScheduleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleType::Immediate => "immediate",
            ScheduleType::OnceAt => "once-at",
            ScheduleType::Interval => "interval",
            ScheduleType::Daily => "daily",
            ScheduleType::Weekly => "weekly",
            ScheduleType::Monthly => "monthly",
            ScheduleType::Cron => "cron",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "immediate" => Some(ScheduleType::Immediate),
            "once-at" => Some(ScheduleType::OnceAt),
            "interval" => Some(ScheduleType::Interval),
            "daily" => Some(ScheduleType::Daily),
            "weekly" => Some(ScheduleType::Weekly),
            "monthly" => Some(ScheduleType::Monthly),
            "cron" => Some(ScheduleType::Cron),
            _ => None,
        }
    }
}

/// Kind of a URL parameter in a crawl template
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UrlParamKind {
    /// Enumerated values, one request per value
    List,
    /// Numeric range expansion
    Range,
    /// A single fixed value
    Value,
}

/// One parameter in a task's URL template, expanded by the collection worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UrlParam {
    pub name: String,
    pub kind: UrlParamKind,
    pub value: serde_json::Value,
}

/// Field descriptor inside an extract configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// How a worker should extract and publish collected records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractConfig {
    pub method: String,
    pub listener_path: String,
    pub dataset_id: String,
    #[serde(default)]
    pub fields: Vec<FieldDescriptor>,
}

/// A declarative collection job as persisted in the store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub task_name: String,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub trigger_mode: TriggerMode,
    pub base_url: Option<String>,
    #[serde(default)]
    pub base_url_params: Vec<UrlParam>,
    pub need_user_login: bool,
    pub extract_config: Option<ExtractConfig>,
    pub creator_id: String,
    pub description: Option<String>,
    pub create_time: i64,
    pub update_time: i64,
}

/// A task's recurrence rule as persisted in the store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleRecord {
    pub id: String,
    pub task_id: String,
    pub schedule_type: ScheduleType,
    pub schedule_config: serde_json::Value,
    pub is_active: bool,
    /// Next fire instant as epoch seconds; `None` means the schedule never
    /// fires again.
    pub next_run_time: Option<i64>,
    pub create_time: i64,
    pub update_time: i64,
}

/// One attempt to run a task, owning a container for its lifetime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub task_id: String,
    pub executor_id: String,
    pub execution_name: String,
    pub status: ExecutionStatus,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub container_name: Option<String>,
    pub container_id: Option<String>,
    pub config_path: Option<String>,
    pub host_port: Option<u16>,
    pub host_command: Option<String>,
    pub result_data: Option<serde_json::Value>,
    pub error_log: Option<String>,
    pub last_heartbeat: Option<i64>,
    pub create_time: i64,
    pub update_time: i64,
}

/// Frozen task configuration handed to the execution engine at admission time
///
/// The snapshot is taken when the execution is created so that later task
/// edits cannot change an in-flight run. Serialized verbatim into the staged
/// `config.json` the container reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub task_name: String,
    pub task_type: TaskType,
    pub base_url: Option<String>,
    #[serde(default)]
    pub base_url_params: Vec<UrlParam>,
    pub need_user_login: bool,
    pub extract_config: Option<ExtractConfig>,
    pub description: Option<String>,
}

impl TaskSnapshot {
    pub fn from_task(task: &TaskRecord) -> Self {
        Self {
            task_name: task.task_name.clone(),
            task_type: task.task_type,
            base_url: task.base_url.clone(),
            base_url_params: task.base_url_params.clone(),
            need_user_login: task.need_user_login,
            extract_config: task.extract_config.clone(),
            description: task.description.clone(),
        }
    }

    /// Validate the snapshot before materialising a container from it
    pub fn validate(&self) -> Result<(), String> {
        if self.task_name.is_empty() {
            return Err("Missing required field: task_name".to_string());
        }

        let base_url = match &self.base_url {
            Some(url) if !url.is_empty() => url,
            _ => return Err("Missing required field: base_url".to_string()),
        };

        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(format!("Invalid base URL format: {}", base_url));
        }

        Ok(())
    }
}

//! Integration-style tests for the orchestrator control plane
//!
//! Everything runs against a real SQLite store in a temp directory, the
//! in-process cache backend, and the scriptable fake host driver.

mod executor_tests;
mod reconciler_tests;
mod scheduler_tests;

use crate::api::monitoring::HeartbeatWriter;
use crate::api::{create_router, AppState};
use crate::cache::Cache;
use crate::database::ServerDatabase;
use crate::executor::{Admission, ExecutionEngine};
use crate::host::fake::FakeHost;
use crate::ports::PortAllocator;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use shared::api::headers;
use shared::config::ServerConfig;
use shared::model::{
    ExecutionRecord, ExecutionStatus, ScheduleRecord, ScheduleType, TaskRecord, TaskStatus,
    TaskType, TriggerMode,
};
use shared::utils::{current_timestamp, new_id};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::{mpsc, Mutex};
use tower::ServiceExt; // for `oneshot`

pub(crate) const TEST_API_KEY: &str = "test-api-key";

/// Everything a test needs, wired the way `main` wires production.
pub(crate) struct TestContext {
    pub config: Arc<ServerConfig>,
    pub database: Arc<Mutex<ServerDatabase>>,
    pub cache: Cache,
    pub host: Arc<FakeHost>,
    pub ports: Arc<PortAllocator>,
    pub engine: ExecutionEngine,
    pub admit_tx: mpsc::Sender<Admission>,
    pub admit_rx: mpsc::Receiver<Admission>,
    _temp_dir: TempDir,
}

pub(crate) fn test_config(temp_dir: &TempDir) -> ServerConfig {
    let data_dir = temp_dir.path().join("data");
    let staging_dir = temp_dir.path().join("task_configs");
    let toml_str = format!(
        r#"
listen_address = "127.0.0.1:8787"
api_key = "{key}"
data_dir = "{data}"
config_staging_dir = "{staging}"
port_range_start = 50000
port_range_end = 50005
port_allocate_attempts = 3
heartbeat_timeout_seconds = 300
heartbeat_timeout_strikes = 3
admission_timeout_seconds = 120
"#,
        key = TEST_API_KEY,
        data = data_dir.display(),
        staging = staging_dir.display(),
    );
    let config: ServerConfig = toml::from_str(&toml_str).unwrap();
    config.validate().unwrap();
    config
}

pub(crate) async fn create_context() -> TestContext {
    let temp_dir = TempDir::new().unwrap();
    let config = Arc::new(test_config(&temp_dir));

    let mut database = ServerDatabase::new(&config.data_dir).unwrap();
    database.initialize().await.unwrap();
    let database = Arc::new(Mutex::new(database));

    let cache = Cache::memory();
    let host = Arc::new(FakeHost::new());
    let ports = Arc::new(PortAllocator::new(
        host.clone() as Arc<dyn crate::host::HostDriver>,
        config.port_range_start,
        config.port_range_end,
    ));
    let (admit_tx, admit_rx) = mpsc::channel(16);
    let engine = ExecutionEngine::new(
        Arc::clone(&config),
        Arc::clone(&database),
        cache.clone(),
        host.clone() as Arc<dyn crate::host::HostDriver>,
        Arc::clone(&ports),
    );

    TestContext {
        config,
        database,
        cache,
        host,
        ports,
        engine,
        admit_tx,
        admit_rx,
        _temp_dir: temp_dir,
    }
}

/// Router plus the heartbeat writer backing it, wired from the context.
pub(crate) fn test_app(ctx: &TestContext) -> (Router, HeartbeatWriter) {
    let heartbeat_writer = HeartbeatWriter::new(16);
    let state = AppState::new(
        Arc::clone(&ctx.config),
        Arc::clone(&ctx.database),
        ctx.cache.clone(),
        ctx.engine.clone(),
        ctx.admit_tx.clone(),
        heartbeat_writer.clone(),
    );
    (create_router(state), heartbeat_writer)
}

/// One in-memory HTTP round trip. `identity = Some((user, role))` attaches
/// the API key and identity headers; `None` sends a bare request.
pub(crate) async fn api_request(
    app: Router,
    method: Method,
    uri: &str,
    identity: Option<(&str, &str)>,
    body: Option<serde_json::Value>,
) -> (StatusCode, serde_json::Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some((user_id, role)) = identity {
        builder = builder
            .header(headers::API_KEY, TEST_API_KEY)
            .header(headers::USER_ID, user_id)
            .header(headers::ROLE, role);
    }
    let request = match body {
        Some(body) => builder
            .header("Content-Type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
    };
    (status, value)
}

/// A live crawl task owned by `creator`.
pub(crate) fn sample_task(name: &str, creator: &str) -> TaskRecord {
    let now = current_timestamp();
    TaskRecord {
        id: new_id(),
        task_name: name.to_string(),
        task_type: TaskType::ContainerCrawl,
        status: TaskStatus::Active,
        trigger_mode: TriggerMode::Manual,
        base_url: Some("https://example.com/news".to_string()),
        base_url_params: vec![],
        need_user_login: false,
        extract_config: None,
        creator_id: creator.to_string(),
        description: Some("test task".to_string()),
        create_time: now,
        update_time: now,
    }
}

pub(crate) fn sample_execution(task_id: &str, status: ExecutionStatus) -> ExecutionRecord {
    let now = current_timestamp();
    ExecutionRecord {
        id: new_id(),
        task_id: task_id.to_string(),
        executor_id: "tester".to_string(),
        execution_name: format!("exec-{}-test", now),
        status,
        start_time: matches!(status, ExecutionStatus::Running).then_some(now),
        end_time: status.is_terminal().then_some(now),
        container_name: None,
        container_id: None,
        config_path: None,
        host_port: None,
        host_command: None,
        result_data: None,
        error_log: None,
        last_heartbeat: None,
        create_time: now,
        update_time: now,
    }
}

pub(crate) fn sample_schedule(
    task_id: &str,
    schedule_type: ScheduleType,
    config: serde_json::Value,
    next_run_time: Option<i64>,
) -> ScheduleRecord {
    let now = current_timestamp();
    ScheduleRecord {
        id: new_id(),
        task_id: task_id.to_string(),
        schedule_type,
        schedule_config: config,
        is_active: true,
        next_run_time,
        create_time: now,
        update_time: now,
    }
}

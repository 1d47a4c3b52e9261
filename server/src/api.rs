//! REST API implementation for the orchestrator control plane
//!
//! This module wires the axum router and owns the pieces every handler
//! shares: application state, authentication (API key plus caller
//! identity), the RBAC policy check, and the error-to-response mapping.
//! The handlers themselves live in the `tasks`, `schedules`, and
//! `monitoring` submodules.

pub mod monitoring;
pub mod schedules;
pub mod tasks;

use crate::cache::Cache;
use crate::database::ServerDatabase;
use crate::executor::{Admission, ExecutionEngine};
use axum::{
    extract::DefaultBodyLimit,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use shared::api::{endpoints, headers};
use shared::config::ServerConfig;
use shared::OrchestratorError;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::warn;

/// Application state shared across all API handlers
#[derive(Clone)]
pub struct AppState {
    /// Server configuration
    pub config: Arc<ServerConfig>,
    /// Database handle, the single source of truth
    pub database: Arc<Mutex<ServerDatabase>>,
    /// Ephemeral cache for heartbeat records and counters
    pub cache: Cache,
    /// Execution engine for stop and terminal cleanup paths
    pub engine: ExecutionEngine,
    /// Admission channel into the execution engine
    pub admissions: mpsc::Sender<Admission>,
    /// Fire-and-forget writer for heartbeat store updates
    pub heartbeat_writer: monitoring::HeartbeatWriter,
}

impl AppState {
    pub fn new(
        config: Arc<ServerConfig>,
        database: Arc<Mutex<ServerDatabase>>,
        cache: Cache,
        engine: ExecutionEngine,
        admissions: mpsc::Sender<Admission>,
        heartbeat_writer: monitoring::HeartbeatWriter,
    ) -> Self {
        Self {
            config,
            database,
            cache,
            engine,
            admissions,
            heartbeat_writer,
        }
    }
}

/// Creates the main API router and defines all the application's routes.
pub fn create_router(state: AppState) -> Router {
    // Maximum request body size: 10MB. Result payloads from containers can
    // be sizeable, everything else is small.
    const MAX_REQUEST_SIZE: usize = 10 * 1024 * 1024;

    Router::new()
        // Unauthenticated liveness probe for load balancers and
        // orchestration.
        .route("/health", get(health_check))
        // Control API: tasks and their lifecycle.
        .route(
            endpoints::TASKS,
            post(tasks::create_task).get(tasks::list_tasks),
        )
        .route(
            "/api/v1/tasks/{task_id}",
            get(tasks::get_task)
                .put(tasks::update_task)
                .delete(tasks::delete_task),
        )
        .route("/api/v1/tasks/{task_id}/execute", post(tasks::execute_task))
        .route("/api/v1/tasks/{task_id}/stop", post(tasks::stop_task))
        .route(
            "/api/v1/tasks/{task_id}/activate",
            post(tasks::activate_task),
        )
        .route(
            "/api/v1/tasks/{task_id}/deactivate",
            post(tasks::deactivate_task),
        )
        .route(
            "/api/v1/tasks/{task_id}/executions",
            get(tasks::list_task_executions),
        )
        // Control API: schedules.
        .route(endpoints::SCHEDULES, post(schedules::create_schedule))
        .route(
            "/api/v1/schedules/task/{task_id}",
            get(schedules::get_task_schedule),
        )
        .route(
            "/api/v1/schedules/{schedule_id}/toggle",
            put(schedules::toggle_schedule),
        )
        .route(
            "/api/v1/schedules/{schedule_id}",
            axum::routing::delete(schedules::delete_schedule),
        )
        // Data-plane callbacks from containers.
        .route(endpoints::HEARTBEAT, post(monitoring::heartbeat))
        .route(endpoints::COMPLETION, post(monitoring::completion))
        // Monitoring reads.
        .route(
            "/api/v1/monitoring/execution/{execution_id}/status",
            get(monitoring::execution_status),
        )
        .route(
            "/api/v1/monitoring/execution/{execution_id}/logs",
            get(monitoring::execution_logs),
        )
        .route(
            endpoints::ACTIVE_EXECUTIONS,
            get(monitoring::active_executions),
        )
        .route(endpoints::STATISTICS, get(monitoring::statistics))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_SIZE))
        .with_state(state)
}

/// The handler for the `/health` endpoint.
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "task-orchestrator",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Authenticated caller identity derived from request headers
///
/// User and role administration is external; the control plane only trusts
/// the gateway-provided identity headers after the shared API key checks
/// out.
#[derive(Debug, Clone)]
pub struct Caller {
    pub user_id: String,
    pub role: String,
}

impl Caller {
    pub fn is_admin(&self) -> bool {
        self.role == "admin"
    }
}

/// Validate the shared API key with a constant-time comparison.
fn validate_api_key(request_headers: &HeaderMap, expected_key: &str) -> Result<(), ApiError> {
    use subtle::ConstantTimeEq;

    let provided_key = match request_headers.get(headers::API_KEY) {
        Some(key) => match key.to_str() {
            Ok(key_str) => key_str,
            Err(_) => {
                warn!("Invalid API key format in header");
                return Err(ApiError::Unauthorized);
            }
        },
        None => {
            warn!("Missing API key header");
            return Err(ApiError::Unauthorized);
        }
    };

    if provided_key.is_empty() {
        warn!("Empty API key provided");
        return Err(ApiError::Unauthorized);
    }

    let provided_bytes = provided_key.as_bytes();
    let expected_bytes = expected_key.as_bytes();
    let keys_match = provided_bytes.len() == expected_bytes.len()
        && bool::from(provided_bytes.ct_eq(expected_bytes));

    if !keys_match {
        warn!("Invalid API key provided");
        return Err(ApiError::Unauthorized);
    }

    Ok(())
}

/// Extract the caller identity from the identity headers.
fn caller_identity(request_headers: &HeaderMap) -> Result<Caller, ApiError> {
    let user_id = request_headers
        .get(headers::USER_ID)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    if user_id.is_empty() {
        warn!("Missing caller identity header");
        return Err(ApiError::Unauthorized);
    }
    if user_id.len() > 128
        || !user_id
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ApiError::BadRequest(format!(
            "Invalid user id: {}",
            user_id
        )));
    }

    let role = request_headers
        .get(headers::ROLE)
        .and_then(|v| v.to_str().ok())
        .filter(|r| !r.is_empty())
        .unwrap_or("user")
        .to_string();

    Ok(Caller { user_id, role })
}

/// Authenticate a control API request: API key plus caller identity.
pub async fn authenticate(
    state: &AppState,
    request_headers: &HeaderMap,
) -> Result<Caller, ApiError> {
    validate_api_key(request_headers, &state.config.api_key)?;
    caller_identity(request_headers)
}

/// RBAC check: may the caller's role perform `action` on `object`?
pub async fn authorize(
    state: &AppState,
    caller: &Caller,
    object: &str,
    action: &str,
) -> Result<(), ApiError> {
    let allowed = {
        let mut db = state.database.lock().await;
        db.policy_allows(&caller.role, object, action)
            .await
            .map_err(ApiError::database)?
    };
    if allowed {
        Ok(())
    } else {
        warn!(
            user_id = %caller.user_id,
            role = %caller.role,
            object,
            action,
            "Policy denied request"
        );
        Err(ApiError::Forbidden(format!(
            "role '{}' may not {} {}",
            caller.role, action, object
        )))
    }
}

/// Custom error types for the API.
/// Using a dedicated enum for API errors allows for consistent error
/// handling and response formatting.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Internal server error: {0}")]
    Internal(String),
    #[error("Database error: {0}")]
    Database(String),
}

impl ApiError {
    pub fn internal(e: impl std::fmt::Display) -> Self {
        ApiError::Internal(e.to_string())
    }

    pub fn database(e: impl std::fmt::Display) -> Self {
        ApiError::Database(e.to_string())
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(e: OrchestratorError) -> Self {
        match e {
            OrchestratorError::Validation(m) => ApiError::BadRequest(m),
            OrchestratorError::Conflict(m) => ApiError::Conflict(m),
            OrchestratorError::NotFound(m) => ApiError::NotFound(m),
            OrchestratorError::Permission(m) => ApiError::Forbidden(m),
            OrchestratorError::Transient(m)
            | OrchestratorError::Exhaustion(m)
            | OrchestratorError::Container(m)
            | OrchestratorError::InvariantViolation(m) => ApiError::Internal(m),
        }
    }
}

/// This implementation allows `ApiError` to be converted into an HTTP
/// response, so handlers can return `Result<_, ApiError>` and let axum do
/// the rest.
impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized"),
            ApiError::Forbidden(_) => (StatusCode::FORBIDDEN, "Forbidden"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "Bad Request"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "Not Found"),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "Conflict"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error"),
            ApiError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Database Error"),
        };

        let body = Json(serde_json::json!({
            "error": error_message,
            "details": self.to_string()
        }));

        (status, body).into_response()
    }
}

//! Callback ingestion and monitoring read handlers
//!
//! The heartbeat and completion routes are the core's only ingress from the
//! data plane. Heartbeat ingestion is availability-first: it answers HTTP
//! 200 even when the cache or store misbehaves, because failing the
//! response could take down an otherwise healthy container run. The store
//! write of `last_heartbeat` is handed to a bounded fire-and-forget queue
//! that drops the oldest pending update on overflow.

use crate::api::{authenticate, authorize, ApiError, AppState};
use crate::cache;
use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use serde::Deserialize;
use shared::api::{
    ActiveExecutionView, ApiResponse, CompletionRequest, ExecutionStatusResponse, HeartbeatRecord,
    HeartbeatRequest, HeartbeatResponse, StatisticsResponse,
};
use shared::model::ExecutionStatus;
use shared::utils::{current_timestamp, validate_execution_id};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Bounded fire-and-forget queue for `last_heartbeat` store writes
///
/// The callback response never waits on the store. When the queue is full
/// the oldest pending update is dropped; heartbeats are last-writer-wins,
/// so losing an old stamp is harmless.
#[derive(Clone)]
pub struct HeartbeatWriter {
    queue: Arc<StdMutex<VecDeque<(String, i64)>>>,
    notify: Arc<Notify>,
    capacity: usize,
}

impl HeartbeatWriter {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Arc::new(StdMutex::new(VecDeque::new())),
            notify: Arc::new(Notify::new()),
            capacity: capacity.max(1),
        }
    }

    /// Queue one update, evicting the oldest entry when full
    pub fn enqueue(&self, execution_id: String, heartbeat_time: i64) {
        {
            let mut queue = self.queue.lock().unwrap();
            if queue.len() >= self.capacity {
                if let Some((dropped, _)) = queue.pop_front() {
                    debug!(execution_id = %dropped, "Heartbeat write queue full, dropped oldest update");
                }
            }
            queue.push_back((execution_id, heartbeat_time));
        }
        self.notify.notify_one();
    }

    /// Spawn the drain task flushing queued updates into the store
    pub fn spawn_drain(
        &self,
        database: Arc<tokio::sync::Mutex<crate::database::ServerDatabase>>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let writer = self.clone();
        tokio::spawn(async move {
            loop {
                let next = {
                    let mut queue = writer.queue.lock().unwrap();
                    queue.pop_front()
                };
                match next {
                    Some((execution_id, heartbeat_time)) => {
                        let mut db = database.lock().await;
                        if let Err(e) = db
                            .update_execution_heartbeat(&execution_id, heartbeat_time)
                            .await
                        {
                            warn!(
                                execution_id = %execution_id,
                                error = %e,
                                "Failed to persist heartbeat time"
                            );
                        }
                    }
                    None => {
                        tokio::select! {
                            _ = writer.notify.notified() => {}
                            _ = shutdown.recv() => {
                                info!("Heartbeat writer received shutdown signal");
                                break;
                            }
                        }
                    }
                }
            }
        })
    }

    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
}

/// POST /api/v1/monitoring/heartbeat
///
/// Containers call this periodically while running. Answers HTTP 200 even
/// for malformed ids (with an error body) so a confused container does not
/// crash-loop on its reporting path.
pub async fn heartbeat(
    State(state): State<AppState>,
    Json(request): Json<HeartbeatRequest>,
) -> Json<HeartbeatResponse> {
    if let Err(e) = validate_execution_id(&request.execution_id) {
        warn!(execution_id = %request.execution_id, "Rejected malformed heartbeat");
        return Json(HeartbeatResponse::error(e.to_string()));
    }

    let now = current_timestamp();
    let record = HeartbeatRecord {
        container_name: request.container_name.clone(),
        status: request.status.clone().unwrap_or_else(|| "running".to_string()),
        progress: request.progress.clone(),
        last_heartbeat: now,
        client_timestamp: request.timestamp,
        network_delay: request.timestamp.map(|t| now - t),
    };

    let ttl = Duration::from_secs(state.config.heartbeat_timeout_seconds * 2);
    match serde_json::to_string(&record) {
        Ok(payload) => {
            if let Err(e) = state
                .cache
                .set_with_ttl(&cache::hb_key(&request.execution_id), &payload, ttl)
                .await
            {
                // Cache trouble must not fail the callback.
                warn!(execution_id = %request.execution_id, error = %e, "Failed to cache heartbeat");
            }
        }
        Err(e) => {
            warn!(execution_id = %request.execution_id, error = %e, "Failed to encode heartbeat record");
        }
    }

    // A fresh heartbeat clears any accumulated timeout strikes.
    let _ = state
        .cache
        .delete(&cache::timeout_key(&request.execution_id))
        .await;

    state
        .heartbeat_writer
        .enqueue(request.execution_id.clone(), now);

    debug!(
        execution_id = %request.execution_id,
        container_name = %request.container_name,
        "Heartbeat received"
    );

    Json(HeartbeatResponse::ok(now, request.execution_id))
}

/// POST /api/v1/monitoring/completion
///
/// Terminal callback from a container. Idempotent: the guarded status
/// write refuses to touch an already-terminal row, so retries are safe.
pub async fn completion(
    State(state): State<AppState>,
    Json(request): Json<CompletionRequest>,
) -> Result<Json<ApiResponse<serde_json::Value>>, ApiError> {
    let execution = {
        let mut db = state.database.lock().await;
        db.get_execution(&request.execution_id)
            .await
            .map_err(ApiError::database)?
    };
    let Some(execution) = execution else {
        return Err(ApiError::NotFound(format!(
            "Execution not found: {}",
            request.execution_id
        )));
    };

    // The container name is a convenience label, not a security boundary;
    // a mismatch is logged and the callback honoured.
    if let Some(expected) = &execution.container_name {
        if *expected != request.container_name {
            warn!(
                execution_id = %execution.id,
                expected = %expected,
                got = %request.container_name,
                "Completion container name mismatch"
            );
        }
    }

    if execution.status.is_terminal() {
        debug!(execution_id = %execution.id, "Completion for already-terminal execution");
        return Ok(Json(ApiResponse::message("Completion already recorded")));
    }

    let status = if request.success {
        ExecutionStatus::Success
    } else {
        ExecutionStatus::Failed
    };
    let finished = {
        let mut db = state.database.lock().await;
        db.finish_execution(
            &execution.id,
            status,
            current_timestamp(),
            request.result_data.as_ref(),
            request.error_message.as_deref(),
        )
        .await
        .map_err(ApiError::database)?
    };
    if !finished {
        // Raced with the reconciler or a user stop; their terminal status
        // stands.
        return Ok(Json(ApiResponse::message("Completion already recorded")));
    }

    info!(
        execution_id = %execution.id,
        success = request.success,
        "Completion recorded"
    );

    // Stop the container if it lingers, release the port, purge staged
    // config, and drop the heartbeat key.
    state.engine.finalize_terminal(&execution).await;

    Ok(Json(ApiResponse::message("Completion recorded")))
}

/// GET /api/v1/monitoring/execution/{execution_id}/status
///
/// Store row overlaid with live heartbeat data from the cache.
pub async fn execution_status(
    State(state): State<AppState>,
    request_headers: HeaderMap,
    Path(execution_id): Path<String>,
) -> Result<Json<ApiResponse<ExecutionStatusResponse>>, ApiError> {
    let caller = authenticate(&state, &request_headers).await?;
    authorize(&state, &caller, "monitoring", "read").await?;

    let execution = {
        let mut db = state.database.lock().await;
        db.get_execution(&execution_id)
            .await
            .map_err(ApiError::database)?
    };
    let Some(execution) = execution else {
        return Err(ApiError::NotFound(format!(
            "Execution not found: {}",
            execution_id
        )));
    };

    let heartbeat = fetch_heartbeat(&state, &execution.id).await;

    let response = ExecutionStatusResponse {
        execution_id: execution.id.clone(),
        status: execution.status,
        start_time: execution.start_time,
        end_time: execution.end_time,
        container_name: execution.container_name.clone(),
        result_data: execution.result_data.clone(),
        error_log: execution.error_log.clone(),
        last_heartbeat: heartbeat
            .as_ref()
            .map(|hb| hb.last_heartbeat)
            .or(execution.last_heartbeat),
        progress: heartbeat.as_ref().and_then(|hb| hb.progress.clone()),
        real_time_status: heartbeat.map(|hb| hb.status),
    };

    Ok(Json(ApiResponse::success(response)))
}

/// GET /api/v1/monitoring/executions/active
pub async fn active_executions(
    State(state): State<AppState>,
    request_headers: HeaderMap,
) -> Result<Json<ApiResponse<Vec<ActiveExecutionView>>>, ApiError> {
    let caller = authenticate(&state, &request_headers).await?;
    authorize(&state, &caller, "monitoring", "read").await?;

    let running = {
        let mut db = state.database.lock().await;
        db.running_executions().await.map_err(ApiError::database)?
    };

    let mut views = Vec::with_capacity(running.len());
    for execution in running {
        let heartbeat = fetch_heartbeat(&state, &execution.id).await;
        views.push(ActiveExecutionView {
            execution_id: execution.id,
            task_id: execution.task_id,
            execution_name: execution.execution_name,
            status: execution.status,
            start_time: execution.start_time,
            container_name: execution.container_name,
            is_alive: heartbeat.is_some(),
            last_heartbeat: heartbeat.as_ref().map(|hb| hb.last_heartbeat),
            progress: heartbeat.and_then(|hb| hb.progress),
        });
    }

    Ok(Json(ApiResponse::success(views)))
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    #[serde(default = "default_log_tail")]
    pub tail: u32,
}

fn default_log_tail() -> u32 {
    100
}

/// GET /api/v1/monitoring/execution/{execution_id}/logs
///
/// Trailing container log lines, straight from the host.
pub async fn execution_logs(
    State(state): State<AppState>,
    request_headers: HeaderMap,
    Path(execution_id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<ApiResponse<serde_json::Value>>, ApiError> {
    let caller = authenticate(&state, &request_headers).await?;
    authorize(&state, &caller, "monitoring", "read").await?;

    let logs = state.engine.container_logs(&execution_id, query.tail).await?;
    Ok(Json(ApiResponse::success(serde_json::json!({
        "execution_id": execution_id,
        "logs": logs,
    }))))
}

#[derive(Debug, Deserialize)]
pub struct StatisticsQuery {
    #[serde(default = "default_statistics_days")]
    pub days: u32,
}

fn default_statistics_days() -> u32 {
    7
}

/// GET /api/v1/monitoring/statistics
pub async fn statistics(
    State(state): State<AppState>,
    request_headers: HeaderMap,
    Query(query): Query<StatisticsQuery>,
) -> Result<Json<ApiResponse<StatisticsResponse>>, ApiError> {
    let caller = authenticate(&state, &request_headers).await?;
    authorize(&state, &caller, "monitoring", "read").await?;

    let since = current_timestamp() - (query.days as i64) * 86400;
    let counts = {
        let mut db = state.database.lock().await;
        db.execution_statistics(since)
            .await
            .map_err(ApiError::database)?
    };

    let rate = |n: u32| {
        if counts.total == 0 {
            0.0
        } else {
            (n as f64 / counts.total as f64 * 10000.0).round() / 100.0
        }
    };

    Ok(Json(ApiResponse::success(StatisticsResponse {
        period_days: query.days,
        total_executions: counts.total,
        successful_executions: counts.success,
        failed_executions: counts.failed,
        cancelled_executions: counts.cancelled,
        current_running: counts.current_running,
        success_rate: rate(counts.success),
        failure_rate: rate(counts.failed),
    })))
}

async fn fetch_heartbeat(state: &AppState, execution_id: &str) -> Option<HeartbeatRecord> {
    let raw = state
        .cache
        .get(&cache::hb_key(execution_id))
        .await
        .ok()
        .flatten()?;
    serde_json::from_str(&raw).ok()
}

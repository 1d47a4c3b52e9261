//! Schedule control handlers
//!
//! Each task carries at most one live schedule; creating a schedule for a
//! task that already has one replaces the rule in place.

use crate::api::{authenticate, authorize, ApiError, AppState, Caller};
use crate::database::db_schedule;
use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use shared::api::{ApiResponse, ScheduleCreateRequest};
use shared::model::{ScheduleRecord, TaskRecord};
use shared::schedule::ScheduleSpec;
use shared::utils::{current_timestamp, epoch_from_naive, new_id, now_naive};
use tracing::info;

async fn load_owned_task(
    state: &AppState,
    caller: &Caller,
    task_id: &str,
) -> Result<TaskRecord, ApiError> {
    let task = {
        let mut db = state.database.lock().await;
        db.get_task(task_id).await.map_err(ApiError::database)?
    };
    match task {
        Some(task) if caller.is_admin() || task.creator_id == caller.user_id => Ok(task),
        _ => Err(ApiError::NotFound(format!("Task not found: {}", task_id))),
    }
}

/// POST /api/v1/schedules
///
/// Creates the task's schedule, or updates the existing one in place.
pub async fn create_schedule(
    State(state): State<AppState>,
    request_headers: HeaderMap,
    Json(request): Json<ScheduleCreateRequest>,
) -> Result<Json<ApiResponse<serde_json::Value>>, ApiError> {
    let caller = authenticate(&state, &request_headers).await?;
    authorize(&state, &caller, "scheduler", "create").await?;

    let task = load_owned_task(&state, &caller, &request.task_id).await?;

    let spec = ScheduleSpec::parse(request.schedule_type, &request.schedule_config)
        .map_err(ApiError::BadRequest)?;
    let next_run_time = spec.next_fire(now_naive()).and_then(epoch_from_naive);
    // A one-shot rule aimed at the past never activates.
    let is_active = next_run_time.is_some();

    let existing = {
        let mut db = state.database.lock().await;
        db.schedule_for_task(&task.id)
            .await
            .map_err(ApiError::database)?
    };

    let (schedule_id, message) = match existing {
        Some(existing) => {
            let mut db = state.database.lock().await;
            let conn = db.get_connection().map_err(ApiError::database)?;
            db_schedule::replace_schedule_config(
                conn,
                &existing.id,
                request.schedule_type,
                &request.schedule_config,
                is_active,
                next_run_time,
            )
            .map_err(ApiError::database)?;
            (existing.id, "Schedule updated")
        }
        None => {
            let now = current_timestamp();
            let schedule = ScheduleRecord {
                id: new_id(),
                task_id: task.id.clone(),
                schedule_type: request.schedule_type,
                schedule_config: request.schedule_config.clone(),
                is_active,
                next_run_time,
                create_time: now,
                update_time: now,
            };
            let mut db = state.database.lock().await;
            db.insert_schedule(&schedule)
                .await
                .map_err(ApiError::database)?;
            (schedule.id, "Schedule created")
        }
    };

    info!(
        task_id = %task.id,
        schedule_id = %schedule_id,
        next_run_time = ?next_run_time,
        "Schedule stored"
    );
    Ok(Json(ApiResponse::message_with_data(
        message,
        serde_json::json!({
            "schedule_id": schedule_id,
            "next_run_time": next_run_time,
        }),
    )))
}

/// GET /api/v1/schedules/task/{task_id}
pub async fn get_task_schedule(
    State(state): State<AppState>,
    request_headers: HeaderMap,
    Path(task_id): Path<String>,
) -> Result<Json<ApiResponse<Vec<ScheduleRecord>>>, ApiError> {
    let caller = authenticate(&state, &request_headers).await?;
    authorize(&state, &caller, "scheduler", "read").await?;

    let task = load_owned_task(&state, &caller, &task_id).await?;

    let schedule = {
        let mut db = state.database.lock().await;
        db.schedule_for_task(&task.id)
            .await
            .map_err(ApiError::database)?
    };

    Ok(Json(ApiResponse::success(
        schedule.into_iter().collect::<Vec<_>>(),
    )))
}

/// PUT /api/v1/schedules/{schedule_id}/toggle
pub async fn toggle_schedule(
    State(state): State<AppState>,
    request_headers: HeaderMap,
    Path(schedule_id): Path<String>,
) -> Result<Json<ApiResponse<serde_json::Value>>, ApiError> {
    let caller = authenticate(&state, &request_headers).await?;
    authorize(&state, &caller, "scheduler", "update").await?;

    let schedule = {
        let mut db = state.database.lock().await;
        db.get_schedule(&schedule_id)
            .await
            .map_err(ApiError::database)?
    };
    let Some(schedule) = schedule else {
        return Err(ApiError::NotFound(format!(
            "Schedule not found: {}",
            schedule_id
        )));
    };

    // Ownership runs through the owning task.
    load_owned_task(&state, &caller, &schedule.task_id).await?;

    let enabling = !schedule.is_active;
    let next_run_time = if enabling {
        let spec = ScheduleSpec::parse(schedule.schedule_type, &schedule.schedule_config)
            .map_err(ApiError::BadRequest)?;
        let next = spec.next_fire(now_naive()).and_then(epoch_from_naive);
        if next.is_none() {
            return Err(ApiError::Conflict(
                "Schedule would never fire; its target time is in the past".to_string(),
            ));
        }
        next
    } else {
        None
    };

    {
        let mut db = state.database.lock().await;
        db.set_schedule_active(&schedule.id, enabling, next_run_time)
            .await
            .map_err(ApiError::database)?;
    }

    let message = if enabling {
        "Schedule enabled"
    } else {
        "Schedule disabled"
    };
    info!(schedule_id = %schedule.id, enabled = enabling, "Schedule toggled");
    Ok(Json(ApiResponse::message_with_data(
        message,
        serde_json::json!({"next_run_time": next_run_time}),
    )))
}

/// DELETE /api/v1/schedules/{schedule_id}
pub async fn delete_schedule(
    State(state): State<AppState>,
    request_headers: HeaderMap,
    Path(schedule_id): Path<String>,
) -> Result<Json<ApiResponse<serde_json::Value>>, ApiError> {
    let caller = authenticate(&state, &request_headers).await?;
    authorize(&state, &caller, "scheduler", "delete").await?;

    let schedule = {
        let mut db = state.database.lock().await;
        db.get_schedule(&schedule_id)
            .await
            .map_err(ApiError::database)?
    };
    let Some(schedule) = schedule else {
        return Err(ApiError::NotFound(format!(
            "Schedule not found: {}",
            schedule_id
        )));
    };

    load_owned_task(&state, &caller, &schedule.task_id).await?;

    {
        let mut db = state.database.lock().await;
        db.soft_delete_schedule(&schedule.id)
            .await
            .map_err(ApiError::database)?;
    }

    info!(schedule_id = %schedule.id, "Schedule deleted");
    Ok(Json(ApiResponse::message("Schedule deleted")))
}

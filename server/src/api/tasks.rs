//! Task control handlers: CRUD, lifecycle, execute/stop
//!
//! Every mutating handler re-checks the single-concurrency rule against the
//! store before acting; the execution engine's guarded status writes make
//! the residual races harmless.

use crate::api::{authenticate, authorize, ApiError, AppState, Caller};
use crate::database::{db_schedule, db_task};
use crate::executor::Admission;
use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use shared::api::{
    ApiResponse, ExecutionListQuery, ExecutionView, Page, ScheduleSpecRequest, TaskCreateRequest,
    TaskListQuery, TaskUpdateRequest,
};
use shared::model::{
    ExecutionRecord, ExecutionStatus, ScheduleRecord, TaskRecord, TaskSnapshot, TaskStatus,
    TriggerMode,
};
use shared::schedule::ScheduleSpec;
use shared::utils::{current_timestamp, epoch_from_naive, new_id, now_naive, short_id};
use tracing::{error, info};

/// Parse and price a schedule request into a ready-to-insert record.
///
/// A one-shot schedule whose target has already passed is stored inactive
/// with no next fire; it never fires.
fn build_schedule(
    task_id: &str,
    request: &ScheduleSpecRequest,
) -> Result<ScheduleRecord, ApiError> {
    let spec = ScheduleSpec::parse(request.schedule_type, &request.schedule_config)
        .map_err(ApiError::BadRequest)?;
    let next_run_time = spec.next_fire(now_naive()).and_then(epoch_from_naive);
    let now = current_timestamp();
    Ok(ScheduleRecord {
        id: new_id(),
        task_id: task_id.to_string(),
        schedule_type: request.schedule_type,
        schedule_config: request.schedule_config.clone(),
        is_active: next_run_time.is_some(),
        next_run_time,
        create_time: now,
        update_time: now,
    })
}

/// Load a task, hiding rows the caller may not see.
///
/// Non-admin callers only see their own tasks; a foreign task reads as
/// absent rather than forbidden so ids cannot be probed.
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

fn validate_task_name(name: &str) -> Result<(), ApiError> {
    if name.is_empty() || name.len() > 200 {
        return Err(ApiError::BadRequest(
            "task_name must be between 1 and 200 characters".to_string(),
        ));
    }
    Ok(())
}

/// POST /api/v1/tasks
pub async fn create_task(
    State(state): State<AppState>,
    request_headers: HeaderMap,
    Json(request): Json<TaskCreateRequest>,
) -> Result<Json<ApiResponse<serde_json::Value>>, ApiError> {
    let caller = authenticate(&state, &request_headers).await?;
    authorize(&state, &caller, "task", "create").await?;

    validate_task_name(&request.task_name)?;

    let trigger_mode = request.trigger_mode.unwrap_or(TriggerMode::Manual);
    if trigger_mode == TriggerMode::Auto && request.schedule.is_none() {
        return Err(ApiError::BadRequest(
            "auto-triggered tasks require a schedule".to_string(),
        ));
    }

    let now = current_timestamp();
    let task = TaskRecord {
        id: new_id(),
        task_name: request.task_name.clone(),
        task_type: request.task_type,
        status: TaskStatus::Active,
        trigger_mode,
        base_url: request.base_url.clone(),
        base_url_params: request.base_url_params.clone(),
        need_user_login: request.need_user_login,
        extract_config: request.extract_config.clone(),
        creator_id: caller.user_id.clone(),
        description: request.description.clone(),
        create_time: now,
        update_time: now,
    };

    // Validate the schedule before touching the store.
    let schedule = request
        .schedule
        .as_ref()
        .map(|s| build_schedule(&task.id, s))
        .transpose()?;

    {
        let mut db = state.database.lock().await;
        let existing = db
            .get_task_by_name(&request.task_name)
            .await
            .map_err(ApiError::database)?;
        if existing.is_some() {
            return Err(ApiError::Conflict(format!(
                "A task named '{}' already exists",
                request.task_name
            )));
        }

        let conn = db.get_connection().map_err(ApiError::database)?;
        let tx = conn.transaction().map_err(ApiError::database)?;
        db_task::insert_task(&tx, &task).map_err(ApiError::database)?;
        if let Some(schedule) = &schedule {
            db_schedule::insert_schedule(&tx, schedule).map_err(ApiError::database)?;
        }
        tx.commit().map_err(ApiError::database)?;
    }

    info!(task_id = %task.id, task_name = %task.task_name, "Task created");
    Ok(Json(ApiResponse::message_with_data(
        "Task created",
        serde_json::json!({
            "task_id": task.id,
            "schedule_id": schedule.as_ref().map(|s| s.id.clone()),
        }),
    )))
}

/// GET /api/v1/tasks
pub async fn list_tasks(
    State(state): State<AppState>,
    request_headers: HeaderMap,
    Query(query): Query<TaskListQuery>,
) -> Result<Json<ApiResponse<Page<TaskRecord>>>, ApiError> {
    let caller = authenticate(&state, &request_headers).await?;
    authorize(&state, &caller, "task", "read").await?;

    let status = query
        .status
        .as_deref()
        .map(|s| {
            TaskStatus::parse(s)
                .ok_or_else(|| ApiError::BadRequest(format!("Unknown task status: {}", s)))
        })
        .transpose()?;

    let filter = db_task::TaskFilter {
        status,
        name_like: query.task_name.clone(),
        creator_id: (!caller.is_admin()).then(|| caller.user_id.clone()),
        page: query.page,
        page_size: query.page_size,
    };

    let (tasks, total) = {
        let mut db = state.database.lock().await;
        let conn = db.get_connection().map_err(ApiError::database)?;
        db_task::list_tasks(conn, &filter).map_err(ApiError::database)?
    };

    Ok(Json(ApiResponse::success(Page::new(
        tasks,
        total,
        query.page.max(1),
        query.page_size.max(1),
    ))))
}

/// GET /api/v1/tasks/{task_id}
pub async fn get_task(
    State(state): State<AppState>,
    request_headers: HeaderMap,
    Path(task_id): Path<String>,
) -> Result<Json<ApiResponse<TaskRecord>>, ApiError> {
    let caller = authenticate(&state, &request_headers).await?;
    authorize(&state, &caller, "task", "read").await?;

    let task = load_owned_task(&state, &caller, &task_id).await?;
    Ok(Json(ApiResponse::success(task)))
}

/// PUT /api/v1/tasks/{task_id}
pub async fn update_task(
    State(state): State<AppState>,
    request_headers: HeaderMap,
    Path(task_id): Path<String>,
    Json(request): Json<TaskUpdateRequest>,
) -> Result<Json<ApiResponse<serde_json::Value>>, ApiError> {
    let caller = authenticate(&state, &request_headers).await?;
    authorize(&state, &caller, "task", "update").await?;

    let mut task = load_owned_task(&state, &caller, &task_id).await?;

    // No edits while an execution is in flight.
    let live = {
        let mut db = state.database.lock().await;
        db.non_terminal_execution_for_task(&task_id)
            .await
            .map_err(ApiError::database)?
    };
    if live.is_some() {
        return Err(ApiError::Conflict(
            "Task has a pending or running execution; stop it before editing".to_string(),
        ));
    }

    if let Some(name) = &request.task_name {
        validate_task_name(name)?;
        if *name != task.task_name {
            let clash = {
                let mut db = state.database.lock().await;
                db.get_task_by_name(name).await.map_err(ApiError::database)?
            };
            if clash.is_some() {
                return Err(ApiError::Conflict(format!(
                    "A task named '{}' already exists",
                    name
                )));
            }
            task.task_name = name.clone();
        }
    }
    if let Some(base_url) = &request.base_url {
        task.base_url = Some(base_url.clone());
    }
    if let Some(params) = &request.base_url_params {
        task.base_url_params = params.clone();
    }
    if let Some(need_user_login) = request.need_user_login {
        task.need_user_login = need_user_login;
    }
    if let Some(extract_config) = &request.extract_config {
        task.extract_config = Some(extract_config.clone());
    }
    if let Some(description) = &request.description {
        task.description = Some(description.clone());
    }

    let old_mode = task.trigger_mode;
    let new_mode = request.trigger_mode.unwrap_or(old_mode);
    task.trigger_mode = new_mode;

    if new_mode == TriggerMode::Manual && request.schedule.is_some() {
        return Err(ApiError::BadRequest(
            "a schedule only applies to auto-triggered tasks".to_string(),
        ));
    }
    if old_mode == TriggerMode::Manual && new_mode == TriggerMode::Auto && request.schedule.is_none()
    {
        return Err(ApiError::BadRequest(
            "switching to auto requires a schedule".to_string(),
        ));
    }

    // Validate the replacement schedule up front.
    let new_schedule = request
        .schedule
        .as_ref()
        .map(|s| build_schedule(&task.id, s))
        .transpose()?;

    {
        let mut db = state.database.lock().await;
        let conn = db.get_connection().map_err(ApiError::database)?;
        let tx = conn.transaction().map_err(ApiError::database)?;
        db_task::update_task(&tx, &task).map_err(ApiError::database)?;
        if old_mode == TriggerMode::Auto && new_mode == TriggerMode::Manual {
            // Leaving auto mode retires the schedule.
            db_schedule::soft_delete_schedules_for_task(&tx, &task.id)
                .map_err(ApiError::database)?;
        }
        if let Some(schedule) = &new_schedule {
            db_schedule::soft_delete_schedules_for_task(&tx, &task.id)
                .map_err(ApiError::database)?;
            db_schedule::insert_schedule(&tx, schedule).map_err(ApiError::database)?;
        }
        tx.commit().map_err(ApiError::database)?;
    }

    info!(task_id = %task.id, "Task updated");
    Ok(Json(ApiResponse::message_with_data(
        "Task updated",
        serde_json::json!({
            "task_id": task.id,
            "schedule_id": new_schedule.as_ref().map(|s| s.id.clone()),
        }),
    )))
}

/// DELETE /api/v1/tasks/{task_id}
pub async fn delete_task(
    State(state): State<AppState>,
    request_headers: HeaderMap,
    Path(task_id): Path<String>,
) -> Result<Json<ApiResponse<serde_json::Value>>, ApiError> {
    let caller = authenticate(&state, &request_headers).await?;
    authorize(&state, &caller, "task", "delete").await?;

    let task = load_owned_task(&state, &caller, &task_id).await?;

    // Only a running execution blocks deletion; a pending one that never
    // starts is failed by the reconciler once the task is gone.
    let running = {
        let mut db = state.database.lock().await;
        db.running_execution_for_task(&task.id)
            .await
            .map_err(ApiError::database)?
    };
    if running.is_some() {
        return Err(ApiError::Conflict(
            "Task has a running execution; stop it before deleting".to_string(),
        ));
    }

    {
        let mut db = state.database.lock().await;
        db.delete_task_cascade(&task.id)
            .await
            .map_err(ApiError::database)?;
    }

    info!(task_id = %task.id, "Task deleted");
    Ok(Json(ApiResponse::message("Task deleted")))
}

/// POST /api/v1/tasks/{task_id}/execute
pub async fn execute_task(
    State(state): State<AppState>,
    request_headers: HeaderMap,
    Path(task_id): Path<String>,
) -> Result<Json<ApiResponse<serde_json::Value>>, ApiError> {
    let caller = authenticate(&state, &request_headers).await?;
    authorize(&state, &caller, "task", "execute").await?;

    let task = load_owned_task(&state, &caller, &task_id).await?;

    match task.status {
        TaskStatus::Paused => {
            return Err(ApiError::Conflict(
                "Task is paused; activate it before executing".to_string(),
            ));
        }
        TaskStatus::Running => {
            return Err(ApiError::Conflict(
                "Task is already running; wait for it to finish or stop it".to_string(),
            ));
        }
        TaskStatus::Active => {}
    }

    let now = current_timestamp();
    let execution = ExecutionRecord {
        id: new_id(),
        task_id: task.id.clone(),
        executor_id: caller.user_id.clone(),
        execution_name: format!("exec-{}-{}", now, short_id(&task.id)),
        status: ExecutionStatus::Pending,
        start_time: None,
        end_time: None,
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
    };

    {
        let mut db = state.database.lock().await;
        // A pending execution also blocks: one execution per task at a
        // time, whether it has started or not.
        let live = db
            .non_terminal_execution_for_task(&task.id)
            .await
            .map_err(ApiError::database)?;
        if live.is_some() {
            return Err(ApiError::Conflict(
                "Task already has a pending or running execution".to_string(),
            ));
        }
        db.insert_execution(&execution)
            .await
            .map_err(ApiError::database)?;
    }

    let admission = Admission {
        execution_id: execution.id.clone(),
        task_id: task.id.clone(),
        snapshot: TaskSnapshot::from_task(&task),
    };
    if let Err(e) = state.admissions.send(admission).await {
        // The pending row remains and the reconciler re-admits it after
        // the admission timeout.
        error!(execution_id = %execution.id, error = %e, "Failed to enqueue execution admission");
    }

    info!(task_id = %task.id, execution_id = %execution.id, "Execution admitted");
    Ok(Json(ApiResponse::message_with_data(
        "Execution admitted",
        serde_json::json!({"execution_id": execution.id}),
    )))
}

/// POST /api/v1/tasks/{task_id}/stop
pub async fn stop_task(
    State(state): State<AppState>,
    request_headers: HeaderMap,
    Path(task_id): Path<String>,
) -> Result<Json<ApiResponse<serde_json::Value>>, ApiError> {
    let caller = authenticate(&state, &request_headers).await?;
    authorize(&state, &caller, "task", "stop").await?;

    let task = load_owned_task(&state, &caller, &task_id).await?;

    let running = {
        let mut db = state.database.lock().await;
        db.running_execution_for_task(&task.id)
            .await
            .map_err(ApiError::database)?
    };
    let Some(execution) = running else {
        return Err(ApiError::Conflict(
            "Task has no running execution to stop".to_string(),
        ));
    };

    state.engine.stop(&execution.id).await?;

    Ok(Json(ApiResponse::message_with_data(
        "Task stopped",
        serde_json::json!({"execution_id": execution.id}),
    )))
}

/// POST /api/v1/tasks/{task_id}/activate
pub async fn activate_task(
    State(state): State<AppState>,
    request_headers: HeaderMap,
    Path(task_id): Path<String>,
) -> Result<Json<ApiResponse<serde_json::Value>>, ApiError> {
    set_task_lifecycle(state, request_headers, task_id, TaskStatus::Active).await
}

/// POST /api/v1/tasks/{task_id}/deactivate
pub async fn deactivate_task(
    State(state): State<AppState>,
    request_headers: HeaderMap,
    Path(task_id): Path<String>,
) -> Result<Json<ApiResponse<serde_json::Value>>, ApiError> {
    set_task_lifecycle(state, request_headers, task_id, TaskStatus::Paused).await
}

async fn set_task_lifecycle(
    state: AppState,
    request_headers: HeaderMap,
    task_id: String,
    target: TaskStatus,
) -> Result<Json<ApiResponse<serde_json::Value>>, ApiError> {
    let caller = authenticate(&state, &request_headers).await?;
    authorize(&state, &caller, "task", "update").await?;

    let task = load_owned_task(&state, &caller, &task_id).await?;

    if task.status == TaskStatus::Running {
        return Err(ApiError::Conflict(
            "Task is running; its status is owned by the execution engine".to_string(),
        ));
    }

    {
        let mut db = state.database.lock().await;
        db.set_task_status(&task.id, target)
            .await
            .map_err(ApiError::database)?;
    }

    let message = match target {
        TaskStatus::Active => "Task activated",
        TaskStatus::Paused => "Task deactivated",
        TaskStatus::Running => unreachable!("lifecycle endpoints never set running"),
    };
    info!(task_id = %task.id, status = target.as_str(), "Task status changed");
    Ok(Json(ApiResponse::message(message)))
}

/// GET /api/v1/tasks/{task_id}/executions
pub async fn list_task_executions(
    State(state): State<AppState>,
    request_headers: HeaderMap,
    Path(task_id): Path<String>,
    Query(query): Query<ExecutionListQuery>,
) -> Result<Json<ApiResponse<Page<ExecutionView>>>, ApiError> {
    let caller = authenticate(&state, &request_headers).await?;
    authorize(&state, &caller, "task", "read").await?;

    let task = load_owned_task(&state, &caller, &task_id).await?;

    let (executions, total) = {
        let mut db = state.database.lock().await;
        db.list_executions_for_task(&task.id, query.page, query.page_size)
            .await
            .map_err(ApiError::database)?
    };

    let host_address = state.config.container_host_address().to_string();
    let items = executions
        .into_iter()
        .map(|execution| {
            let access_url = execution
                .host_port
                .map(|port| format!("http://{}:{}", host_address, port));
            ExecutionView {
                execution,
                access_url,
            }
        })
        .collect();

    Ok(Json(ApiResponse::success(Page::new(
        items,
        total,
        query.page.max(1),
        query.page_size.max(1),
    ))))
}

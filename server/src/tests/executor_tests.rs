//! Tests for the execution engine's start/stop state machine

use super::*;
use crate::executor::{Admission, StopResult};
use shared::model::TaskSnapshot;

fn admission_for(task: &TaskRecord, execution: &ExecutionRecord) -> Admission {
    Admission {
        execution_id: execution.id.clone(),
        task_id: task.id.clone(),
        snapshot: TaskSnapshot::from_task(task),
    }
}

async fn insert_pending(ctx: &TestContext, task: &TaskRecord) -> ExecutionRecord {
    let execution = sample_execution(&task.id, ExecutionStatus::Pending);
    let mut db = ctx.database.lock().await;
    db.create_task(task).await.ok();
    db.insert_execution(&execution).await.unwrap();
    execution
}

#[tokio::test]
async fn test_start_brings_pending_to_running_with_container() {
    let ctx = create_context().await;
    let task = sample_task("happy", "alice");
    let execution = insert_pending(&ctx, &task).await;

    ctx.engine.start(admission_for(&task, &execution)).await;

    let loaded = {
        let mut db = ctx.database.lock().await;
        db.get_execution(&execution.id).await.unwrap().unwrap()
    };
    assert_eq!(loaded.status, ExecutionStatus::Running);
    assert!(loaded.start_time.is_some());
    assert_eq!(
        loaded.container_name.as_deref(),
        Some(format!("task-{}", execution.id).as_str())
    );
    assert!(loaded.container_id.is_some());
    let port = loaded.host_port.unwrap();
    assert!((50000..=50005).contains(&port));
    let command = loaded.host_command.unwrap();
    assert!(command.starts_with("docker run -d --name"));
    assert!(command.contains(&format!("TASK_EXECUTION_ID={}", execution.id)));
    assert!(command.contains(&format!("-p {}:8080", port)));

    let started = ctx.host.started_specs();
    assert_eq!(started.len(), 1);
    assert_eq!(started[0].image, ctx.config.crawler_image);
}

#[tokio::test]
async fn test_db_extract_gets_backup_bind() {
    let ctx = create_context().await;
    let mut task = sample_task("extract", "alice");
    task.task_type = TaskType::DbExtract;
    let execution = insert_pending(&ctx, &task).await;

    ctx.engine.start(admission_for(&task, &execution)).await;

    let started = ctx.host.started_specs();
    assert_eq!(started.len(), 1);
    assert_eq!(started[0].image, ctx.config.db_extract_image);
    assert_eq!(
        started[0].extra_binds,
        vec![(ctx.config.db_backup_dir.clone(), "/app/backups".to_string())]
    );
}

#[tokio::test]
async fn test_invalid_snapshot_fails_without_container() {
    let ctx = create_context().await;
    let mut task = sample_task("invalid", "alice");
    task.base_url = Some("ftp://example.com".to_string());
    let execution = insert_pending(&ctx, &task).await;

    ctx.engine.start(admission_for(&task, &execution)).await;

    let loaded = {
        let mut db = ctx.database.lock().await;
        db.get_execution(&execution.id).await.unwrap().unwrap()
    };
    assert_eq!(loaded.status, ExecutionStatus::Failed);
    assert!(loaded
        .error_log
        .unwrap()
        .contains("Task config validation failed"));
    assert!(ctx.host.started_specs().is_empty());
}

#[tokio::test]
async fn test_port_exhaustion_fails_after_retries() {
    let ctx = create_context().await;
    for port in 50000..=50005 {
        ctx.host.mark_listening(port);
    }
    let task = sample_task("noports", "alice");
    let execution = insert_pending(&ctx, &task).await;

    ctx.engine.start(admission_for(&task, &execution)).await;

    let loaded = {
        let mut db = ctx.database.lock().await;
        db.get_execution(&execution.id).await.unwrap().unwrap()
    };
    assert_eq!(loaded.status, ExecutionStatus::Failed);
    let error_log = loaded.error_log.unwrap();
    assert!(error_log.contains("port exhaustion"), "got: {}", error_log);
    assert!(ctx.host.started_specs().is_empty());
}

#[tokio::test]
async fn test_port_collision_retries_with_fresh_port() {
    let ctx = create_context().await;
    // First start attempt loses the probe-to-bind race.
    ctx.host
        .fail_next_starts("driver failed programming external connectivity: port is already allocated", 1);
    let task = sample_task("retry", "alice");
    let execution = insert_pending(&ctx, &task).await;

    ctx.engine.start(admission_for(&task, &execution)).await;

    let loaded = {
        let mut db = ctx.database.lock().await;
        db.get_execution(&execution.id).await.unwrap().unwrap()
    };
    assert_eq!(loaded.status, ExecutionStatus::Running);
    assert_eq!(ctx.host.started_specs().len(), 1);
}

#[tokio::test]
async fn test_non_port_start_error_is_terminal() {
    let ctx = create_context().await;
    ctx.host
        .fail_next_starts("Unable to find image 'data-platform/crawler:latest'", 1);
    let task = sample_task("noimage", "alice");
    let execution = insert_pending(&ctx, &task).await;

    ctx.engine.start(admission_for(&task, &execution)).await;

    let loaded = {
        let mut db = ctx.database.lock().await;
        db.get_execution(&execution.id).await.unwrap().unwrap()
    };
    assert_eq!(loaded.status, ExecutionStatus::Failed);
    assert!(loaded.error_log.unwrap().contains("Container start failed"));
    // The staged config was purged on the way out.
    assert_eq!(ctx.host.purged_configs(), vec![execution.id.clone()]);
}

#[tokio::test]
async fn test_start_skips_cancelled_execution() {
    let ctx = create_context().await;
    let task = sample_task("gone", "alice");
    let execution = insert_pending(&ctx, &task).await;
    {
        let mut db = ctx.database.lock().await;
        db.finish_execution(
            &execution.id,
            ExecutionStatus::Cancelled,
            current_timestamp(),
            None,
            None,
        )
        .await
        .unwrap();
    }

    ctx.engine.start(admission_for(&task, &execution)).await;

    // Nothing started and the terminal status is untouched.
    assert!(ctx.host.started_specs().is_empty());
    let loaded = {
        let mut db = ctx.database.lock().await;
        db.get_execution(&execution.id).await.unwrap().unwrap()
    };
    assert_eq!(loaded.status, ExecutionStatus::Cancelled);
}

#[tokio::test]
async fn test_stop_cancels_running_execution() {
    let ctx = create_context().await;
    let task = sample_task("stoppable", "alice");
    let execution = insert_pending(&ctx, &task).await;
    ctx.engine.start(admission_for(&task, &execution)).await;

    let result = ctx.engine.stop(&execution.id).await.unwrap();
    assert_eq!(result, StopResult::Cancelled);

    let loaded = {
        let mut db = ctx.database.lock().await;
        db.get_execution(&execution.id).await.unwrap().unwrap()
    };
    assert_eq!(loaded.status, ExecutionStatus::Cancelled);
    assert!(loaded.end_time.is_some());
    assert!(!ctx.host.stopped_targets().is_empty());
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let ctx = create_context().await;
    let task = sample_task("twice", "alice");
    let execution = insert_pending(&ctx, &task).await;
    ctx.engine.start(admission_for(&task, &execution)).await;

    assert_eq!(
        ctx.engine.stop(&execution.id).await.unwrap(),
        StopResult::Cancelled
    );
    assert_eq!(
        ctx.engine.stop(&execution.id).await.unwrap(),
        StopResult::Noop
    );
}

#[tokio::test]
async fn test_stop_unknown_execution_is_not_found() {
    let ctx = create_context().await;
    let err = ctx.engine.stop("no-such-execution").await.unwrap_err();
    assert!(matches!(err, shared::OrchestratorError::NotFound(_)));
}

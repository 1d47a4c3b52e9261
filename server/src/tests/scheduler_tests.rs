//! Tests for the schedule engine: firing, auto-disable, leader lease

use super::*;
use crate::scheduler::ScheduleEngine;
use serde_json::json;

fn schedule_engine(ctx: &TestContext) -> ScheduleEngine {
    ScheduleEngine::new(
        Arc::clone(&ctx.config),
        Arc::clone(&ctx.database),
        ctx.cache.clone(),
        ctx.admit_tx.clone(),
    )
}

async fn insert_task_with_schedule(
    ctx: &TestContext,
    name: &str,
    schedule_type: ScheduleType,
    config: serde_json::Value,
) -> (TaskRecord, ScheduleRecord) {
    let mut task = sample_task(name, "alice");
    task.trigger_mode = TriggerMode::Auto;
    // Due one second ago.
    let schedule = sample_schedule(
        &task.id,
        schedule_type,
        config,
        Some(current_timestamp() - 1),
    );
    let mut db = ctx.database.lock().await;
    db.create_task(&task).await.unwrap();
    db.insert_schedule(&schedule).await.unwrap();
    (task, schedule)
}

#[tokio::test]
async fn test_immediate_schedule_fires_once_and_deactivates() {
    let mut ctx = create_context().await;
    let (task, schedule) =
        insert_task_with_schedule(&ctx, "immediate", ScheduleType::Immediate, json!({})).await;

    let engine = schedule_engine(&ctx);
    assert_eq!(engine.tick().await.unwrap(), 1);

    // A pending execution exists and was admitted.
    let admission = ctx.admit_rx.try_recv().unwrap();
    assert_eq!(admission.task_id, task.id);
    let mut db = ctx.database.lock().await;
    let execution = db.get_execution(&admission.execution_id).await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Pending);
    assert_eq!(execution.executor_id, "alice");
    assert!(execution.execution_name.starts_with("sched-"));

    // The one-shot schedule deactivated with no next fire.
    let schedule = db.get_schedule(&schedule.id).await.unwrap().unwrap();
    assert!(!schedule.is_active);
    assert!(schedule.next_run_time.is_none());
    drop(db);

    // Nothing left to fire.
    assert_eq!(engine.tick().await.unwrap(), 0);
}

#[tokio::test]
async fn test_interval_schedule_recomputes_next_fire() {
    let mut ctx = create_context().await;
    let (_task, schedule) = insert_task_with_schedule(
        &ctx,
        "interval",
        ScheduleType::Interval,
        json!({"interval": 10, "unit": "minutes"}),
    )
    .await;

    let engine = schedule_engine(&ctx);
    assert_eq!(engine.tick().await.unwrap(), 1);
    assert!(ctx.admit_rx.try_recv().is_ok());

    let mut db = ctx.database.lock().await;
    let schedule = db.get_schedule(&schedule.id).await.unwrap().unwrap();
    assert!(schedule.is_active);
    let next = schedule.next_run_time.unwrap();
    // Roughly ten minutes out.
    let delta = next - current_timestamp();
    assert!((590..=610).contains(&delta), "next fire in {}s", delta);
}

#[tokio::test]
async fn test_auto_disable_after_three_failures() {
    let mut ctx = create_context().await;
    let (task, schedule) = insert_task_with_schedule(
        &ctx,
        "flaky",
        ScheduleType::Interval,
        json!({"interval": 60, "unit": "seconds"}),
    )
    .await;

    {
        let mut db = ctx.database.lock().await;
        for _ in 0..3 {
            db.insert_execution(&sample_execution(&task.id, ExecutionStatus::Failed))
                .await
                .unwrap();
        }
    }

    let engine = schedule_engine(&ctx);
    // The tick observes three consecutive failures and disables the
    // schedule instead of firing a fourth run.
    assert_eq!(engine.tick().await.unwrap(), 0);
    assert!(ctx.admit_rx.try_recv().is_err());

    let mut db = ctx.database.lock().await;
    let schedule = db.get_schedule(&schedule.id).await.unwrap().unwrap();
    assert!(!schedule.is_active);

    // No fourth execution was created.
    let recent = db.recent_executions(&task.id, 10).await.unwrap();
    assert_eq!(recent.len(), 3);
}

#[tokio::test]
async fn test_mixed_outcomes_do_not_disable() {
    let mut ctx = create_context().await;
    let (task, _schedule) = insert_task_with_schedule(
        &ctx,
        "mixed",
        ScheduleType::Interval,
        json!({"interval": 60, "unit": "seconds"}),
    )
    .await;

    {
        let mut db = ctx.database.lock().await;
        db.insert_execution(&sample_execution(&task.id, ExecutionStatus::Failed))
            .await
            .unwrap();
        db.insert_execution(&sample_execution(&task.id, ExecutionStatus::Success))
            .await
            .unwrap();
        db.insert_execution(&sample_execution(&task.id, ExecutionStatus::Failed))
            .await
            .unwrap();
    }

    let engine = schedule_engine(&ctx);
    assert_eq!(engine.tick().await.unwrap(), 1);
    assert!(ctx.admit_rx.try_recv().is_ok());
}

#[tokio::test]
async fn test_live_execution_blocks_firing() {
    let mut ctx = create_context().await;
    let (task, schedule) = insert_task_with_schedule(
        &ctx,
        "busy",
        ScheduleType::Interval,
        json!({"interval": 60, "unit": "seconds"}),
    )
    .await;

    {
        let mut db = ctx.database.lock().await;
        db.insert_execution(&sample_execution(&task.id, ExecutionStatus::Running))
            .await
            .unwrap();
    }

    let engine = schedule_engine(&ctx);
    assert_eq!(engine.tick().await.unwrap(), 0);
    assert!(ctx.admit_rx.try_recv().is_err());

    // The schedule stays due and retries once the slot frees up.
    let mut db = ctx.database.lock().await;
    let schedule = db.get_schedule(&schedule.id).await.unwrap().unwrap();
    assert!(schedule.is_active);
}

#[tokio::test]
async fn test_running_task_is_skipped() {
    let mut ctx = create_context().await;
    let (task, _schedule) = insert_task_with_schedule(
        &ctx,
        "running-task",
        ScheduleType::Interval,
        json!({"interval": 60, "unit": "seconds"}),
    )
    .await;
    {
        let mut db = ctx.database.lock().await;
        db.set_task_status(&task.id, TaskStatus::Running).await.unwrap();
    }

    let engine = schedule_engine(&ctx);
    assert_eq!(engine.tick().await.unwrap(), 0);
    assert!(ctx.admit_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_schedule_for_deleted_task_is_removed() {
    let mut ctx = create_context().await;
    let (task, schedule) = insert_task_with_schedule(
        &ctx,
        "orphan",
        ScheduleType::Interval,
        json!({"interval": 60, "unit": "seconds"}),
    )
    .await;
    {
        // Delete the task but leave the schedule behind on purpose.
        let mut db = ctx.database.lock().await;
        let conn = db.get_connection().unwrap();
        crate::database::db_task::soft_delete_task(conn, &task.id).unwrap();
    }

    let engine = schedule_engine(&ctx);
    assert_eq!(engine.tick().await.unwrap(), 0);
    assert!(ctx.admit_rx.try_recv().is_err());

    let mut db = ctx.database.lock().await;
    assert!(db.get_schedule(&schedule.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_non_leader_skips_tick() {
    let ctx = create_context().await;
    insert_task_with_schedule(&ctx, "leaderless", ScheduleType::Immediate, json!({})).await;

    // Another process holds the lease.
    ctx.cache
        .acquire_lease(
            crate::cache::LEADER_KEY,
            "some-other-node",
            std::time::Duration::from_secs(60),
        )
        .await
        .unwrap();

    let engine = schedule_engine(&ctx);
    assert_eq!(engine.tick().await.unwrap(), 0);
}

#[tokio::test]
async fn test_at_most_one_live_execution_across_paths() {
    let mut ctx = create_context().await;
    let (task, _schedule) =
        insert_task_with_schedule(&ctx, "single", ScheduleType::Immediate, json!({})).await;

    let engine = schedule_engine(&ctx);
    assert_eq!(engine.tick().await.unwrap(), 1);
    let admission = ctx.admit_rx.try_recv().unwrap();

    // While the fired execution is pending, a second tick (re-enabled
    // schedule) must not create another one.
    {
        let mut db = ctx.database.lock().await;
        let schedule = db.schedule_for_task(&task.id).await.unwrap().unwrap();
        db.set_schedule_active(&schedule.id, true, Some(current_timestamp() - 1))
            .await
            .unwrap();
    }
    assert_eq!(engine.tick().await.unwrap(), 0);

    let mut db = ctx.database.lock().await;
    let live = db.non_terminal_execution_for_task(&task.id).await.unwrap();
    assert_eq!(live.unwrap().id, admission.execution_id);
}

//! Tests for the liveness reconciler: container-authoritative resolution,
//! heartbeat strikes, and lost-admission repair

use super::*;
use crate::host::ContainerState;
use crate::reconciler::Reconciler;

fn reconciler(ctx: &TestContext) -> Reconciler {
    Reconciler::new(
        Arc::clone(&ctx.config),
        Arc::clone(&ctx.database),
        ctx.cache.clone(),
        ctx.host.clone() as Arc<dyn crate::host::HostDriver>,
        ctx.engine.clone(),
        ctx.admit_tx.clone(),
    )
}

/// A running execution whose container the fake host knows about.
async fn running_execution(ctx: &TestContext, task: &TaskRecord, container_id: &str) -> ExecutionRecord {
    let mut execution = sample_execution(&task.id, ExecutionStatus::Running);
    execution.container_name = Some(format!("task-{}", execution.id));
    execution.container_id = Some(container_id.to_string());
    execution.host_port = Some(50001);
    execution.last_heartbeat = Some(current_timestamp());
    {
        let mut db = ctx.database.lock().await;
        db.create_task(task).await.ok();
        db.insert_execution(&execution).await.unwrap();
    }
    ctx.host.set_container_state(
        container_id,
        ContainerState {
            exists: true,
            running: true,
            status: "running".to_string(),
            exit_code: None,
        },
    );
    execution
}

async fn load(ctx: &TestContext, execution_id: &str) -> ExecutionRecord {
    let mut db = ctx.database.lock().await;
    db.get_execution(execution_id).await.unwrap().unwrap()
}

#[tokio::test]
async fn test_healthy_execution_is_untouched() {
    let ctx = create_context().await;
    let task = sample_task("healthy", "alice");
    let execution = running_execution(&ctx, &task, "cid-healthy").await;

    let summary = reconciler(&ctx).run_pass().await.unwrap();
    assert_eq!(summary.checked, 1);
    assert_eq!(summary.resolved, 0);

    assert_eq!(load(&ctx, &execution.id).await.status, ExecutionStatus::Running);
}

#[tokio::test]
async fn test_silent_success() {
    let ctx = create_context().await;
    let task = sample_task("silent", "alice");
    let execution = running_execution(&ctx, &task, "cid-silent").await;

    // The container exits cleanly without ever calling completion.
    ctx.host.set_container_state(
        "cid-silent",
        ContainerState {
            exists: true,
            running: false,
            status: "exited".to_string(),
            exit_code: Some(0),
        },
    );

    let summary = reconciler(&ctx).run_pass().await.unwrap();
    assert_eq!(summary.resolved, 1);

    let loaded = load(&ctx, &execution.id).await;
    assert_eq!(loaded.status, ExecutionStatus::Success);
    assert!(loaded.end_time.is_some());
    assert!(loaded
        .error_log
        .unwrap()
        .contains("exited cleanly without completion callback"));
}

#[tokio::test]
async fn test_nonzero_exit_fails_with_code() {
    let ctx = create_context().await;
    let task = sample_task("crashed", "alice");
    let execution = running_execution(&ctx, &task, "cid-crash").await;

    ctx.host.set_container_state(
        "cid-crash",
        ContainerState {
            exists: true,
            running: false,
            status: "exited".to_string(),
            exit_code: Some(137),
        },
    );

    reconciler(&ctx).run_pass().await.unwrap();

    let loaded = load(&ctx, &execution.id).await;
    assert_eq!(loaded.status, ExecutionStatus::Failed);
    let error_log = loaded.error_log.unwrap();
    assert!(error_log.contains("exit_code=137"), "got: {}", error_log);
}

#[tokio::test]
async fn test_missing_container_fails_execution() {
    let ctx = create_context().await;
    let task = sample_task("vanished", "alice");
    let execution = running_execution(&ctx, &task, "cid-gone").await;
    ctx.host.remove_container_record("cid-gone");

    reconciler(&ctx).run_pass().await.unwrap();

    let loaded = load(&ctx, &execution.id).await;
    assert_eq!(loaded.status, ExecutionStatus::Failed);
    assert!(loaded.error_log.unwrap().contains("container missing"));
}

#[tokio::test]
async fn test_heartbeat_loss_takes_three_strikes() {
    let ctx = create_context().await;
    let task = sample_task("quiet", "alice");
    let execution = running_execution(&ctx, &task, "cid-quiet").await;
    {
        // Heartbeats stopped long ago.
        let mut db = ctx.database.lock().await;
        db.update_execution_heartbeat(&execution.id, current_timestamp() - 400)
            .await
            .unwrap();
    }

    let reconciler = reconciler(&ctx);

    // Two stale passes accumulate strikes without terminating.
    for expected_strikes in 1..=2 {
        let summary = reconciler.run_pass().await.unwrap();
        assert_eq!(summary.strikes, 1, "pass {}", expected_strikes);
        assert_eq!(summary.resolved, 0);
        assert_eq!(load(&ctx, &execution.id).await.status, ExecutionStatus::Running);
    }

    // The third strike is terminal.
    let summary = reconciler.run_pass().await.unwrap();
    assert_eq!(summary.resolved, 1);
    let loaded = load(&ctx, &execution.id).await;
    assert_eq!(loaded.status, ExecutionStatus::Failed);
    assert!(loaded.error_log.unwrap().contains("heartbeat lost"));
    // The owning container was stopped on resolution.
    assert!(ctx
        .host
        .stopped_targets()
        .contains(&"cid-quiet".to_string()));
}

#[tokio::test]
async fn test_fresh_heartbeat_clears_strikes() {
    let ctx = create_context().await;
    let task = sample_task("recovering", "alice");
    let execution = running_execution(&ctx, &task, "cid-recover").await;
    {
        let mut db = ctx.database.lock().await;
        db.update_execution_heartbeat(&execution.id, current_timestamp() - 400)
            .await
            .unwrap();
    }

    let reconciler = reconciler(&ctx);
    reconciler.run_pass().await.unwrap();
    reconciler.run_pass().await.unwrap();

    // The container comes back and heartbeats again.
    {
        let mut db = ctx.database.lock().await;
        db.update_execution_heartbeat(&execution.id, current_timestamp())
            .await
            .unwrap();
    }
    let summary = reconciler.run_pass().await.unwrap();
    assert_eq!(summary.strikes, 0);

    // Heartbeats stop again: the strike counter restarts from one instead
    // of resuming at two.
    {
        let mut db = ctx.database.lock().await;
        db.update_execution_heartbeat(&execution.id, current_timestamp() - 400)
            .await
            .unwrap();
    }
    let summary = reconciler.run_pass().await.unwrap();
    assert_eq!(summary.strikes, 1);
    assert_eq!(load(&ctx, &execution.id).await.status, ExecutionStatus::Running);
}

#[tokio::test]
async fn test_never_heartbeated_execution_times_out() {
    let ctx = create_context().await;
    let task = sample_task("mute", "alice");
    let mut execution = sample_execution(&task.id, ExecutionStatus::Running);
    // Started beyond the heartbeat timeout, never called back, and no
    // container was ever recorded.
    execution.start_time = Some(current_timestamp() - 400);
    {
        let mut db = ctx.database.lock().await;
        db.create_task(&task).await.unwrap();
        db.insert_execution(&execution).await.unwrap();
    }

    reconciler(&ctx).run_pass().await.unwrap();

    let loaded = load(&ctx, &execution.id).await;
    assert_eq!(loaded.status, ExecutionStatus::Failed);
    assert!(loaded.error_log.unwrap().contains("never reported heartbeat"));
}

#[tokio::test]
async fn test_recently_started_mute_execution_survives() {
    let ctx = create_context().await;
    let task = sample_task("warming-up", "alice");
    let mut execution = sample_execution(&task.id, ExecutionStatus::Running);
    execution.start_time = Some(current_timestamp() - 30);
    {
        let mut db = ctx.database.lock().await;
        db.create_task(&task).await.unwrap();
        db.insert_execution(&execution).await.unwrap();
    }

    let summary = reconciler(&ctx).run_pass().await.unwrap();
    assert_eq!(summary.resolved, 0);
    assert_eq!(load(&ctx, &execution.id).await.status, ExecutionStatus::Running);
}

#[tokio::test]
async fn test_stale_pending_execution_is_readmitted() {
    let mut ctx = create_context().await;
    let task = sample_task("forgotten", "alice");
    let mut execution = sample_execution(&task.id, ExecutionStatus::Pending);
    execution.create_time = current_timestamp() - 600;
    {
        let mut db = ctx.database.lock().await;
        db.create_task(&task).await.unwrap();
        db.insert_execution(&execution).await.unwrap();
    }

    let summary = reconciler(&ctx).run_pass().await.unwrap();
    assert_eq!(summary.readmitted, 1);

    let admission = ctx.admit_rx.try_recv().unwrap();
    assert_eq!(admission.execution_id, execution.id);
    assert_eq!(admission.task_id, task.id);
}

#[tokio::test]
async fn test_stale_pending_for_deleted_task_fails() {
    let ctx = create_context().await;
    let task = sample_task("abandoned", "alice");
    let mut execution = sample_execution(&task.id, ExecutionStatus::Pending);
    execution.create_time = current_timestamp() - 600;
    {
        let mut db = ctx.database.lock().await;
        db.create_task(&task).await.unwrap();
        db.insert_execution(&execution).await.unwrap();
        db.delete_task_cascade(&task.id).await.unwrap();
    }

    let summary = reconciler(&ctx).run_pass().await.unwrap();
    assert_eq!(summary.readmitted, 0);

    let loaded = load(&ctx, &execution.id).await;
    assert_eq!(loaded.status, ExecutionStatus::Failed);
}

#[tokio::test]
async fn test_resolution_releases_resources() {
    let ctx = create_context().await;
    let task = sample_task("tidy", "alice");
    let execution = running_execution(&ctx, &task, "cid-tidy").await;
    ctx.cache
        .set_with_ttl(
            &crate::cache::hb_key(&execution.id),
            "{}",
            std::time::Duration::from_secs(600),
        )
        .await
        .unwrap();

    ctx.host.set_container_state(
        "cid-tidy",
        ContainerState {
            exists: true,
            running: false,
            status: "exited".to_string(),
            exit_code: Some(0),
        },
    );

    reconciler(&ctx).run_pass().await.unwrap();

    // Staged config purged and heartbeat key dropped in the same pass.
    assert!(ctx.host.purged_configs().contains(&execution.id));
    assert_eq!(
        ctx.cache
            .get(&crate::cache::hb_key(&execution.id))
            .await
            .unwrap(),
        None
    );
}

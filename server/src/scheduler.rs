//! Schedule engine: scans due schedules and admits their tasks
//!
//! One tick loads every active schedule whose next fire is due and, per
//! schedule inside a single store transaction, re-checks the owning task,
//! applies the auto-disable policy, creates the pending execution, and
//! recomputes the next fire. Creating the execution row is the commit
//! point: a lost admission message after commit means a delayed start
//! (repaired by the reconciler), never a duplicate.
//!
//! Only the leader runs ticks. Leadership is a cache-held lease so running
//! several control plane processes does not duplicate fires.

use crate::cache::{self, Cache};
use crate::database::{db_execution, db_schedule, db_task, ServerDatabase};
use crate::executor::Admission;
use anyhow::{Context, Result};
use shared::model::{ExecutionRecord, ExecutionStatus, ScheduleRecord, TaskSnapshot, TaskStatus};
use shared::schedule::ScheduleSpec;
use shared::utils::{current_timestamp, epoch_from_naive, new_id, now_naive, short_id};
use shared::config::ServerConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// How a due schedule was handled within its transaction
struct DueOutcome {
    admission: Option<Admission>,
    clear_backoff: bool,
}

pub struct ScheduleEngine {
    config: Arc<ServerConfig>,
    database: Arc<Mutex<ServerDatabase>>,
    cache: Cache,
    admissions: mpsc::Sender<Admission>,
    /// Identity under which this process competes for the leader lease
    leader_id: String,
}

impl ScheduleEngine {
    pub fn new(
        config: Arc<ServerConfig>,
        database: Arc<Mutex<ServerDatabase>>,
        cache: Cache,
        admissions: mpsc::Sender<Admission>,
    ) -> Self {
        Self {
            config,
            database,
            cache,
            admissions,
            leader_id: new_id(),
        }
    }

    /// Run one scheduler scan; idempotent. Returns the number of schedules
    /// fired.
    pub async fn tick(&self) -> Result<usize> {
        let lease_ttl = Duration::from_secs(self.config.leader_lease_ttl_seconds);
        if !self
            .cache
            .acquire_lease(cache::LEADER_KEY, &self.leader_id, lease_ttl)
            .await?
        {
            debug!("Another process holds the scheduler lease, skipping tick");
            return Ok(0);
        }

        let now = current_timestamp();
        let due = {
            let mut db = self.database.lock().await;
            db.due_schedules(now, self.config.schedule_batch_size).await?
        };
        if due.is_empty() {
            return Ok(0);
        }

        info!("Scheduler tick: {} due schedules", due.len());

        let mut fired = 0;
        for schedule in due {
            let schedule_id = schedule.id.clone();
            let task_id = schedule.task_id.clone();
            match self.process_due_schedule(schedule).await {
                Ok(outcome) => {
                    if outcome.clear_backoff {
                        let _ = self.cache.delete(&cache::backoff_key(&task_id)).await;
                    }
                    if let Some(admission) = outcome.admission {
                        fired += 1;
                        if let Err(e) = self.admissions.send(admission).await {
                            // The pending row survives; the reconciler
                            // re-admits it once it exceeds the admission
                            // timeout.
                            error!(
                                schedule_id = %schedule_id,
                                error = %e,
                                "Failed to enqueue admission for fired schedule"
                            );
                        }
                    }
                }
                Err(e) => {
                    error!(schedule_id = %schedule_id, error = %e, "Failed to process due schedule");
                }
            }
        }

        Ok(fired)
    }

    /// Give up scheduler leadership, letting another process take over
    /// without waiting for the lease to expire
    pub async fn release_leadership(&self) {
        if let Err(e) = self
            .cache
            .release_lease(cache::LEADER_KEY, &self.leader_id)
            .await
        {
            warn!("Failed to release scheduler lease: {:#}", e);
        }
    }

    /// Handle one due schedule inside a single store transaction
    async fn process_due_schedule(&self, schedule: ScheduleRecord) -> Result<DueOutcome> {
        let mut db = self.database.lock().await;
        let conn = db.get_connection()?;
        let tx = conn.transaction()?;
        let outcome = Self::evaluate_due(&tx, &schedule)?;
        tx.commit().context("Failed to commit scheduler transaction")?;
        Ok(outcome)
    }

    fn evaluate_due(
        tx: &rusqlite::Transaction<'_>,
        schedule: &ScheduleRecord,
    ) -> Result<DueOutcome> {
        let skip = DueOutcome {
            admission: None,
            clear_backoff: false,
        };

        // Re-read the owning task under the transaction.
        let Some(task) = db_task::get_task(tx, &schedule.task_id)? else {
            // The owning task is gone; the delete cascade should have taken
            // this schedule with it, so repair the stragglers here.
            warn!(
                schedule_id = %schedule.id,
                task_id = %schedule.task_id,
                "Schedule points at a deleted task, removing it"
            );
            db_schedule::soft_delete_schedule(tx, &schedule.id)?;
            return Ok(skip);
        };

        if task.status == TaskStatus::Running {
            debug!(task_id = %task.id, "Task is running, schedule will retry next tick");
            return Ok(skip);
        }

        // Auto-disable on consecutive failure: three failed executions in a
        // row park the schedule until someone fixes the task and re-enables
        // it.
        let recent = db_execution::recent_executions(tx, &task.id, 3)?;
        if recent.len() >= 3 && recent.iter().all(|e| e.status == ExecutionStatus::Failed) {
            warn!(
                task_id = %task.id,
                schedule_id = %schedule.id,
                "Last three executions failed, auto-disabling schedule"
            );
            db_schedule::set_schedule_active(tx, &schedule.id, false, schedule.next_run_time)?;
            return Ok(DueOutcome {
                admission: None,
                clear_backoff: true,
            });
        }
        let clear_backoff = recent
            .first()
            .map(|e| e.status == ExecutionStatus::Success)
            .unwrap_or(false);

        // Defensive single-concurrency guard; concurrent admissions through
        // the control API must not double-fire.
        if db_execution::non_terminal_execution_for_task(tx, &task.id)?.is_some() {
            debug!(task_id = %task.id, "Task already has a live execution, skipping fire");
            return Ok(DueOutcome {
                admission: None,
                clear_backoff,
            });
        }

        let spec = match ScheduleSpec::parse(schedule.schedule_type, &schedule.schedule_config) {
            Ok(spec) => spec,
            Err(reason) => {
                warn!(
                    schedule_id = %schedule.id,
                    reason = %reason,
                    "Schedule config no longer parses, deactivating"
                );
                db_schedule::set_schedule_active(tx, &schedule.id, false, None)?;
                return Ok(skip);
            }
        };

        let now = current_timestamp();
        let execution = ExecutionRecord {
            id: new_id(),
            task_id: task.id.clone(),
            executor_id: task.creator_id.clone(),
            execution_name: format!("sched-{}-{}", now, short_id(&task.id)),
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
        db_execution::insert_execution(tx, &execution)?;

        // Recompute the next fire. One-shot schedules (immediate, once-at)
        // deactivate after firing with no next fire.
        let next = if spec.fires_once() {
            None
        } else {
            spec.next_fire(now_naive()).and_then(epoch_from_naive)
        };
        let still_active = next.is_some();
        db_schedule::set_schedule_active(tx, &schedule.id, still_active, next)?;

        info!(
            task_id = %task.id,
            execution_id = %execution.id,
            next_run_time = ?next,
            "Schedule fired"
        );

        Ok(DueOutcome {
            admission: Some(Admission {
                execution_id: execution.id,
                task_id: task.id.clone(),
                snapshot: TaskSnapshot::from_task(&task),
            }),
            clear_backoff,
        })
    }
}

//! Liveness reconciler: resolves executions from authoritative container
//! state
//!
//! Container state is the primary signal; heartbeats are a liveness hint
//! only. A container that exited cleanly without ever calling the
//! completion endpoint is still a success, and one that vanished is a
//! failure no matter how recent its last heartbeat was. The reconciler
//! holds no locks: every terminal write goes through the guarded
//! non-terminal -> terminal update, so racing with callbacks or user stops
//! is harmless.

use crate::cache::{self, Cache};
use crate::database::ServerDatabase;
use crate::executor::{Admission, ExecutionEngine};
use crate::host::HostDriver;
use anyhow::Result;
use futures_util::stream::{self, StreamExt};
use shared::config::ServerConfig;
use shared::model::{ExecutionRecord, ExecutionStatus, TaskSnapshot};
use shared::utils::current_timestamp;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

/// What one per-execution check concluded
enum Disposition {
    /// Container running and heartbeats fresh
    Healthy,
    /// A terminal status was written this pass
    Resolved,
    /// Heartbeat stale but still under the strike budget
    Strike,
    /// Could not tell (inspect timeout, cache unavailable); retry next pass
    Unknown,
}

/// Counters for one reconcile pass
#[derive(Debug, Default, Clone, Copy)]
pub struct ReconcileSummary {
    pub checked: usize,
    pub resolved: usize,
    pub strikes: usize,
    pub readmitted: usize,
}

pub struct Reconciler {
    config: Arc<ServerConfig>,
    database: Arc<Mutex<ServerDatabase>>,
    cache: Cache,
    host: Arc<dyn HostDriver>,
    engine: ExecutionEngine,
    admissions: mpsc::Sender<Admission>,
}

impl Reconciler {
    pub fn new(
        config: Arc<ServerConfig>,
        database: Arc<Mutex<ServerDatabase>>,
        cache: Cache,
        host: Arc<dyn HostDriver>,
        engine: ExecutionEngine,
        admissions: mpsc::Sender<Admission>,
    ) -> Self {
        Self {
            config,
            database,
            cache,
            host,
            engine,
            admissions,
        }
    }

    /// Run one reconcile pass over every running execution, then re-admit
    /// stale pending rows whose admission message was lost
    pub async fn run_pass(&self) -> Result<ReconcileSummary> {
        let running = {
            let mut db = self.database.lock().await;
            db.running_executions().await?
        };

        let mut summary = ReconcileSummary {
            checked: running.len(),
            ..Default::default()
        };

        let dispositions: Vec<Disposition> = stream::iter(running)
            .map(|execution| self.check_execution(execution))
            .buffer_unordered(self.config.reconciler_concurrency.max(1))
            .collect()
            .await;

        for disposition in dispositions {
            match disposition {
                Disposition::Resolved => summary.resolved += 1,
                Disposition::Strike => summary.strikes += 1,
                Disposition::Healthy | Disposition::Unknown => {}
            }
        }

        summary.readmitted = self.readmit_stale_pending().await?;

        if summary.resolved > 0 || summary.strikes > 0 || summary.readmitted > 0 {
            info!(
                checked = summary.checked,
                resolved = summary.resolved,
                strikes = summary.strikes,
                readmitted = summary.readmitted,
                "Reconcile pass complete"
            );
        }

        Ok(summary)
    }

    async fn check_execution(&self, execution: ExecutionRecord) -> Disposition {
        // Container reality check comes first and is authoritative.
        if let Some(container_id) = execution.container_id.clone() {
            match self.host.inspect(&container_id).await {
                Err(e) if e.is_timeout() => {
                    warn!(
                        execution_id = %execution.id,
                        container_id = %container_id,
                        "Container inspect timed out; state unknown until next pass"
                    );
                    return Disposition::Unknown;
                }
                Err(e) => {
                    warn!(
                        execution_id = %execution.id,
                        container_id = %container_id,
                        error = %e,
                        "Container inspect failed"
                    );
                    return Disposition::Unknown;
                }
                Ok(state) => {
                    if !state.exists {
                        warn!(
                            execution_id = %execution.id,
                            container_id = %container_id,
                            "Container missing, failing execution"
                        );
                        return self
                            .resolve(&execution, ExecutionStatus::Failed, "container missing")
                            .await;
                    }
                    if !state.running {
                        return match state.exit_code {
                            Some(0) => {
                                // Silent success: clean exit, no completion
                                // callback.
                                info!(
                                    execution_id = %execution.id,
                                    "Container exited cleanly without completion callback"
                                );
                                self.resolve(
                                    &execution,
                                    ExecutionStatus::Success,
                                    "container exited cleanly without completion callback",
                                )
                                .await
                            }
                            exit_code => {
                                warn!(
                                    execution_id = %execution.id,
                                    exit_code = ?exit_code,
                                    status = %state.status,
                                    "Container exited abnormally"
                                );
                                let reason = format!(
                                    "container exited (exit_code={}, status={})",
                                    exit_code
                                        .map(|c| c.to_string())
                                        .unwrap_or_else(|| "unknown".to_string()),
                                    state.status
                                );
                                self.resolve(&execution, ExecutionStatus::Failed, &reason).await
                            }
                        };
                    }
                    // Still running: fall through to the heartbeat hint.
                }
            }
        }

        self.check_heartbeat(&execution).await
    }

    /// Heartbeat check, reached only while the container (if any) is still
    /// running
    async fn check_heartbeat(&self, execution: &ExecutionRecord) -> Disposition {
        let now = current_timestamp();
        let t_hb = self.config.heartbeat_timeout_seconds as i64;

        let Some(last_heartbeat) = execution.last_heartbeat else {
            let started = execution.start_time.unwrap_or(execution.create_time);
            if now - started > t_hb {
                warn!(
                    execution_id = %execution.id,
                    "Execution never reported a heartbeat, failing it"
                );
                return self
                    .resolve(execution, ExecutionStatus::Failed, "never reported heartbeat")
                    .await;
            }
            return Disposition::Healthy;
        };

        if now - last_heartbeat <= t_hb {
            // Fresh heartbeat wipes any accumulated strikes.
            let _ = self.cache.delete(&cache::timeout_key(&execution.id)).await;
            return Disposition::Healthy;
        }

        let strikes = match self
            .cache
            .incr_with_ttl(
                &cache::timeout_key(&execution.id),
                Duration::from_secs(self.config.heartbeat_timeout_seconds * 2),
            )
            .await
        {
            Ok(strikes) => strikes,
            Err(e) => {
                warn!(
                    execution_id = %execution.id,
                    error = %e,
                    "Cache unavailable for timeout counter; retrying next pass"
                );
                return Disposition::Unknown;
            }
        };

        let budget = self.config.heartbeat_timeout_strikes as i64;
        warn!(
            execution_id = %execution.id,
            strikes,
            budget,
            "Heartbeat is stale"
        );
        if strikes >= budget {
            let _ = self.cache.delete(&cache::timeout_key(&execution.id)).await;
            let reason = format!("heartbeat lost after {} consecutive timeouts", strikes);
            return self.resolve(execution, ExecutionStatus::Failed, &reason).await;
        }
        Disposition::Strike
    }

    /// Guarded terminal write plus resource teardown
    async fn resolve(
        &self,
        execution: &ExecutionRecord,
        status: ExecutionStatus,
        note: &str,
    ) -> Disposition {
        let finished = {
            let mut db = self.database.lock().await;
            db.finish_execution(&execution.id, status, current_timestamp(), None, Some(note))
                .await
        };
        match finished {
            Ok(true) => {
                self.engine.finalize_terminal(execution).await;
                Disposition::Resolved
            }
            Ok(false) => {
                // Someone else (completion callback, user stop) got there
                // first; their terminal status stands.
                debug!(execution_id = %execution.id, "Execution already terminal");
                Disposition::Healthy
            }
            Err(e) => {
                error!(execution_id = %execution.id, error = %e, "Failed to write terminal status");
                Disposition::Unknown
            }
        }
    }

    /// Re-admit pending executions older than the admission timeout
    ///
    /// Covers the enqueue-after-commit failure window in the scheduler and
    /// the control API: the row exists but its admission message never
    /// reached the engine.
    async fn readmit_stale_pending(&self) -> Result<usize> {
        let cutoff = current_timestamp() - self.config.admission_timeout_seconds as i64;
        let stale = {
            let mut db = self.database.lock().await;
            db.stale_pending_executions(cutoff).await?
        };

        let mut readmitted = 0;
        for execution in stale {
            let task = {
                let mut db = self.database.lock().await;
                db.get_task(&execution.task_id).await?
            };
            let Some(task) = task else {
                warn!(
                    execution_id = %execution.id,
                    task_id = %execution.task_id,
                    "Pending execution's task is gone, failing it"
                );
                self.engine
                    .fail_execution(&execution.id, "task was deleted before the execution started")
                    .await;
                continue;
            };

            info!(
                execution_id = %execution.id,
                task_id = %task.id,
                "Re-admitting stale pending execution"
            );
            let admission = Admission {
                execution_id: execution.id.clone(),
                task_id: task.id.clone(),
                snapshot: TaskSnapshot::from_task(&task),
            };
            if self.admissions.send(admission).await.is_ok() {
                readmitted += 1;
            }
        }
        Ok(readmitted)
    }
}

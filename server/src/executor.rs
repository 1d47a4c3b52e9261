//! Execution engine: drives a pending execution to a live container
//!
//! Admissions arrive over a bounded channel from the control API and the
//! scheduler; each one is served by its own spawned task so a slow container
//! start never blocks the worker loop. The engine owns the start/stop state
//! machine; terminal resolution of running containers belongs to the
//! reconciler and the completion callback.

use crate::cache::{self, Cache};
use crate::database::db_execution::ContainerInfo;
use crate::database::ServerDatabase;
use crate::host::{HostDriver, StartSpec};
use crate::ports::PortAllocator;
use anyhow::{Context, Result};
use rand::Rng;
use shared::config::ServerConfig;
use shared::model::{ExecutionRecord, ExecutionStatus, TaskSnapshot, TaskType};
use shared::utils::{container_name_for, current_timestamp};
use shared::OrchestratorError;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Fixed path of the config file inside the worker container
const CONTAINER_CONFIG_PATH: &str = "/app/config.json";

/// Message admitting one pending execution to the engine
///
/// The snapshot is frozen at admission time; later task edits do not affect
/// an in-flight run.
#[derive(Debug, Clone)]
pub struct Admission {
    pub execution_id: String,
    pub task_id: String,
    pub snapshot: TaskSnapshot,
}

/// Result of a stop request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopResult {
    /// The execution was cancelled by this call
    Cancelled,
    /// The execution was already terminal; nothing changed
    Noop,
}

/// Shared engine handle, cheap to clone
#[derive(Clone)]
pub struct ExecutionEngine {
    config: Arc<ServerConfig>,
    database: Arc<Mutex<ServerDatabase>>,
    cache: Cache,
    host: Arc<dyn HostDriver>,
    ports: Arc<PortAllocator>,
}

impl ExecutionEngine {
    pub fn new(
        config: Arc<ServerConfig>,
        database: Arc<Mutex<ServerDatabase>>,
        cache: Cache,
        host: Arc<dyn HostDriver>,
        ports: Arc<PortAllocator>,
    ) -> Self {
        Self {
            config,
            database,
            cache,
            host,
            ports,
        }
    }

    /// Spawn the admission worker draining the channel until shutdown
    pub fn spawn_worker(
        &self,
        mut admissions: mpsc::Receiver<Admission>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    admission = admissions.recv() => {
                        match admission {
                            Some(admission) => {
                                let engine = engine.clone();
                                tokio::spawn(async move {
                                    engine.start(admission).await;
                                });
                            }
                            None => break,
                        }
                    }
                    _ = shutdown.recv() => {
                        info!("Execution engine received shutdown signal");
                        break;
                    }
                }
            }
        })
    }

    /// Bring a pending execution to `running` with a live container, or to
    /// `failed` deterministically
    pub async fn start(&self, admission: Admission) {
        let Admission {
            execution_id,
            task_id,
            snapshot,
        } = admission;

        // Optimistic CAS pending -> running. A second admission for the
        // same execution (lost-message repair) loses the race here and
        // returns quietly.
        let started = {
            let mut db = self.database.lock().await;
            db.mark_execution_running(&execution_id, current_timestamp())
                .await
        };
        match started {
            Ok(true) => {}
            Ok(false) => {
                debug!(
                    execution_id = %execution_id,
                    "Execution is not pending anymore, skipping start"
                );
                return;
            }
            Err(e) => {
                error!(execution_id = %execution_id, error = %e, "Failed to mark execution running");
                return;
            }
        }

        info!(
            execution_id = %execution_id,
            task_id = %task_id,
            task_type = snapshot.task_type.as_str(),
            "Starting execution"
        );

        match self.launch(&execution_id, &snapshot).await {
            Ok(()) => {
                info!(execution_id = %execution_id, "Container started, waiting for callbacks");
            }
            Err(reason) => {
                warn!(execution_id = %execution_id, reason = %reason, "Execution start failed");
                self.fail_execution(&execution_id, &reason).await;
            }
        }
    }

    /// The fallible part of `start`; any error becomes the terminal failure
    /// reason
    async fn launch(
        &self,
        execution_id: &str,
        snapshot: &TaskSnapshot,
    ) -> std::result::Result<(), String> {
        // Validation failures hold no resources yet.
        snapshot
            .validate()
            .map_err(|reason| format!("Task config validation failed: {}", reason))?;

        let local_path = self
            .write_local_config(execution_id, snapshot)
            .await
            .map_err(|e| format!("Failed to write config file: {:#}", e))?;

        let staged_path = match self.host.stage_config(&local_path, execution_id).await {
            Ok(path) => path,
            Err(e) => {
                let _ = self.host.purge_config(execution_id).await;
                return Err(format!("Failed to stage config: {}", e));
            }
        };

        let container_name = container_name_for(execution_id);
        let image = self.config.image_for(snapshot.task_type).to_string();

        let attempts = self.config.port_allocate_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 0..attempts {
            if attempt > 0 {
                // Small randomised backoff spreads out concurrent starts
                // racing for the same ports.
                let delay: u64 = rand::rng().random_range(100..=500);
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }

            let host_port = match self.ports.allocate().await {
                Ok(port) => port,
                Err(e) => {
                    last_error = format!("port exhaustion: {}", e);
                    warn!(execution_id, attempt, "Port allocation failed, retrying");
                    continue;
                }
            };

            let spec = self.start_spec(execution_id, snapshot, &container_name, &image, &staged_path, host_port);

            // A container with our name is a leftover from an earlier
            // attempt; force-remove it before starting.
            if let Err(e) = self.host.remove_container(&container_name, true).await {
                debug!(container_name = %container_name, error = %e, "Pre-start container removal failed");
            }

            match self.host.start_container(&spec).await {
                Ok(container_id) => {
                    let info = ContainerInfo {
                        container_name: container_name.clone(),
                        container_id: container_id.clone(),
                        config_path: staged_path.clone(),
                        host_port,
                        host_command: self.host.command_line(&spec),
                    };
                    let mut db = self.database.lock().await;
                    if let Err(e) = db.set_execution_container_info(execution_id, &info).await {
                        // The container is up; losing its coordinates would
                        // orphan it, so surface this as a start failure.
                        drop(db);
                        let _ = self.host.stop_container(&container_name).await;
                        let _ = self.host.remove_container(&container_name, true).await;
                        self.ports.release(host_port);
                        let _ = self.host.purge_config(execution_id).await;
                        return Err(format!("Failed to persist container info: {:#}", e));
                    }
                    info!(
                        execution_id,
                        container_id = %container_id,
                        host_port,
                        "Container started"
                    );
                    return Ok(());
                }
                Err(e) => {
                    let message = e.to_string();
                    self.ports.release(host_port);
                    let lowered = message.to_lowercase();
                    if lowered.contains("port is already allocated")
                        || lowered.contains("address already in use")
                    {
                        // The port got taken between probe and bind; try a
                        // fresh one.
                        warn!(execution_id, host_port, "Port was taken before bind, retrying");
                        last_error = message;
                        continue;
                    }
                    let _ = self.host.remove_container(&container_name, true).await;
                    let _ = self.host.purge_config(execution_id).await;
                    return Err(format!("Container start failed: {}", message));
                }
            }
        }

        let _ = self.host.purge_config(execution_id).await;
        Err(format!(
            "Container start failed after {} attempts: {}",
            attempts, last_error
        ))
    }

    /// Stop an execution; idempotent and callable by users or the
    /// reconciler
    pub async fn stop(&self, execution_id: &str) -> Result<StopResult, OrchestratorError> {
        let execution = {
            let mut db = self.database.lock().await;
            db.get_execution(execution_id)
                .await
                .map_err(|e| OrchestratorError::Transient(format!("{:#}", e)))?
        };
        let Some(execution) = execution else {
            return Err(OrchestratorError::NotFound(format!(
                "Execution not found: {}",
                execution_id
            )));
        };

        if execution.status.is_terminal() {
            return Ok(StopResult::Noop);
        }

        // The host stop request is sent before the status flips; a
        // non-removable container is logged but does not block the
        // transition.
        if let Some(target) = execution
            .container_id
            .as_deref()
            .or(execution.container_name.as_deref())
        {
            if let Err(e) = self.host.stop_container(target).await {
                warn!(execution_id, target, error = %e, "Container stop failed during cancel");
            }
        }

        let cancelled = {
            let mut db = self.database.lock().await;
            db.finish_execution(
                execution_id,
                ExecutionStatus::Cancelled,
                current_timestamp(),
                None,
                None,
            )
            .await
            .map_err(|e| OrchestratorError::Transient(format!("{:#}", e)))?
        };

        if !cancelled {
            // Lost the race against a completion callback or the
            // reconciler; the row is terminal either way.
            return Ok(StopResult::Noop);
        }

        self.release_resources(&execution).await;
        info!(execution_id, "Execution cancelled");
        Ok(StopResult::Cancelled)
    }

    /// Record a terminal failure with a reason, guarded by terminal
    /// monotonicity
    pub async fn fail_execution(&self, execution_id: &str, reason: &str) {
        let finished = {
            let mut db = self.database.lock().await;
            db.finish_execution(
                execution_id,
                ExecutionStatus::Failed,
                current_timestamp(),
                None,
                Some(reason),
            )
            .await
        };
        match finished {
            Ok(true) => {}
            Ok(false) => {
                // The guarded write refused to touch a terminal row; this
                // path only fires on a bug or a lost race, never silently.
                error!(
                    execution_id,
                    reason, "Refusing to overwrite terminal execution status"
                );
            }
            Err(e) => {
                error!(execution_id, error = %e, "Failed to record execution failure");
            }
        }
    }

    /// Release everything an execution owned: its port, staged config, and
    /// cache keys. Optionally stops the container first.
    pub async fn release_resources(&self, execution: &ExecutionRecord) {
        if let Some(port) = execution.host_port {
            self.ports.release(port);
        }
        if let Err(e) = self.host.purge_config(&execution.id).await {
            debug!(execution_id = %execution.id, error = %e, "Config purge failed");
        }
        let _ = self.cache.delete(&cache::hb_key(&execution.id)).await;
        let _ = self.cache.delete(&cache::timeout_key(&execution.id)).await;
    }

    /// Best-effort container stop plus resource release, used after any
    /// terminal transition
    pub async fn finalize_terminal(&self, execution: &ExecutionRecord) {
        if let Some(target) = execution
            .container_id
            .as_deref()
            .or(execution.container_name.as_deref())
        {
            if let Err(e) = self.host.stop_container(target).await {
                debug!(execution_id = %execution.id, target, error = %e, "Post-terminal container stop failed");
            }
        }
        self.release_resources(execution).await;
    }

    /// Fetch the trailing container log of an execution, for diagnostics
    pub async fn container_logs(
        &self,
        execution_id: &str,
        tail: u32,
    ) -> Result<String, OrchestratorError> {
        let execution = {
            let mut db = self.database.lock().await;
            db.get_execution(execution_id)
                .await
                .map_err(|e| OrchestratorError::Transient(format!("{:#}", e)))?
        };
        let Some(execution) = execution else {
            return Err(OrchestratorError::NotFound(format!(
                "Execution not found: {}",
                execution_id
            )));
        };
        let Some(container_id) = execution.container_id else {
            return Err(OrchestratorError::NotFound(format!(
                "Execution has no container yet: {}",
                execution_id
            )));
        };
        self.host
            .logs(&container_id, tail)
            .await
            .map_err(|e| OrchestratorError::Container(e.to_string()))
    }

    /// Write the frozen snapshot to the local staging directory
    async fn write_local_config(
        &self,
        execution_id: &str,
        snapshot: &TaskSnapshot,
    ) -> Result<PathBuf> {
        let dir = PathBuf::from(&self.config.config_staging_dir).join(execution_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;
        let path = dir.join("config.json");
        let payload = serde_json::to_vec_pretty(snapshot)?;
        tokio::fs::write(&path, payload)
            .await
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(path)
    }

    fn start_spec(
        &self,
        execution_id: &str,
        snapshot: &TaskSnapshot,
        container_name: &str,
        image: &str,
        config_path: &str,
        host_port: u16,
    ) -> StartSpec {
        let mut extra_binds = Vec::new();
        if snapshot.task_type == TaskType::DbExtract {
            extra_binds.push((
                self.config.db_backup_dir.clone(),
                "/app/backups".to_string(),
            ));
        }

        StartSpec {
            image: image.to_string(),
            name: container_name.to_string(),
            config_bind: (config_path.to_string(), CONTAINER_CONFIG_PATH.to_string()),
            extra_binds,
            env: vec![
                ("TASK_EXECUTION_ID".to_string(), execution_id.to_string()),
                ("CONFIG_PATH".to_string(), CONTAINER_CONFIG_PATH.to_string()),
                (
                    "API_BASE_URL".to_string(),
                    self.config.callback_base_url.clone(),
                ),
            ],
            port_map: (host_port, self.config.container_port),
            auto_remove: self.config.auto_remove_containers,
        }
    }
}

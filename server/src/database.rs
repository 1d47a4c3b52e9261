//! Database management for the orchestrator control plane
//!
//! This module handles SQLite operations for tasks, schedules, executions,
//! and the RBAC policy rows the core consults. SQLite keeps the control
//! plane self-contained; the store is the single source of truth, and every
//! execution status write goes through a guarded update that only moves
//! non-terminal rows.

// Entity-specific database modules
pub mod db_execution;
pub mod db_policy;
pub mod db_schedule;
pub mod db_task;

use anyhow::{Context, Result};
use rusqlite::Connection;
use shared::model::{
    ExecutionRecord, ExecutionStatus, ScheduleRecord, TaskRecord, TaskStatus,
};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// The default name of the orchestrator's database file.
const DATABASE_FILE: &str = "orchestrator.db";

/// Manages the SQLite database for the control plane.
/// This struct encapsulates the database connection and all related
/// operations, providing a high-level API to the rest of the server.
pub struct ServerDatabase {
    /// The path to the SQLite database file.
    db_path: PathBuf,
    /// The active database connection, opened lazily.
    connection: Option<Connection>,
}

impl ServerDatabase {
    /// Creates a new `ServerDatabase` manager.
    /// It ensures that the directory for the database file exists.
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        if !data_dir.exists() {
            std::fs::create_dir_all(data_dir).with_context(|| {
                format!("Failed to create data directory: {}", data_dir.display())
            })?;
        }

        Ok(Self {
            db_path: data_dir.join(DATABASE_FILE),
            connection: None,
        })
    }

    /// Initializes the database by creating tables and indexes if they don't
    /// exist. Idempotent and safe to call on every server startup.
    pub async fn initialize(&mut self) -> Result<()> {
        info!("Initializing orchestrator database at {}", self.db_path.display());

        let conn = self.get_connection()?;

        db_task::create_table(conn)?;
        db_schedule::create_table(conn)?;
        db_execution::create_table(conn)?;
        db_policy::create_table(conn)?;
        db_policy::seed_default_policies(conn)?;

        info!("Orchestrator database initialization complete");
        Ok(())
    }

    /// Lazily gets a mutable reference to the database connection, creating
    /// it if needed.
    pub fn get_connection(&mut self) -> Result<&mut Connection> {
        if self.connection.is_none() {
            let conn = Connection::open(&self.db_path)
                .with_context(|| format!("Failed to open database: {}", self.db_path.display()))?;

            // WAL mode is good for concurrency.
            conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))
                .context("Failed to enable WAL mode")?;

            conn.query_row("PRAGMA wal_autocheckpoint=1000", [], |_| Ok(()))
                .context("Failed to set WAL auto-checkpoint")?;

            conn.execute("PRAGMA foreign_keys=ON", [])
                .context("Failed to enable foreign key constraints")?;

            conn.busy_timeout(std::time::Duration::from_secs(30))
                .context("Failed to set busy timeout")?;

            self.connection = Some(conn);
        }
        Ok(self
            .connection
            .as_mut()
            .expect("Database connection should exist after initialization in get_connection()"))
    }

    /// Runs a WAL checkpoint, returning the number of checkpointed frames.
    pub async fn checkpoint_wal(&mut self) -> Result<i64> {
        let conn = self.get_connection()?;
        let (_busy, _log, checkpointed): (i64, i64, i64) = conn
            .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })
            .context("WAL checkpoint failed")?;
        Ok(checkpointed)
    }

    /// Closes the database connection.
    pub async fn close(&mut self) {
        if let Some(conn) = self.connection.take() {
            if let Err((_conn, e)) = conn.close() {
                debug!("Error closing database connection: {}", e);
            }
        }
    }

    // ----- task operations -----

    pub async fn create_task(&mut self, task: &TaskRecord) -> Result<()> {
        db_task::insert_task(self.get_connection()?, task)
    }

    pub async fn get_task(&mut self, task_id: &str) -> Result<Option<TaskRecord>> {
        db_task::get_task(self.get_connection()?, task_id)
    }

    pub async fn get_task_by_name(&mut self, task_name: &str) -> Result<Option<TaskRecord>> {
        db_task::get_task_by_name(self.get_connection()?, task_name)
    }

    pub async fn update_task(&mut self, task: &TaskRecord) -> Result<()> {
        db_task::update_task(self.get_connection()?, task)
    }

    pub async fn set_task_status(&mut self, task_id: &str, status: TaskStatus) -> Result<()> {
        db_task::set_task_status(self.get_connection()?, task_id, status)
    }

    /// Soft-deletes a task and cascades to its schedules, atomically.
    pub async fn delete_task_cascade(&mut self, task_id: &str) -> Result<()> {
        let conn = self.get_connection()?;
        let tx = conn.transaction()?;
        db_task::soft_delete_task(&tx, task_id)?;
        db_schedule::soft_delete_schedules_for_task(&tx, task_id)?;
        tx.commit().context("Failed to commit task delete")?;
        Ok(())
    }

    // ----- schedule operations -----

    pub async fn insert_schedule(&mut self, schedule: &ScheduleRecord) -> Result<()> {
        db_schedule::insert_schedule(self.get_connection()?, schedule)
    }

    pub async fn get_schedule(&mut self, schedule_id: &str) -> Result<Option<ScheduleRecord>> {
        db_schedule::get_schedule(self.get_connection()?, schedule_id)
    }

    pub async fn schedule_for_task(&mut self, task_id: &str) -> Result<Option<ScheduleRecord>> {
        db_schedule::schedule_for_task(self.get_connection()?, task_id)
    }

    pub async fn due_schedules(&mut self, now: i64, limit: u32) -> Result<Vec<ScheduleRecord>> {
        db_schedule::due_schedules(self.get_connection()?, now, limit)
    }

    pub async fn set_schedule_active(
        &mut self,
        schedule_id: &str,
        is_active: bool,
        next_run_time: Option<i64>,
    ) -> Result<()> {
        db_schedule::set_schedule_active(self.get_connection()?, schedule_id, is_active, next_run_time)
    }

    pub async fn soft_delete_schedule(&mut self, schedule_id: &str) -> Result<()> {
        db_schedule::soft_delete_schedule(self.get_connection()?, schedule_id)
    }

    // ----- execution operations -----

    pub async fn insert_execution(&mut self, execution: &ExecutionRecord) -> Result<()> {
        db_execution::insert_execution(self.get_connection()?, execution)
    }

    pub async fn get_execution(&mut self, execution_id: &str) -> Result<Option<ExecutionRecord>> {
        db_execution::get_execution(self.get_connection()?, execution_id)
    }

    pub async fn running_executions(&mut self) -> Result<Vec<ExecutionRecord>> {
        db_execution::executions_with_status(self.get_connection()?, ExecutionStatus::Running)
    }

    pub async fn stale_pending_executions(&mut self, created_before: i64) -> Result<Vec<ExecutionRecord>> {
        db_execution::stale_pending_executions(self.get_connection()?, created_before)
    }

    pub async fn non_terminal_execution_for_task(
        &mut self,
        task_id: &str,
    ) -> Result<Option<ExecutionRecord>> {
        db_execution::non_terminal_execution_for_task(self.get_connection()?, task_id)
    }

    pub async fn running_execution_for_task(
        &mut self,
        task_id: &str,
    ) -> Result<Option<ExecutionRecord>> {
        db_execution::running_execution_for_task(self.get_connection()?, task_id)
    }

    pub async fn recent_executions(
        &mut self,
        task_id: &str,
        limit: u32,
    ) -> Result<Vec<ExecutionRecord>> {
        db_execution::recent_executions(self.get_connection()?, task_id, limit)
    }

    pub async fn list_executions_for_task(
        &mut self,
        task_id: &str,
        page: u32,
        page_size: u32,
    ) -> Result<(Vec<ExecutionRecord>, u32)> {
        db_execution::list_executions_for_task(self.get_connection()?, task_id, page, page_size)
    }

    /// Marks a pending execution as running. Returns false when the row was
    /// not in `pending` (already started, cancelled, or gone).
    pub async fn mark_execution_running(&mut self, execution_id: &str, start_time: i64) -> Result<bool> {
        db_execution::mark_running(self.get_connection()?, execution_id, start_time)
    }

    pub async fn set_execution_container_info(
        &mut self,
        execution_id: &str,
        info: &db_execution::ContainerInfo,
    ) -> Result<()> {
        db_execution::set_container_info(self.get_connection()?, execution_id, info)
    }

    /// Writes a terminal status. The update is guarded by the
    /// terminal-monotonicity predicate: only `pending` or `running` rows
    /// move, so a second completion is a no-op and returns false.
    pub async fn finish_execution(
        &mut self,
        execution_id: &str,
        status: ExecutionStatus,
        end_time: i64,
        result_data: Option<&serde_json::Value>,
        error_log: Option<&str>,
    ) -> Result<bool> {
        db_execution::finish_execution(
            self.get_connection()?,
            execution_id,
            status,
            end_time,
            result_data,
            error_log,
        )
    }

    pub async fn update_execution_heartbeat(
        &mut self,
        execution_id: &str,
        heartbeat_time: i64,
    ) -> Result<()> {
        db_execution::update_heartbeat(self.get_connection()?, execution_id, heartbeat_time)
    }

    pub async fn execution_statistics(
        &mut self,
        since: i64,
    ) -> Result<db_execution::ExecutionCounts> {
        db_execution::count_since(self.get_connection()?, since)
    }

    /// Soft-deletes terminal executions created before the cutoff. Returns
    /// the number of rows affected.
    pub async fn cleanup_old_executions(&mut self, created_before: i64) -> Result<usize> {
        db_execution::cleanup_old_executions(self.get_connection()?, created_before)
    }

    // ----- policy operations -----

    pub async fn policy_allows(&mut self, subject: &str, object: &str, action: &str) -> Result<bool> {
        db_policy::policy_allows(self.get_connection()?, subject, object, action)
    }
}

/// Parse an optional JSON text column.
pub(crate) fn json_col<T: serde::de::DeserializeOwned>(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<T>> {
    let raw: Option<String> = row.get(idx)?;
    match raw {
        None => Ok(None),
        Some(s) => serde_json::from_str(&s).map(Some).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                idx,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        }),
    }
}

/// Parse a TEXT column holding one of the domain enums.
pub(crate) fn enum_col<T>(
    idx: usize,
    raw: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> rusqlite::Result<T> {
    parse(raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unrecognised value '{}'", raw).into(),
        )
    })
}

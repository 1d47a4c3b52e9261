//! Execution table operations
//!
//! Status transitions are linearised here: `mark_running` only moves
//! `pending` rows and `finish_execution` only moves non-terminal rows, so a
//! terminal status can never be rewritten regardless of caller interleaving.

use crate::database::{enum_col, json_col};
use anyhow::{Context, Result};
use rusqlite::{params, Connection, Row};
use shared::model::{ExecutionRecord, ExecutionStatus};
use shared::utils::current_timestamp;

pub fn create_table(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS task_execution (
            id TEXT PRIMARY KEY,
            task_id TEXT NOT NULL,
            executor_id TEXT NOT NULL,
            execution_name TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            start_time INTEGER,
            end_time INTEGER,
            container_name TEXT,
            container_id TEXT,
            config_path TEXT,
            host_port INTEGER,
            host_command TEXT,
            result_data TEXT,
            error_log TEXT,
            last_heartbeat INTEGER,
            is_delete INTEGER NOT NULL DEFAULT 0,
            create_time INTEGER NOT NULL,
            update_time INTEGER NOT NULL
        )
        "#,
        [],
    )
    .context("Failed to create task_execution table")?;

    // Supports the single-concurrency check and per-task listings.
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_execution_task_status
         ON task_execution(task_id, status)",
        [],
    )?;
    // Supports the reconciler's sweep over running executions.
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_execution_status_heartbeat
         ON task_execution(status, last_heartbeat)",
        [],
    )?;

    Ok(())
}

const EXECUTION_COLUMNS: &str =
    "id, task_id, executor_id, execution_name, status, start_time, end_time, \
     container_name, container_id, config_path, host_port, host_command, \
     result_data, error_log, last_heartbeat, create_time, update_time";

fn execution_from_row(row: &Row<'_>) -> rusqlite::Result<ExecutionRecord> {
    let status: String = row.get(4)?;
    let host_port: Option<i64> = row.get(10)?;
    Ok(ExecutionRecord {
        id: row.get(0)?,
        task_id: row.get(1)?,
        executor_id: row.get(2)?,
        execution_name: row.get(3)?,
        status: enum_col(4, &status, ExecutionStatus::parse)?,
        start_time: row.get(5)?,
        end_time: row.get(6)?,
        container_name: row.get(7)?,
        container_id: row.get(8)?,
        config_path: row.get(9)?,
        host_port: host_port.map(|p| p as u16),
        host_command: row.get(11)?,
        result_data: json_col(row, 12)?,
        error_log: row.get(13)?,
        last_heartbeat: row.get(14)?,
        create_time: row.get(15)?,
        update_time: row.get(16)?,
    })
}

pub fn insert_execution(conn: &Connection, execution: &ExecutionRecord) -> Result<()> {
    let result_data = execution
        .result_data
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    conn.execute(
        r#"
        INSERT INTO task_execution (id, task_id, executor_id, execution_name, status,
                                    start_time, end_time, container_name, container_id,
                                    config_path, host_port, host_command, result_data,
                                    error_log, last_heartbeat, create_time, update_time)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
        "#,
        params![
            execution.id,
            execution.task_id,
            execution.executor_id,
            execution.execution_name,
            execution.status.as_str(),
            execution.start_time,
            execution.end_time,
            execution.container_name,
            execution.container_id,
            execution.config_path,
            execution.host_port.map(|p| p as i64),
            execution.host_command,
            result_data,
            execution.error_log,
            execution.last_heartbeat,
            execution.create_time,
            execution.update_time,
        ],
    )
    .with_context(|| format!("Failed to insert execution: {}", execution.id))?;

    Ok(())
}

pub fn get_execution(conn: &Connection, execution_id: &str) -> Result<Option<ExecutionRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM task_execution WHERE id = ?1 AND is_delete = 0",
        EXECUTION_COLUMNS
    ))?;
    let mut rows = stmt.query_map(params![execution_id], execution_from_row)?;
    rows.next().transpose().context("Failed to query execution")
}

pub fn executions_with_status(
    conn: &Connection,
    status: ExecutionStatus,
) -> Result<Vec<ExecutionRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM task_execution
         WHERE status = ?1 AND is_delete = 0
         ORDER BY start_time DESC",
        EXECUTION_COLUMNS
    ))?;
    let rows = stmt.query_map(params![status.as_str()], execution_from_row)?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .context("Failed to query executions by status")
}

/// Pending rows older than the cutoff; their admission message was lost.
pub fn stale_pending_executions(
    conn: &Connection,
    created_before: i64,
) -> Result<Vec<ExecutionRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM task_execution
         WHERE status = 'pending' AND is_delete = 0 AND create_time <= ?1
         ORDER BY create_time ASC",
        EXECUTION_COLUMNS
    ))?;
    let rows = stmt.query_map(params![created_before], execution_from_row)?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .context("Failed to query stale pending executions")
}

/// The execution, if any, currently holding the task's single-concurrency
/// slot.
pub fn non_terminal_execution_for_task(
    conn: &Connection,
    task_id: &str,
) -> Result<Option<ExecutionRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM task_execution
         WHERE task_id = ?1 AND status IN ('pending', 'running') AND is_delete = 0
         LIMIT 1",
        EXECUTION_COLUMNS
    ))?;
    let mut rows = stmt.query_map(params![task_id], execution_from_row)?;
    rows.next()
        .transpose()
        .context("Failed to query non-terminal execution")
}

/// The task's running execution, if any. Pending rows do not count: they
/// have no container yet and are handled by admission, not by stop.
pub fn running_execution_for_task(
    conn: &Connection,
    task_id: &str,
) -> Result<Option<ExecutionRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM task_execution
         WHERE task_id = ?1 AND status = 'running' AND is_delete = 0
         LIMIT 1",
        EXECUTION_COLUMNS
    ))?;
    let mut rows = stmt.query_map(params![task_id], execution_from_row)?;
    rows.next()
        .transpose()
        .context("Failed to query running execution")
}

/// The most recent executions of a task, newest first.
pub fn recent_executions(
    conn: &Connection,
    task_id: &str,
    limit: u32,
) -> Result<Vec<ExecutionRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM task_execution
         WHERE task_id = ?1 AND is_delete = 0
         ORDER BY create_time DESC LIMIT ?2",
        EXECUTION_COLUMNS
    ))?;
    let rows = stmt.query_map(params![task_id, limit], execution_from_row)?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .context("Failed to query recent executions")
}

pub fn list_executions_for_task(
    conn: &Connection,
    task_id: &str,
    page: u32,
    page_size: u32,
) -> Result<(Vec<ExecutionRecord>, u32)> {
    let total: u32 = conn.query_row(
        "SELECT COUNT(*) FROM task_execution WHERE task_id = ?1 AND is_delete = 0",
        params![task_id],
        |row| row.get(0),
    )?;

    let page = page.max(1);
    let page_size = page_size.max(1);
    let offset = (page - 1) * page_size;

    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM task_execution
         WHERE task_id = ?1 AND is_delete = 0
         ORDER BY create_time DESC LIMIT ?2 OFFSET ?3",
        EXECUTION_COLUMNS
    ))?;
    let rows = stmt.query_map(params![task_id, page_size, offset], execution_from_row)?;
    let executions = rows.collect::<rusqlite::Result<Vec<_>>>()?;

    Ok((executions, total))
}

/// CAS `pending` -> `running`, stamping the start time.
pub fn mark_running(conn: &Connection, execution_id: &str, start_time: i64) -> Result<bool> {
    let updated = conn.execute(
        "UPDATE task_execution
         SET status = 'running', start_time = ?1, update_time = ?2
         WHERE id = ?3 AND status = 'pending' AND is_delete = 0",
        params![start_time, current_timestamp(), execution_id],
    )?;
    Ok(updated == 1)
}

/// Container details persisted once the host has started the container.
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub container_name: String,
    pub container_id: String,
    pub config_path: String,
    pub host_port: u16,
    pub host_command: String,
}

pub fn set_container_info(
    conn: &Connection,
    execution_id: &str,
    info: &ContainerInfo,
) -> Result<()> {
    conn.execute(
        "UPDATE task_execution
         SET container_name = ?1, container_id = ?2, config_path = ?3,
             host_port = ?4, host_command = ?5, update_time = ?6
         WHERE id = ?7 AND is_delete = 0",
        params![
            info.container_name,
            info.container_id,
            info.config_path,
            info.host_port as i64,
            info.host_command,
            current_timestamp(),
            execution_id,
        ],
    )
    .with_context(|| format!("Failed to persist container info: {}", execution_id))?;
    Ok(())
}

/// Guarded terminal write: only non-terminal rows move. Returns false when
/// the row was already terminal (or missing), which callers treat as an
/// idempotent no-op.
pub fn finish_execution(
    conn: &Connection,
    execution_id: &str,
    status: ExecutionStatus,
    end_time: i64,
    result_data: Option<&serde_json::Value>,
    error_log: Option<&str>,
) -> Result<bool> {
    debug_assert!(status.is_terminal());
    let result_data = result_data.map(serde_json::to_string).transpose()?;

    let updated = conn.execute(
        "UPDATE task_execution
         SET status = ?1, end_time = ?2,
             result_data = COALESCE(?3, result_data),
             error_log = COALESCE(?4, error_log),
             update_time = ?5
         WHERE id = ?6 AND status IN ('pending', 'running') AND is_delete = 0",
        params![
            status.as_str(),
            end_time,
            result_data,
            error_log,
            current_timestamp(),
            execution_id,
        ],
    )?;
    Ok(updated == 1)
}

/// Last-writer-wins heartbeat stamp; ordering among heartbeats is
/// irrelevant.
pub fn update_heartbeat(conn: &Connection, execution_id: &str, heartbeat_time: i64) -> Result<()> {
    conn.execute(
        "UPDATE task_execution SET last_heartbeat = ?1, update_time = ?2
         WHERE id = ?3 AND is_delete = 0",
        params![heartbeat_time, current_timestamp(), execution_id],
    )
    .with_context(|| format!("Failed to update heartbeat: {}", execution_id))?;
    Ok(())
}

/// Execution counts for the statistics endpoint.
#[derive(Debug, Clone, Default)]
pub struct ExecutionCounts {
    pub total: u32,
    pub success: u32,
    pub failed: u32,
    pub cancelled: u32,
    pub current_running: u32,
}

pub fn count_since(conn: &Connection, since: i64) -> Result<ExecutionCounts> {
    let (total, success, failed, cancelled): (u32, u32, u32, u32) = conn.query_row(
        "SELECT COUNT(*),
                COALESCE(SUM(status = 'success'), 0),
                COALESCE(SUM(status = 'failed'), 0),
                COALESCE(SUM(status = 'cancelled'), 0)
         FROM task_execution
         WHERE create_time >= ?1 AND is_delete = 0",
        params![since],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
    )?;

    let current_running: u32 = conn.query_row(
        "SELECT COUNT(*) FROM task_execution WHERE status = 'running' AND is_delete = 0",
        [],
        |row| row.get(0),
    )?;

    Ok(ExecutionCounts {
        total,
        success,
        failed,
        cancelled,
        current_running,
    })
}

/// Soft-delete terminal executions older than the cutoff.
pub fn cleanup_old_executions(conn: &Connection, created_before: i64) -> Result<usize> {
    let deleted = conn.execute(
        "UPDATE task_execution SET is_delete = 1, update_time = ?1
         WHERE create_time < ?2 AND status IN ('success', 'failed', 'cancelled')
           AND is_delete = 0",
        params![current_timestamp(), created_before],
    )?;
    Ok(deleted)
}

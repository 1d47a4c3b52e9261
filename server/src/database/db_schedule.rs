//! Schedule table operations

use crate::database::enum_col;
use anyhow::{Context, Result};
use rusqlite::{params, Connection, Row};
use shared::model::{ScheduleRecord, ScheduleType};
use shared::utils::current_timestamp;

pub fn create_table(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS task_schedule (
            id TEXT PRIMARY KEY,
            task_id TEXT NOT NULL,
            schedule_type TEXT NOT NULL,
            schedule_config TEXT NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            next_run_time INTEGER,
            is_delete INTEGER NOT NULL DEFAULT 0,
            create_time INTEGER NOT NULL,
            update_time INTEGER NOT NULL
        )
        "#,
        [],
    )
    .context("Failed to create task_schedule table")?;

    // The scheduler scans by (is_active, next_run_time) every tick.
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_schedule_due
         ON task_schedule(is_active, next_run_time)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_schedule_task ON task_schedule(task_id)",
        [],
    )?;

    Ok(())
}

const SCHEDULE_COLUMNS: &str =
    "id, task_id, schedule_type, schedule_config, is_active, next_run_time, \
     create_time, update_time";

fn schedule_from_row(row: &Row<'_>) -> rusqlite::Result<ScheduleRecord> {
    let schedule_type: String = row.get(2)?;
    let config_raw: String = row.get(3)?;
    let schedule_config = serde_json::from_str(&config_raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(ScheduleRecord {
        id: row.get(0)?,
        task_id: row.get(1)?,
        schedule_type: enum_col(2, &schedule_type, ScheduleType::parse)?,
        schedule_config,
        is_active: row.get(4)?,
        next_run_time: row.get(5)?,
        create_time: row.get(6)?,
        update_time: row.get(7)?,
    })
}

pub fn insert_schedule(conn: &Connection, schedule: &ScheduleRecord) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO task_schedule (id, task_id, schedule_type, schedule_config,
                                   is_active, next_run_time, create_time, update_time)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        "#,
        params![
            schedule.id,
            schedule.task_id,
            schedule.schedule_type.as_str(),
            serde_json::to_string(&schedule.schedule_config)?,
            schedule.is_active,
            schedule.next_run_time,
            schedule.create_time,
            schedule.update_time,
        ],
    )
    .with_context(|| format!("Failed to insert schedule for task: {}", schedule.task_id))?;

    Ok(())
}

pub fn get_schedule(conn: &Connection, schedule_id: &str) -> Result<Option<ScheduleRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM task_schedule WHERE id = ?1 AND is_delete = 0",
        SCHEDULE_COLUMNS
    ))?;
    let mut rows = stmt.query_map(params![schedule_id], schedule_from_row)?;
    rows.next().transpose().context("Failed to query schedule")
}

/// The (single) live schedule of a task, active or not.
pub fn schedule_for_task(conn: &Connection, task_id: &str) -> Result<Option<ScheduleRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM task_schedule
         WHERE task_id = ?1 AND is_delete = 0
         ORDER BY create_time DESC LIMIT 1",
        SCHEDULE_COLUMNS
    ))?;
    let mut rows = stmt.query_map(params![task_id], schedule_from_row)?;
    rows.next()
        .transpose()
        .context("Failed to query schedule for task")
}

/// Active schedules whose next fire is due, oldest first, bounded.
pub fn due_schedules(conn: &Connection, now: i64, limit: u32) -> Result<Vec<ScheduleRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM task_schedule
         WHERE is_active = 1 AND is_delete = 0
           AND next_run_time IS NOT NULL AND next_run_time <= ?1
         ORDER BY next_run_time ASC LIMIT ?2",
        SCHEDULE_COLUMNS
    ))?;
    let rows = stmt.query_map(params![now, limit], schedule_from_row)?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .context("Failed to query due schedules")
}

pub fn set_schedule_active(
    conn: &Connection,
    schedule_id: &str,
    is_active: bool,
    next_run_time: Option<i64>,
) -> Result<()> {
    conn.execute(
        "UPDATE task_schedule
         SET is_active = ?1, next_run_time = ?2, update_time = ?3
         WHERE id = ?4 AND is_delete = 0",
        params![is_active, next_run_time, current_timestamp(), schedule_id],
    )
    .with_context(|| format!("Failed to update schedule: {}", schedule_id))?;
    Ok(())
}

/// Replace a schedule's rule in place.
pub fn replace_schedule_config(
    conn: &Connection,
    schedule_id: &str,
    schedule_type: ScheduleType,
    schedule_config: &serde_json::Value,
    is_active: bool,
    next_run_time: Option<i64>,
) -> Result<()> {
    conn.execute(
        "UPDATE task_schedule
         SET schedule_type = ?1, schedule_config = ?2, is_active = ?3,
             next_run_time = ?4, update_time = ?5
         WHERE id = ?6 AND is_delete = 0",
        params![
            schedule_type.as_str(),
            serde_json::to_string(schedule_config)?,
            is_active,
            next_run_time,
            current_timestamp(),
            schedule_id,
        ],
    )
    .with_context(|| format!("Failed to replace schedule config: {}", schedule_id))?;
    Ok(())
}

pub fn soft_delete_schedule(conn: &Connection, schedule_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE task_schedule SET is_delete = 1, is_active = 0, update_time = ?1 WHERE id = ?2",
        params![current_timestamp(), schedule_id],
    )
    .with_context(|| format!("Failed to delete schedule: {}", schedule_id))?;
    Ok(())
}

pub fn soft_delete_schedules_for_task(conn: &Connection, task_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE task_schedule SET is_delete = 1, is_active = 0, update_time = ?1
         WHERE task_id = ?2 AND is_delete = 0",
        params![current_timestamp(), task_id],
    )
    .with_context(|| format!("Failed to delete schedules for task: {}", task_id))?;
    Ok(())
}

//! Task table operations

use crate::database::{enum_col, json_col};
use anyhow::{Context, Result};
use rusqlite::{params, Connection, Row};
use shared::model::{TaskRecord, TaskStatus, TaskType, TriggerMode};
use shared::utils::current_timestamp;

pub fn create_table(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS task (
            id TEXT PRIMARY KEY,
            task_name TEXT NOT NULL,
            task_type TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active',
            trigger_mode TEXT NOT NULL DEFAULT 'manual',
            base_url TEXT,
            base_url_params TEXT,
            need_user_login INTEGER NOT NULL DEFAULT 0,
            extract_config TEXT,
            creator_id TEXT NOT NULL,
            description TEXT,
            is_delete INTEGER NOT NULL DEFAULT 0,
            create_time INTEGER NOT NULL,
            update_time INTEGER NOT NULL
        )
        "#,
        [],
    )
    .context("Failed to create task table")?;

    // Task names are unique among live rows only; soft-deleted rows may
    // leave their name behind for reuse.
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_task_name_live
         ON task(task_name) WHERE is_delete = 0",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_task_creator ON task(creator_id)",
        [],
    )?;

    Ok(())
}

const TASK_COLUMNS: &str = "id, task_name, task_type, status, trigger_mode, base_url, \
     base_url_params, need_user_login, extract_config, creator_id, description, \
     create_time, update_time";

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<TaskRecord> {
    let task_type: String = row.get(2)?;
    let status: String = row.get(3)?;
    let trigger_mode: String = row.get(4)?;
    Ok(TaskRecord {
        id: row.get(0)?,
        task_name: row.get(1)?,
        task_type: enum_col(2, &task_type, TaskType::parse)?,
        status: enum_col(3, &status, TaskStatus::parse)?,
        trigger_mode: enum_col(4, &trigger_mode, TriggerMode::parse)?,
        base_url: row.get(5)?,
        base_url_params: json_col(row, 6)?.unwrap_or_default(),
        need_user_login: row.get(7)?,
        extract_config: json_col(row, 8)?,
        creator_id: row.get(9)?,
        description: row.get(10)?,
        create_time: row.get(11)?,
        update_time: row.get(12)?,
    })
}

pub fn insert_task(conn: &Connection, task: &TaskRecord) -> Result<()> {
    let base_url_params = serde_json::to_string(&task.base_url_params)?;
    let extract_config = task
        .extract_config
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    conn.execute(
        r#"
        INSERT INTO task (id, task_name, task_type, status, trigger_mode, base_url,
                          base_url_params, need_user_login, extract_config, creator_id,
                          description, create_time, update_time)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
        "#,
        params![
            task.id,
            task.task_name,
            task.task_type.as_str(),
            task.status.as_str(),
            task.trigger_mode.as_str(),
            task.base_url,
            base_url_params,
            task.need_user_login,
            extract_config,
            task.creator_id,
            task.description,
            task.create_time,
            task.update_time,
        ],
    )
    .with_context(|| format!("Failed to insert task: {}", task.task_name))?;

    Ok(())
}

pub fn get_task(conn: &Connection, task_id: &str) -> Result<Option<TaskRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM task WHERE id = ?1 AND is_delete = 0",
        TASK_COLUMNS
    ))?;
    let mut rows = stmt.query_map(params![task_id], task_from_row)?;
    rows.next().transpose().context("Failed to query task")
}

pub fn get_task_by_name(conn: &Connection, task_name: &str) -> Result<Option<TaskRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM task WHERE task_name = ?1 AND is_delete = 0",
        TASK_COLUMNS
    ))?;
    let mut rows = stmt.query_map(params![task_name], task_from_row)?;
    rows.next()
        .transpose()
        .context("Failed to query task by name")
}

/// Filter for task listings. `creator_id` restricts the listing to one
/// owner (non-admin callers).
#[derive(Debug, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub name_like: Option<String>,
    pub creator_id: Option<String>,
    pub page: u32,
    pub page_size: u32,
}

pub fn list_tasks(conn: &Connection, filter: &TaskFilter) -> Result<(Vec<TaskRecord>, u32)> {
    let mut clauses = vec!["is_delete = 0".to_string()];
    let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(status) = filter.status {
        args.push(Box::new(status.as_str().to_string()));
        clauses.push(format!("status = ?{}", args.len()));
    }
    if let Some(name) = &filter.name_like {
        args.push(Box::new(format!("%{}%", name)));
        clauses.push(format!("task_name LIKE ?{}", args.len()));
    }
    if let Some(creator) = &filter.creator_id {
        args.push(Box::new(creator.clone()));
        clauses.push(format!("creator_id = ?{}", args.len()));
    }

    let where_clause = clauses.join(" AND ");

    let total: u32 = conn.query_row(
        &format!("SELECT COUNT(*) FROM task WHERE {}", where_clause),
        rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
        |row| row.get(0),
    )?;

    let page = filter.page.max(1);
    let page_size = filter.page_size.max(1);
    let offset = (page - 1) * page_size;

    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM task WHERE {} ORDER BY create_time DESC LIMIT {} OFFSET {}",
        TASK_COLUMNS, where_clause, page_size, offset
    ))?;
    let rows = stmt.query_map(
        rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
        task_from_row,
    )?;
    let tasks = rows.collect::<rusqlite::Result<Vec<_>>>()?;

    Ok((tasks, total))
}

pub fn update_task(conn: &Connection, task: &TaskRecord) -> Result<()> {
    let base_url_params = serde_json::to_string(&task.base_url_params)?;
    let extract_config = task
        .extract_config
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    conn.execute(
        r#"
        UPDATE task
        SET task_name = ?1, task_type = ?2, status = ?3, trigger_mode = ?4,
            base_url = ?5, base_url_params = ?6, need_user_login = ?7,
            extract_config = ?8, description = ?9, update_time = ?10
        WHERE id = ?11 AND is_delete = 0
        "#,
        params![
            task.task_name,
            task.task_type.as_str(),
            task.status.as_str(),
            task.trigger_mode.as_str(),
            task.base_url,
            base_url_params,
            task.need_user_login,
            extract_config,
            task.description,
            current_timestamp(),
            task.id,
        ],
    )
    .with_context(|| format!("Failed to update task: {}", task.id))?;

    Ok(())
}

pub fn set_task_status(conn: &Connection, task_id: &str, status: TaskStatus) -> Result<()> {
    conn.execute(
        "UPDATE task SET status = ?1, update_time = ?2 WHERE id = ?3 AND is_delete = 0",
        params![status.as_str(), current_timestamp(), task_id],
    )
    .with_context(|| format!("Failed to set task status: {}", task_id))?;
    Ok(())
}

pub fn soft_delete_task(conn: &Connection, task_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE task SET is_delete = 1, update_time = ?1 WHERE id = ?2",
        params![current_timestamp(), task_id],
    )
    .with_context(|| format!("Failed to delete task: {}", task_id))?;
    Ok(())
}

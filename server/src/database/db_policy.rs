//! RBAC policy rows consumed by the control API
//!
//! The core does not administer users or roles; it only answers "may
//! subject S perform action A on object O?" against these rows. `*` acts as
//! a wildcard for object and action.

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use tracing::info;

pub fn create_table(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS policy (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            subject TEXT NOT NULL,
            object TEXT NOT NULL,
            action TEXT NOT NULL,
            UNIQUE(subject, object, action)
        )
        "#,
        [],
    )
    .context("Failed to create policy table")?;
    Ok(())
}

/// Default policy set: admins can do everything, users manage tasks and
/// schedules and read monitoring data.
pub fn seed_default_policies(conn: &Connection) -> Result<()> {
    let defaults: &[(&str, &str, &str)] = &[
        ("admin", "*", "*"),
        ("user", "task", "create"),
        ("user", "task", "read"),
        ("user", "task", "update"),
        ("user", "task", "delete"),
        ("user", "task", "execute"),
        ("user", "task", "stop"),
        ("user", "scheduler", "create"),
        ("user", "scheduler", "read"),
        ("user", "scheduler", "update"),
        ("user", "scheduler", "delete"),
        ("user", "monitoring", "read"),
    ];

    let mut inserted = 0;
    for (subject, object, action) in defaults {
        inserted += conn.execute(
            "INSERT OR IGNORE INTO policy (subject, object, action) VALUES (?1, ?2, ?3)",
            params![subject, object, action],
        )?;
    }
    if inserted > 0 {
        info!("Seeded {} default policy rows", inserted);
    }
    Ok(())
}

/// Policy lookup with wildcard support.
pub fn policy_allows(conn: &Connection, subject: &str, object: &str, action: &str) -> Result<bool> {
    let count: u32 = conn.query_row(
        "SELECT COUNT(*) FROM policy
         WHERE subject = ?1
           AND (object = ?2 OR object = '*')
           AND (action = ?3 OR action = '*')",
        params![subject, object, action],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

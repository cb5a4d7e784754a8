//! Sync run log and cursor store.
//!
//! Every pull, push, or process run gets a `sync_log` row so operators can
//! see what the worker last did and why it stopped. `sync_metadata` is a
//! small key/value store holding the sync cursors.

use anyhow::Result;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::db;
use crate::models::SyncLogEntry;

/// On the worker: `updated_at` of the last row applied by a completed
/// pull. On the cloud: when a worker last pulled.
pub const LAST_PULL_TIMESTAMP: &str = "last_pull_timestamp";
/// Worker-side id tiebreak paired with [`LAST_PULL_TIMESTAMP`], so rows
/// sharing that millisecond are not skipped or re-fetched.
pub const LAST_PULL_ID: &str = "last_pull_id";
/// On the worker: `updated_at` high-water mark of the last accepted push
/// batch. On the cloud: when a worker last pushed.
pub const LAST_PUSH_TIMESTAMP: &str = "last_push_timestamp";
/// Worker-side id tiebreak paired with [`LAST_PUSH_TIMESTAMP`].
pub const LAST_PUSH_ID: &str = "last_push_id";
/// Cursor key: wall clock of the last process-queue run.
pub const LAST_PROCESS_TIMESTAMP: &str = "last_process_timestamp";

/// Opens a run. Returns the log row id to complete or fail later.
pub async fn start(pool: &SqlitePool, sync_type: &str) -> Result<String> {
    let id = Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO sync_log (id, sync_type, status, documents_processed, started_at)
         VALUES (?, ?, 'started', 0, ?)",
    )
    .bind(&id)
    .bind(sync_type)
    .bind(db::now_ms())
    .execute(pool)
    .await?;
    Ok(id)
}

pub async fn complete(
    pool: &SqlitePool,
    id: &str,
    documents_processed: i64,
    details: Option<serde_json::Value>,
) -> Result<()> {
    sqlx::query(
        "UPDATE sync_log
         SET status = 'completed', documents_processed = ?, details = ?, completed_at = ?
         WHERE id = ?",
    )
    .bind(documents_processed)
    .bind(details.map(|d| d.to_string()))
    .bind(db::now_ms())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn fail(pool: &SqlitePool, id: &str, error: &str) -> Result<()> {
    sqlx::query(
        "UPDATE sync_log SET status = 'failed', error_message = ?, completed_at = ? WHERE id = ?",
    )
    .bind(error)
    .bind(db::now_ms())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn recent(pool: &SqlitePool, limit: i64) -> Result<Vec<SyncLogEntry>> {
    let rows = sqlx::query(
        "SELECT id, sync_type, status, documents_processed, error_message, details,
                started_at, completed_at
         FROM sync_log ORDER BY started_at DESC LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| SyncLogEntry {
            id: row.get("id"),
            sync_type: row.get("sync_type"),
            status: row.get("status"),
            documents_processed: row.get("documents_processed"),
            error_message: row.get("error_message"),
            details: row.get("details"),
            started_at: row.get("started_at"),
            completed_at: row.get("completed_at"),
        })
        .collect())
}

pub async fn get_metadata(pool: &SqlitePool, key: &str) -> Result<Option<String>> {
    let value: Option<String> = sqlx::query_scalar("SELECT value FROM sync_metadata WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;
    Ok(value)
}

pub async fn set_metadata(pool: &SqlitePool, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO sync_metadata (key, value, updated_at) VALUES (?, ?, ?)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
        "#,
    )
    .bind(key)
    .bind(value)
    .bind(db::now_ms())
    .execute(pool)
    .await?;
    Ok(())
}

/// Reads a millisecond cursor, treating a missing or malformed value as 0
/// (sync from the beginning).
pub async fn get_cursor(pool: &SqlitePool, key: &str) -> Result<i64> {
    let value = get_metadata(pool, key).await?;
    Ok(value.and_then(|s| s.parse::<i64>().ok()).unwrap_or(0))
}

pub async fn set_cursor(pool: &SqlitePool, key: &str, cursor: i64) -> Result<()> {
    set_metadata(pool, key, &cursor.to_string()).await
}

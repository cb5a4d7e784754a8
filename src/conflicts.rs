//! Review queue for sync conflicts.
//!
//! A conflict is recorded when a pushed document carries the same
//! `sync_version` as the stored row but a different payload. The pipeline
//! never merges these automatically; `resil conflicts` lists them for
//! manual review and marks one resolved once someone has reconciled the
//! documents by hand.

use anyhow::Result;

use crate::config::Config;
use crate::db;
use crate::documents;
use crate::migrate;

/// CLI entry point for `resil conflicts`.
///
/// With `resolve` set, marks that conflict reviewed; otherwise lists
/// unresolved conflicts (`include_resolved` adds the reviewed ones).
pub async fn run_conflicts(
    config: &Config,
    resolve: Option<&str>,
    include_resolved: bool,
) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::run_migrations(&pool).await?;

    if let Some(conflict_id) = resolve {
        let resolved = documents::resolve_conflict(&pool, conflict_id).await?;
        if resolved {
            println!("Conflict {} marked resolved.", conflict_id);
        } else {
            println!("No unresolved conflict with id {}.", conflict_id);
        }
        pool.close().await;
        return Ok(());
    }

    let conflicts = documents::list_conflicts(&pool, include_resolved).await?;
    if conflicts.is_empty() {
        println!("No conflicts.");
        pool.close().await;
        return Ok(());
    }

    println!("{} conflict(s):", conflicts.len());
    println!();
    for conflict in &conflicts {
        let state = if conflict.resolved { "resolved" } else { "unresolved" };
        println!(
            "[{}] document {} at sync_version {}",
            state, conflict.document_id, conflict.sync_version
        );
        println!("    detected: {}", format_ts_iso(conflict.detected_at));
        println!("    local:    {}", payload_preview(&conflict.local_payload));
        println!("    remote:   {}", payload_preview(&conflict.remote_payload));
        println!("    id: {}", conflict.id);
        println!();
    }
    println!("Resolve with `resil conflicts --resolve <id>` once reconciled.");

    pool.close().await;
    Ok(())
}

/// One line of payload, truncated; enough to tell the two sides apart.
fn payload_preview(payload: &str) -> String {
    let flat = payload.replace('\n', " ");
    let flat = flat.trim();
    if flat.chars().count() > 120 {
        let head: String = flat.chars().take(120).collect();
        format!("{}...", head)
    } else {
        flat.to_string()
    }
}

fn format_ts_iso(ts_ms: i64) -> String {
    chrono::DateTime::from_timestamp(ts_ms / 1000, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ts_ms.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_flattens_and_truncates() {
        assert_eq!(payload_preview("short\npayload"), "short payload");

        let long = "x".repeat(200);
        let preview = payload_preview(&long);
        assert_eq!(preview.chars().count(), 123);
        assert!(preview.ends_with("..."));
    }

    #[test]
    fn detected_at_renders_as_iso_from_millis() {
        assert_eq!(format_ts_iso(1_700_000_000_000), "2023-11-14T22:13:20Z");
    }
}

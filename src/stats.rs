//! Processing and sync statistics.
//!
//! One-screen overview for operators: document counts by status, the
//! full-processing queue, stuck claims, unresolved sync conflicts, the
//! knowledge-graph totals, and the most recent sync runs. Stuck documents
//! are only ever reported here; nothing recovers them automatically.

use anyhow::Result;

use crate::config::Config;
use crate::db;
use crate::documents;
use crate::kg_query;
use crate::migrate;
use crate::sync_log;

pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::run_migrations(&pool).await?;

    let stuck_after = config.sync.stuck_after_secs.max(0) as u64;
    let stats = documents::processing_stats(&pool, stuck_after).await?;
    let kg = kg_query::statistics(&pool).await?;

    let unresolved_conflicts: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM sync_conflicts WHERE resolved = 0")
            .fetch_one(&pool)
            .await?;
    let failed_extractions: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE kg_extraction_status = 'failed'")
            .fetch_one(&pool)
            .await?;

    let db_size = std::fs::metadata(&config.storage.db_path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Resilience Pipeline — Stats");
    println!("===========================");
    println!();
    println!("  Database:    {}", config.storage.db_path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!("  Mode:        {}", config.deployment.mode);
    println!();
    println!("  Documents:   {}", stats.total);

    if !stats.by_status.is_empty() {
        println!();
        println!("  {:<24} {:>6}", "STATUS", "DOCS");
        println!("  {}", "-".repeat(32));
        for (status, count) in &stats.by_status {
            println!("  {:<24} {:>6}", status, count);
        }
    }

    println!();
    println!("  Awaiting full processing: {}", stats.needs_full_processing);
    if stats.stuck_processing > 0 {
        println!(
            "  Stuck in processing:      {} (claimed over {}s ago; review manually)",
            stats.stuck_processing, stuck_after
        );
    }
    if unresolved_conflicts > 0 {
        println!(
            "  Unresolved conflicts:     {} (see `resil conflicts`)",
            unresolved_conflicts
        );
    }

    println!();
    println!("  Knowledge graph:");
    println!(
        "    Entities:      {} (avg confidence {:.2})",
        kg.total_entities, kg.avg_confidence
    );
    println!("    Relationships: {}", kg.total_relationships);
    if failed_extractions > 0 {
        println!("    Failed extractions: {}", failed_extractions);
    }
    if !kg.entity_counts.is_empty() {
        println!();
        println!("    {:<16} {:>6}", "ENTITY TYPE", "COUNT");
        println!("    {}", "-".repeat(24));
        for (entity_type, count) in &kg.entity_counts {
            println!("    {:<16} {:>6}", entity_type, count);
        }
    }

    let last_process = sync_log::get_metadata(&pool, sync_log::LAST_PROCESS_TIMESTAMP).await?;
    let last_pull = sync_log::get_metadata(&pool, sync_log::LAST_PULL_TIMESTAMP).await?;
    let last_push = sync_log::get_metadata(&pool, sync_log::LAST_PUSH_TIMESTAMP).await?;
    let recent = sync_log::recent(&pool, 5).await?;

    if last_process.is_some() || last_pull.is_some() || last_push.is_some() || !recent.is_empty() {
        println!();
        println!("  Sync:");
        println!("    Last process: {}", cursor_display(last_process));
        println!("    Last pull:    {}", cursor_display(last_pull));
        println!("    Last push:    {}", cursor_display(last_push));

        if !recent.is_empty() {
            println!();
            println!("    {:<10} {:<10} {:>6}   {}", "TYPE", "STATUS", "DOCS", "WHEN");
            println!("    {}", "-".repeat(48));
            for entry in &recent {
                println!(
                    "    {:<10} {:<10} {:>6}   {}",
                    entry.sync_type,
                    entry.status,
                    entry.documents_processed,
                    format_ts_relative(entry.started_at)
                );
            }
        }
    }

    println!();

    pool.close().await;
    Ok(())
}

fn cursor_display(value: Option<String>) -> String {
    value
        .and_then(|v| v.parse::<i64>().ok())
        .map(format_ts_relative)
        .unwrap_or_else(|| "never".to_string())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a unix-millisecond timestamp as a relative time ("3 hours ago").
fn format_ts_relative(ts_ms: i64) -> String {
    let ts = ts_ms / 1000;
    let now = chrono::Utc::now().timestamp();
    let delta = now - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_scale_through_units() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn relative_times_derive_from_millis() {
        let now_ms = chrono::Utc::now().timestamp_millis();
        assert_eq!(format_ts_relative(now_ms), "just now");
        assert_eq!(format_ts_relative(now_ms - 5 * 60 * 1000), "5 mins ago");
        assert_eq!(format_ts_relative(now_ms - 2 * 3600 * 1000), "2 hours ago");
        assert_eq!(format_ts_relative(now_ms - 3 * 86400 * 1000), "3 days ago");
    }
}

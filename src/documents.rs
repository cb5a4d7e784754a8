//! Document store operations.
//!
//! All reads and writes against the `documents` table live here, along with
//! the sync comparator (`apply_remote`) and its conflict bookkeeping. The
//! processing state machine is enforced at this layer: claims are guarded
//! UPDATEs, and a completed document always carries non-empty content.

use anyhow::{bail, Result};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::db;
use crate::models::{
    Document, ProcessedDocument, ProcessedPayload, ProcessingStats, ProcessingStatus, SyncConflict,
    SyncDocument,
};

const DOCUMENT_COLUMNS: &str = "id, title, description, tags, location, hazard_type, source, \
     content, processing_status, needs_full_processing, processing_mode, raw_file_path, \
     metadata, sections, kg_extraction_status, sync_version, created_at, updated_at, processed_at";

const SYNC_COLUMNS: &str = "id, title, description, tags, location, hazard_type, source, \
     processing_status, needs_full_processing, sync_version, created_at, updated_at";

/// Fields supplied at upload/ingest time. Everything else starts at its
/// state-machine default.
#[derive(Debug, Clone, Default)]
pub struct NewDocument {
    pub title: Option<String>,
    pub description: Option<String>,
    pub tags: Option<String>,
    pub location: Option<String>,
    pub hazard_type: Option<String>,
    pub source: Option<String>,
    pub raw_file_path: Option<String>,
}

/// What `apply_remote` did with an incoming sync payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Inserted, or replaced with the newer payload.
    Applied,
    /// Identical to or older than what we already hold.
    Skipped,
    /// Same `sync_version` with a differing payload; recorded for review.
    Conflict,
}

fn document_from_row(row: &sqlx::sqlite::SqliteRow) -> Document {
    let status: String = row.get("processing_status");
    Document {
        id: row.get("id"),
        title: row.get("title"),
        description: row.get("description"),
        tags: row.get("tags"),
        location: row.get("location"),
        hazard_type: row.get("hazard_type"),
        source: row.get("source"),
        content: row.get("content"),
        processing_status: ProcessingStatus::parse(&status).unwrap_or(ProcessingStatus::Pending),
        needs_full_processing: row.get::<i64, _>("needs_full_processing") != 0,
        processing_mode: row.get("processing_mode"),
        raw_file_path: row.get("raw_file_path"),
        metadata: row.get("metadata"),
        sections: row.get("sections"),
        kg_extraction_status: row.get("kg_extraction_status"),
        sync_version: row.get("sync_version"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        processed_at: row.get("processed_at"),
    }
}

fn sync_document_from_row(row: &sqlx::sqlite::SqliteRow) -> SyncDocument {
    let status: String = row.get("processing_status");
    SyncDocument {
        id: row.get("id"),
        title: row.get("title"),
        description: row.get("description"),
        tags: row.get("tags"),
        location: row.get("location"),
        hazard_type: row.get("hazard_type"),
        source: row.get("source"),
        processing_status: ProcessingStatus::parse(&status).unwrap_or(ProcessingStatus::Pending),
        needs_full_processing: row.get::<i64, _>("needs_full_processing") != 0,
        sync_version: row.get("sync_version"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

pub async fn insert_document(pool: &SqlitePool, new: NewDocument) -> Result<Document> {
    let id = Uuid::new_v4().to_string();
    let now = db::now_ms();

    sqlx::query(
        r#"
        INSERT INTO documents (id, title, description, tags, location, hazard_type, source,
            processing_status, needs_full_processing, processing_mode, raw_file_path,
            kg_extraction_status, sync_version, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, 'pending', 0, 'pending', ?, 'pending', ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(&new.title)
    .bind(&new.description)
    .bind(&new.tags)
    .bind(&new.location)
    .bind(&new.hazard_type)
    .bind(&new.source)
    .bind(&new.raw_file_path)
    .bind(now)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(Document {
        id,
        title: new.title,
        description: new.description,
        tags: new.tags,
        location: new.location,
        hazard_type: new.hazard_type,
        source: new.source,
        content: None,
        processing_status: ProcessingStatus::Pending,
        needs_full_processing: false,
        processing_mode: "pending".to_string(),
        raw_file_path: new.raw_file_path,
        metadata: None,
        sections: None,
        kg_extraction_status: "pending".to_string(),
        sync_version: now,
        created_at: now,
        updated_at: now,
        processed_at: None,
    })
}

pub async fn get_document(pool: &SqlitePool, id: &str) -> Result<Option<Document>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM documents WHERE id = ?",
        DOCUMENT_COLUMNS
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(row.as_ref().map(document_from_row))
}

pub async fn list_documents(
    pool: &SqlitePool,
    status: Option<&str>,
    limit: i64,
) -> Result<Vec<Document>> {
    let rows = match status {
        Some(status) => {
            sqlx::query(&format!(
                "SELECT {} FROM documents WHERE processing_status = ? ORDER BY updated_at DESC LIMIT ?",
                DOCUMENT_COLUMNS
            ))
            .bind(status)
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query(&format!(
                "SELECT {} FROM documents ORDER BY updated_at DESC LIMIT ?",
                DOCUMENT_COLUMNS
            ))
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
    };

    Ok(rows.iter().map(document_from_row).collect())
}

/// The full-processing queue: parked documents, oldest first.
pub async fn unprocessed_documents(pool: &SqlitePool, limit: i64) -> Result<Vec<Document>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM documents
         WHERE needs_full_processing = 1
           AND processing_status IN ('pending', 'needs_local')
         ORDER BY created_at ASC
         LIMIT ?",
        DOCUMENT_COLUMNS
    ))
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows.iter().map(document_from_row).collect())
}

/// Guarded claim. Returns `false` when the document is missing or some other
/// worker already holds it; the caller must not process in that case.
///
/// A claim that never completes leaves the row in `processing` on purpose.
/// It shows up in the stats as stuck and waits for an operator.
pub async fn mark_processing(pool: &SqlitePool, id: &str) -> Result<bool> {
    let now = db::now_ms();
    let result = sqlx::query(
        "UPDATE documents
         SET processing_status = 'processing',
             updated_at = ?,
             sync_version = MAX(?, sync_version + 1)
         WHERE id = ? AND processing_status IN ('pending', 'needs_local')",
    )
    .bind(now)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Completes a claimed document. Only valid from `processing`; a completed
/// row always has non-empty content. Resets `kg_extraction_status` so the
/// fresh text gets picked up for graph extraction.
pub async fn update_processed(
    pool: &SqlitePool,
    id: &str,
    payload: &ProcessedPayload,
) -> Result<()> {
    if payload.content.trim().is_empty() {
        bail!("content must not be empty");
    }

    let metadata = serde_json::to_string(&payload.metadata)?;
    let sections = serde_json::to_string(&payload.sections)?;
    let now = db::now_ms();

    let result = sqlx::query(
        "UPDATE documents
         SET content = ?,
             metadata = ?,
             sections = ?,
             processing_mode = ?,
             processing_status = 'completed',
             needs_full_processing = 0,
             kg_extraction_status = 'pending',
             processed_at = ?,
             updated_at = ?,
             sync_version = MAX(?, sync_version + 1)
         WHERE id = ? AND processing_status = 'processing'",
    )
    .bind(&payload.content)
    .bind(&metadata)
    .bind(&sections)
    .bind(&payload.processing_mode)
    .bind(now)
    .bind(now)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        match get_document(pool, id).await? {
            None => bail!("document not found: {}", id),
            Some(doc) => bail!(
                "document {} is not in processing (status: {})",
                id,
                doc.processing_status
            ),
        }
    }
    Ok(())
}

/// Persists a fresh processing outcome for a just-inserted document.
///
/// Failure lands in `failed`; success that still needs the full pipeline
/// lands in `needs_local` with the raw file retained; plain success goes
/// through the claim + complete path.
pub async fn finalize_processing(
    pool: &SqlitePool,
    id: &str,
    result: &ProcessedDocument,
) -> Result<ProcessingStatus> {
    if !result.success {
        let error = result.error.as_deref().unwrap_or("processing failed");
        mark_failed(pool, id, error).await?;
        return Ok(ProcessingStatus::Failed);
    }

    if result.needs_full_processing {
        let metadata = serde_json::to_string(&result.metadata)?;
        let now = db::now_ms();
        sqlx::query(
            "UPDATE documents
             SET content = ?,
                 metadata = ?,
                 processing_mode = ?,
                 processing_status = 'needs_local',
                 needs_full_processing = 1,
                 updated_at = ?,
                 sync_version = MAX(?, sync_version + 1)
             WHERE id = ?",
        )
        .bind((!result.content.trim().is_empty()).then_some(result.content.as_str()))
        .bind(&metadata)
        .bind(&result.processing_mode)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(pool)
        .await?;
        return Ok(ProcessingStatus::NeedsLocal);
    }

    if !mark_processing(pool, id).await? {
        bail!("document {} could not be claimed for processing", id);
    }
    update_processed(
        pool,
        id,
        &ProcessedPayload {
            content: result.content.clone(),
            metadata: result.metadata.clone(),
            sections: result.sections.clone(),
            processing_mode: result.processing_mode.clone(),
        },
    )
    .await?;
    Ok(ProcessingStatus::Completed)
}

/// Marks a document failed and records the error under `processing_error`
/// in its metadata. Allowed from any state so operators can retire stuck
/// claims by hand.
pub async fn mark_failed(pool: &SqlitePool, id: &str, error: &str) -> Result<()> {
    let doc = match get_document(pool, id).await? {
        Some(doc) => doc,
        None => bail!("document not found: {}", id),
    };

    let mut metadata: serde_json::Value = doc
        .metadata
        .as_deref()
        .and_then(|m| serde_json::from_str(m).ok())
        .unwrap_or_else(|| serde_json::json!({}));
    if let Some(obj) = metadata.as_object_mut() {
        obj.insert("processing_error".to_string(), serde_json::json!(error));
    }

    let now = db::now_ms();
    sqlx::query(
        "UPDATE documents
         SET processing_status = 'failed',
             metadata = ?,
             processed_at = ?,
             updated_at = ?,
             sync_version = MAX(?, sync_version + 1)
         WHERE id = ?",
    )
    .bind(metadata.to_string())
    .bind(now)
    .bind(now)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Drops the stored raw-file path once the file itself is gone.
pub async fn clear_raw_file_path(pool: &SqlitePool, id: &str) -> Result<()> {
    sqlx::query("UPDATE documents SET raw_file_path = NULL WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Moves a document through the graph-extraction states
/// (`pending` → `processing` → `completed` | `failed`).
pub async fn set_kg_status(pool: &SqlitePool, id: &str, status: &str) -> Result<()> {
    sqlx::query("UPDATE documents SET kg_extraction_status = ? WHERE id = ?")
        .bind(status)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn processing_stats(pool: &SqlitePool, stuck_after_secs: u64) -> Result<ProcessingStats> {
    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
        .fetch_one(pool)
        .await?;

    let rows = sqlx::query(
        "SELECT processing_status, COUNT(*) AS n FROM documents GROUP BY processing_status",
    )
    .fetch_all(pool)
    .await?;
    let by_status = rows
        .iter()
        .map(|row| (row.get::<String, _>("processing_status"), row.get::<i64, _>("n")))
        .collect();

    let needs_full_processing: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE needs_full_processing = 1")
            .fetch_one(pool)
            .await?;

    // Stuck iff now - updated_at >= the cutoff age, so a zero-second
    // cutoff counts a claim made this very millisecond.
    let cutoff = db::now_ms() - (stuck_after_secs as i64) * 1000;
    let stuck_processing: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM documents WHERE processing_status = 'processing' AND updated_at <= ?",
    )
    .bind(cutoff)
    .fetch_one(pool)
    .await?;

    Ok(ProcessingStats {
        total,
        by_status,
        needs_full_processing,
        stuck_processing,
    })
}

/// Rows changed after the (`since`, `after_id`) cursor, ordered by
/// `(updated_at, id)`. With an `after_id` the id tiebreak resumes paging
/// inside a group of rows sharing one millisecond; without one, `since` is
/// the strict watermark. Fetches one past the limit so the caller can tell
/// whether another page is waiting.
pub async fn changed_since(
    pool: &SqlitePool,
    since: i64,
    after_id: &str,
    limit: i64,
) -> Result<(Vec<SyncDocument>, bool)> {
    let rows = if after_id.is_empty() {
        sqlx::query(&format!(
            "SELECT {} FROM documents
             WHERE updated_at > ?
             ORDER BY updated_at ASC, id ASC
             LIMIT ?",
            SYNC_COLUMNS
        ))
        .bind(since)
        .bind(limit + 1)
        .fetch_all(pool)
        .await?
    } else {
        sqlx::query(&format!(
            "SELECT {} FROM documents
             WHERE updated_at > ? OR (updated_at = ? AND id > ?)
             ORDER BY updated_at ASC, id ASC
             LIMIT ?",
            SYNC_COLUMNS
        ))
        .bind(since)
        .bind(since)
        .bind(after_id)
        .bind(limit + 1)
        .fetch_all(pool)
        .await?
    };

    let mut documents: Vec<SyncDocument> = rows.iter().map(sync_document_from_row).collect();
    let has_more = documents.len() as i64 > limit;
    documents.truncate(limit as usize);
    Ok((documents, has_more))
}

/// The sync comparator: apply the incoming payload if it is newer.
///
/// Incoming `sync_version` greater than ours wins; smaller loses; equal with
/// an identical payload is the idempotent re-push and does nothing; equal
/// with a differing payload is a conflict, recorded and skipped. Applied
/// payloads keep the remote's `sync_version` and `updated_at` verbatim —
/// rewriting them here would make every apply look like a fresh local edit
/// and bounce the same document back over sync forever.
pub async fn apply_remote(pool: &SqlitePool, incoming: &SyncDocument) -> Result<ApplyOutcome> {
    let existing = sqlx::query(&format!(
        "SELECT {} FROM documents WHERE id = ?",
        SYNC_COLUMNS
    ))
    .bind(&incoming.id)
    .fetch_optional(pool)
    .await?;

    let current = match existing.as_ref() {
        Some(row) => sync_document_from_row(row),
        None => {
            sqlx::query(
                r#"
                INSERT INTO documents (id, title, description, tags, location, hazard_type,
                    source, processing_status, needs_full_processing, processing_mode,
                    kg_extraction_status, sync_version, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending', 'pending', ?, ?, ?)
                "#,
            )
            .bind(&incoming.id)
            .bind(&incoming.title)
            .bind(&incoming.description)
            .bind(&incoming.tags)
            .bind(&incoming.location)
            .bind(&incoming.hazard_type)
            .bind(&incoming.source)
            .bind(incoming.processing_status.as_str())
            .bind(incoming.needs_full_processing as i64)
            .bind(incoming.sync_version)
            .bind(incoming.created_at)
            .bind(incoming.updated_at)
            .execute(pool)
            .await?;
            return Ok(ApplyOutcome::Applied);
        }
    };

    if incoming.sync_version > current.sync_version {
        sqlx::query(
            "UPDATE documents
             SET title = ?, description = ?, tags = ?, location = ?, hazard_type = ?,
                 source = ?, processing_status = ?, needs_full_processing = ?,
                 sync_version = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(&incoming.title)
        .bind(&incoming.description)
        .bind(&incoming.tags)
        .bind(&incoming.location)
        .bind(&incoming.hazard_type)
        .bind(&incoming.source)
        .bind(incoming.processing_status.as_str())
        .bind(incoming.needs_full_processing as i64)
        .bind(incoming.sync_version)
        .bind(incoming.updated_at)
        .bind(&incoming.id)
        .execute(pool)
        .await?;
        return Ok(ApplyOutcome::Applied);
    }

    if incoming.sync_version < current.sync_version || *incoming == current {
        return Ok(ApplyOutcome::Skipped);
    }

    record_conflict(pool, &current, incoming).await?;
    Ok(ApplyOutcome::Conflict)
}

/// Writes a `sync_conflicts` row unless the identical conflict is already on
/// file unresolved. Re-pushing the same diverged state must not pile up rows.
async fn record_conflict(
    pool: &SqlitePool,
    current: &SyncDocument,
    incoming: &SyncDocument,
) -> Result<()> {
    let local_payload = serde_json::to_string(current)?;
    let remote_payload = serde_json::to_string(incoming)?;

    let already_recorded: Option<String> = sqlx::query_scalar(
        "SELECT id FROM sync_conflicts
         WHERE document_id = ? AND sync_version = ? AND remote_payload = ? AND resolved = 0",
    )
    .bind(&incoming.id)
    .bind(incoming.sync_version)
    .bind(&remote_payload)
    .fetch_optional(pool)
    .await?;
    if already_recorded.is_some() {
        return Ok(());
    }

    sqlx::query(
        r#"
        INSERT INTO sync_conflicts (id, document_id, sync_version, local_payload, remote_payload, detected_at, resolved)
        VALUES (?, ?, ?, ?, ?, ?, 0)
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(&incoming.id)
    .bind(incoming.sync_version)
    .bind(&local_payload)
    .bind(&remote_payload)
    .bind(db::now_ms())
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn list_conflicts(pool: &SqlitePool, include_resolved: bool) -> Result<Vec<SyncConflict>> {
    let sql = if include_resolved {
        "SELECT id, document_id, sync_version, local_payload, remote_payload, detected_at, resolved
         FROM sync_conflicts ORDER BY detected_at DESC"
    } else {
        "SELECT id, document_id, sync_version, local_payload, remote_payload, detected_at, resolved
         FROM sync_conflicts WHERE resolved = 0 ORDER BY detected_at DESC"
    };
    let rows = sqlx::query(sql).fetch_all(pool).await?;

    Ok(rows
        .iter()
        .map(|row| SyncConflict {
            id: row.get("id"),
            document_id: row.get("document_id"),
            sync_version: row.get("sync_version"),
            local_payload: row.get("local_payload"),
            remote_payload: row.get("remote_payload"),
            detected_at: row.get("detected_at"),
            resolved: row.get::<i64, _>("resolved") != 0,
        })
        .collect())
}

pub async fn resolve_conflict(pool: &SqlitePool, conflict_id: &str) -> Result<bool> {
    let result = sqlx::query("UPDATE sync_conflicts SET resolved = 1 WHERE id = ? AND resolved = 0")
        .bind(conflict_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() == 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate;
    use serde_json::json;

    async fn test_pool() -> SqlitePool {
        // A multi-connection :memory: pool would hand each connection its
        // own empty database.
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        pool
    }

    fn payload(content: &str) -> ProcessedPayload {
        ProcessedPayload {
            content: content.to_string(),
            metadata: json!({"processor": "full"}),
            sections: Vec::new(),
            processing_mode: "simple_text".to_string(),
        }
    }

    #[tokio::test]
    async fn insert_then_get_round_trips() {
        let pool = test_pool().await;
        let doc = insert_document(
            &pool,
            NewDocument {
                title: Some("Evacuation routes".to_string()),
                hazard_type: Some("wildfire".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let fetched = get_document(&pool, &doc.id).await.unwrap().unwrap();
        assert_eq!(fetched.title.as_deref(), Some("Evacuation routes"));
        assert_eq!(fetched.processing_status, ProcessingStatus::Pending);
        assert!(fetched.content.is_none());
        assert_eq!(fetched.sync_version, doc.sync_version);
    }

    #[tokio::test]
    async fn claim_is_exclusive() {
        let pool = test_pool().await;
        let doc = insert_document(&pool, NewDocument::default()).await.unwrap();

        assert!(mark_processing(&pool, &doc.id).await.unwrap());
        // Second claim loses: the row is already in processing.
        assert!(!mark_processing(&pool, &doc.id).await.unwrap());
        assert!(!mark_processing(&pool, "no-such-id").await.unwrap());
    }

    #[tokio::test]
    async fn interrupted_claim_stays_in_processing() {
        let pool = test_pool().await;
        let doc = insert_document(&pool, NewDocument::default()).await.unwrap();
        assert!(mark_processing(&pool, &doc.id).await.unwrap());

        // Nothing completes the claim. The row must still read processing;
        // no recovery happens on its own.
        let fetched = get_document(&pool, &doc.id).await.unwrap().unwrap();
        assert_eq!(fetched.processing_status, ProcessingStatus::Processing);

        // With a zero-second cutoff the claim immediately counts as stuck.
        let stats = processing_stats(&pool, 0).await.unwrap();
        assert_eq!(stats.stuck_processing, 1);
    }

    #[tokio::test]
    async fn completion_requires_claim_and_content() {
        let pool = test_pool().await;
        let doc = insert_document(&pool, NewDocument::default()).await.unwrap();

        // Not claimed yet.
        let err = update_processed(&pool, &doc.id, &payload("text"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not in processing"));

        mark_processing(&pool, &doc.id).await.unwrap();

        // Whitespace-only content must never complete a document.
        let err = update_processed(&pool, &doc.id, &payload("  \n "))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("must not be empty"));

        update_processed(&pool, &doc.id, &payload("Extracted body text."))
            .await
            .unwrap();
        let fetched = get_document(&pool, &doc.id).await.unwrap().unwrap();
        assert_eq!(fetched.processing_status, ProcessingStatus::Completed);
        assert_eq!(fetched.content.as_deref(), Some("Extracted body text."));
        assert!(fetched.processed_at.is_some());
        assert!(!fetched.needs_full_processing);
        assert_eq!(fetched.kg_extraction_status, "pending");
        assert!(fetched.sync_version > doc.sync_version);
    }

    #[tokio::test]
    async fn mark_failed_records_error_in_metadata() {
        let pool = test_pool().await;
        let doc = insert_document(&pool, NewDocument::default()).await.unwrap();
        mark_processing(&pool, &doc.id).await.unwrap();
        mark_failed(&pool, &doc.id, "no text layer").await.unwrap();

        let fetched = get_document(&pool, &doc.id).await.unwrap().unwrap();
        assert_eq!(fetched.processing_status, ProcessingStatus::Failed);
        let meta: serde_json::Value =
            serde_json::from_str(fetched.metadata.as_deref().unwrap()).unwrap();
        assert_eq!(meta["processing_error"], "no text layer");
    }

    #[tokio::test]
    async fn finalize_routes_outcomes_to_the_right_state() {
        let pool = test_pool().await;

        let parked = insert_document(
            &pool,
            NewDocument {
                raw_file_path: Some("/data/raw/plan.docx".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let outcome = ProcessedDocument {
            success: true,
            content: String::new(),
            metadata: json!({"file_extension": ".docx"}),
            sections: Vec::new(),
            needs_full_processing: true,
            processing_mode: "pending_full_processing".to_string(),
            error: None,
        };
        let status = finalize_processing(&pool, &parked.id, &outcome).await.unwrap();
        assert_eq!(status, ProcessingStatus::NeedsLocal);
        let fetched = get_document(&pool, &parked.id).await.unwrap().unwrap();
        assert!(fetched.needs_full_processing);
        assert_eq!(fetched.content, None);
        assert_eq!(fetched.raw_file_path.as_deref(), Some("/data/raw/plan.docx"));

        let done = insert_document(&pool, NewDocument::default()).await.unwrap();
        let outcome = ProcessedDocument {
            success: true,
            content: "Body text.".to_string(),
            metadata: json!({}),
            sections: Vec::new(),
            needs_full_processing: false,
            processing_mode: "simple_text".to_string(),
            error: None,
        };
        let status = finalize_processing(&pool, &done.id, &outcome).await.unwrap();
        assert_eq!(status, ProcessingStatus::Completed);

        let broken = insert_document(&pool, NewDocument::default()).await.unwrap();
        let outcome = ProcessedDocument {
            success: false,
            content: String::new(),
            metadata: json!({}),
            sections: Vec::new(),
            needs_full_processing: false,
            processing_mode: "error".to_string(),
            error: Some("file contains no text".to_string()),
        };
        let status = finalize_processing(&pool, &broken.id, &outcome).await.unwrap();
        assert_eq!(status, ProcessingStatus::Failed);
        let fetched = get_document(&pool, &broken.id).await.unwrap().unwrap();
        let meta: serde_json::Value =
            serde_json::from_str(fetched.metadata.as_deref().unwrap()).unwrap();
        assert_eq!(meta["processing_error"], "file contains no text");
    }

    #[tokio::test]
    async fn changed_since_pages_with_has_more() {
        let pool = test_pool().await;
        for ts in [1000_i64, 2000, 3000] {
            let doc = insert_document(&pool, NewDocument::default()).await.unwrap();
            sqlx::query("UPDATE documents SET updated_at = ? WHERE id = ?")
                .bind(ts)
                .bind(&doc.id)
                .execute(&pool)
                .await
                .unwrap();
        }

        let (page, has_more) = changed_since(&pool, 0, "", 2).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].updated_at, 1000);
        assert!(has_more);

        let (rest, has_more) = changed_since(&pool, page[1].updated_at, &page[1].id, 2)
            .await
            .unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].updated_at, 3000);
        assert!(!has_more);

        let (empty, has_more) = changed_since(&pool, 3000, &rest[0].id, 2).await.unwrap();
        assert!(empty.is_empty());
        assert!(!has_more);
    }

    #[tokio::test]
    async fn tied_timestamps_page_on_the_id_tiebreak() {
        let pool = test_pool().await;
        // Burst writes land several rows in the same millisecond. The id
        // tiebreak must carry the cursor across a page boundary inside the
        // tie without dropping or repeating a row.
        for _ in 0..5 {
            let doc = insert_document(&pool, NewDocument::default()).await.unwrap();
            sqlx::query("UPDATE documents SET updated_at = 5000 WHERE id = ?")
                .bind(&doc.id)
                .execute(&pool)
                .await
                .unwrap();
        }

        let mut seen: Vec<String> = Vec::new();
        let (mut since, mut after_id) = (0_i64, String::new());
        loop {
            let (page, has_more) = changed_since(&pool, since, &after_id, 2).await.unwrap();
            let Some(last) = page.last() else {
                assert!(!has_more);
                break;
            };
            since = last.updated_at;
            after_id = last.id.clone();
            seen.extend(page.iter().map(|d| d.id.clone()));
            if !has_more {
                break;
            }
        }

        assert_eq!(seen.len(), 5, "every tied row must come back exactly once");
        let mut deduped = seen.clone();
        deduped.sort();
        deduped.dedup();
        assert_eq!(deduped.len(), 5);

        // A cursor pointing at the last tied row sees nothing more.
        let (empty, has_more) = changed_since(&pool, since, &after_id, 2).await.unwrap();
        assert!(empty.is_empty());
        assert!(!has_more);
    }

    fn remote(id: &str, version: i64) -> SyncDocument {
        SyncDocument {
            id: id.to_string(),
            title: Some("Shelter list".to_string()),
            description: None,
            tags: None,
            location: Some("Marysville".to_string()),
            hazard_type: None,
            source: None,
            processing_status: ProcessingStatus::Pending,
            needs_full_processing: true,
            sync_version: version,
            created_at: 100,
            updated_at: 200,
        }
    }

    #[tokio::test]
    async fn apply_remote_inserts_unknown_documents() {
        let pool = test_pool().await;
        let outcome = apply_remote(&pool, &remote("d1", 5)).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied);

        let doc = get_document(&pool, "d1").await.unwrap().unwrap();
        assert_eq!(doc.sync_version, 5);
        assert_eq!(doc.updated_at, 200);
        assert!(doc.needs_full_processing);
    }

    #[tokio::test]
    async fn apply_remote_newer_wins_older_skips() {
        let pool = test_pool().await;
        apply_remote(&pool, &remote("d1", 5)).await.unwrap();

        let mut newer = remote("d1", 9);
        newer.title = Some("Shelter list (rev 2)".to_string());
        newer.updated_at = 300;
        assert_eq!(
            apply_remote(&pool, &newer).await.unwrap(),
            ApplyOutcome::Applied
        );
        let doc = get_document(&pool, "d1").await.unwrap().unwrap();
        assert_eq!(doc.title.as_deref(), Some("Shelter list (rev 2)"));
        assert_eq!(doc.updated_at, 300);

        let mut stale = remote("d1", 3);
        stale.title = Some("ancient".to_string());
        assert_eq!(
            apply_remote(&pool, &stale).await.unwrap(),
            ApplyOutcome::Skipped
        );
        let doc = get_document(&pool, "d1").await.unwrap().unwrap();
        assert_eq!(doc.title.as_deref(), Some("Shelter list (rev 2)"));
    }

    #[tokio::test]
    async fn identical_re_push_is_idempotent() {
        let pool = test_pool().await;
        let incoming = remote("d1", 5);
        assert_eq!(
            apply_remote(&pool, &incoming).await.unwrap(),
            ApplyOutcome::Applied
        );
        assert_eq!(
            apply_remote(&pool, &incoming).await.unwrap(),
            ApplyOutcome::Skipped
        );
        assert!(list_conflicts(&pool, true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn same_version_payload_drift_records_one_conflict() {
        let pool = test_pool().await;
        apply_remote(&pool, &remote("d1", 5)).await.unwrap();

        let mut diverged = remote("d1", 5);
        diverged.title = Some("Shelter list (edited elsewhere)".to_string());
        assert_eq!(
            apply_remote(&pool, &diverged).await.unwrap(),
            ApplyOutcome::Conflict
        );
        // The local row is untouched.
        let doc = get_document(&pool, "d1").await.unwrap().unwrap();
        assert_eq!(doc.title.as_deref(), Some("Shelter list"));

        // Re-pushing the same diverged payload does not add a second row.
        apply_remote(&pool, &diverged).await.unwrap();
        let conflicts = list_conflicts(&pool, false).await.unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].document_id, "d1");
        assert_eq!(conflicts[0].sync_version, 5);

        assert!(resolve_conflict(&pool, &conflicts[0].id).await.unwrap());
        assert!(list_conflicts(&pool, false).await.unwrap().is_empty());
        // Resolving twice reports false.
        assert!(!resolve_conflict(&pool, &conflicts[0].id).await.unwrap());
    }

    #[tokio::test]
    async fn stats_count_queue_and_statuses() {
        let pool = test_pool().await;
        let a = insert_document(&pool, NewDocument::default()).await.unwrap();
        insert_document(&pool, NewDocument::default()).await.unwrap();
        apply_remote(&pool, &remote("d3", 1)).await.unwrap();

        mark_processing(&pool, &a.id).await.unwrap();
        update_processed(&pool, &a.id, &payload("done")).await.unwrap();

        let stats = processing_stats(&pool, 3600).await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_status.get("completed"), Some(&1));
        assert_eq!(stats.by_status.get("pending"), Some(&2));
        assert_eq!(stats.needs_full_processing, 1);
        assert_eq!(stats.stuck_processing, 0);
    }
}

//! Local sync worker.
//!
//! Runs on a `local` deployment and drives the cloud's sync API on a timer
//! (default every 15 minutes). Each cycle has three independent steps:
//!
//! 1. **Process** — fetch the cloud's full-processing queue, download each
//!    raw file, run the full extraction pipeline, and submit the result
//!    through the `processed` or `failed` endpoint.
//! 2. **Pull** — page documents changed on the cloud since the last pull
//!    cursor and apply them locally through the version comparator.
//! 3. **Push** — send locally changed documents, oldest first, advancing
//!    the push cursor past each accepted batch.
//!
//! A network or HTTP failure aborts only the step it occurred in; the step
//! is logged as failed and runs again on the next tick. Documents the
//! worker downloaded but never submitted stay claimed (`processing`) on the
//! cloud and show up in its stats for an operator to deal with.

use anyhow::{bail, Result};
use serde::Deserialize;
use sqlx::SqlitePool;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::{Config, SyncConfig};
use crate::db;
use crate::documents::{self, ApplyOutcome};
use crate::migrate;
use crate::models::{
    FailedPayload, ProcessedPayload, PullResponse, PushRequest, PushResponse, SyncDocument,
};
use crate::processor::DocumentProcessor;
use crate::sync_log;

const HTTP_TIMEOUT_SECS: u64 = 120;

/// Starts the worker. With `once` set, runs a single cycle and prints a
/// summary; otherwise ticks forever at `[sync].interval_secs`.
pub async fn run_worker(config: &Config, once: bool) -> Result<()> {
    if !config.sync.enabled {
        bail!("sync is not enabled; set [sync] enabled = true, cloud_url, and api_key");
    }
    if !config.is_local() {
        bail!("the worker runs the full pipeline and requires deployment.mode = \"local\"");
    }

    let pool = db::connect(config).await?;
    migrate::run_migrations(&pool).await?;
    let client = SyncClient::new(&config.sync)?;

    if once {
        let outcome = run_cycle(&pool, config, &client).await;
        println!("sync cycle against {}", client.base_url);
        println!("  processed {} ({} failed)", outcome.processed, outcome.process_failed);
        println!("  pulled    {}", outcome.pulled);
        println!("  pushed    {}", outcome.pushed);
        for err in &outcome.step_errors {
            println!("  error: {}", err);
        }
        if outcome.step_errors.is_empty() {
            println!("ok");
        }
        pool.close().await;
        return Ok(());
    }

    println!(
        "worker syncing with {} every {}s",
        client.base_url, config.sync.interval_secs
    );

    let mut ticker = tokio::time::interval(Duration::from_secs(config.sync.interval_secs));
    loop {
        ticker.tick().await;
        let outcome = run_cycle(&pool, config, &client).await;
        info!(
            processed = outcome.processed,
            process_failed = outcome.process_failed,
            pulled = outcome.pulled,
            pushed = outcome.pushed,
            errors = outcome.step_errors.len(),
            "sync cycle finished"
        );
    }
}

#[derive(Debug, Default)]
struct CycleOutcome {
    processed: i64,
    process_failed: i64,
    pulled: i64,
    pushed: i64,
    step_errors: Vec<String>,
}

/// One full cycle. Steps run in order but do not depend on each other
/// succeeding; each failure is recorded and the cycle moves on.
async fn run_cycle(pool: &SqlitePool, config: &Config, client: &SyncClient) -> CycleOutcome {
    let mut outcome = CycleOutcome::default();

    match process_queue(pool, config, client).await {
        Ok((processed, failed)) => {
            outcome.processed = processed;
            outcome.process_failed = failed;
        }
        Err(e) => {
            warn!(error = %e, "process step failed; retrying next cycle");
            outcome.step_errors.push(format!("process: {}", e));
        }
    }

    match pull_from_cloud(pool, config, client).await {
        Ok(pulled) => outcome.pulled = pulled,
        Err(e) => {
            warn!(error = %e, "pull step failed; retrying next cycle");
            outcome.step_errors.push(format!("pull: {}", e));
        }
    }

    match push_to_cloud(pool, config, client).await {
        Ok(pushed) => outcome.pushed = pushed,
        Err(e) => {
            warn!(error = %e, "push step failed; retrying next cycle");
            outcome.step_errors.push(format!("push: {}", e));
        }
    }

    outcome
}

// ============ Step 1: process queue ============

async fn process_queue(
    pool: &SqlitePool,
    config: &Config,
    client: &SyncClient,
) -> Result<(i64, i64)> {
    let log_id = sync_log::start(pool, "process").await?;
    match process_queue_inner(pool, config, client).await {
        Ok((processed, failed)) => {
            sync_log::complete(
                pool,
                &log_id,
                processed,
                Some(serde_json::json!({ "failed": failed })),
            )
            .await?;
            Ok((processed, failed))
        }
        Err(e) => {
            let _ = sync_log::fail(pool, &log_id, &e.to_string()).await;
            Err(e)
        }
    }
}

async fn process_queue_inner(
    pool: &SqlitePool,
    config: &Config,
    client: &SyncClient,
) -> Result<(i64, i64)> {
    let queue = client.unprocessed(config.sync.batch_limit).await?;
    if queue.is_empty() {
        return Ok((0, 0));
    }

    let processor = DocumentProcessor::new(config);
    let mut processed = 0i64;
    let mut failed = 0i64;

    for doc in &queue {
        let bytes = match client.download(&doc.id).await? {
            Download::Bytes(bytes) => bytes,
            // Claimed by another worker between listing and download.
            Download::Claimed => continue,
            // A vanished raw file never heals on its own. Fail the document
            // out of the queue instead of letting it head the oldest-first
            // listing forever and block everything behind it.
            Download::Missing => {
                warn!(document_id = %doc.id, "raw file missing on cloud; marking failed");
                client
                    .submit_failed(&doc.id, "raw file missing on cloud instance")
                    .await?;
                failed += 1;
                continue;
            }
        };

        let filename = queued_filename(doc);
        let result = processor.process(&filename, &bytes);

        if result.success && !result.content.trim().is_empty() {
            client
                .submit_processed(
                    &doc.id,
                    &ProcessedPayload {
                        content: result.content,
                        metadata: result.metadata,
                        sections: result.sections,
                        processing_mode: result.processing_mode,
                    },
                )
                .await?;
            info!(document_id = %doc.id, "fully processed for cloud");
            processed += 1;
        } else {
            let error = result
                .error
                .unwrap_or_else(|| "processing produced no text".to_string());
            client.submit_failed(&doc.id, &error).await?;
            warn!(document_id = %doc.id, error = %error, "full processing failed");
            failed += 1;
        }
    }

    sync_log::set_cursor(pool, sync_log::LAST_PROCESS_TIMESTAMP, db::now_ms()).await?;
    Ok((processed, failed))
}

/// The raw file keeps its original extension under a UUID name, so its
/// basename is enough to route the bytes to the right extractor.
fn queued_filename(doc: &QueuedDocument) -> String {
    doc.raw_file_path
        .as_deref()
        .and_then(|p| std::path::Path::new(p).file_name())
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| doc.id.clone())
}

// ============ Step 2: pull ============

async fn pull_from_cloud(pool: &SqlitePool, config: &Config, client: &SyncClient) -> Result<i64> {
    let log_id = sync_log::start(pool, "pull").await?;
    match pull_inner(pool, config, client).await {
        Ok((pulled, conflicts)) => {
            sync_log::complete(
                pool,
                &log_id,
                pulled,
                Some(serde_json::json!({ "conflicts": conflicts })),
            )
            .await?;
            Ok(pulled)
        }
        Err(e) => {
            let _ = sync_log::fail(pool, &log_id, &e.to_string()).await;
            Err(e)
        }
    }
}

async fn pull_inner(
    pool: &SqlitePool,
    config: &Config,
    client: &SyncClient,
) -> Result<(i64, i64)> {
    let mut since = sync_log::get_cursor(pool, sync_log::LAST_PULL_TIMESTAMP).await?;
    let mut after_id = sync_log::get_metadata(pool, sync_log::LAST_PULL_ID)
        .await?
        .unwrap_or_default();
    let mut pulled = 0i64;
    let mut conflicts = 0i64;

    loop {
        let page = client.pull(since, &after_id, config.sync.batch_limit).await?;

        for doc in &page.documents {
            if documents::apply_remote(pool, doc).await? == ApplyOutcome::Conflict {
                warn!(document_id = %doc.id, "sync conflict recorded for manual review");
                conflicts += 1;
            }
            pulled += 1;
        }

        // Advance both cursor halves together; rows tied on `updated_at`
        // are disambiguated by id on the server side.
        if let Some(last) = page.documents.last() {
            since = last.updated_at;
            after_id = last.id.clone();
        }

        if !page.has_more {
            // The durable cursor points at the last applied row and only
            // advances once the whole pull applied; re-applying a page
            // after a crash is a no-op.
            sync_log::set_cursor(pool, sync_log::LAST_PULL_TIMESTAMP, since).await?;
            sync_log::set_metadata(pool, sync_log::LAST_PULL_ID, &after_id).await?;
            return Ok((pulled, conflicts));
        }
    }
}

// ============ Step 3: push ============

async fn push_to_cloud(pool: &SqlitePool, config: &Config, client: &SyncClient) -> Result<i64> {
    let log_id = sync_log::start(pool, "push").await?;
    match push_inner(pool, config, client).await {
        Ok(pushed) => {
            sync_log::complete(pool, &log_id, pushed, None).await?;
            Ok(pushed)
        }
        Err(e) => {
            let _ = sync_log::fail(pool, &log_id, &e.to_string()).await;
            Err(e)
        }
    }
}

async fn push_inner(pool: &SqlitePool, config: &Config, client: &SyncClient) -> Result<i64> {
    let mut cursor = sync_log::get_cursor(pool, sync_log::LAST_PUSH_TIMESTAMP).await?;
    let mut cursor_id = sync_log::get_metadata(pool, sync_log::LAST_PUSH_ID)
        .await?
        .unwrap_or_default();
    let mut pushed = 0i64;

    loop {
        let (batch, has_more) =
            documents::changed_since(pool, cursor, &cursor_id, config.sync.batch_limit).await?;
        let Some(last) = batch.last() else {
            return Ok(pushed);
        };
        let (batch_high_water, batch_last_id) = (last.updated_at, last.id.clone());

        let response = client.push(&batch).await?;
        if response.failed_count > 0 {
            warn!(
                failed = response.failed_count,
                errors = ?response.errors,
                "cloud rejected some pushed documents"
            );
        }
        if response.conflict_count > 0 {
            warn!(
                conflicts = response.conflict_count,
                "cloud recorded sync conflicts for manual review"
            );
        }

        pushed += batch.len() as i64;
        cursor = batch_high_water;
        cursor_id = batch_last_id;
        sync_log::set_cursor(pool, sync_log::LAST_PUSH_TIMESTAMP, cursor).await?;
        sync_log::set_metadata(pool, sync_log::LAST_PUSH_ID, &cursor_id).await?;

        if !has_more {
            return Ok(pushed);
        }
    }
}

// ============ HTTP client ============

/// Thin client for the cloud's sync API. Every request carries the shared
/// key as a bearer token. Errors are not retried here; the cycle's steps
/// are re-run wholesale on the next tick.
#[derive(Debug)]
struct SyncClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct QueuedDocument {
    id: String,
    raw_file_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UnprocessedResponse {
    documents: Vec<QueuedDocument>,
}

#[derive(Debug, Deserialize)]
struct SubmitAck {
    success: bool,
}

/// Outcome of a raw-file download attempt.
enum Download {
    Bytes(Vec<u8>),
    /// 409: another worker claimed the document first.
    Claimed,
    /// 404: the document or its raw file is gone on the cloud.
    Missing,
}

impl SyncClient {
    fn new(config: &SyncConfig) -> Result<Self> {
        let base_url = match config.cloud_url.as_deref() {
            Some(url) if !url.is_empty() => url.trim_end_matches('/').to_string(),
            _ => bail!("sync.cloud_url is not configured"),
        };
        let api_key = match config.api_key.as_deref() {
            Some(key) if !key.is_empty() => key.to_string(),
            _ => bail!("sync.api_key is not configured"),
        };
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            http,
            base_url,
            api_key,
        })
    }

    fn auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request.header("Authorization", format!("Bearer {}", self.api_key))
    }

    async fn unprocessed(&self, limit: i64) -> Result<Vec<QueuedDocument>> {
        let url = format!(
            "{}/api/sync/documents/unprocessed?limit={}",
            self.base_url, limit
        );
        let response = self.auth(self.http.get(&url)).send().await?;
        let response = ok_or_api_error(response).await?;
        let body: UnprocessedResponse = response.json().await?;
        Ok(body.documents)
    }

    /// Downloads and claims a queued document. Claim races and missing raw
    /// files are per-document outcomes, not transport errors; only the
    /// latter abort the processing step.
    async fn download(&self, id: &str) -> Result<Download> {
        let url = format!("{}/api/sync/documents/{}/download", self.base_url, id);
        let response = self.auth(self.http.get(&url)).send().await?;
        match response.status() {
            reqwest::StatusCode::CONFLICT => return Ok(Download::Claimed),
            reqwest::StatusCode::NOT_FOUND => return Ok(Download::Missing),
            _ => {}
        }
        let response = ok_or_api_error(response).await?;
        Ok(Download::Bytes(response.bytes().await?.to_vec()))
    }

    async fn submit_processed(&self, id: &str, payload: &ProcessedPayload) -> Result<()> {
        let url = format!("{}/api/sync/documents/{}/processed", self.base_url, id);
        let response = self.auth(self.http.post(&url).json(payload)).send().await?;
        let response = ok_or_api_error(response).await?;
        let ack: SubmitAck = response.json().await?;
        if !ack.success {
            bail!("cloud did not accept processed content for document {}", id);
        }
        Ok(())
    }

    async fn submit_failed(&self, id: &str, error: &str) -> Result<()> {
        let url = format!("{}/api/sync/documents/{}/failed", self.base_url, id);
        let payload = FailedPayload {
            error_message: error.to_string(),
        };
        let response = self.auth(self.http.post(&url).json(&payload)).send().await?;
        ok_or_api_error(response).await?;
        Ok(())
    }

    async fn pull(&self, since: i64, after_id: &str, limit: i64) -> Result<PullResponse> {
        let url = format!(
            "{}/api/sync/pull?since={}&after_id={}&limit={}",
            self.base_url, since, after_id, limit
        );
        let response = self.auth(self.http.get(&url)).send().await?;
        let response = ok_or_api_error(response).await?;
        Ok(response.json().await?)
    }

    async fn push(&self, documents: &[SyncDocument]) -> Result<PushResponse> {
        let url = format!("{}/api/sync/push", self.base_url);
        let body = PushRequest {
            documents: documents.to_vec(),
        };
        let response = self.auth(self.http.post(&url).json(&body)).send().await?;
        let response = ok_or_api_error(response).await?;
        Ok(response.json().await?)
    }
}

async fn ok_or_api_error(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().path().to_string();
    let body = response.text().await.unwrap_or_default();
    bail!("cloud API error {} on {}: {}", status, url, body)
}

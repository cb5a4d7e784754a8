//! Core data models shared across the pipeline.
//!
//! These types represent documents moving through the processing state
//! machine, the payloads exchanged over the sync protocol, and the
//! knowledge-graph rows produced by extraction.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Lifecycle state of a document's text extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    /// Uploaded, not yet processed.
    Pending,
    /// Claimed by a worker; raw file handed out for full processing.
    Processing,
    /// Shallow pass done; waiting for a local instance to do the deep work.
    NeedsLocal,
    Completed,
    Failed,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Processing => "processing",
            ProcessingStatus::NeedsLocal => "needs_local",
            ProcessingStatus::Completed => "completed",
            ProcessingStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<ProcessingStatus> {
        match s {
            "pending" => Some(ProcessingStatus::Pending),
            "processing" => Some(ProcessingStatus::Processing),
            "needs_local" => Some(ProcessingStatus::NeedsLocal),
            "completed" => Some(ProcessingStatus::Completed),
            "failed" => Some(ProcessingStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A document row stored in SQLite.
///
/// `content` stays `None` until processing succeeds; `raw_file_path` is kept
/// only while a raw file is still needed for full processing. All timestamps
/// are unix milliseconds.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub tags: Option<String>,
    pub location: Option<String>,
    pub hazard_type: Option<String>,
    pub source: Option<String>,
    pub content: Option<String>,
    pub processing_status: ProcessingStatus,
    pub needs_full_processing: bool,
    pub processing_mode: String,
    pub raw_file_path: Option<String>,
    pub metadata: Option<String>,
    pub sections: Option<String>,
    pub kg_extraction_status: String,
    pub sync_version: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub processed_at: Option<i64>,
}

/// A structural section of a processed document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    pub title: String,
    pub level: u32,
    pub content: String,
}

/// Result of running a document through a processor.
#[derive(Debug, Clone)]
pub struct ProcessedDocument {
    pub success: bool,
    pub content: String,
    pub metadata: serde_json::Value,
    pub sections: Vec<Section>,
    pub needs_full_processing: bool,
    pub processing_mode: String,
    pub error: Option<String>,
}

/// Document metadata as exchanged over `/api/sync/pull` and `/api/sync/push`.
///
/// Content never travels this way; processed text moves through the
/// dedicated `processed` endpoint. `PartialEq` backs the conflict check:
/// equal `sync_version` with a differing payload is a conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncDocument {
    pub id: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub tags: Option<String>,
    pub location: Option<String>,
    pub hazard_type: Option<String>,
    pub source: Option<String>,
    pub processing_status: ProcessingStatus,
    pub needs_full_processing: bool,
    pub sync_version: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Body of `POST /api/sync/documents/{id}/processed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedPayload {
    pub content: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub sections: Vec<Section>,
    pub processing_mode: String,
}

/// Body of `POST /api/sync/documents/{id}/failed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedPayload {
    pub error_message: String,
}

/// Response of `GET /api/sync/pull`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullResponse {
    pub documents: Vec<SyncDocument>,
    pub has_more: bool,
    /// Server clock at response time (unix ms). Informational; the caller
    /// advances its cursor from the last row's `(updated_at, id)` instead,
    /// which stays exact when rows share a millisecond.
    pub server_time: i64,
}

/// Body of `POST /api/sync/push`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushRequest {
    pub documents: Vec<SyncDocument>,
}

/// Response of `POST /api/sync/push`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushResponse {
    pub processed_count: u64,
    pub failed_count: u64,
    pub conflict_count: u64,
    pub errors: Vec<String>,
}

/// Aggregate processing counters surfaced to operators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingStats {
    pub total: i64,
    pub by_status: BTreeMap<String, i64>,
    pub needs_full_processing: i64,
    /// Documents sitting in `processing` longer than the configured cutoff.
    /// Surfaced for manual review — never auto-recovered.
    pub stuck_processing: i64,
}

/// One pull/push/process run recorded in the sync log.
#[derive(Debug, Clone, Serialize)]
pub struct SyncLogEntry {
    pub id: String,
    pub sync_type: String,
    pub status: String,
    pub documents_processed: i64,
    pub error_message: Option<String>,
    pub details: Option<String>,
    pub started_at: i64,
    pub completed_at: Option<i64>,
}

/// A push that matched on `sync_version` but differed in payload.
///
/// Held for manual review; the push that raised it is skipped, never merged.
#[derive(Debug, Clone, Serialize)]
pub struct SyncConflict {
    pub id: String,
    pub document_id: String,
    pub sync_version: i64,
    pub local_payload: String,
    pub remote_payload: String,
    pub detected_at: i64,
    pub resolved: bool,
}

/// Entity types the extractor is allowed to produce.
pub const ENTITY_TYPES: [&str; 6] = [
    "HazardType",
    "Community",
    "Agency",
    "Location",
    "Resource",
    "Action",
];

/// Relationship types the extractor is allowed to produce.
pub const RELATIONSHIP_TYPES: [&str; 10] = [
    "occursIn",
    "hasHazardType",
    "serves",
    "responsibleFor",
    "locatedIn",
    "targets",
    "owns",
    "implementedBy",
    "dependsOn",
    "partOf",
];

/// An entity as returned by the LLM, before storage-side dedup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedEntity {
    pub entity_type: String,
    pub name: String,
    #[serde(default)]
    pub entity_subtype: Option<String>,
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub evidence_text: Option<String>,
    #[serde(default)]
    pub location_text: Option<String>,
}

/// A relationship as returned by the LLM, endpoints referenced by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedRelationship {
    pub source_name: String,
    #[serde(default)]
    pub source_type: String,
    pub target_name: String,
    #[serde(default)]
    pub target_type: String,
    pub relationship_type: String,
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub evidence_text: Option<String>,
}

fn default_confidence() -> f64 {
    0.5
}

/// A deduplicated knowledge-graph entity row.
#[derive(Debug, Clone, Serialize)]
pub struct KgEntity {
    pub id: String,
    pub entity_type: String,
    pub name: String,
    pub canonical_name: String,
    pub entity_subtype: Option<String>,
    pub attributes: String,
    pub confidence: f64,
    pub location_text: Option<String>,
    pub extraction_method: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A knowledge-graph edge between two entities.
#[derive(Debug, Clone, Serialize)]
pub struct KgRelationship {
    pub id: String,
    pub source_entity_id: String,
    pub target_entity_id: String,
    pub relationship_type: String,
    pub attributes: String,
    pub confidence: f64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Provenance row tying an entity or relationship back to source text.
#[derive(Debug, Clone, Serialize)]
pub struct KgEvidence {
    pub id: String,
    pub entity_id: Option<String>,
    pub relationship_id: Option<String>,
    pub document_id: String,
    pub evidence_text: String,
    pub extraction_confidence: f64,
    pub created_at: i64,
}

//! Knowledge-graph storage.
//!
//! Deduplicates extracted entities by canonical name, merges repeat
//! sightings instead of inserting twins, and keeps an evidence row tying
//! every stored fact back to the document and phrase it came from. Evidence
//! is hashed so re-ingesting the same document never duplicates provenance.

use anyhow::Result;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use uuid::Uuid;
use tracing::{debug, warn};

use crate::config::EmbeddingConfig;
use crate::db;
use crate::embedding;
use crate::models::{ExtractedEntity, ExtractedRelationship};

/// Counters returned by [`store_extraction`].
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct StoreOutcome {
    pub entities_created: u64,
    pub entities_merged: u64,
    pub relationships_created: u64,
    pub relationships_merged: u64,
    pub evidence_added: u64,
}

/// Normalizes an entity name for deduplication: lowercase, strip
/// punctuation except hyphens, collapse whitespace runs.
pub fn normalize_name(name: &str) -> String {
    let kept: String = name
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || *c == '-' || *c == '_')
        .collect();
    kept.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Stores one document's extraction results.
///
/// Entities land first so relationships can resolve their endpoints.
/// Individual failures are logged and skipped; one bad item must not drop
/// the rest of the batch.
pub async fn store_extraction(
    pool: &SqlitePool,
    embedding_config: &EmbeddingConfig,
    document_id: &str,
    entities: &[ExtractedEntity],
    relationships: &[ExtractedRelationship],
) -> Result<StoreOutcome> {
    let mut outcome = StoreOutcome::default();

    for entity in entities {
        match store_entity(pool, embedding_config, document_id, entity).await {
            Ok((created, evidence)) => {
                if created {
                    outcome.entities_created += 1;
                } else {
                    outcome.entities_merged += 1;
                }
                outcome.evidence_added += evidence;
            }
            Err(e) => warn!(name = %entity.name, error = %e, "failed to store entity"),
        }
    }

    for rel in relationships {
        match store_relationship(pool, document_id, rel).await {
            Ok(Some((created, evidence))) => {
                if created {
                    outcome.relationships_created += 1;
                } else {
                    outcome.relationships_merged += 1;
                }
                outcome.evidence_added += evidence;
            }
            Ok(None) => {} // unresolved endpoints, already logged
            Err(e) => warn!(
                source = %rel.source_name,
                target = %rel.target_name,
                error = %e,
                "failed to store relationship"
            ),
        }
    }

    debug!(
        document_id,
        created = outcome.entities_created,
        merged = outcome.entities_merged,
        "graph storage done"
    );
    Ok(outcome)
}

/// Returns `(created, evidence_rows_added)`.
async fn store_entity(
    pool: &SqlitePool,
    embedding_config: &EmbeddingConfig,
    document_id: &str,
    entity: &ExtractedEntity,
) -> Result<(bool, u64)> {
    let canonical = normalize_name(&entity.name);
    let now = db::now_ms();

    let entity_id = match find_entity(pool, &canonical, Some(&entity.entity_type)).await? {
        Some(existing_id) => {
            let existing_attrs: Option<String> =
                sqlx::query_scalar("SELECT attributes FROM kg_entities WHERE id = ?")
                    .bind(&existing_id)
                    .fetch_one(pool)
                    .await?;
            let merged = merge_attributes(existing_attrs.as_deref(), &entity.attributes);

            sqlx::query(
                "UPDATE kg_entities
                 SET confidence = MAX(confidence, ?),
                     attributes = ?,
                     location_text = COALESCE(location_text, ?),
                     updated_at = ?
                 WHERE id = ?",
            )
            .bind(entity.confidence)
            .bind(merged)
            .bind(&entity.location_text)
            .bind(now)
            .bind(&existing_id)
            .execute(pool)
            .await?;

            let evidence = store_evidence(pool, document_id, &existing_id, entity).await?;
            return Ok((false, evidence));
        }
        None => Uuid::new_v4().to_string(),
    };

    // Embedding is best-effort; an unreachable provider must not block
    // graph writes.
    let embedding_blob = if embedding_config.is_enabled() {
        let text = format!("{} {}", entity.name, entity.entity_type);
        match embed_entity_text(embedding_config, &text).await {
            Ok(vector) => Some(embedding::vec_to_blob(&vector)),
            Err(e) => {
                warn!(name = %entity.name, error = %e, "entity embedding failed");
                None
            }
        }
    } else {
        None
    };

    sqlx::query(
        r#"
        INSERT INTO kg_entities (id, entity_type, name, canonical_name, entity_subtype,
            attributes, confidence, location_text, embedding, extraction_method,
            is_deleted, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 'llm_extracted', 0, ?, ?)
        "#,
    )
    .bind(&entity_id)
    .bind(&entity.entity_type)
    .bind(&entity.name)
    .bind(&canonical)
    .bind(&entity.entity_subtype)
    .bind(serde_json::Value::Object(entity.attributes.clone()).to_string())
    .bind(entity.confidence)
    .bind(&entity.location_text)
    .bind(embedding_blob)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    let evidence = store_evidence(pool, document_id, &entity_id, entity).await?;
    Ok((true, evidence))
}

async fn embed_entity_text(config: &EmbeddingConfig, text: &str) -> Result<Vec<f32>> {
    let provider = embedding::create_provider(config)?;
    embedding::embed_query(provider.as_ref(), config, text).await
}

/// Returns `Some((created, evidence_rows_added))`, or `None` when an
/// endpoint cannot be resolved.
async fn store_relationship(
    pool: &SqlitePool,
    document_id: &str,
    rel: &ExtractedRelationship,
) -> Result<Option<(bool, u64)>> {
    let source_canonical = normalize_name(&rel.source_name);
    let target_canonical = normalize_name(&rel.target_name);

    let mut source_id = find_entity(pool, &source_canonical, Some(&rel.source_type)).await?;
    let mut target_id = find_entity(pool, &target_canonical, Some(&rel.target_type)).await?;

    // The LLM sometimes mislabels an endpoint's type; fall back to a
    // name-only match before giving up.
    if source_id.is_none() {
        source_id = find_entity(pool, &source_canonical, None).await?;
    }
    if target_id.is_none() {
        target_id = find_entity(pool, &target_canonical, None).await?;
    }

    let (Some(source_id), Some(target_id)) = (source_id, target_id) else {
        warn!(
            source = %rel.source_name,
            target = %rel.target_name,
            relationship_type = %rel.relationship_type,
            "cannot resolve relationship endpoints, skipping"
        );
        return Ok(None);
    };

    let now = db::now_ms();
    let existing: Option<(String, Option<String>)> = sqlx::query_as(
        "SELECT id, attributes FROM kg_relationships
         WHERE source_entity_id = ? AND target_entity_id = ? AND relationship_type = ?",
    )
    .bind(&source_id)
    .bind(&target_id)
    .bind(&rel.relationship_type)
    .fetch_optional(pool)
    .await?;

    let (relationship_id, created) = match existing {
        Some((id, attrs)) => {
            let merged = merge_attributes(attrs.as_deref(), &rel.attributes);
            sqlx::query(
                "UPDATE kg_relationships
                 SET confidence = MAX(confidence, ?), attributes = ?, updated_at = ?
                 WHERE id = ?",
            )
            .bind(rel.confidence)
            .bind(merged)
            .bind(now)
            .bind(&id)
            .execute(pool)
            .await?;
            (id, false)
        }
        None => {
            let id = Uuid::new_v4().to_string();
            sqlx::query(
                r#"
                INSERT INTO kg_relationships (id, source_entity_id, target_entity_id,
                    relationship_type, attributes, confidence, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&id)
            .bind(&source_id)
            .bind(&target_id)
            .bind(&rel.relationship_type)
            .bind(serde_json::Value::Object(rel.attributes.clone()).to_string())
            .bind(rel.confidence)
            .bind(now)
            .bind(now)
            .execute(pool)
            .await?;
            (id, true)
        }
    };

    let evidence = store_relationship_evidence(pool, document_id, &relationship_id, rel).await?;
    Ok(Some((created, evidence)))
}

async fn find_entity(
    pool: &SqlitePool,
    canonical_name: &str,
    entity_type: Option<&str>,
) -> Result<Option<String>> {
    let id = match entity_type {
        Some(entity_type) => {
            sqlx::query_scalar(
                "SELECT id FROM kg_entities
                 WHERE canonical_name = ? AND entity_type = ? AND is_deleted = 0",
            )
            .bind(canonical_name)
            .bind(entity_type)
            .fetch_optional(pool)
            .await?
        }
        None => {
            sqlx::query_scalar(
                "SELECT id FROM kg_entities WHERE canonical_name = ? AND is_deleted = 0",
            )
            .bind(canonical_name)
            .fetch_optional(pool)
            .await?
        }
    };
    Ok(id)
}

/// Merges attribute maps with existing keys winning over extracted ones.
fn merge_attributes(
    existing_json: Option<&str>,
    extracted: &serde_json::Map<String, serde_json::Value>,
) -> String {
    let mut merged = extracted.clone();
    if let Some(existing) = existing_json
        .and_then(|s| serde_json::from_str::<serde_json::Value>(s).ok())
        .and_then(|v| v.as_object().cloned())
    {
        for (key, value) in existing {
            merged.insert(key, value);
        }
    }
    serde_json::Value::Object(merged).to_string()
}

fn evidence_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

async fn store_evidence(
    pool: &SqlitePool,
    document_id: &str,
    entity_id: &str,
    entity: &ExtractedEntity,
) -> Result<u64> {
    let Some(text) = entity.evidence_text.as_deref().filter(|t| !t.trim().is_empty()) else {
        return Ok(0);
    };
    insert_evidence(pool, document_id, Some(entity_id), None, text, entity.confidence).await
}

async fn store_relationship_evidence(
    pool: &SqlitePool,
    document_id: &str,
    relationship_id: &str,
    rel: &ExtractedRelationship,
) -> Result<u64> {
    let Some(text) = rel.evidence_text.as_deref().filter(|t| !t.trim().is_empty()) else {
        return Ok(0);
    };
    insert_evidence(pool, document_id, None, Some(relationship_id), text, rel.confidence).await
}

/// The unique indexes on `(entity_id | relationship_id, document_id,
/// evidence_hash)` turn re-inserts of the same phrase into no-ops.
async fn insert_evidence(
    pool: &SqlitePool,
    document_id: &str,
    entity_id: Option<&str>,
    relationship_id: Option<&str>,
    text: &str,
    confidence: f64,
) -> Result<u64> {
    let result = sqlx::query(
        r#"
        INSERT INTO kg_evidence (id, entity_id, relationship_id, document_id,
            evidence_text, evidence_hash, extraction_confidence, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT DO NOTHING
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(entity_id)
    .bind(relationship_id)
    .bind(document_id)
    .bind(text)
    .bind(evidence_hash(text))
    .bind(confidence)
    .bind(db::now_ms())
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

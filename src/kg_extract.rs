//! LLM-driven entity and relationship extraction.
//!
//! Chunks a document at paragraph boundaries, asks the configured LLM for
//! entities per chunk, then for relationships between the entities it found.
//! Responses are parsed leniently: malformed list items are skipped, and a
//! reply wrapped in prose falls back to its outermost `{...}` slice.

use std::time::Duration;

use anyhow::{bail, Result};
use serde_json::Value;
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use crate::config::{Config, LlmConfig};
use crate::db;
use crate::documents;
use crate::kg_store::{self, StoreOutcome};
use crate::llm::{self, LlmClient};
use crate::migrate;
use crate::models::{
    Document, ExtractedEntity, ExtractedRelationship, ENTITY_TYPES, RELATIONSHIP_TYPES,
};

const MAX_CHUNK_CHARS: usize = 3000;

pub struct KgExtractor<'a> {
    llm: &'a dyn LlmClient,
    timeout: Duration,
    max_retries: u32,
}

impl<'a> KgExtractor<'a> {
    pub fn new(llm: &'a dyn LlmClient, config: &LlmConfig) -> Self {
        Self {
            llm,
            timeout: Duration::from_secs(config.timeout_secs),
            max_retries: config.max_retries,
        }
    }

    /// Runs the full pipeline over one document's text.
    ///
    /// Extraction is best-effort: a chunk whose calls keep failing
    /// contributes nothing rather than failing the document.
    pub async fn extract_from_text(
        &self,
        doc: &Document,
        content: &str,
    ) -> (Vec<ExtractedEntity>, Vec<ExtractedRelationship>) {
        let chunks = chunk_text(content, MAX_CHUNK_CHARS);
        info!(
            document_id = %doc.id,
            chunks = chunks.len(),
            model = self.llm.model_name(),
            "extracting knowledge graph"
        );

        let mut all_entities: Vec<ExtractedEntity> = Vec::new();
        let mut all_relationships: Vec<ExtractedRelationship> = Vec::new();

        for (i, chunk) in chunks.iter().enumerate() {
            debug!(chunk = i + 1, total = chunks.len(), chars = chunk.len(), "processing chunk");

            let entities = self.extract_entities(chunk, doc).await;
            if !entities.is_empty() {
                let relationships = self.extract_relationships(chunk, &entities).await;
                all_relationships.extend(relationships);
            }
            all_entities.extend(entities);
        }

        let entities = deduplicate_entities(all_entities);
        let relationships = deduplicate_relationships(all_relationships);
        info!(
            document_id = %doc.id,
            entities = entities.len(),
            relationships = relationships.len(),
            "extraction complete"
        );
        (entities, relationships)
    }

    async fn extract_entities(&self, chunk: &str, doc: &Document) -> Vec<ExtractedEntity> {
        let prompt = build_entity_prompt(chunk, doc);

        for attempt in 0..=self.max_retries {
            match tokio::time::timeout(self.timeout, self.llm.generate(&prompt)).await {
                Ok(Ok(response)) => {
                    let entities = parse_entity_response(&response);
                    if !entities.is_empty() {
                        return entities;
                    }
                    warn!(attempt, "entity extraction returned nothing usable");
                }
                Ok(Err(e)) => warn!(attempt, error = %e, "entity extraction error"),
                Err(_) => warn!(attempt, "entity extraction timed out"),
            }
        }

        warn!("entity extraction failed after all retries");
        Vec::new()
    }

    async fn extract_relationships(
        &self,
        chunk: &str,
        entities: &[ExtractedEntity],
    ) -> Vec<ExtractedRelationship> {
        let prompt = build_relationship_prompt(chunk, entities);

        for attempt in 0..=self.max_retries {
            match tokio::time::timeout(self.timeout, self.llm.generate(&prompt)).await {
                Ok(Ok(response)) => {
                    let relationships = parse_relationship_response(&response);
                    if !relationships.is_empty() {
                        return relationships;
                    }
                    warn!(attempt, "relationship extraction returned nothing usable");
                }
                Ok(Err(e)) => warn!(attempt, error = %e, "relationship extraction error"),
                Err(_) => warn!(attempt, "relationship extraction timed out"),
            }
        }

        warn!("relationship extraction failed after all retries");
        Vec::new()
    }
}

/// Runs extraction end to end for one stored document and tracks it through
/// `kg_extraction_status` (`processing` → `completed` | `failed`).
///
/// Fails when the document is missing or has no content; a storage failure
/// lands the document in `failed` and propagates.
pub async fn run_extraction(
    pool: &SqlitePool,
    config: &Config,
    llm: &dyn LlmClient,
    document_id: &str,
) -> Result<StoreOutcome> {
    let doc = documents::get_document(pool, document_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("document not found: {}", document_id))?;
    let content = match doc.content.as_deref() {
        Some(c) if !c.trim().is_empty() => c.to_string(),
        _ => bail!("document {} has no content to extract from", document_id),
    };

    documents::set_kg_status(pool, document_id, "processing").await?;

    let extractor = KgExtractor::new(llm, &config.llm);
    let (entities, relationships) = extractor.extract_from_text(&doc, &content).await;

    match kg_store::store_extraction(pool, &config.embedding, document_id, &entities, &relationships)
        .await
    {
        Ok(outcome) => {
            documents::set_kg_status(pool, document_id, "completed").await?;
            Ok(outcome)
        }
        Err(e) => {
            documents::set_kg_status(pool, document_id, "failed").await?;
            Err(e)
        }
    }
}

// ============ CLI entry point ============

/// `resil extract` entry point: runs extraction for one stored document and
/// prints what the graph store did with the results.
pub async fn run_extract(config: &Config, document_id: &str) -> Result<()> {
    let Some(client) = llm::create_client(&config.llm)? else {
        bail!("LLM extraction is disabled; set [llm] provider in the config");
    };

    let pool = db::connect(config).await?;
    migrate::run_migrations(&pool).await?;

    println!(
        "Extracting knowledge graph from {} with {}",
        document_id,
        client.model_name()
    );
    let outcome = run_extraction(&pool, config, client.as_ref(), document_id).await?;

    println!(
        "  entities:      {} created, {} merged",
        outcome.entities_created, outcome.entities_merged
    );
    println!(
        "  relationships: {} created, {} merged",
        outcome.relationships_created, outcome.relationships_merged
    );
    println!("  evidence rows: {}", outcome.evidence_added);
    println!("ok");

    pool.close().await;
    Ok(())
}

// ============ Prompts ============

fn build_entity_prompt(chunk: &str, doc: &Document) -> String {
    let mut meta_lines: Vec<String> = Vec::new();
    if let Some(ref title) = doc.title {
        meta_lines.push(format!("Document title: {}", title));
    }
    if let Some(ref hazard) = doc.hazard_type {
        meta_lines.push(format!("Hazard type: {}", hazard));
    }
    if let Some(ref location) = doc.location {
        meta_lines.push(format!("Location context: {}", location));
    }
    if let Some(ref tags) = doc.tags {
        meta_lines.push(format!("Tags: {}", tags));
    }
    let meta_section = if meta_lines.is_empty() {
        "No metadata available.".to_string()
    } else {
        meta_lines.join("\n")
    };

    format!(
        r#"You are a knowledge graph entity extractor for a community disaster resilience system.

Extract all relevant entities from the text below. Each entity must be one of these types:

- HazardType: Natural or human-caused hazards (e.g., bushfire, flood, cyclone, drought, earthquake)
- Community: Towns, suburbs, neighborhoods, demographic groups, vulnerable populations
- Agency: Organizations, government bodies, emergency services, NGOs, community groups
- Location: Specific places, infrastructure sites, evacuation zones, landmarks
- Resource: Physical resources, shelters, equipment, supplies, funding, personnel
- Action: Mitigation measures, response actions, recovery programs, preparedness activities

## Document metadata
{meta}

## Text to extract from
{chunk}

## Output format
Respond ONLY with a valid JSON object:

{{
  "entities": [
    {{
      "entity_type": "HazardType",
      "name": "Bushfire",
      "entity_subtype": "wildfire",
      "attributes": {{"severity": "high", "season": "summer"}},
      "confidence": 0.9,
      "evidence_text": "The bushfire season typically peaks in summer...",
      "location_text": null
    }}
  ]
}}

Rules:
- entity_type MUST be one of: {entity_types}
- confidence is 0.0 to 1.0 (how certain you are this entity exists in the text)
- evidence_text is the phrase or sentence from the text supporting this entity
- location_text is a place name if the entity has a geographic reference
- Do NOT invent entities not supported by the text
- Include ALL entities you can find, even low-confidence ones (0.3+)
"#,
        meta = meta_section,
        chunk = chunk,
        entity_types = ENTITY_TYPES.join(", "),
    )
}

fn build_relationship_prompt(chunk: &str, entities: &[ExtractedEntity]) -> String {
    let entity_list = entities
        .iter()
        .map(|e| format!("- {} ({})", e.name, e.entity_type))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        r#"You are a knowledge graph relationship extractor for a community disaster resilience system.

Given the following entities already extracted from the text, identify relationships between them.

## Extracted entities
{entity_list}

## Relationship types to look for
{relationship_types}

Relationship type meanings:
- occursIn: A hazard or event occurs in a location/community
- hasHazardType: An entity is associated with a hazard type
- serves: An agency/resource serves a community
- responsibleFor: An agency is responsible for an action or area
- locatedIn: An entity is physically located in a place
- targets: An action targets a community, hazard, or resource
- owns: An agency owns or manages a resource
- implementedBy: An action is implemented by an agency
- dependsOn: An entity depends on another entity
- partOf: An entity is part of a larger entity

## Text
{chunk}

## Output format
Respond ONLY with a valid JSON object:

{{
  "relationships": [
    {{
      "source_name": "SES",
      "source_type": "Agency",
      "target_name": "Smithville",
      "target_type": "Community",
      "relationship_type": "serves",
      "attributes": {{}},
      "confidence": 0.85,
      "evidence_text": "The SES serves the Smithville community..."
    }}
  ]
}}

Rules:
- source_name and target_name MUST match entity names from the list above
- relationship_type MUST be one of: {relationship_types}
- confidence is 0.0 to 1.0
- Only include relationships supported by the text
- evidence_text is the phrase from the text supporting this relationship
"#,
        entity_list = entity_list,
        relationship_types = RELATIONSHIP_TYPES.join(", "),
        chunk = chunk,
    )
}

// ============ Response parsing ============

/// Parses a JSON object out of an LLM reply. Tries the whole reply first,
/// then the outermost `{...}` slice for models that wrap JSON in prose.
fn parse_json_object(response: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str::<Value>(response) {
        if value.is_object() {
            return Some(value);
        }
    }

    let start = response.find('{')?;
    let end = response.rfind('}')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str::<Value>(&response[start..=end]) {
        Ok(value) if value.is_object() => Some(value),
        _ => {
            warn!(
                "failed to parse JSON from LLM response: {}...",
                &response.chars().take(200).collect::<String>()
            );
            None
        }
    }
}

fn parse_entity_response(response: &str) -> Vec<ExtractedEntity> {
    let Some(data) = parse_json_object(response) else {
        return Vec::new();
    };
    let Some(items) = data.get("entities").and_then(|e| e.as_array()) else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| {
            let entity: ExtractedEntity = match serde_json::from_value(item.clone()) {
                Ok(entity) => entity,
                Err(e) => {
                    debug!(error = %e, "skipping malformed entity");
                    return None;
                }
            };
            let name = entity.name.trim();
            if name.is_empty() || !ENTITY_TYPES.contains(&entity.entity_type.as_str()) {
                return None;
            }
            Some(ExtractedEntity {
                name: name.to_string(),
                ..entity
            })
        })
        .collect()
}

fn parse_relationship_response(response: &str) -> Vec<ExtractedRelationship> {
    let Some(data) = parse_json_object(response) else {
        return Vec::new();
    };
    let Some(items) = data.get("relationships").and_then(|r| r.as_array()) else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| {
            let rel: ExtractedRelationship = match serde_json::from_value(item.clone()) {
                Ok(rel) => rel,
                Err(e) => {
                    debug!(error = %e, "skipping malformed relationship");
                    return None;
                }
            };
            let source = rel.source_name.trim();
            let target = rel.target_name.trim();
            if source.is_empty()
                || target.is_empty()
                || !RELATIONSHIP_TYPES.contains(&rel.relationship_type.as_str())
            {
                return None;
            }
            Some(ExtractedRelationship {
                source_name: source.to_string(),
                target_name: target.to_string(),
                ..rel
            })
        })
        .collect()
}

// ============ Chunking and dedup ============

/// Splits content at paragraph boundaries, packing paragraphs up to
/// `max_chars` per chunk and carrying the previous chunk's last paragraph
/// forward as overlap.
pub fn chunk_text(content: &str, max_chars: usize) -> Vec<String> {
    if content.len() <= max_chars {
        return vec![content.to_string()];
    }

    let mut chunks: Vec<String> = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut current_len = 0usize;

    for para in content.split("\n\n") {
        let para = para.trim();
        if para.is_empty() {
            continue;
        }

        let para_len = para.len() + 2;
        if current_len + para_len > max_chars && !current.is_empty() {
            chunks.push(current.join("\n\n"));
            // Keep the last paragraph for context.
            let overlap = current[current.len() - 1];
            current = vec![overlap];
            current_len = overlap.len() + 2;
        }

        current.push(para);
        current_len += para_len;
    }

    if !current.is_empty() {
        chunks.push(current.join("\n\n"));
    }

    if chunks.is_empty() {
        vec![content.to_string()]
    } else {
        chunks
    }
}

/// Keyed by (lowercased trimmed name, type), keeping the highest confidence.
fn deduplicate_entities(entities: Vec<ExtractedEntity>) -> Vec<ExtractedEntity> {
    let mut seen: Vec<ExtractedEntity> = Vec::new();
    for entity in entities {
        let key = (entity.name.to_lowercase(), entity.entity_type.clone());
        match seen
            .iter_mut()
            .find(|e| e.name.to_lowercase() == key.0 && e.entity_type == key.1)
        {
            Some(existing) => {
                if entity.confidence > existing.confidence {
                    *existing = entity;
                }
            }
            None => seen.push(entity),
        }
    }
    seen
}

/// Keyed by (source, target, type), keeping the highest confidence.
fn deduplicate_relationships(
    relationships: Vec<ExtractedRelationship>,
) -> Vec<ExtractedRelationship> {
    let mut seen: Vec<ExtractedRelationship> = Vec::new();
    for rel in relationships {
        match seen.iter_mut().find(|r| {
            r.source_name.to_lowercase() == rel.source_name.to_lowercase()
                && r.target_name.to_lowercase() == rel.target_name.to_lowercase()
                && r.relationship_type == rel.relationship_type
        }) {
            Some(existing) => {
                if rel.confidence > existing.confidence {
                    *existing = rel;
                }
            }
            None => seen.push(rel),
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;
    use crate::models::ProcessingStatus;

    fn doc() -> Document {
        Document {
            id: "doc-1".to_string(),
            title: Some("Bushfire readiness plan".to_string()),
            description: None,
            tags: Some("bushfire, preparedness".to_string()),
            location: Some("Yarra Ranges".to_string()),
            hazard_type: Some("bushfire".to_string()),
            source: None,
            content: None,
            processing_status: ProcessingStatus::Completed,
            needs_full_processing: false,
            processing_mode: "simple_text".to_string(),
            raw_file_path: None,
            metadata: None,
            sections: None,
            kg_extraction_status: "pending".to_string(),
            sync_version: 1,
            created_at: 0,
            updated_at: 0,
            processed_at: None,
        }
    }

    fn config() -> LlmConfig {
        LlmConfig::default()
    }

    const ENTITY_REPLY: &str = r#"{"entities": [
        {"entity_type": "Agency", "name": "CFA", "confidence": 0.9,
         "evidence_text": "The CFA coordinates bushfire response"},
        {"entity_type": "HazardType", "name": "Bushfire", "confidence": 0.95,
         "evidence_text": "bushfire season"}
    ]}"#;

    const REL_REPLY: &str = r#"{"relationships": [
        {"source_name": "CFA", "source_type": "Agency",
         "target_name": "Bushfire", "target_type": "HazardType",
         "relationship_type": "responsibleFor", "confidence": 0.8,
         "evidence_text": "The CFA coordinates bushfire response"}
    ]}"#;

    #[tokio::test]
    async fn extracts_entities_then_relationships() {
        let mock = MockLlmClient::new(&[ENTITY_REPLY, REL_REPLY]);
        let extractor = KgExtractor::new(&mock, &config());

        let (entities, relationships) = extractor
            .extract_from_text(&doc(), "The CFA coordinates bushfire response.")
            .await;

        assert_eq!(entities.len(), 2);
        assert_eq!(relationships.len(), 1);
        assert_eq!(relationships[0].relationship_type, "responsibleFor");

        let prompts = mock.prompts();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[0].contains("Document title: Bushfire readiness plan"));
        assert!(prompts[0].contains("Hazard type: bushfire"));
        assert!(prompts[1].contains("- CFA (Agency)"));
    }

    #[tokio::test]
    async fn no_entities_means_no_relationship_call() {
        // Empty entity lists are retried, then extraction gives up; the
        // relationship prompt must never be sent.
        let mock = MockLlmClient::new(&[
            r#"{"entities": []}"#,
            r#"{"entities": []}"#,
            r#"{"entities": []}"#,
        ]);
        let extractor = KgExtractor::new(&mock, &config());

        let (entities, relationships) =
            extractor.extract_from_text(&doc(), "Nothing of note.").await;
        assert!(entities.is_empty());
        assert!(relationships.is_empty());
        assert_eq!(mock.prompts().len(), 3); // 1 + max_retries attempts
    }

    #[tokio::test]
    async fn run_extraction_tracks_status_and_stores() {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::migrate::run_migrations(&pool).await.unwrap();

        let app_config: Config =
            toml::from_str("[deployment]\nmode = \"local\"\n[storage]\ndb_path = \":memory:\"\n")
                .unwrap();

        let stored = documents::insert_document(&pool, documents::NewDocument::default())
            .await
            .unwrap();
        sqlx::query(
            "UPDATE documents
             SET content = 'The CFA coordinates bushfire response.',
                 processing_status = 'completed'
             WHERE id = ?",
        )
        .bind(&stored.id)
        .execute(&pool)
        .await
        .unwrap();

        let mock = MockLlmClient::new(&[ENTITY_REPLY, REL_REPLY]);
        let outcome = run_extraction(&pool, &app_config, &mock, &stored.id)
            .await
            .unwrap();
        assert_eq!(outcome.entities_created, 2);
        assert_eq!(outcome.relationships_created, 1);

        let fetched = documents::get_document(&pool, &stored.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.kg_extraction_status, "completed");

        let empty = documents::insert_document(&pool, documents::NewDocument::default())
            .await
            .unwrap();
        let err = run_extraction(&pool, &app_config, &mock, &empty.id)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no content"));
    }

    #[test]
    fn parser_recovers_json_wrapped_in_prose() {
        let wrapped = format!("Here is what I found:\n{}\nHope that helps!", ENTITY_REPLY);
        let entities = parse_entity_response(&wrapped);
        assert_eq!(entities.len(), 2);
        assert_eq!(entities[0].name, "CFA");
    }

    #[test]
    fn parser_skips_malformed_and_offcatalogue_items() {
        let reply = r#"{"entities": [
            {"entity_type": "Agency", "name": "SES"},
            {"entity_type": "Starship", "name": "Enterprise"},
            {"entity_type": "Agency", "name": "   "},
            {"name": "missing type"},
            "not even an object"
        ]}"#;
        let entities = parse_entity_response(reply);
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].name, "SES");
        assert_eq!(entities[0].confidence, 0.5);
    }

    #[test]
    fn parser_rejects_offcatalogue_relationship_types() {
        let reply = r#"{"relationships": [
            {"source_name": "A", "target_name": "B", "relationship_type": "friendsWith"},
            {"source_name": "A", "target_name": "B", "relationship_type": "serves"}
        ]}"#;
        let rels = parse_relationship_response(reply);
        assert_eq!(rels.len(), 1);
        assert_eq!(rels[0].relationship_type, "serves");
        assert_eq!(rels[0].source_type, "");
    }

    #[test]
    fn short_content_is_a_single_chunk() {
        let chunks = chunk_text("one paragraph", 3000);
        assert_eq!(chunks, vec!["one paragraph".to_string()]);
    }

    #[test]
    fn chunking_packs_and_overlaps_paragraphs() {
        let paras: Vec<String> = (0..10).map(|i| format!("paragraph {} {}", i, "x".repeat(40))).collect();
        let content = paras.join("\n\n");
        let chunks = chunk_text(&content, 120);

        assert!(chunks.len() > 1);
        for pair in chunks.windows(2) {
            // The next chunk starts with the previous chunk's last paragraph.
            let last_para = pair[0].split("\n\n").last().unwrap();
            assert!(pair[1].starts_with(last_para));
        }
    }

    #[test]
    fn entity_dedup_keeps_highest_confidence() {
        let mk = |name: &str, ty: &str, conf: f64| ExtractedEntity {
            entity_type: ty.to_string(),
            name: name.to_string(),
            entity_subtype: None,
            attributes: serde_json::Map::new(),
            confidence: conf,
            evidence_text: None,
            location_text: None,
        };
        let deduped = deduplicate_entities(vec![
            mk("CFA", "Agency", 0.6),
            mk("cfa", "Agency", 0.9),
            mk("CFA", "Resource", 0.4),
        ]);
        assert_eq!(deduped.len(), 2);
        let agency = deduped.iter().find(|e| e.entity_type == "Agency").unwrap();
        assert_eq!(agency.confidence, 0.9);
    }
}

//! Read-only knowledge-graph queries.
//!
//! Listing, detail, hybrid search (text first, then embedding similarity),
//! summary statistics, coverage gaps, and bounded network traversal.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use anyhow::{bail, Result};
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::config::{Config, EmbeddingConfig};
use crate::db;
use crate::embedding;
use crate::migrate;

/// Compact entity row used by list, search, and gap responses.
#[derive(Debug, Clone, Serialize)]
pub struct EntitySummary {
    pub id: String,
    pub name: String,
    pub entity_type: String,
    pub entity_subtype: Option<String>,
    pub confidence: f64,
    pub location_text: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectedRelationship {
    pub id: String,
    pub relationship_type: String,
    pub confidence: f64,
    pub attributes: serde_json::Value,
    /// The entity on the far end of the edge.
    pub entity_id: String,
    pub entity_name: String,
    pub entity_type: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvidenceItem {
    pub id: String,
    pub document_id: String,
    pub evidence_text: String,
    pub extraction_confidence: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntityDetail {
    pub id: String,
    pub entity_type: String,
    pub entity_subtype: Option<String>,
    pub name: String,
    pub attributes: serde_json::Value,
    pub location_text: Option<String>,
    pub confidence: f64,
    pub extraction_method: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub outgoing_relationships: Vec<ConnectedRelationship>,
    pub incoming_relationships: Vec<ConnectedRelationship>,
    pub evidence: Vec<EvidenceItem>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GraphStatistics {
    pub total_entities: i64,
    pub total_relationships: i64,
    pub entity_counts: BTreeMap<String, i64>,
    pub relationship_counts: BTreeMap<String, i64>,
    pub avg_confidence: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkNode {
    pub id: String,
    pub name: String,
    pub entity_type: String,
    pub entity_subtype: Option<String>,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkEdge {
    pub id: String,
    pub source: String,
    pub target: String,
    pub relationship_type: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkGraph {
    pub nodes: Vec<NetworkNode>,
    pub edges: Vec<NetworkEdge>,
}

fn summary_from_row(row: &sqlx::sqlite::SqliteRow) -> EntitySummary {
    EntitySummary {
        id: row.get("id"),
        name: row.get("name"),
        entity_type: row.get("entity_type"),
        entity_subtype: row.get("entity_subtype"),
        confidence: row.get("confidence"),
        location_text: row.get("location_text"),
    }
}

/// Lists entities with optional type filter and case-insensitive name or
/// location match. Returns the page and the total match count.
pub async fn list_entities(
    pool: &SqlitePool,
    entity_type: Option<&str>,
    name_query: Option<&str>,
    limit: i64,
    offset: i64,
) -> Result<(Vec<EntitySummary>, i64)> {
    let mut where_clause = String::from("is_deleted = 0");
    if entity_type.is_some() {
        where_clause.push_str(" AND entity_type = ?");
    }
    if name_query.is_some() {
        where_clause.push_str(" AND (LOWER(name) LIKE ? OR LOWER(location_text) LIKE ?)");
    }
    let pattern = name_query.map(|q| format!("%{}%", q.to_lowercase()));

    let count_sql = format!("SELECT COUNT(*) FROM kg_entities WHERE {}", where_clause);
    let mut count_query = sqlx::query_scalar(&count_sql);
    if let Some(t) = entity_type {
        count_query = count_query.bind(t);
    }
    if let Some(ref p) = pattern {
        count_query = count_query.bind(p).bind(p);
    }
    let total: i64 = count_query.fetch_one(pool).await?;

    let page_sql = format!(
        "SELECT id, name, entity_type, entity_subtype, confidence, location_text
         FROM kg_entities WHERE {}
         ORDER BY confidence DESC, name ASC LIMIT ? OFFSET ?",
        where_clause
    );
    let mut page_query = sqlx::query(&page_sql);
    if let Some(t) = entity_type {
        page_query = page_query.bind(t);
    }
    if let Some(ref p) = pattern {
        page_query = page_query.bind(p).bind(p);
    }
    let rows = page_query.bind(limit).bind(offset).fetch_all(pool).await?;

    Ok((rows.iter().map(summary_from_row).collect(), total))
}

pub async fn entity_detail(pool: &SqlitePool, entity_id: &str) -> Result<Option<EntityDetail>> {
    let row = sqlx::query(
        "SELECT id, entity_type, entity_subtype, name, attributes, location_text,
                confidence, extraction_method, created_at, updated_at
         FROM kg_entities WHERE id = ? AND is_deleted = 0",
    )
    .bind(entity_id)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let outgoing = connected_relationships(pool, entity_id, true).await?;
    let incoming = connected_relationships(pool, entity_id, false).await?;

    let evidence_rows = sqlx::query(
        "SELECT id, document_id, evidence_text, extraction_confidence
         FROM kg_evidence WHERE entity_id = ? ORDER BY created_at ASC",
    )
    .bind(entity_id)
    .fetch_all(pool)
    .await?;
    let evidence = evidence_rows
        .iter()
        .map(|e| EvidenceItem {
            id: e.get("id"),
            document_id: e.get("document_id"),
            evidence_text: e.get("evidence_text"),
            extraction_confidence: e.get("extraction_confidence"),
        })
        .collect();

    let attributes: String = row.get("attributes");
    Ok(Some(EntityDetail {
        id: row.get("id"),
        entity_type: row.get("entity_type"),
        entity_subtype: row.get("entity_subtype"),
        name: row.get("name"),
        attributes: serde_json::from_str(&attributes).unwrap_or(serde_json::json!({})),
        location_text: row.get("location_text"),
        confidence: row.get("confidence"),
        extraction_method: row.get("extraction_method"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        outgoing_relationships: outgoing,
        incoming_relationships: incoming,
        evidence,
    }))
}

/// Edges touching `entity_id`, joined with the entity on the far end.
async fn connected_relationships(
    pool: &SqlitePool,
    entity_id: &str,
    outgoing: bool,
) -> Result<Vec<ConnectedRelationship>> {
    let sql = if outgoing {
        "SELECT r.id, r.relationship_type, r.confidence, r.attributes,
                e.id AS entity_id, e.name AS entity_name, e.entity_type AS entity_type
         FROM kg_relationships r
         JOIN kg_entities e ON e.id = r.target_entity_id
         WHERE r.source_entity_id = ?
         ORDER BY r.confidence DESC"
    } else {
        "SELECT r.id, r.relationship_type, r.confidence, r.attributes,
                e.id AS entity_id, e.name AS entity_name, e.entity_type AS entity_type
         FROM kg_relationships r
         JOIN kg_entities e ON e.id = r.source_entity_id
         WHERE r.target_entity_id = ?
         ORDER BY r.confidence DESC"
    };

    let rows = sqlx::query(sql).bind(entity_id).fetch_all(pool).await?;
    Ok(rows
        .iter()
        .map(|row| {
            let attributes: String = row.get("attributes");
            ConnectedRelationship {
                id: row.get("id"),
                relationship_type: row.get("relationship_type"),
                confidence: row.get("confidence"),
                attributes: serde_json::from_str(&attributes).unwrap_or(serde_json::json!({})),
                entity_id: row.get("entity_id"),
                entity_name: row.get("entity_name"),
                entity_type: row.get("entity_type"),
            }
        })
        .collect())
}

/// Two-phase search: substring matches first, then embedding similarity to
/// fill the remainder when a provider is configured.
pub async fn search_entities(
    pool: &SqlitePool,
    embedding_config: &EmbeddingConfig,
    query: &str,
    limit: i64,
) -> Result<Vec<EntitySummary>> {
    let pattern = format!("%{}%", query.to_lowercase());
    let rows = sqlx::query(
        "SELECT id, name, entity_type, entity_subtype, confidence, location_text
         FROM kg_entities
         WHERE is_deleted = 0
           AND (LOWER(name) LIKE ? OR LOWER(location_text) LIKE ?)
         ORDER BY confidence DESC LIMIT ?",
    )
    .bind(&pattern)
    .bind(&pattern)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    let mut results: Vec<EntitySummary> = rows.iter().map(summary_from_row).collect();
    let mut seen: HashSet<String> = results.iter().map(|e| e.id.clone()).collect();

    let remaining = limit - results.len() as i64;
    if remaining > 0 && embedding_config.is_enabled() {
        let provider = embedding::create_provider(embedding_config)?;
        let query_vector = embedding::embed_query(provider.as_ref(), embedding_config, query).await?;

        let candidate_rows = sqlx::query(
            "SELECT id, name, entity_type, entity_subtype, confidence, location_text, embedding
             FROM kg_entities WHERE is_deleted = 0 AND embedding IS NOT NULL",
        )
        .fetch_all(pool)
        .await?;

        let mut scored: Vec<(f32, EntitySummary)> = candidate_rows
            .iter()
            .filter_map(|row| {
                let summary = summary_from_row(row);
                if seen.contains(&summary.id) {
                    return None;
                }
                let blob: Vec<u8> = row.get("embedding");
                let vector = embedding::blob_to_vec(&blob);
                Some((embedding::cosine_similarity(&query_vector, &vector), summary))
            })
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        for (_, summary) in scored.into_iter().take(remaining as usize) {
            seen.insert(summary.id.clone());
            results.push(summary);
        }
    }

    Ok(results)
}

pub async fn statistics(pool: &SqlitePool) -> Result<GraphStatistics> {
    let entity_rows = sqlx::query(
        "SELECT entity_type, COUNT(*) AS n FROM kg_entities
         WHERE is_deleted = 0 GROUP BY entity_type",
    )
    .fetch_all(pool)
    .await?;
    let entity_counts: BTreeMap<String, i64> = entity_rows
        .iter()
        .map(|row| (row.get::<String, _>("entity_type"), row.get::<i64, _>("n")))
        .collect();
    let total_entities = entity_counts.values().sum();

    let rel_rows = sqlx::query(
        "SELECT relationship_type, COUNT(*) AS n FROM kg_relationships GROUP BY relationship_type",
    )
    .fetch_all(pool)
    .await?;
    let relationship_counts: BTreeMap<String, i64> = rel_rows
        .iter()
        .map(|row| {
            (
                row.get::<String, _>("relationship_type"),
                row.get::<i64, _>("n"),
            )
        })
        .collect();
    let total_relationships = relationship_counts.values().sum();

    let avg: Option<f64> =
        sqlx::query_scalar("SELECT AVG(confidence) FROM kg_entities WHERE is_deleted = 0")
            .fetch_one(pool)
            .await?;
    let avg_confidence = (avg.unwrap_or(0.0) * 1000.0).round() / 1000.0;

    Ok(GraphStatistics {
        total_entities,
        total_relationships,
        entity_counts,
        relationship_counts,
        avg_confidence,
    })
}

/// Entities of `entity_type` with no outgoing `required_relationship` edge
/// to any entity of `target_type`.
pub async fn coverage_gaps(
    pool: &SqlitePool,
    entity_type: &str,
    required_relationship: &str,
    target_type: &str,
) -> Result<Vec<EntitySummary>> {
    let rows = sqlx::query(
        "SELECT id, name, entity_type, entity_subtype, confidence, location_text
         FROM kg_entities
         WHERE entity_type = ? AND is_deleted = 0
           AND id NOT IN (
               SELECT r.source_entity_id
               FROM kg_relationships r
               JOIN kg_entities t ON t.id = r.target_entity_id
               WHERE r.relationship_type = ? AND t.entity_type = ? AND t.is_deleted = 0
           )
         ORDER BY name ASC",
    )
    .bind(entity_type)
    .bind(required_relationship)
    .bind(target_type)
    .fetch_all(pool)
    .await?;

    Ok(rows.iter().map(summary_from_row).collect())
}

/// Breadth-first neighborhood around an entity, bounded by `max_depth`.
/// Edges are deduped by (source, target, type).
pub async fn entity_network(
    pool: &SqlitePool,
    entity_id: &str,
    max_depth: u32,
) -> Result<NetworkGraph> {
    let mut nodes: Vec<NetworkNode> = Vec::new();
    let mut edges: Vec<NetworkEdge> = Vec::new();
    let mut visited: HashSet<String> = HashSet::new();
    let mut queue: VecDeque<(String, u32)> = VecDeque::new();
    queue.push_back((entity_id.to_string(), 0));

    while let Some((current_id, depth)) = queue.pop_front() {
        if visited.contains(&current_id) || depth > max_depth {
            continue;
        }
        visited.insert(current_id.clone());

        let row = sqlx::query(
            "SELECT id, name, entity_type, entity_subtype, confidence
             FROM kg_entities WHERE id = ? AND is_deleted = 0",
        )
        .bind(&current_id)
        .fetch_optional(pool)
        .await?;
        let Some(row) = row else {
            continue;
        };

        nodes.push(NetworkNode {
            id: row.get("id"),
            name: row.get("name"),
            entity_type: row.get("entity_type"),
            entity_subtype: row.get("entity_subtype"),
            confidence: row.get("confidence"),
        });

        if depth < max_depth {
            let touching = sqlx::query(
                "SELECT id, source_entity_id, target_entity_id, relationship_type, confidence
                 FROM kg_relationships
                 WHERE source_entity_id = ? OR target_entity_id = ?",
            )
            .bind(&current_id)
            .bind(&current_id)
            .fetch_all(pool)
            .await?;

            for rel in &touching {
                let source: String = rel.get("source_entity_id");
                let target: String = rel.get("target_entity_id");
                edges.push(NetworkEdge {
                    id: rel.get("id"),
                    source: source.clone(),
                    target: target.clone(),
                    relationship_type: rel.get("relationship_type"),
                    confidence: rel.get("confidence"),
                });

                let neighbor = if source == current_id { target } else { source };
                if !visited.contains(&neighbor) {
                    queue.push_back((neighbor, depth + 1));
                }
            }
        }
    }

    let mut seen_edges: HashSet<(String, String, String)> = HashSet::new();
    edges.retain(|e| {
        seen_edges.insert((e.source.clone(), e.target.clone(), e.relationship_type.clone()))
    });

    Ok(NetworkGraph { nodes, edges })
}

// ============ CLI entry points ============

pub async fn run_list(
    config: &Config,
    entity_type: Option<&str>,
    query: Option<&str>,
    limit: i64,
    offset: i64,
) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::run_migrations(&pool).await?;

    let (entities, total) = list_entities(&pool, entity_type, query, limit, offset).await?;

    if entities.is_empty() {
        println!("No entities.");
        pool.close().await;
        return Ok(());
    }

    for e in &entities {
        println!("[{:.2}] {} / {}", e.confidence, e.entity_type, e.name);
        if let Some(ref location) = e.location_text {
            println!("    location: {}", location);
        }
        println!("    id: {}", e.id);
        println!();
    }
    println!("{} of {} entities", entities.len(), total);

    pool.close().await;
    Ok(())
}

pub async fn run_show(config: &Config, entity_id: &str) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::run_migrations(&pool).await?;

    let Some(detail) = entity_detail(&pool, entity_id).await? else {
        pool.close().await;
        bail!("entity not found: {}", entity_id);
    };

    println!("{} ({})", detail.name, detail.entity_type);
    if let Some(ref subtype) = detail.entity_subtype {
        println!("    subtype: {}", subtype);
    }
    println!("    confidence: {:.2}", detail.confidence);
    if let Some(ref location) = detail.location_text {
        println!("    location: {}", location);
    }
    println!("    method: {}", detail.extraction_method);
    if detail.attributes.as_object().is_some_and(|o| !o.is_empty()) {
        println!("    attributes: {}", detail.attributes);
    }
    println!("    id: {}", detail.id);

    println!();
    println!("outgoing ({})", detail.outgoing_relationships.len());
    for r in &detail.outgoing_relationships {
        println!(
            "    -[{}]-> {} ({}) [{:.2}]",
            r.relationship_type, r.entity_name, r.entity_type, r.confidence
        );
    }
    println!("incoming ({})", detail.incoming_relationships.len());
    for r in &detail.incoming_relationships {
        println!(
            "    <-[{}]- {} ({}) [{:.2}]",
            r.relationship_type, r.entity_name, r.entity_type, r.confidence
        );
    }
    println!("evidence ({})", detail.evidence.len());
    for ev in &detail.evidence {
        println!(
            "    \"{}\" (document {})",
            ev.evidence_text.replace('\n', " ").trim(),
            ev.document_id
        );
    }

    pool.close().await;
    Ok(())
}

pub async fn run_search(config: &Config, query: &str, limit: i64) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::run_migrations(&pool).await?;

    let results = search_entities(&pool, &config.embedding, query, limit).await?;

    if results.is_empty() {
        println!("No results.");
        pool.close().await;
        return Ok(());
    }

    for (i, e) in results.iter().enumerate() {
        println!("{}. [{:.2}] {} / {}", i + 1, e.confidence, e.entity_type, e.name);
        if let Some(ref location) = e.location_text {
            println!("    location: {}", location);
        }
        println!("    id: {}", e.id);
        println!();
    }

    pool.close().await;
    Ok(())
}

pub async fn run_gaps(
    config: &Config,
    entity_type: &str,
    relationship: &str,
    target_type: &str,
) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::run_migrations(&pool).await?;

    let gaps = coverage_gaps(&pool, entity_type, relationship, target_type).await?;

    if gaps.is_empty() {
        println!(
            "No gaps: every {} has a {} edge to a {}.",
            entity_type, relationship, target_type
        );
    } else {
        println!(
            "{} {} entities lack a {} edge to any {}:",
            gaps.len(),
            entity_type,
            relationship,
            target_type
        );
        for e in &gaps {
            println!("    {} (id: {})", e.name, e.id);
        }
    }

    pool.close().await;
    Ok(())
}

pub async fn run_network(config: &Config, entity_id: &str, depth: u32) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::run_migrations(&pool).await?;

    let graph = entity_network(&pool, entity_id, depth).await?;
    if graph.nodes.is_empty() {
        pool.close().await;
        bail!("entity not found: {}", entity_id);
    }

    println!(
        "{} nodes, {} edges (depth {})",
        graph.nodes.len(),
        graph.edges.len(),
        depth
    );
    println!();
    for n in &graph.nodes {
        println!("[{:.2}] {} / {}  (id: {})", n.confidence, n.entity_type, n.name, n.id);
    }

    if !graph.edges.is_empty() {
        let names: HashMap<&str, &str> = graph
            .nodes
            .iter()
            .map(|n| (n.id.as_str(), n.name.as_str()))
            .collect();
        println!();
        for e in &graph.edges {
            println!(
                "    {} -[{}]-> {}",
                names.get(e.source.as_str()).copied().unwrap_or(&e.source),
                e.relationship_type,
                names.get(e.target.as_str()).copied().unwrap_or(&e.target)
            );
        }
    }

    pool.close().await;
    Ok(())
}

use anyhow::Result;
use sqlx::SqlitePool;

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Create documents table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            title TEXT,
            description TEXT,
            tags TEXT,
            location TEXT,
            hazard_type TEXT,
            source TEXT,
            content TEXT,
            processing_status TEXT NOT NULL DEFAULT 'pending',
            needs_full_processing INTEGER NOT NULL DEFAULT 0,
            processing_mode TEXT NOT NULL DEFAULT 'pending',
            raw_file_path TEXT,
            metadata TEXT,
            sections TEXT,
            kg_extraction_status TEXT NOT NULL DEFAULT 'pending',
            sync_version INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            processed_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create sync log table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_log (
            id TEXT PRIMARY KEY,
            sync_type TEXT NOT NULL,
            status TEXT NOT NULL,
            documents_processed INTEGER NOT NULL DEFAULT 0,
            error_message TEXT,
            details TEXT,
            started_at INTEGER NOT NULL,
            completed_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create sync metadata key/value table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_metadata (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create sync conflicts table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_conflicts (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            sync_version INTEGER NOT NULL,
            local_payload TEXT NOT NULL,
            remote_payload TEXT NOT NULL,
            detected_at INTEGER NOT NULL,
            resolved INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create knowledge-graph entity table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS kg_entities (
            id TEXT PRIMARY KEY,
            entity_type TEXT NOT NULL,
            name TEXT NOT NULL,
            canonical_name TEXT NOT NULL,
            entity_subtype TEXT,
            attributes TEXT NOT NULL DEFAULT '{}',
            confidence REAL NOT NULL DEFAULT 0.5,
            location_text TEXT,
            embedding BLOB,
            extraction_method TEXT NOT NULL DEFAULT 'llm_extracted',
            is_deleted INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(canonical_name, entity_type)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create knowledge-graph relationship table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS kg_relationships (
            id TEXT PRIMARY KEY,
            source_entity_id TEXT NOT NULL,
            target_entity_id TEXT NOT NULL,
            relationship_type TEXT NOT NULL,
            attributes TEXT NOT NULL DEFAULT '{}',
            confidence REAL NOT NULL DEFAULT 0.5,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(source_entity_id, target_entity_id, relationship_type),
            FOREIGN KEY (source_entity_id) REFERENCES kg_entities(id),
            FOREIGN KEY (target_entity_id) REFERENCES kg_entities(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create evidence table. Exactly one of entity_id / relationship_id is
    // set per row; evidence_hash makes identical re-pushes no-ops.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS kg_evidence (
            id TEXT PRIMARY KEY,
            entity_id TEXT,
            relationship_id TEXT,
            document_id TEXT NOT NULL,
            evidence_text TEXT NOT NULL,
            evidence_hash TEXT NOT NULL,
            extraction_confidence REAL NOT NULL DEFAULT 0.5,
            created_at INTEGER NOT NULL,
            CHECK ((entity_id IS NULL) <> (relationship_id IS NULL)),
            FOREIGN KEY (entity_id) REFERENCES kg_entities(id),
            FOREIGN KEY (relationship_id) REFERENCES kg_relationships(id),
            FOREIGN KEY (document_id) REFERENCES documents(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_documents_updated_at ON documents(updated_at DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_documents_status ON documents(processing_status)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_documents_queue
         ON documents(needs_full_processing, processing_status, created_at)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_sync_log_started ON sync_log(started_at DESC)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_sync_conflicts_document
         ON sync_conflicts(document_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_kg_entities_type ON kg_entities(entity_type)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS ux_kg_evidence_entity
         ON kg_evidence(entity_id, document_id, evidence_hash)
         WHERE entity_id IS NOT NULL",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS ux_kg_evidence_relationship
         ON kg_evidence(relationship_id, document_id, evidence_hash)
         WHERE relationship_id IS NOT NULL",
    )
    .execute(pool)
    .await?;

    Ok(())
}

//! Local ingestion of files straight into the document store.
//!
//! Walks a file or directory, stores each raw file, runs the deployment
//! mode's processor, and finalizes status through the same state machine
//! the upload API uses. Knowledge-graph extraction runs inline for
//! completed documents when an LLM provider is configured.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::warn;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::config::Config;
use crate::db;
use crate::documents::{self, NewDocument};
use crate::kg_extract;
use crate::llm;
use crate::migrate;
use crate::models::ProcessingStatus;
use crate::processor::DocumentProcessor;

pub async fn run_ingest(config: &Config, path: &Path, no_extract: bool) -> Result<()> {
    if !path.exists() {
        bail!("path does not exist: {}", path.display());
    }

    let pool = db::connect(config).await?;
    migrate::run_migrations(&pool).await?;

    let processor = DocumentProcessor::new(config);
    let llm_client = if no_extract {
        None
    } else {
        llm::create_client(&config.llm)?
    };

    let files = collect_files(path)?;
    let raw_dir = &config.storage.raw_dir;
    std::fs::create_dir_all(raw_dir)
        .with_context(|| format!("Failed to create raw dir: {}", raw_dir.display()))?;

    let mut skipped = 0u64;
    let mut added = 0u64;
    let mut completed = 0u64;
    let mut needs_local = 0u64;
    let mut failed = 0u64;
    let mut errors = 0u64;
    let mut extracted_ids: Vec<String> = Vec::new();

    for file in &files {
        let filename = file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        if !processor.is_supported(&filename) {
            skipped += 1;
            continue;
        }

        let bytes = match std::fs::read(file) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(path = %file.display(), error = %e, "skipping unreadable file");
                errors += 1;
                continue;
            }
        };
        if bytes.len() as u64 > config.max_upload_bytes() {
            warn!(path = %file.display(), size = bytes.len(), "file exceeds size ceiling");
            skipped += 1;
            continue;
        }

        let raw_path = save_raw_file(raw_dir, &filename, &bytes)?;
        let result = processor.process(&filename, &bytes);

        let title = file
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .filter(|s| !s.is_empty());
        let description = (!result.content.is_empty())
            .then(|| result.content.chars().take(500).collect::<String>());

        let doc = documents::insert_document(
            &pool,
            NewDocument {
                title,
                description,
                raw_file_path: Some(raw_path.display().to_string()),
                ..Default::default()
            },
        )
        .await?;
        added += 1;

        let status = documents::finalize_processing(&pool, &doc.id, &result).await?;
        match status {
            ProcessingStatus::Completed => {
                completed += 1;
                extracted_ids.push(doc.id.clone());
            }
            ProcessingStatus::NeedsLocal => needs_local += 1,
            _ => failed += 1,
        }

        // The raw file only stays behind for documents still awaiting
        // full processing.
        if status != ProcessingStatus::NeedsLocal {
            if let Err(e) = std::fs::remove_file(&raw_path) {
                warn!(path = %raw_path.display(), error = %e, "failed to remove raw file");
            }
            documents::clear_raw_file_path(&pool, &doc.id).await?;
        }
    }

    let mut kg_entities = 0u64;
    let mut kg_relationships = 0u64;
    let mut kg_failed = 0u64;
    if let Some(ref client) = llm_client {
        for id in &extracted_ids {
            match kg_extract::run_extraction(&pool, config, client.as_ref(), id).await {
                Ok(outcome) => {
                    kg_entities += outcome.entities_created + outcome.entities_merged;
                    kg_relationships +=
                        outcome.relationships_created + outcome.relationships_merged;
                }
                Err(e) => {
                    warn!(document_id = %id, error = %e, "kg extraction failed");
                    kg_failed += 1;
                }
            }
        }
    }

    println!("ingest {}", path.display());
    println!("  scanned: {} files", files.len());
    println!("  added: {} documents", added);
    println!("  completed: {}", completed);
    println!("  needs local processing: {}", needs_local);
    println!("  failed: {}", failed);
    if skipped > 0 {
        println!("  skipped (unsupported or oversized): {}", skipped);
    }
    if errors > 0 {
        println!("  unreadable: {}", errors);
    }
    if llm_client.is_some() {
        println!("  kg entities: {}", kg_entities);
        println!("  kg relationships: {}", kg_relationships);
        if kg_failed > 0 {
            println!("  kg extraction failures: {}", kg_failed);
        }
    }
    println!("ok");

    pool.close().await;
    Ok(())
}

fn collect_files(path: &Path) -> Result<Vec<PathBuf>> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(path) {
        let entry = entry?;
        if entry.file_type().is_file() {
            files.push(entry.path().to_path_buf());
        }
    }

    // Sort for deterministic ordering
    files.sort();
    Ok(files)
}

/// Stores raw bytes under `raw_dir` with a fresh UUID name, preserving the
/// original extension so later full processing knows the format.
pub(crate) fn save_raw_file(raw_dir: &Path, filename: &str, bytes: &[u8]) -> Result<PathBuf> {
    let ext = Path::new(filename)
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let dest = raw_dir.join(format!("{}{}", Uuid::new_v4(), ext));
    std::fs::write(&dest, bytes)
        .with_context(|| format!("Failed to store raw file: {}", dest.display()))?;
    Ok(dest)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &tempfile::TempDir) -> Config {
        let body = format!(
            "[deployment]\nmode = \"local\"\n\
             [storage]\ndb_path = \"{db}\"\nraw_dir = \"{raw}\"\n\
             [llm]\nprovider = \"disabled\"\n",
            db = dir.path().join("test.db").display(),
            raw = dir.path().join("raw").display(),
        );
        toml::from_str(&body).unwrap()
    }

    #[tokio::test]
    async fn ingests_a_directory_and_reports_statuses() {
        let tmp = tempfile::TempDir::new().unwrap();
        let docs = tmp.path().join("docs");
        std::fs::create_dir_all(&docs).unwrap();
        std::fs::write(docs.join("plan.txt"), "Evacuate via the main road.").unwrap();
        std::fs::write(docs.join("empty.md"), "").unwrap();
        std::fs::write(docs.join("image.png"), [0x89, 0x50]).unwrap();

        let config = test_config(&tmp);
        run_ingest(&config, &docs, true).await.unwrap();

        let pool = db::connect(&config).await.unwrap();
        let all = documents::list_documents(&pool, None, 10).await.unwrap();
        assert_eq!(all.len(), 2); // png skipped

        let by_title = |t: &str| {
            all.iter()
                .find(|d| d.title.as_deref() == Some(t))
                .unwrap()
                .clone()
        };
        let plan = by_title("plan");
        assert_eq!(plan.processing_status, ProcessingStatus::Completed);
        assert_eq!(plan.content.as_deref(), Some("Evacuate via the main road."));
        assert_eq!(plan.description.as_deref(), Some("Evacuate via the main road."));
        assert_eq!(plan.raw_file_path, None);

        let empty = by_title("empty");
        assert_eq!(empty.processing_status, ProcessingStatus::Failed);

        // Completed and failed documents leave nothing in the raw dir.
        let leftovers: Vec<_> = std::fs::read_dir(tmp.path().join("raw"))
            .unwrap()
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn ingesting_a_missing_path_fails() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = test_config(&tmp);
        let err = run_ingest(&config, Path::new("/no/such/dir"), true)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }
}

//! # Resilience Pipeline CLI (`resil`)
//!
//! The `resil` binary is the primary interface for the resilience document
//! pipeline. It provides commands for database initialization, the HTTP API
//! server, the local sync worker, direct ingestion, knowledge graph
//! extraction and queries, and operational statistics.
//!
//! ## Usage
//!
//! ```bash
//! resil --config ./resilience.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `resil init` | Write a starter config (if missing) and create the SQLite schema |
//! | `resil serve` | Start the HTTP API (upload, status, sync endpoints) |
//! | `resil worker` | Run the local worker that processes the cloud's queue |
//! | `resil ingest <path>` | Ingest a file or directory directly into this instance |
//! | `resil extract <id>` | Run knowledge graph extraction for one document |
//! | `resil kg <action>` | Query the knowledge graph (list, show, search, gaps, network) |
//! | `resil stats` | Processing, sync, and knowledge graph statistics |
//! | `resil conflicts` | Review sync conflicts held for manual resolution |
//!
//! ## Examples
//!
//! ```bash
//! # First run: write ./resilience.toml and create the database
//! resil init
//!
//! # Start the API server (cloud or local, per [deployment].mode)
//! resil serve
//!
//! # Run one sync cycle against the configured cloud instance, then exit
//! resil worker --once
//!
//! # Ingest a directory of plans and reports
//! resil ingest ./documents
//!
//! # Inspect the graph
//! resil kg search "evacuation center" --limit 5
//! resil kg gaps Community serves Agency
//! ```

mod config;
mod conflicts;
mod db;
mod documents;
mod embedding;
mod extract;
mod ingest;
mod kg_extract;
mod kg_query;
mod kg_store;
mod llm;
mod migrate;
mod models;
mod processor;
mod server;
mod stats;
mod sync_log;
mod worker;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Resilience Pipeline CLI — document processing and knowledge graph
/// extraction for community disaster resilience.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. `resil init` writes a commented starter file.
#[derive(Parser)]
#[command(
    name = "resil",
    about = "Resilience Pipeline — hybrid cloud/local document processing and knowledge graph extraction",
    version,
    long_about = "Resilience Pipeline ingests community resilience documents (plans, reports, \
    spreadsheets), extracts their text, and builds a knowledge graph of hazards, communities, \
    agencies, locations, resources, and actions. A cloud instance accepts uploads and queues \
    documents that need deep processing; a local worker claims that queue, runs full extraction, \
    and submits results back over the sync API."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./resilience.toml`. Deployment mode, storage paths,
    /// server, sync, LLM, and embedding settings are read from this file.
    #[arg(long, global = true, default_value = "./resilience.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the configuration and database.
    ///
    /// Writes a commented starter config to the `--config` path when no file
    /// exists there, then creates the SQLite database and runs schema
    /// migrations. This command is idempotent — running it again is safe.
    Init,

    /// Start the HTTP API server.
    ///
    /// Binds to `[server].bind` and serves document upload, status, and the
    /// sync API. The sync endpoints require `[sync].api_key` to be set;
    /// without it they respond 503 and the rest of the API still works.
    Serve,

    /// Run the local processing worker.
    ///
    /// Polls the configured cloud instance for documents queued for full
    /// processing, downloads their raw files, extracts locally, and submits
    /// results back; each cycle also pulls and pushes document changes.
    /// Requires `[sync]` to be enabled and `[deployment].mode = "local"`.
    Worker {
        /// Run a single sync cycle and exit instead of looping on
        /// `[sync].interval_secs`.
        #[arg(long)]
        once: bool,
    },

    /// Ingest a file or directory into this instance.
    ///
    /// Walks the path, processes every supported file in this instance's
    /// deployment mode, and stores the results. Documents that complete with
    /// content are queued for knowledge graph extraction when an LLM
    /// provider is configured.
    Ingest {
        /// File or directory to ingest.
        path: PathBuf,

        /// Skip knowledge graph extraction after processing.
        #[arg(long)]
        no_extract: bool,
    },

    /// Run knowledge graph extraction for one document.
    ///
    /// The document must already hold extracted content. Requires an `[llm]`
    /// provider to be configured.
    Extract {
        /// Document UUID.
        document_id: String,
    },

    /// Query the knowledge graph.
    Kg {
        #[command(subcommand)]
        action: KgAction,
    },

    /// Show processing, sync, and knowledge graph statistics.
    ///
    /// Includes documents stuck in `processing` (claimed by a worker that
    /// never reported back) and unresolved sync conflicts.
    Stats,

    /// Review sync conflicts held for manual resolution.
    ///
    /// A conflict is a pushed document whose `sync_version` matched the
    /// stored row but whose payload differed. Conflicts are never merged
    /// automatically.
    Conflicts {
        /// Mark one conflict as resolved after reconciling by hand.
        #[arg(long)]
        resolve: Option<String>,

        /// Include conflicts already marked resolved.
        #[arg(long)]
        all: bool,
    },
}

/// Knowledge graph query subcommands.
#[derive(Subcommand)]
enum KgAction {
    /// List entities, optionally filtered by type and name.
    List {
        /// Filter by entity type (HazardType, Community, Agency, Location,
        /// Resource, Action).
        #[arg(long)]
        entity_type: Option<String>,

        /// Filter by a substring of the entity name.
        #[arg(long)]
        query: Option<String>,

        /// Maximum number of entities to return.
        #[arg(long, default_value_t = 20)]
        limit: i64,

        /// Number of entities to skip (for paging).
        #[arg(long, default_value_t = 0)]
        offset: i64,
    },

    /// Show one entity with its relationships and evidence.
    Show {
        /// Entity UUID.
        entity_id: String,
    },

    /// Search entities by name, with semantic ranking when an embedding
    /// provider is configured.
    Search {
        /// The search query string.
        query: String,

        /// Maximum number of results to return.
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },

    /// Find entities of one type missing an expected relationship.
    ///
    /// Example: `resil kg gaps Community serves Agency` lists communities
    /// with no agency serving them.
    Gaps {
        /// Entity type to check (e.g. `Community`).
        entity_type: String,

        /// Relationship type that should exist (e.g. `serves`).
        relationship: String,

        /// Entity type expected on the other end (e.g. `Agency`).
        target_type: String,
    },

    /// Walk the neighborhood of one entity.
    Network {
        /// Entity UUID to start from.
        entity_id: String,

        /// How many relationship hops to include.
        #[arg(long, default_value_t = 2)]
        depth: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "resil=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    // `init` must work before a config file exists; scaffold one first.
    if let Commands::Init = cli.command {
        if !cli.config.exists() {
            if let Some(parent) = cli.config.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            std::fs::write(&cli.config, config::example_config())?;
            println!("Wrote starter config to {}", cli.config.display());
        }

        let cfg = config::load_config(&cli.config)?;
        let pool = db::connect(&cfg).await?;
        migrate::run_migrations(&pool).await?;
        pool.close().await;
        println!("Database initialized at {}", cfg.storage.db_path.display());
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            // Handled above (before config loading)
            unreachable!()
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Worker { once } => {
            worker::run_worker(&cfg, once).await?;
        }
        Commands::Ingest { path, no_extract } => {
            ingest::run_ingest(&cfg, &path, no_extract).await?;
        }
        Commands::Extract { document_id } => {
            kg_extract::run_extract(&cfg, &document_id).await?;
        }
        Commands::Kg { action } => match action {
            KgAction::List {
                entity_type,
                query,
                limit,
                offset,
            } => {
                kg_query::run_list(&cfg, entity_type.as_deref(), query.as_deref(), limit, offset)
                    .await?;
            }
            KgAction::Show { entity_id } => {
                kg_query::run_show(&cfg, &entity_id).await?;
            }
            KgAction::Search { query, limit } => {
                kg_query::run_search(&cfg, &query, limit).await?;
            }
            KgAction::Gaps {
                entity_type,
                relationship,
                target_type,
            } => {
                kg_query::run_gaps(&cfg, &entity_type, &relationship, &target_type).await?;
            }
            KgAction::Network { entity_id, depth } => {
                kg_query::run_network(&cfg, &entity_id, depth).await?;
            }
        },
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Conflicts { resolve, all } => {
            conflicts::run_conflicts(&cfg, resolve.as_deref(), all).await?;
        }
    }

    Ok(())
}

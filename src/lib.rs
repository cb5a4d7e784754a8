//! # Resilience Pipeline
//!
//! Document processing and knowledge graph extraction for community
//! disaster resilience.
//!
//! The pipeline runs in one of two deployment modes. A `cloud` instance
//! accepts uploads, extracts what it can without heavy tooling, and queues
//! documents that need deep processing. A `local` instance runs the full
//! extraction stack, polls the cloud's queue over the sync API, and submits
//! results back. Documents with content feed an LLM-driven knowledge graph
//! of hazards, communities, agencies, locations, resources, and actions.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐       ┌─────────────────┐
//! │  Uploads   │──────▶│ Cloud instance  │
//! │  (HTTP)    │       │ shallow extract │
//! └────────────┘       │ + deep queue    │
//!                      └────────┬────────┘
//!                               │ sync API: unprocessed, download,
//!                               │ processed, failed, pull, push
//!                      ┌────────▼────────┐
//!                      │ Local instance  │
//!                      │ full extract,   │
//!                      │ knowledge graph │
//!                      └─────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! resil init                      # write config + create database
//! resil serve                     # start the HTTP API
//! resil ingest ./plans            # process a directory of documents
//! resil worker --once             # local worker: one sync cycle
//! resil kg search "evacuation"    # query the knowledge graph
//! resil stats                     # processing + sync health
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types and wire formats |
//! | [`processor`] | Mode-aware document processing |
//! | [`extract`] | Text extraction per file format |
//! | [`documents`] | Document store and sync comparator |
//! | [`server`] | HTTP API (upload, status, sync) |
//! | [`worker`] | Local sync worker |
//! | [`ingest`] | Direct file and directory ingestion |
//! | [`kg_extract`] | LLM entity and relationship extraction |
//! | [`kg_store`] | Knowledge graph persistence |
//! | [`kg_query`] | Knowledge graph queries |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`llm`] | LLM provider abstraction |
//! | [`sync_log`] | Sync operation history |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod config;
pub mod conflicts;
pub mod db;
pub mod documents;
pub mod embedding;
pub mod extract;
pub mod ingest;
pub mod kg_extract;
pub mod kg_query;
pub mod kg_store;
pub mod llm;
pub mod migrate;
pub mod models;
pub mod processor;
pub mod server;
pub mod stats;
pub mod sync_log;
pub mod worker;

//! # Dedupe Harness
//!
//! Near-duplicate detection and reversible merges for a document corpus.
//!
//! Pages are ingested from a content source (a wiki, a directory of Markdown
//! files), embedded, and compared pairwise. Similar pairs are written back
//! into each document as a symmetric `similar_to` list and materialized in a
//! pair cache. Merging collapses two pages into one and is recorded in an
//! append-only log so it can be undone, most recent first.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌─────────────┐   ┌───────────────┐
//! │ Content      │──▶│  Ingest     │──▶│ Document store │
//! │ Wiki / FS    │   │             │   │ (SQLite)       │
//! └──────┬───────┘   └─────────────┘   └──────┬────────┘
//!        │                                     ▼
//!        │            ┌──────────────┐   ┌─────────────┐
//!        │            │ Pair cache   │◀──│    Scan     │
//!        │            │ Merge log    │   │ embed+pairs │
//!        │            │ (blob store) │   └─────────────┘
//!        │            └──────┬───────┘
//!        ▼                   ▼
//!   ┌──────────────────────────────┐
//!   │ DedupeService: merge / undo  │──▶ CLI (`dedupe`), HTTP API
//!   └──────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! dedupe init                          # create database
//! dedupe --org acme ingest             # pull pages from the content source
//! dedupe --org acme scan               # embed and find duplicates
//! dedupe --org acme duplicates         # list pending pairs
//! dedupe --org acme merge <kept> <removed> --content-file merged.md
//! dedupe --org acme undo <merge-id>
//! dedupe serve                         # start HTTP API
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema creation |
//! | [`sqlite_store`] | SQLite document store |
//! | [`storage`] | Blob backend selection and keys |
//! | [`storage_fs`] | Local filesystem blob store |
//! | [`storage_s3`] | S3 blob store (SigV4) |
//! | [`embedding`] | Embedding providers |
//! | [`content_source`] | Content source trait and restore chains |
//! | [`connector_fs`] | Filesystem content source |
//! | [`connector_wiki`] | Wiki REST content source |
//! | [`ingest`] | Content source → document store |
//! | [`scan`] | Similarity scan pipeline and task handle |
//! | [`progress`] | Scan progress reporting |
//! | [`pair_cache`] | Duplicate pair cache |
//! | [`merge_log`] | Merge operation log |
//! | [`locks`] | Per-page advisory locks |
//! | [`service`] | Merge, undo, and the public surface |
//! | [`server`] | HTTP JSON API |

pub mod config;
pub mod connector_fs;
pub mod connector_wiki;
pub mod content_source;
pub mod db;
pub mod embedding;
pub mod ingest;
pub mod locks;
pub mod merge_log;
pub mod migrate;
pub mod pair_cache;
pub mod progress;
pub mod scan;
pub mod server;
pub mod service;
pub mod sqlite_store;
pub mod storage;
pub mod storage_fs;
pub mod storage_s3;

//! Storage abstractions for Dedupe Harness.
//!
//! [`DocumentStore`] holds each organization's corpus; [`BlobStore`] is the
//! key/blob interface the pair cache and merge log serialize into. Both
//! have in-memory implementations here; SQLite, filesystem, and S3
//! backends live in the app crate.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::Document;

/// Per-organization document collection.
///
/// Every method takes the organization id; no document is visible outside
/// its organization even when ids collide.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert or replace documents by id.
    async fn upsert_documents(&self, org: &str, docs: &[Document]) -> Result<()>;

    /// All documents of an organization, ordered by id.
    async fn all_documents(&self, org: &str) -> Result<Vec<Document>>;

    async fn get_document(&self, org: &str, id: &str) -> Result<Option<Document>>;

    /// Delete the given ids and insert `docs` as one atomic step.
    ///
    /// Readers see either the old set or the new one, never a mix.
    async fn replace_documents(&self, org: &str, docs: &[Document]) -> Result<()>;

    /// Delete by id; returns how many existed.
    async fn delete_documents(&self, org: &str, ids: &[String]) -> Result<usize>;

    /// Remove every document of the organization; returns how many existed.
    async fn clear(&self, org: &str) -> Result<usize>;

    async fn count(&self, org: &str) -> Result<usize>;
}

/// Key/blob storage.
///
/// Backends are interchangeable and selected by configuration. A missing
/// key reads as `None`; deleting a missing key is not an error.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn delete(&self, key: &str) -> Result<()>;

    /// Backend name for logs (`"local"`, `"s3"`, `"memory"`).
    fn backend_name(&self) -> &'static str;
}

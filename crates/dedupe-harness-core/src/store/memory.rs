//! In-memory store implementations for testing.
//!
//! Both use `HashMap`s behind `std::sync::RwLock`. Documents are
//! partitioned by organization id.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::Document;

use super::{BlobStore, DocumentStore};

/// In-memory document store.
pub struct InMemoryDocumentStore {
    orgs: RwLock<HashMap<String, BTreeMap<String, Document>>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self {
            orgs: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn upsert_documents(&self, org: &str, docs: &[Document]) -> Result<()> {
        let mut orgs = self.orgs.write().unwrap();
        let corpus = orgs.entry(org.to_string()).or_default();
        for doc in docs {
            corpus.insert(doc.id.clone(), doc.clone());
        }
        Ok(())
    }

    async fn all_documents(&self, org: &str) -> Result<Vec<Document>> {
        let orgs = self.orgs.read().unwrap();
        Ok(orgs
            .get(org)
            .map(|corpus| corpus.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_document(&self, org: &str, id: &str) -> Result<Option<Document>> {
        let orgs = self.orgs.read().unwrap();
        Ok(orgs.get(org).and_then(|corpus| corpus.get(id).cloned()))
    }

    async fn replace_documents(&self, org: &str, docs: &[Document]) -> Result<()> {
        // One write guard covers delete and insert.
        let mut orgs = self.orgs.write().unwrap();
        let corpus = orgs.entry(org.to_string()).or_default();
        for doc in docs {
            corpus.remove(&doc.id);
        }
        for doc in docs {
            corpus.insert(doc.id.clone(), doc.clone());
        }
        Ok(())
    }

    async fn delete_documents(&self, org: &str, ids: &[String]) -> Result<usize> {
        let mut orgs = self.orgs.write().unwrap();
        let Some(corpus) = orgs.get_mut(org) else {
            return Ok(0);
        };
        Ok(ids.iter().filter(|id| corpus.remove(*id).is_some()).count())
    }

    async fn clear(&self, org: &str) -> Result<usize> {
        let mut orgs = self.orgs.write().unwrap();
        Ok(orgs.remove(org).map(|corpus| corpus.len()).unwrap_or(0))
    }

    async fn count(&self, org: &str) -> Result<usize> {
        let orgs = self.orgs.read().unwrap();
        Ok(orgs.get(org).map(|corpus| corpus.len()).unwrap_or(0))
    }
}

/// In-memory blob store.
pub struct InMemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self {
            blobs: RwLock::new(HashMap::new()),
        }
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.blobs.read().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl Default for InMemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        self.blobs.write().unwrap().insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.read().unwrap().get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.blobs.write().unwrap().remove(key);
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

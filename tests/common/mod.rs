//! Fakes shared by the integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use dedupe_harness::config::DetectionConfig;
use dedupe_harness::content_source::{ContentSource, Page};
use dedupe_harness::service::DedupeService;
use dedupe_harness_core::embedding::EmbeddingProvider;
use dedupe_harness_core::models::{document_id_for, VersionToken};
use dedupe_harness_core::store::memory::{InMemoryBlobStore, InMemoryDocumentStore};
use dedupe_harness_core::store::{BlobStore, DocumentStore};

/// Embedder backed by a fixed content → vector table. Unknown text fails.
pub struct TableEmbedder {
    vectors: HashMap<String, Vec<f32>>,
}

impl TableEmbedder {
    pub fn new(entries: impl IntoIterator<Item = (String, Vec<f32>)>) -> Self {
        Self {
            vectors: entries.into_iter().collect(),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for TableEmbedder {
    fn model_name(&self) -> &str {
        "table"
    }
    fn dims(&self) -> usize {
        4
    }
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.vectors
            .get(text)
            .cloned()
            .ok_or_else(|| anyhow!("no vector for text"))
    }
}

/// Embedder that waits for a permit before every call, so a test can hold
/// a scan in its embedding phase.
pub struct GatedEmbedder {
    inner: TableEmbedder,
    pub gate: tokio::sync::Semaphore,
}

impl GatedEmbedder {
    pub fn closed(inner: TableEmbedder) -> Self {
        Self {
            inner,
            gate: tokio::sync::Semaphore::new(0),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for GatedEmbedder {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }
    fn dims(&self) -> usize {
        self.inner.dims()
    }
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let _permit = self.gate.acquire().await?;
        self.inner.embed(text).await
    }
}

/// Blob store over memory whose pair-cache reads and merge-log writes can be
/// switched to fail.
#[derive(Default)]
pub struct FlakyBlobStore {
    inner: InMemoryBlobStore,
    pub fail_cache_reads: AtomicBool,
    pub fail_log_writes: AtomicBool,
}

#[async_trait]
impl BlobStore for FlakyBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        if key.ends_with("/merge_operations.json") && self.fail_log_writes.load(Ordering::SeqCst) {
            bail!("log write refused");
        }
        self.inner.put(key, bytes).await
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        if key.ends_with("/duplicate_pairs.json") && self.fail_cache_reads.load(Ordering::SeqCst) {
            bail!("cache backend unavailable");
        }
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key).await
    }

    fn backend_name(&self) -> &'static str {
        "flaky"
    }
}

struct WikiPage {
    title: String,
    /// Content of every version; the token of version n is `n`.
    versions: Vec<String>,
    live: bool,
}

/// In-memory wiki with numbered versions and a trash flag.
#[derive(Default)]
pub struct MemoryWiki {
    pages: Mutex<BTreeMap<String, WikiPage>>,
    pub fail_update: AtomicBool,
    pub fail_restore: AtomicBool,
}

impl MemoryWiki {
    pub fn add_page(&self, source_id: &str, title: &str, content: &str) {
        self.pages.lock().unwrap().insert(
            source_id.to_string(),
            WikiPage {
                title: title.to_string(),
                versions: vec![content.to_string()],
                live: true,
            },
        );
    }

    pub fn content(&self, source_id: &str) -> Option<String> {
        let pages = self.pages.lock().unwrap();
        pages
            .get(source_id)
            .filter(|p| p.live)
            .and_then(|p| p.versions.last().cloned())
    }

    pub fn is_live(&self, source_id: &str) -> bool {
        self.pages
            .lock()
            .unwrap()
            .get(source_id)
            .is_some_and(|p| p.live)
    }

    fn page(source_id: &str, p: &WikiPage) -> Page {
        Page {
            source_id: source_id.to_string(),
            title: p.title.clone(),
            url: format!("https://wiki.example/pages/{}", source_id),
            space: "ENG".into(),
            content: p.versions.last().cloned().unwrap_or_default(),
            version: VersionToken(p.versions.len().to_string()),
        }
    }
}

#[async_trait]
impl ContentSource for MemoryWiki {
    fn name(&self) -> &str {
        "memory-wiki"
    }

    async fn list_pages(&self) -> Result<Vec<Page>> {
        let pages = self.pages.lock().unwrap();
        Ok(pages
            .iter()
            .filter(|(_, p)| p.live)
            .map(|(id, p)| Self::page(id, p))
            .collect())
    }

    async fn fetch_page(&self, source_id: &str) -> Result<Option<Page>> {
        let pages = self.pages.lock().unwrap();
        Ok(pages
            .get(source_id)
            .filter(|p| p.live)
            .map(|p| Self::page(source_id, p)))
    }

    async fn get_version(&self, source_id: &str) -> Result<VersionToken> {
        let pages = self.pages.lock().unwrap();
        let page = pages
            .get(source_id)
            .filter(|p| p.live)
            .ok_or_else(|| anyhow!("page {} not found", source_id))?;
        Ok(VersionToken(page.versions.len().to_string()))
    }

    async fn update_page(&self, source_id: &str, title: &str, content: &str) -> Result<()> {
        if self.fail_update.load(Ordering::SeqCst) {
            bail!("HTTP 503 from wiki");
        }
        let mut pages = self.pages.lock().unwrap();
        let page = pages
            .get_mut(source_id)
            .filter(|p| p.live)
            .ok_or_else(|| anyhow!("page {} not found", source_id))?;
        page.title = title.to_string();
        page.versions.push(content.to_string());
        Ok(())
    }

    async fn delete_page(&self, source_id: &str) -> Result<()> {
        let mut pages = self.pages.lock().unwrap();
        let page = pages
            .get_mut(source_id)
            .ok_or_else(|| anyhow!("page {} not found", source_id))?;
        page.live = false;
        Ok(())
    }

    async fn restore(&self, source_id: &str, version: &VersionToken) -> Result<()> {
        if self.fail_restore.load(Ordering::SeqCst) {
            bail!("restore endpoint unavailable");
        }
        let n: usize = version.0.parse()?;
        let mut pages = self.pages.lock().unwrap();
        let page = pages
            .get_mut(source_id)
            .ok_or_else(|| anyhow!("page {} not found", source_id))?;
        let wanted = page
            .versions
            .get(n.wrapping_sub(1))
            .cloned()
            .ok_or_else(|| anyhow!("no version {}", n))?;
        page.live = true;
        if page.versions.last() != Some(&wanted) {
            page.versions.push(wanted);
        }
        Ok(())
    }
}

/// Body text of scenario page `n`; long enough to pass the content floor.
pub fn body(n: u32) -> String {
    format!(
        "Page {} of the engineering handbook. It describes how the team runs deployments.",
        n
    )
}

/// Vectors for the five-page scenario: pages 1 and 2 score 0.90, pages 4
/// and 5 score 0.72, everything else stays below 0.65.
pub fn scenario_vectors() -> Vec<(String, Vec<f32>)> {
    let s2 = (1.0f32 - 0.81).sqrt();
    let s5 = (1.0f32 - 0.72 * 0.72).sqrt();
    vec![
        (body(1), vec![1.0, 0.0, 0.0, 0.0]),
        (body(2), vec![0.9, s2, 0.0, 0.0]),
        (body(3), vec![0.0, 0.0, 0.0, 1.0]),
        (body(4), vec![0.0, 1.0, 0.0, 0.0]),
        (body(5), vec![0.0, 0.72, s5, 0.0]),
    ]
}

pub fn scenario_wiki() -> Arc<MemoryWiki> {
    let wiki = Arc::new(MemoryWiki::default());
    for n in 1..=5 {
        wiki.add_page(&format!("p{}", n), &format!("Page {}", n), &body(n));
    }
    wiki
}

/// Document id of scenario page `n`.
pub fn doc_id(n: u32) -> String {
    document_id_for(&format!("p{}", n))
}

pub struct Harness {
    pub service: DedupeService,
    pub wiki: Arc<MemoryWiki>,
    pub docs: Arc<dyn DocumentStore>,
    pub blobs: Arc<dyn BlobStore>,
}

pub fn harness_with(docs: Arc<dyn DocumentStore>, blobs: Arc<dyn BlobStore>) -> Harness {
    harness_from(docs, blobs, Arc::new(TableEmbedder::new(scenario_vectors())))
}

pub fn harness_from(
    docs: Arc<dyn DocumentStore>,
    blobs: Arc<dyn BlobStore>,
    embedder: Arc<dyn EmbeddingProvider>,
) -> Harness {
    let wiki = scenario_wiki();
    let service = DedupeService::new(
        docs.clone(),
        blobs.clone(),
        embedder,
        Some(wiki.clone()),
        DetectionConfig::default(),
        2,
    );
    Harness {
        service,
        wiki,
        docs,
        blobs,
    }
}

pub fn harness() -> Harness {
    harness_with(
        Arc::new(InMemoryDocumentStore::new()),
        Arc::new(InMemoryBlobStore::new()),
    )
}

/// Scenario harness over a [`FlakyBlobStore`].
pub fn flaky_harness() -> (Harness, Arc<FlakyBlobStore>) {
    let blobs = Arc::new(FlakyBlobStore::default());
    let h = harness_with(Arc::new(InMemoryDocumentStore::new()), blobs.clone());
    (h, blobs)
}

//! Content source abstraction.
//!
//! A content source is the external system that owns the pages being
//! deduplicated (a wiki, a directory of Markdown files). Merges mutate it
//! and undo reverses those mutations through [`ContentSource::restore`].
//!
//! Restore is modelled as an ordered [`RestoreChain`]: each strategy is
//! tried in turn, the first success wins, and if every strategy fails the
//! errors are reported together.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use dedupe_harness_core::models::VersionToken;

use crate::config::Config;
use crate::connector_fs::FilesystemSource;
use crate::connector_wiki::WikiSource;

/// One page as seen in the content source.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub source_id: String,
    pub title: String,
    pub url: String,
    pub space: String,
    pub content: String,
    pub version: VersionToken,
}

#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Connector type name (`"filesystem"`, `"wiki"`).
    fn name(&self) -> &str;

    async fn list_pages(&self) -> Result<Vec<Page>>;

    /// Fetch one live page; `None` when it does not exist.
    async fn fetch_page(&self, source_id: &str) -> Result<Option<Page>>;

    /// Current version token of a live page.
    async fn get_version(&self, source_id: &str) -> Result<VersionToken>;

    async fn update_page(&self, source_id: &str, title: &str, content: &str) -> Result<()>;

    async fn delete_page(&self, source_id: &str) -> Result<()>;

    /// Bring a page back to the given version, undeleting it if needed.
    async fn restore(&self, source_id: &str, version: &VersionToken) -> Result<()>;
}

/// One way of restoring a page, operating on connector state `C`.
#[async_trait]
pub trait RestoreStrategy<C: Sync>: Send + Sync {
    fn name(&self) -> &'static str;
    async fn attempt(&self, ctx: &C, source_id: &str, version: &VersionToken) -> Result<()>;
}

/// Ordered restore strategies; first success wins.
pub struct RestoreChain<C: Sync> {
    strategies: Vec<Box<dyn RestoreStrategy<C>>>,
}

impl<C: Sync> RestoreChain<C> {
    pub fn new() -> Self {
        Self {
            strategies: Vec::new(),
        }
    }

    pub fn with(mut self, strategy: impl RestoreStrategy<C> + 'static) -> Self {
        self.strategies.push(Box::new(strategy));
        self
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Run strategies in order. Returns the name of the one that worked.
    pub async fn run(&self, ctx: &C, source_id: &str, version: &VersionToken) -> Result<&'static str> {
        let mut failures = Vec::new();
        for strategy in &self.strategies {
            match strategy.attempt(ctx, source_id, version).await {
                Ok(()) => {
                    tracing::info!(
                        source_id,
                        version = %version,
                        strategy = strategy.name(),
                        "page restored"
                    );
                    return Ok(strategy.name());
                }
                Err(e) => {
                    tracing::debug!(source_id, strategy = strategy.name(), error = %e, "restore strategy failed");
                    failures.push(format!("{}: {:#}", strategy.name(), e));
                }
            }
        }
        anyhow::bail!(
            "all {} restore strategies failed for '{}': {}",
            self.strategies.len(),
            source_id,
            failures.join("; ")
        )
    }
}

impl<C: Sync> Default for RestoreChain<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the content source named by `[content] type`, if any.
pub fn create_content_source(config: &Config) -> Result<Option<Arc<dyn ContentSource>>> {
    match config.content.kind.as_deref() {
        None => Ok(None),
        Some("filesystem") => {
            let fs = config
                .content
                .filesystem
                .clone()
                .ok_or_else(|| anyhow::anyhow!("[content.filesystem] not configured"))?;
            Ok(Some(Arc::new(FilesystemSource::new(fs)?)))
        }
        Some("wiki") => {
            let wiki = config
                .content
                .wiki
                .clone()
                .ok_or_else(|| anyhow::anyhow!("[content.wiki] not configured"))?;
            Ok(Some(Arc::new(WikiSource::from_env(wiki)?)))
        }
        Some(other) => anyhow::bail!("Unknown content type: '{}'", other),
    }
}

//! Filesystem content source.
//!
//! Pages are text files under a root directory; the relative path is the
//! page's source id and its top-level directory is its space. Two hidden
//! directories give the connector the history a merge needs:
//!
//! - `.versions/<source_id>/<token>` holds content snapshots. Version tokens
//!   are the hex SHA-256 of the content, so capturing a version twice is a
//!   no-op.
//! - `.trash/<source_id>` holds deleted pages until they are restored.
//!
//! Restore tries untrashing first, then rewriting from a snapshot.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

use dedupe_harness_core::models::VersionToken;

use crate::config::FilesystemContentConfig;
use crate::content_source::{ContentSource, Page, RestoreChain, RestoreStrategy};

const VERSIONS_DIR: &str = ".versions";
const TRASH_DIR: &str = ".trash";

pub struct FilesystemSource {
    root: PathBuf,
    include: GlobSet,
    exclude: GlobSet,
    restore_chain: RestoreChain<FilesystemSource>,
}

impl FilesystemSource {
    pub fn new(config: FilesystemContentConfig) -> Result<Self> {
        let mut default_excludes = vec![
            format!("{}/**", VERSIONS_DIR),
            format!("{}/**", TRASH_DIR),
            "**/.git/**".to_string(),
        ];
        default_excludes.extend(config.exclude_globs.clone());

        Ok(Self {
            include: build_globset(&config.include_globs)?,
            exclude: build_globset(&default_excludes)?,
            root: config.root,
            restore_chain: RestoreChain::new().with(Untrash).with(RewriteFromSnapshot),
        })
    }

    fn page_path(&self, source_id: &str) -> Result<PathBuf> {
        Ok(self.root.join(safe_relative(source_id)?))
    }

    fn trash_path(&self, source_id: &str) -> Result<PathBuf> {
        Ok(self.root.join(TRASH_DIR).join(safe_relative(source_id)?))
    }

    fn snapshot_path(&self, source_id: &str, version: &VersionToken) -> Result<PathBuf> {
        if !version.0.chars().all(|c| c.is_ascii_hexdigit()) || version.0.is_empty() {
            bail!("invalid version token '{}'", version);
        }
        Ok(self
            .root
            .join(VERSIONS_DIR)
            .join(safe_relative(source_id)?)
            .join(&version.0))
    }

    /// Store a snapshot of `content` and return its token.
    fn snapshot(&self, source_id: &str, content: &str) -> Result<VersionToken> {
        let token = content_version(content);
        let path = self.snapshot_path(source_id, &token)?;
        if !path.exists() {
            write_file(&path, content)?;
        }
        Ok(token)
    }

    fn read_page(&self, source_id: &str, path: &Path) -> Result<Page> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let title = markdown_title(&content).unwrap_or_else(|| {
            path.file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default()
        });
        let space = match source_id.split_once('/') {
            Some((top, _)) => top.to_string(),
            None => String::new(),
        };

        Ok(Page {
            source_id: source_id.to_string(),
            title,
            url: format!("file://{}", path.display()),
            space,
            version: content_version(&content),
            content,
        })
    }
}

#[async_trait]
impl ContentSource for FilesystemSource {
    fn name(&self) -> &str {
        "filesystem"
    }

    async fn list_pages(&self) -> Result<Vec<Page>> {
        if !self.root.exists() {
            bail!(
                "Filesystem content root does not exist: {}",
                self.root.display()
            );
        }

        let mut pages = Vec::new();
        for entry in WalkDir::new(&self.root) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let relative = path.strip_prefix(&self.root).unwrap_or(path);
            let rel_str = relative.to_string_lossy().replace('\\', "/");

            if self.exclude.is_match(&rel_str) || !self.include.is_match(&rel_str) {
                continue;
            }
            pages.push(self.read_page(&rel_str, path)?);
        }

        pages.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        Ok(pages)
    }

    async fn fetch_page(&self, source_id: &str) -> Result<Option<Page>> {
        let path = self.page_path(source_id)?;
        if !path.is_file() {
            return Ok(None);
        }
        Ok(Some(self.read_page(source_id, &path)?))
    }

    async fn get_version(&self, source_id: &str) -> Result<VersionToken> {
        let path = self.page_path(source_id)?;
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Page '{}' not found", source_id))?;
        self.snapshot(source_id, &content)
    }

    /// Filesystem pages take their title from their content; `title` is
    /// not written separately.
    async fn update_page(&self, source_id: &str, _title: &str, content: &str) -> Result<()> {
        let path = self.page_path(source_id)?;
        let current = std::fs::read_to_string(&path)
            .with_context(|| format!("Page '{}' not found", source_id))?;
        self.snapshot(source_id, &current)?;
        write_file(&path, content)
    }

    async fn delete_page(&self, source_id: &str) -> Result<()> {
        let path = self.page_path(source_id)?;
        let current = std::fs::read_to_string(&path)
            .with_context(|| format!("Page '{}' not found", source_id))?;
        self.snapshot(source_id, &current)?;

        let trash = self.trash_path(source_id)?;
        if let Some(parent) = trash.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::rename(&path, &trash)
            .with_context(|| format!("Failed to move '{}' to trash", source_id))?;
        Ok(())
    }

    async fn restore(&self, source_id: &str, version: &VersionToken) -> Result<()> {
        self.restore_chain.run(self, source_id, version).await?;
        Ok(())
    }
}

/// Move a trashed page back, if the trashed copy is the wanted version.
struct Untrash;

#[async_trait]
impl RestoreStrategy<FilesystemSource> for Untrash {
    fn name(&self) -> &'static str {
        "untrash"
    }

    async fn attempt(&self, fs: &FilesystemSource, source_id: &str, version: &VersionToken) -> Result<()> {
        let trash = fs.trash_path(source_id)?;
        let live = fs.page_path(source_id)?;
        if !trash.is_file() {
            bail!("page is not in trash");
        }
        if live.exists() {
            bail!("a live page already exists at '{}'", source_id);
        }
        let content = std::fs::read_to_string(&trash)?;
        let trashed_version = content_version(&content);
        if &trashed_version != version {
            bail!("trashed copy is at version {}, wanted {}", trashed_version, version);
        }
        if let Some(parent) = live.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::rename(&trash, &live)?;
        Ok(())
    }
}

/// Write the snapshot content back as the live page.
struct RewriteFromSnapshot;

#[async_trait]
impl RestoreStrategy<FilesystemSource> for RewriteFromSnapshot {
    fn name(&self) -> &'static str {
        "rewrite-from-snapshot"
    }

    async fn attempt(&self, fs: &FilesystemSource, source_id: &str, version: &VersionToken) -> Result<()> {
        let snapshot = fs.snapshot_path(source_id, version)?;
        let content = std::fs::read_to_string(&snapshot)
            .with_context(|| format!("no snapshot for version {}", version))?;

        let live = fs.page_path(source_id)?;
        if let Ok(current) = std::fs::read_to_string(&live) {
            fs.snapshot(source_id, &current)?;
        }
        write_file(&live, &content)?;

        let trash = fs.trash_path(source_id)?;
        if trash.exists() {
            std::fs::remove_file(&trash)?;
        }
        Ok(())
    }
}

/// Version token of a piece of content.
pub fn content_version(content: &str) -> VersionToken {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    VersionToken(format!("{:x}", hasher.finalize()))
}

fn markdown_title(content: &str) -> Option<String> {
    content
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .and_then(|l| l.strip_prefix("# "))
        .map(|t| t.trim().to_string())
}

fn safe_relative(source_id: &str) -> Result<&Path> {
    let path = Path::new(source_id);
    let ok = !source_id.is_empty()
        && path.components().all(|c| matches!(c, Component::Normal(_)))
        && !source_id.starts_with(VERSIONS_DIR)
        && !source_id.starts_with(TRASH_DIR);
    if !ok {
        bail!("invalid page id '{}'", source_id);
    }
    Ok(path)
}

fn write_file(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

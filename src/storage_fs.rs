//! Local filesystem [`BlobStore`].
//!
//! Keys map to files under a root directory (`{root}/{key}`). Writes land in
//! a sibling temp file first and are renamed into place, so a reader never
//! sees a half-written blob.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};

use dedupe_harness_core::store::BlobStore;

pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a key to a path under the root, rejecting escapes.
    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let rel = Path::new(key);
        if key.is_empty() {
            bail!("empty blob key");
        }
        for component in rel.components() {
            match component {
                Component::Normal(_) => {}
                _ => bail!("invalid blob key: '{}'", key),
            }
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, &bytes)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e).with_context(|| format!("Failed to move blob into {}", path.display()));
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete {}", path.display())),
        }
    }

    fn backend_name(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());

        assert!(store.get("acme/merge_operations.json").await.unwrap().is_none());
        store
            .put("acme/merge_operations.json", b"{\"operations\":[]}".to_vec())
            .await
            .unwrap();
        assert!(dir.path().join("acme/merge_operations.json").exists());
        assert_eq!(
            store.get("acme/merge_operations.json").await.unwrap().unwrap(),
            b"{\"operations\":[]}".to_vec()
        );

        store.delete("acme/merge_operations.json").await.unwrap();
        store.delete("acme/merge_operations.json").await.unwrap();
        assert!(store.get("acme/merge_operations.json").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_overwrite_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        store.put("o/k.json", b"1".to_vec()).await.unwrap();
        store.put("o/k.json", b"2".to_vec()).await.unwrap();

        let entries: Vec<_> = std::fs::read_dir(dir.path().join("o")).unwrap().collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(store.get("o/k.json").await.unwrap().unwrap(), b"2".to_vec());
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        assert!(store.put("../evil", b"x".to_vec()).await.is_err());
        assert!(store.get("/etc/passwd").await.is_err());
        assert!(store.delete("a/../../b").await.is_err());
    }
}

//! Blob backend selection and key layout.
//!
//! Callers never branch on the backend: [`create_blob_store`] picks one from
//! `[storage]` and everything else talks to `dyn BlobStore`.

use anyhow::{Context, Result};
use std::sync::Arc;

use dedupe_harness_core::error::DedupeError;
use dedupe_harness_core::models::validate_org_id;
use dedupe_harness_core::store::BlobStore;

use crate::config::StorageConfig;
use crate::storage_fs::FsBlobStore;
use crate::storage_s3::{AwsCredentials, S3BlobStore};

/// Blob key of an organization's duplicate pair cache.
pub fn pair_cache_key(org: &str) -> Result<String, DedupeError> {
    validate_org_id(org)?;
    Ok(format!("{}/duplicate_pairs.json", org))
}

/// Blob key of an organization's merge operation log.
pub fn merge_log_key(org: &str) -> Result<String, DedupeError> {
    validate_org_id(org)?;
    Ok(format!("{}/merge_operations.json", org))
}

/// Build the configured blob backend.
///
/// `auto` uses S3 when a `[storage.s3]` section exists and AWS credentials
/// are in the environment, else the local filesystem.
pub fn create_blob_store(config: &StorageConfig) -> Result<Arc<dyn BlobStore>> {
    let use_s3 = match config.backend.as_str() {
        "s3" => true,
        "auto" => config.s3.is_some() && AwsCredentials::present_in_env(),
        _ => false,
    };

    if use_s3 {
        let s3 = config
            .s3
            .clone()
            .context("storage backend 's3' requires a [storage.s3] section")?;
        let creds = AwsCredentials::from_env()?;
        tracing::info!(bucket = %s3.bucket, region = %s3.region, "using S3 blob storage");
        return Ok(Arc::new(S3BlobStore::new(s3, creds)));
    }

    tracing::info!(path = %config.local_path.display(), "using local blob storage");
    Ok(Arc::new(FsBlobStore::new(config.local_path.clone())))
}

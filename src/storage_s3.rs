//! Amazon S3 [`BlobStore`].
//!
//! PUT/GET/DELETE object with AWS Signature V4 signing, built on `hmac` and
//! `sha2` only. A custom `endpoint_url` switches to path-style addressing
//! for S3-compatible services (MinIO, LocalStack).
//!
//! # Environment Variables
//!
//! - `AWS_ACCESS_KEY_ID` (required)
//! - `AWS_SECRET_ACCESS_KEY` (required)
//! - `AWS_SESSION_TOKEN` (optional)

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::Method;
use sha2::{Digest, Sha256};

use dedupe_harness_core::store::BlobStore;

use crate::config::S3StorageConfig;

type HmacSha256 = Hmac<Sha256>;

/// AWS credentials loaded from environment variables.
#[derive(Clone)]
pub struct AwsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl AwsCredentials {
    pub fn from_env() -> Result<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
            .context("AWS_ACCESS_KEY_ID environment variable not set")?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .context("AWS_SECRET_ACCESS_KEY environment variable not set")?;
        let session_token = std::env::var("AWS_SESSION_TOKEN").ok();

        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token,
        })
    }

    /// Whether the required variables are present, without reading them into memory.
    pub fn present_in_env() -> bool {
        std::env::var("AWS_ACCESS_KEY_ID").is_ok() && std::env::var("AWS_SECRET_ACCESS_KEY").is_ok()
    }
}

pub struct S3BlobStore {
    config: S3StorageConfig,
    creds: AwsCredentials,
    client: reqwest::Client,
}

/// Where a request goes and what gets signed.
struct Target {
    url: String,
    host: String,
    canonical_uri: String,
}

impl S3BlobStore {
    pub fn new(config: S3StorageConfig, creds: AwsCredentials) -> Self {
        Self {
            config,
            creds,
            client: reqwest::Client::new(),
        }
    }

    fn object_key(&self, key: &str) -> String {
        let prefix = self.config.prefix.trim_matches('/');
        if prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", prefix, key)
        }
    }

    fn target(&self, key: &str) -> Target {
        let encoded_key = self
            .object_key(key)
            .split('/')
            .map(uri_encode)
            .collect::<Vec<_>>()
            .join("/");

        match self.config.endpoint_url {
            Some(ref endpoint) => {
                let base = endpoint.trim_end_matches('/');
                let canonical_uri = format!("/{}/{}", self.config.bucket, encoded_key);
                Target {
                    url: format!("{}{}", base, canonical_uri),
                    host: s3_host(&self.config),
                    canonical_uri,
                }
            }
            None => {
                let host = s3_host(&self.config);
                Target {
                    url: format!("https://{}/{}", host, encoded_key),
                    canonical_uri: format!("/{}", encoded_key),
                    host,
                }
            }
        }
    }

    async fn send(&self, method: Method, key: &str, body: Vec<u8>) -> Result<reqwest::Response> {
        let target = self.target(key);
        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let payload_hash = hex_sha256(&body);

        let mut headers = vec![
            ("host".to_string(), target.host.clone()),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if let Some(ref token) = self.creds.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }
        headers.sort_by(|a, b| a.0.cmp(&b.0));

        let authorization = sign_request(
            &self.creds,
            &self.config.region,
            method.as_str(),
            &target.canonical_uri,
            &headers,
            &payload_hash,
            &date_stamp,
            &amz_date,
        );

        let mut req = self
            .client
            .request(method.clone(), &target.url)
            .header("Authorization", authorization)
            .header("x-amz-content-sha256", &payload_hash)
            .header("x-amz-date", &amz_date);
        if let Some(ref token) = self.creds.session_token {
            req = req.header("x-amz-security-token", token);
        }
        if method == Method::PUT {
            req = req.header("Content-Type", "application/json").body(body);
        }

        req.send().await.map_err(|e| {
            anyhow::anyhow!(
                "S3 {} s3://{}/{} failed: {}",
                method,
                self.config.bucket,
                self.object_key(key),
                e
            )
        })
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        let resp = self.send(Method::PUT, key, bytes).await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("S3 PutObject failed (HTTP {}) for key '{}': {}", status, key, text);
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let resp = self.send(Method::GET, key, Vec::new()).await?;
        let status = resp.status();
        if status.as_u16() == 404 {
            return Ok(None);
        }
        if !status.is_success() {
            bail!("S3 GetObject failed (HTTP {}) for key '{}'", status, key);
        }
        Ok(Some(resp.bytes().await?.to_vec()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let resp = self.send(Method::DELETE, key, Vec::new()).await?;
        let status = resp.status();
        if !status.is_success() && status.as_u16() != 404 {
            bail!("S3 DeleteObject failed (HTTP {}) for key '{}'", status, key);
        }
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "s3"
    }
}

// ============ AWS SigV4 Helpers ============

/// Build the SigV4 `Authorization` header value.
///
/// `headers` must be lowercase and sorted by name.
#[allow(clippy::too_many_arguments)]
fn sign_request(
    creds: &AwsCredentials,
    region: &str,
    method: &str,
    canonical_uri: &str,
    headers: &[(String, String)],
    payload_hash: &str,
    date_stamp: &str,
    amz_date: &str,
) -> String {
    let signed_headers: String = headers
        .iter()
        .map(|(k, _)| k.as_str())
        .collect::<Vec<_>>()
        .join(";");
    let canonical_headers: String = headers
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k, v))
        .collect();

    let canonical_request = format!(
        "{}\n{}\n\n{}\n{}\n{}",
        method, canonical_uri, canonical_headers, signed_headers, payload_hash
    );

    let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, region);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        amz_date,
        credential_scope,
        hex_sha256(canonical_request.as_bytes())
    );

    let signing_key = derive_signing_key(&creds.secret_access_key, date_stamp, region, "s3");
    let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));

    format!(
        "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
        creds.access_key_id, credential_scope, signed_headers, signature
    )
}

/// Hostname for the bucket: the custom endpoint's host, or virtual-hosted style.
fn s3_host(config: &S3StorageConfig) -> String {
    if let Some(ref endpoint) = config.endpoint_url {
        endpoint
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_end_matches('/')
            .to_string()
    } else {
        format!("{}.s3.{}.amazonaws.com", config.bucket, config.region)
    }
}

fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// ```text
/// kDate    = HMAC("AWS4" + secret, dateStamp)
/// kRegion  = HMAC(kDate, region)
/// kService = HMAC(kRegion, service)
/// kSigning = HMAC(kService, "aws4_request")
/// ```
fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(
        format!("AWS4{}", secret_key).as_bytes(),
        date_stamp.as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// RFC 3986 encoding; unreserved characters `A-Z a-z 0-9 - _ . ~` pass through.
fn uri_encode(s: &str) -> String {
    let mut result = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => {
                result.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    result
}

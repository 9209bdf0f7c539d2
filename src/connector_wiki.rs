//! Wiki content source (Confluence-style REST API).
//!
//! Pages live under `{base_url}/rest/api/content/{id}`. Version tokens are
//! the wiki's page version numbers; every update is a `PUT` carrying
//! `version.number = current + 1`.
//!
//! Undeleting a page differs between wiki versions, so the untrash step is
//! a [`RestoreChain`]:
//!
//! 1. `POST /restore` with a `{confirm, restoreMode}` body
//! 2. `POST /restore` without a body
//! 3. `PUT` the trashed page back with `status = "current"`
//!
//! After the page is live again its content is reverted to the requested
//! version if it differs.
//!
//! # Environment Variables
//!
//! - `WIKI_USERNAME` (required)
//! - `WIKI_API_TOKEN` (required)

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

use dedupe_harness_core::models::VersionToken;

use crate::config::WikiContentConfig;
use crate::content_source::{ContentSource, Page, RestoreChain, RestoreStrategy};

pub struct WikiSource {
    config: WikiContentConfig,
    username: String,
    api_token: String,
    client: reqwest::Client,
    untrash_chain: RestoreChain<WikiSource>,
}

impl WikiSource {
    pub fn new(config: WikiContentConfig, username: String, api_token: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            config,
            username,
            api_token,
            client,
            untrash_chain: RestoreChain::new()
                .with(RestoreEndpoint { confirm_body: true })
                .with(RestoreEndpoint { confirm_body: false })
                .with(StatusFlip),
        })
    }

    pub fn from_env(config: WikiContentConfig) -> Result<Self> {
        let username = std::env::var("WIKI_USERNAME")
            .context("WIKI_USERNAME environment variable not set")?;
        let api_token = std::env::var("WIKI_API_TOKEN")
            .context("WIKI_API_TOKEN environment variable not set")?;
        Self::new(config, username, api_token)
    }

    fn content_url(&self, page_id: &str) -> String {
        format!(
            "{}/rest/api/content/{}",
            self.config.base_url.trim_end_matches('/'),
            page_id
        )
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .basic_auth(&self.username, Some(&self.api_token))
            .header("Accept", "application/json")
    }

    /// GET a page as JSON. `Ok(None)` on 404.
    async fn get_page_json(&self, page_id: &str, query: &[(&str, &str)]) -> Result<Option<Value>> {
        let resp = self
            .request(reqwest::Method::GET, &self.content_url(page_id))
            .query(query)
            .send()
            .await
            .with_context(|| format!("GET page {} failed", page_id))?;
        let status = resp.status();
        if status.as_u16() == 404 {
            return Ok(None);
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            bail!("GET page {} failed: {} - {}", page_id, status, text);
        }
        Ok(Some(resp.json().await?))
    }

    async fn current_version_number(&self, page_id: &str) -> Result<Option<u64>> {
        Ok(self
            .get_page_json(page_id, &[("expand", "version")])
            .await?
            .and_then(|json| version_number(&json)))
    }

    async fn put_page(&self, page_id: &str, body: &Value) -> Result<()> {
        let resp = self
            .request(reqwest::Method::PUT, &self.content_url(page_id))
            .json(body)
            .send()
            .await
            .with_context(|| format!("PUT page {} failed", page_id))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("PUT page {} failed: {} - {}", page_id, status, text);
        }
        Ok(())
    }

    /// Overwrite the live page with the content of an older version.
    async fn revert_to_version(&self, page_id: &str, version: u64) -> Result<()> {
        let version_str = version.to_string();
        let old = self
            .get_page_json(
                page_id,
                &[("expand", "body.storage,version"), ("version", version_str.as_str())],
            )
            .await?
            .ok_or_else(|| anyhow::anyhow!("version {} of page {} not found", version, page_id))?;
        if version_number(&old) != Some(version) {
            bail!(
                "wiki returned version {:?} instead of {}",
                version_number(&old),
                version
            );
        }

        let current = self
            .current_version_number(page_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("page {} is not live", page_id))?;
        let body = update_body(
            current + 1,
            old.get("title").and_then(Value::as_str).unwrap_or_default(),
            storage_value(&old),
            None,
            Some(&format!("Reverted to version {}", version)),
        );
        self.put_page(page_id, &body).await
    }

    fn page_from_json(&self, json: &Value, fallback_space: &str) -> Option<Page> {
        let id = json.get("id").and_then(Value::as_str)?.to_string();
        let webui = json
            .pointer("/_links/webui")
            .and_then(Value::as_str)
            .unwrap_or_default();
        Some(Page {
            source_id: id,
            title: json
                .get("title")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            url: format!("{}{}", self.config.base_url.trim_end_matches('/'), webui),
            space: json
                .pointer("/space/key")
                .and_then(Value::as_str)
                .unwrap_or(fallback_space)
                .to_string(),
            content: storage_value(json).to_string(),
            version: VersionToken(version_number(json).unwrap_or(1).to_string()),
        })
    }
}

#[async_trait]
impl ContentSource for WikiSource {
    fn name(&self) -> &str {
        "wiki"
    }

    async fn list_pages(&self) -> Result<Vec<Page>> {
        let url = format!(
            "{}/rest/api/content",
            self.config.base_url.trim_end_matches('/')
        );
        let limit = self.config.limit_per_space.to_string();
        let mut pages = Vec::new();

        for space in &self.config.space_keys {
            let resp = self
                .request(reqwest::Method::GET, &url)
                .query(&[
                    ("spaceKey", space.as_str()),
                    ("type", "page"),
                    ("limit", limit.as_str()),
                    ("expand", "body.storage,version,space"),
                ])
                .send()
                .await
                .with_context(|| format!("listing space {} failed", space))?;
            if !resp.status().is_success() {
                let status = resp.status();
                let text = resp.text().await.unwrap_or_default();
                bail!("listing space {} failed: {} - {}", space, status, text);
            }
            let json: Value = resp.json().await?;
            let results = json
                .get("results")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            tracing::debug!(space = %space, count = results.len(), "listed wiki pages");
            pages.extend(results.iter().filter_map(|r| self.page_from_json(r, space)));
        }

        pages.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        Ok(pages)
    }

    async fn fetch_page(&self, source_id: &str) -> Result<Option<Page>> {
        Ok(self
            .get_page_json(source_id, &[("expand", "body.storage,version,space")])
            .await?
            .and_then(|json| self.page_from_json(&json, "")))
    }

    async fn get_version(&self, source_id: &str) -> Result<VersionToken> {
        let number = self
            .current_version_number(source_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("page {} not found", source_id))?;
        Ok(VersionToken(number.to_string()))
    }

    async fn update_page(&self, source_id: &str, title: &str, content: &str) -> Result<()> {
        let current = self
            .current_version_number(source_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("page {} not found", source_id))?;
        let body = update_body(current + 1, title, &to_storage_format(content), None, None);
        self.put_page(source_id, &body).await
    }

    async fn delete_page(&self, source_id: &str) -> Result<()> {
        let resp = self
            .request(reqwest::Method::DELETE, &self.content_url(source_id))
            .send()
            .await
            .with_context(|| format!("DELETE page {} failed", source_id))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("DELETE page {} failed: {} - {}", source_id, status, text);
        }
        Ok(())
    }

    async fn restore(&self, source_id: &str, version: &VersionToken) -> Result<()> {
        let wanted: u64 = version
            .0
            .parse()
            .with_context(|| format!("invalid wiki version token '{}'", version))?;

        let current = match self.current_version_number(source_id).await? {
            Some(n) => n,
            None => {
                self.untrash_chain.run(self, source_id, version).await?;
                self.current_version_number(source_id)
                    .await?
                    .ok_or_else(|| anyhow::anyhow!("page {} still missing after untrash", source_id))?
            }
        };

        if current != wanted {
            self.revert_to_version(source_id, wanted).await?;
        }
        Ok(())
    }
}

/// `POST {content}/restore`, with or without a confirmation body.
struct RestoreEndpoint {
    confirm_body: bool,
}

#[async_trait]
impl RestoreStrategy<WikiSource> for RestoreEndpoint {
    fn name(&self) -> &'static str {
        if self.confirm_body {
            "restore-endpoint"
        } else {
            "restore-endpoint-bare"
        }
    }

    async fn attempt(&self, wiki: &WikiSource, page_id: &str, _version: &VersionToken) -> Result<()> {
        let url = format!("{}/restore", wiki.content_url(page_id));
        let mut req = wiki.request(reqwest::Method::POST, &url);
        if self.confirm_body {
            req = req.json(&json!({ "confirm": true, "restoreMode": "full" }));
        }
        let resp = req.send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("{} - {}", status, text);
        }
        Ok(())
    }
}

/// Re-PUT the trashed page with `status = "current"`.
struct StatusFlip;

#[async_trait]
impl RestoreStrategy<WikiSource> for StatusFlip {
    fn name(&self) -> &'static str {
        "status-flip"
    }

    async fn attempt(&self, wiki: &WikiSource, page_id: &str, _version: &VersionToken) -> Result<()> {
        let trashed = wiki
            .get_page_json(
                page_id,
                &[("status", "trashed"), ("expand", "body.storage,version")],
            )
            .await?
            .ok_or_else(|| anyhow::anyhow!("page {} not found in trash", page_id))?;

        let body = update_body(
            version_number(&trashed).unwrap_or(1) + 1,
            trashed.get("title").and_then(Value::as_str).unwrap_or("Restored Page"),
            storage_value(&trashed),
            Some("current"),
            None,
        );
        wiki.put_page(page_id, &body).await
    }
}

fn version_number(json: &Value) -> Option<u64> {
    json.pointer("/version/number").and_then(Value::as_u64)
}

fn storage_value(json: &Value) -> &str {
    json.pointer("/body/storage/value")
        .and_then(Value::as_str)
        .unwrap_or_default()
}

fn update_body(
    version: u64,
    title: &str,
    storage: &str,
    status: Option<&str>,
    message: Option<&str>,
) -> Value {
    let mut version_obj = json!({ "number": version });
    if let Some(message) = message {
        version_obj["message"] = json!(message);
    }
    let mut body = json!({
        "version": version_obj,
        "title": title,
        "type": "page",
        "body": { "storage": { "value": storage, "representation": "storage" } },
    });
    if let Some(status) = status {
        body["status"] = json!(status);
    }
    body
}

/// Wrap plain text in paragraphs; HTML passes through.
fn to_storage_format(content: &str) -> String {
    let trimmed = content.trim();
    if trimmed.starts_with('<') {
        return trimmed.to_string();
    }
    trimmed
        .split("\n\n")
        .filter(|p| !p.trim().is_empty())
        .map(|p| format!("<p>{}</p>", p.trim().replace('\n', " ")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> WikiSource {
        WikiSource::new(
            WikiContentConfig {
                base_url: "https://wiki.example.com/".into(),
                space_keys: vec!["ENG".into()],
                limit_per_space: 50,
                timeout_secs: 5,
            },
            "bot".into(),
            "token".into(),
        )
        .unwrap()
    }

    #[test]
    fn test_page_from_json() {
        let json = json!({
            "id": "12345",
            "title": "Deploy Guide",
            "space": { "key": "ENG" },
            "version": { "number": 7 },
            "body": { "storage": { "value": "<p>Steps</p>" } },
            "_links": { "webui": "/spaces/ENG/pages/12345" }
        });
        let page = source().page_from_json(&json, "X").unwrap();
        assert_eq!(page.source_id, "12345");
        assert_eq!(page.space, "ENG");
        assert_eq!(page.version, VersionToken("7".into()));
        assert_eq!(page.url, "https://wiki.example.com/spaces/ENG/pages/12345");
        assert_eq!(page.content, "<p>Steps</p>");
    }

    #[test]
    fn test_update_body_shape() {
        let body = update_body(4, "T", "<p>x</p>", Some("current"), Some("Reverted"));
        assert_eq!(body["version"]["number"], 4);
        assert_eq!(body["version"]["message"], "Reverted");
        assert_eq!(body["status"], "current");
        assert_eq!(body["body"]["storage"]["representation"], "storage");
    }

    #[test]
    fn test_storage_format() {
        assert_eq!(to_storage_format("a\nb\n\nc"), "<p>a b</p><p>c</p>");
        assert_eq!(to_storage_format(" <h1>x</h1> "), "<h1>x</h1>");
    }

    #[test]
    fn test_untrash_strategy_order() {
        assert_eq!(
            source().untrash_chain.names(),
            vec!["restore-endpoint", "restore-endpoint-bare", "status-flip"]
        );
    }
}

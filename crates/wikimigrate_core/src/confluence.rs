use std::fmt;
use std::path::Path;
use std::thread::sleep;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use log::debug;
use reqwest::StatusCode;
use reqwest::blocking::{Client, Response, multipart};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::MigrationConfig;

/// Typed marker carried in the error chain when the target answers HTTP 429.
/// Orchestration boundaries detect it with `root_cause().is::<RateLimited>()`
/// and back off; nothing retries at the per-request level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimited;

impl fmt::Display for RateLimited {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "Confluence rate limit hit (HTTP 429)")
    }
}

impl std::error::Error for RateLimited {}

pub fn is_rate_limited(error: &anyhow::Error) -> bool {
    error.root_cause().is::<RateLimited>()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSpace {
    pub key: String,
    pub homepage_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePage {
    pub id: String,
    pub title: String,
    pub version: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAttachment {
    pub id: String,
    pub file_name: String,
}

/// The slice of the Confluence REST surface the migration consumes. The
/// publisher and validator are generic over this trait so protocol tests run
/// against an in-memory fake.
pub trait ConfluenceApi {
    fn get_space_by_key(&mut self, key: &str) -> Result<RemoteSpace>;
    fn get_page_by_title(&mut self, space_key: &str, title: &str) -> Result<Option<RemotePage>>;
    fn create_page(
        &mut self,
        title: &str,
        space_key: &str,
        parent_id: Option<&str>,
        body: &str,
    ) -> Result<String>;
    fn update_page(&mut self, id: &str, title: &str, version: i64, body: &str) -> Result<()>;
    fn get_page_version(&mut self, id: &str) -> Result<i64>;
    fn get_child_pages(&mut self, parent_id: &str) -> Result<Vec<RemotePage>>;
    fn delete_page(&mut self, id: &str) -> Result<()>;
    fn get_attachments(&mut self, page_id: &str) -> Result<Vec<RemoteAttachment>>;
    fn upload_attachment(
        &mut self,
        page_id: &str,
        file_path: &Path,
        file_name: &str,
        mime_type: &str,
    ) -> Result<String>;
    fn request_count(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct ConfluenceClientConfig {
    pub base_url: String,
    pub username: String,
    pub api_token: String,
    pub timeout_ms: u64,
    pub rate_limit_read_ms: u64,
    pub rate_limit_write_ms: u64,
}

impl ConfluenceClientConfig {
    pub fn from_config(config: &MigrationConfig) -> Result<Self> {
        Ok(Self {
            base_url: config.base_url()?,
            username: config.username()?,
            api_token: config.api_token()?,
            timeout_ms: env_value_u64("CONFLUENCE_HTTP_TIMEOUT_MS", 30_000),
            rate_limit_read_ms: env_value_u64("CONFLUENCE_RATE_LIMIT_READ", 100),
            rate_limit_write_ms: env_value_u64("CONFLUENCE_RATE_LIMIT_WRITE", 300),
        })
    }
}

fn env_value_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

pub struct ConfluenceClient {
    client: Client,
    config: ConfluenceClientConfig,
    last_request_at: Option<Instant>,
    request_count: usize,
}

impl ConfluenceClient {
    pub fn new(config: ConfluenceClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .context("failed to build Confluence HTTP client")?;
        Ok(Self {
            client,
            config,
            last_request_at: None,
            request_count: 0,
        })
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/rest/api/{}", self.config.base_url, path)
    }

    fn apply_rate_limit(&mut self, is_write: bool) {
        let delay = if is_write {
            Duration::from_millis(self.config.rate_limit_write_ms)
        } else {
            Duration::from_millis(self.config.rate_limit_read_ms)
        };
        if let Some(last) = self.last_request_at {
            let elapsed = last.elapsed();
            if elapsed < delay {
                sleep(delay - elapsed);
            }
        }
        self.last_request_at = Some(Instant::now());
        self.request_count += 1;
    }

    /// Map the response codes that need differentiated handling. 404 is handled
    /// by callers that treat "absent" as a normal outcome.
    fn check_status(&self, response: &Response, operation: &str) -> Result<()> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => bail!(
                "Confluence rejected credentials during {operation} (HTTP {status}).\n\
                 Check CONFLUENCE_USERNAME / CONFLUENCE_API_TOKEN and the account's\n\
                 permissions on the target space."
            ),
            StatusCode::TOO_MANY_REQUESTS => {
                Err(anyhow!(RateLimited).context(format!("{operation} was rate limited")))
            }
            _ => bail!("Confluence {operation} failed with HTTP {status}"),
        }
    }

    fn get_json(
        &mut self,
        path: &str,
        query: &[(&str, &str)],
        operation: &str,
    ) -> Result<Option<serde_json::Value>> {
        self.apply_rate_limit(false);
        debug!("GET {path} {query:?}");
        let response = self
            .client
            .get(self.api_url(path))
            .basic_auth(&self.config.username, Some(&self.config.api_token))
            .query(query)
            .send()
            .with_context(|| format!("failed to call Confluence during {operation}"))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        self.check_status(&response, operation)?;
        let payload = response
            .json()
            .with_context(|| format!("failed to decode Confluence response for {operation}"))?;
        Ok(Some(payload))
    }

    fn send_json(
        &mut self,
        method: reqwest::Method,
        path: &str,
        body: &serde_json::Value,
        operation: &str,
    ) -> Result<serde_json::Value> {
        self.apply_rate_limit(true);
        debug!("{method} {path}");
        let response = self
            .client
            .request(method, self.api_url(path))
            .basic_auth(&self.config.username, Some(&self.config.api_token))
            .json(body)
            .send()
            .with_context(|| format!("failed to call Confluence during {operation}"))?;
        self.check_status(&response, operation)?;
        response
            .json()
            .with_context(|| format!("failed to decode Confluence response for {operation}"))
    }
}

#[derive(Debug, Deserialize)]
struct SearchResults<T> {
    #[serde(default = "Vec::new")]
    results: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct ContentPayload {
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    version: Option<VersionPayload>,
}

#[derive(Debug, Deserialize)]
struct VersionPayload {
    number: i64,
}

#[derive(Debug, Deserialize)]
struct SpacePayload {
    key: String,
    #[serde(rename = "homepage")]
    homepage: Option<HomepagePayload>,
}

#[derive(Debug, Deserialize)]
struct HomepagePayload {
    id: String,
}

#[derive(Debug, Deserialize)]
struct AttachmentPayload {
    id: String,
    title: String,
}

#[derive(Debug, Serialize)]
struct AncestorRef<'a> {
    id: &'a str,
}

fn page_from_payload(payload: ContentPayload) -> RemotePage {
    RemotePage {
        version: payload.version.map(|version| version.number).unwrap_or(1),
        id: payload.id,
        title: payload.title,
    }
}

impl ConfluenceApi for ConfluenceClient {
    fn get_space_by_key(&mut self, key: &str) -> Result<RemoteSpace> {
        let payload = self
            .get_json(
                &format!("space/{key}"),
                &[("expand", "homepage")],
                "space lookup",
            )?
            .ok_or_else(|| {
                anyhow!(
                    "Confluence space '{key}' was not found.\n\
                     Check CONFLUENCE_SPACE_KEY and CONFLUENCE_BASE_URL."
                )
            })?;
        let space: SpacePayload =
            serde_json::from_value(payload).context("failed to decode space payload")?;
        Ok(RemoteSpace {
            key: space.key,
            homepage_id: space.homepage.map(|homepage| homepage.id),
        })
    }

    fn get_page_by_title(&mut self, space_key: &str, title: &str) -> Result<Option<RemotePage>> {
        let Some(payload) = self.get_json(
            "content",
            &[
                ("spaceKey", space_key),
                ("title", title),
                ("expand", "version"),
            ],
            "page lookup",
        )?
        else {
            return Ok(None);
        };
        let results: SearchResults<ContentPayload> =
            serde_json::from_value(payload).context("failed to decode page lookup payload")?;
        Ok(results.results.into_iter().next().map(page_from_payload))
    }

    fn create_page(
        &mut self,
        title: &str,
        space_key: &str,
        parent_id: Option<&str>,
        body: &str,
    ) -> Result<String> {
        let ancestors: Vec<AncestorRef<'_>> =
            parent_id.map(|id| vec![AncestorRef { id }]).unwrap_or_default();
        let payload = json!({
            "type": "page",
            "title": title,
            "space": { "key": space_key },
            "ancestors": ancestors,
            "body": {
                "storage": { "value": body, "representation": "storage" }
            }
        });
        let response = self.send_json(
            reqwest::Method::POST,
            "content",
            &payload,
            "page creation",
        )?;
        let content: ContentPayload =
            serde_json::from_value(response).context("failed to decode created page payload")?;
        Ok(content.id)
    }

    fn update_page(&mut self, id: &str, title: &str, version: i64, body: &str) -> Result<()> {
        let payload = json!({
            "type": "page",
            "title": title,
            "version": { "number": version },
            "body": {
                "storage": { "value": body, "representation": "storage" }
            }
        });
        self.send_json(
            reqwest::Method::PUT,
            &format!("content/{id}"),
            &payload,
            "page update",
        )?;
        Ok(())
    }

    fn get_page_version(&mut self, id: &str) -> Result<i64> {
        let payload = self
            .get_json(
                &format!("content/{id}"),
                &[("expand", "version")],
                "version lookup",
            )?
            .ok_or_else(|| anyhow!("page {id} disappeared during version lookup"))?;
        let content: ContentPayload =
            serde_json::from_value(payload).context("failed to decode version payload")?;
        Ok(content.version.map(|version| version.number).unwrap_or(1))
    }

    fn get_child_pages(&mut self, parent_id: &str) -> Result<Vec<RemotePage>> {
        let Some(payload) = self.get_json(
            &format!("content/{parent_id}/child/page"),
            &[("limit", "200"), ("expand", "version")],
            "child page listing",
        )?
        else {
            return Ok(Vec::new());
        };
        let results: SearchResults<ContentPayload> =
            serde_json::from_value(payload).context("failed to decode child page payload")?;
        Ok(results.results.into_iter().map(page_from_payload).collect())
    }

    fn delete_page(&mut self, id: &str) -> Result<()> {
        self.apply_rate_limit(true);
        debug!("DELETE content/{id}");
        let response = self
            .client
            .delete(self.api_url(&format!("content/{id}")))
            .basic_auth(&self.config.username, Some(&self.config.api_token))
            .send()
            .context("failed to call Confluence during page deletion")?;
        if response.status() == StatusCode::NOT_FOUND {
            // Already gone; deletion is idempotent.
            return Ok(());
        }
        self.check_status(&response, "page deletion")
    }

    fn get_attachments(&mut self, page_id: &str) -> Result<Vec<RemoteAttachment>> {
        let Some(payload) = self.get_json(
            &format!("content/{page_id}/child/attachment"),
            &[("limit", "200")],
            "attachment listing",
        )?
        else {
            return Ok(Vec::new());
        };
        let results: SearchResults<AttachmentPayload> =
            serde_json::from_value(payload).context("failed to decode attachment payload")?;
        Ok(results
            .results
            .into_iter()
            .map(|attachment| RemoteAttachment {
                id: attachment.id,
                file_name: attachment.title,
            })
            .collect())
    }

    fn upload_attachment(
        &mut self,
        page_id: &str,
        file_path: &Path,
        file_name: &str,
        mime_type: &str,
    ) -> Result<String> {
        self.apply_rate_limit(true);
        debug!("POST content/{page_id}/child/attachment ({file_name})");
        let part = multipart::Part::file(file_path)
            .with_context(|| format!("failed to read attachment {}", file_path.display()))?
            .file_name(file_name.to_string())
            .mime_str(mime_type)
            .with_context(|| format!("invalid mime type {mime_type}"))?;
        let form = multipart::Form::new().part("file", part);
        let response = self
            .client
            .post(self.api_url(&format!("content/{page_id}/child/attachment")))
            .basic_auth(&self.config.username, Some(&self.config.api_token))
            .header("X-Atlassian-Token", "nocheck")
            .multipart(form)
            .send()
            .context("failed to call Confluence during attachment upload")?;
        self.check_status(&response, "attachment upload")?;
        let results: SearchResults<AttachmentPayload> = response
            .json()
            .context("failed to decode attachment upload payload")?;
        results
            .results
            .into_iter()
            .next()
            .map(|attachment| attachment.id)
            .ok_or_else(|| anyhow!("attachment upload returned an empty result set"))
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;

    use super::{RateLimited, is_rate_limited};

    #[test]
    fn rate_limited_marker_is_detectable_through_context() {
        let error = anyhow!(RateLimited)
            .context("page creation was rate limited")
            .context("placeholder pass failed");
        assert!(is_rate_limited(&error));
    }

    #[test]
    fn ordinary_errors_are_not_rate_limited() {
        let error = anyhow!("HTTP 500");
        assert!(!is_rate_limited(&error));
    }
}

//! Attachment storage, content hashing, HTTP fetch utilities and store contracts for castsync.

pub mod memory;
pub mod postgres;
pub mod store;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use castsync_core::RemoteId;
use reqwest::{StatusCode, Url};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info_span, warn, Instrument};
use uuid::Uuid;

pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use store::{ContentStore, OptionStore, RecordSummary, ScheduleTable, StoreError, StoreResult};

pub const CRATE_NAME: &str = "castsync-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Serializes JSON with object keys sorted and no insignificant whitespace.
pub fn canonical_json(value: &JsonValue) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &JsonValue, out: &mut String) {
    match value {
        JsonValue::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&JsonValue::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        JsonValue::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Stable content hash of a whole collection payload.
pub fn content_hash(records: &[JsonValue]) -> String {
    let mut out = String::from("[");
    for (i, record) in records.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        write_canonical(record, &mut out);
    }
    out.push(']');
    sha256_hex(out.as_bytes())
}

#[derive(Debug, Clone)]
pub struct StoredAttachment {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Hash-addressed local storage for downloaded thumbnails.
#[derive(Debug, Clone)]
pub struct AttachmentStore {
    root: PathBuf,
}

impl AttachmentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn attachment_relative_path(
        &self,
        show_id: RemoteId,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from("shows")
            .join(show_id.to_string())
            .join(format!("{content_hash}.{ext}"))
    }

    /// Store bytes immutably using a hash-addressed path and atomic temp-file rename.
    pub async fn store_bytes(
        &self,
        show_id: RemoteId,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredAttachment> {
        let content_hash = sha256_hex(bytes);
        let relative_path = self.attachment_relative_path(show_id, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating attachment directory {}", parent.display()))?;

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking attachment path {}", absolute_path.display()))?
        {
            return Ok(StoredAttachment {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp attachment file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp attachment file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp attachment file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(StoredAttachment {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: false,
            }),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp attachment {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

/// File extension of the last path segment of `url`, lowercased.
pub fn extension_from_url(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| u.path_segments().and_then(|segments| segments.last().map(str::to_string)))
        .and_then(|name| name.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase()))
        .filter(|ext| !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or_else(|| "bin".to_string())
}

/// An absolute http(s) URL with a host.
pub fn is_valid_remote_url(candidate: &str) -> bool {
    Url::parse(candidate.trim())
        .map(|u| matches!(u.scheme(), "http" | "https") && u.host_str().is_some_and(|h| !h.is_empty()))
        .unwrap_or(false)
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    /// Used for expanded-page and bulk id-only requests.
    pub extended_timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            extended_timeout: Duration::from_secs(60),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("malformed json from {url}: {source}")]
    Json {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("response from {url} has no `{key}` collection")]
    MissingCollection { url: String, key: String },
    #[error("invalid url {0}")]
    InvalidUrl(String),
}

/// Paginated GET against the remote catalog. Never retries; failures are logged and absorbed.
#[derive(Debug, Clone)]
pub struct ResourceFetcher {
    client: reqwest::Client,
    timeout: Duration,
    extended_timeout: Duration,
}

impl ResourceFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().gzip(true).brotli(true);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            timeout: config.timeout,
            extended_timeout: config.extended_timeout,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn extended_timeout(&self) -> Duration {
        self.extended_timeout
    }

    async fn read_json(&self, resp: reqwest::Response) -> Result<JsonValue, FetchError> {
        let status = resp.status();
        let url = resp.url().to_string();
        if status != StatusCode::OK {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url,
            });
        }
        let body = resp.bytes().await?;
        serde_json::from_slice(&body).map_err(|source| FetchError::Json { url, source })
    }

    pub async fn get_json(&self, url: &str, timeout: Duration) -> Result<JsonValue, FetchError> {
        let resp = self.client.get(url).timeout(timeout).send().await?;
        self.read_json(resp).await
    }

    pub async fn post_json(&self, url: &str, body: &JsonValue) -> Result<JsonValue, FetchError> {
        let resp = self
            .client
            .post(url)
            .timeout(self.timeout)
            .json(body)
            .send()
            .await?;
        self.read_json(resp).await
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let resp = self
            .client
            .get(url)
            .timeout(self.extended_timeout)
            .send()
            .await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let body = resp.bytes().await?.to_vec();
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }

    /// Like [`ResourceFetcher::fetch`] but reports failure as `None` instead of an empty collection.
    pub async fn try_fetch(
        &self,
        url: &str,
        collection_key: &str,
        ensure_all_loaded: bool,
    ) -> Option<Vec<JsonValue>> {
        let span = info_span!("resource_fetch", url, collection_key);
        async move {
            match self
                .fetch_collection(url, collection_key, ensure_all_loaded, self.timeout)
                .await
            {
                Ok(records) => Some(records),
                Err(err) => {
                    error!(%err, "resource fetch failed");
                    None
                }
            }
        }
        .instrument(span)
        .await
    }

    pub async fn fetch(
        &self,
        url: &str,
        collection_key: &str,
        ensure_all_loaded: bool,
    ) -> Vec<JsonValue> {
        self.try_fetch(url, collection_key, ensure_all_loaded)
            .await
            .unwrap_or_default()
    }

    async fn fetch_collection(
        &self,
        url: &str,
        collection_key: &str,
        ensure_all_loaded: bool,
        timeout: Duration,
    ) -> Result<Vec<JsonValue>, FetchError> {
        let body = self.get_json(url, timeout).await?;
        let records = take_collection(&body, url, collection_key)?;

        if !ensure_all_loaded {
            return Ok(records);
        }
        let Some((count, page_size)) = page_meta(&body) else {
            return Ok(records);
        };
        if count <= page_size {
            return Ok(records);
        }

        // One expanded follow-up only; a remaining shortfall is accepted.
        let expanded = with_page_size(url, count + 10)?;
        debug!(count, page_size, %expanded, "expanding page size");
        let body = self.get_json(&expanded, self.extended_timeout).await?;
        let records = take_collection(&body, &expanded, collection_key)?;
        if (records.len() as u64) < count {
            warn!(count, loaded = records.len(), "expanded page still short of reported count");
        }
        Ok(records)
    }
}

fn take_collection(body: &JsonValue, url: &str, key: &str) -> Result<Vec<JsonValue>, FetchError> {
    body.get(key)
        .and_then(JsonValue::as_array)
        .cloned()
        .ok_or_else(|| FetchError::MissingCollection {
            url: url.to_string(),
            key: key.to_string(),
        })
}

/// `(meta.count, meta.pageSize)` when both are present.
pub fn page_meta(body: &JsonValue) -> Option<(u64, u64)> {
    let meta = body.get("meta")?;
    let count = meta.get("count")?.as_u64()?;
    let page_size = meta.get("pageSize")?.as_u64()?;
    Some((count, page_size))
}

/// Rewrites (or appends) the `page_size` query parameter.
pub fn with_page_size(url: &str, page_size: u64) -> Result<String, FetchError> {
    let mut parsed = Url::parse(url).map_err(|_| FetchError::InvalidUrl(url.to_string()))?;
    let retained: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(k, _)| k != "page_size")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    parsed
        .query_pairs_mut()
        .clear()
        .extend_pairs(retained)
        .append_pair("page_size", &page_size.to_string());
    Ok(parsed.to_string())
}

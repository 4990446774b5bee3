//! HTTP acquisition + atomic artifact persistence for the pipeline.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, REFERER, USER_AGENT};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "vtrack-storage";

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
}

/// Output directory whose files are replaced wholesale on every run.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Overwrite `relative_path` with `bytes` via a sibling temp file and an atomic rename,
    /// so readers never observe a partially written artifact.
    pub async fn replace_bytes(
        &self,
        relative_path: impl AsRef<Path>,
        bytes: &[u8],
    ) -> anyhow::Result<StoredArtifact> {
        let relative_path = relative_path.as_ref().to_path_buf();
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating artifact directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp artifact file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp artifact file {}", temp_path.display()))?;
        file.sync_all()
            .await
            .with_context(|| format!("syncing temp artifact file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically replacing {} with {}",
                    absolute_path.display(),
                    temp_path.display()
                )
            });
        }

        Ok(StoredArtifact {
            content_hash: Self::sha256_hex(bytes),
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// A single GET. Per-request headers override the client defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    pub user_agent: Option<String>,
    pub referer: Option<String>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            user_agent: None,
            referer: None,
        }
    }

    pub fn with_browser_headers(mut self, user_agent: impl Into<String>, referer: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self.referer = Some(referer.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: u16,
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Anything that can answer a GET: the live client, or fixtures in tests.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch(
        &self,
        run_id: Uuid,
        source_id: &str,
        request: &FetchRequest,
    ) -> Result<FetchedResponse, FetchError>;
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    fn build_request(&self, request: &FetchRequest) -> reqwest::RequestBuilder {
        let mut builder = self.client.get(&request.url);
        if let Some(user_agent) = &request.user_agent {
            builder = builder.header(USER_AGENT, user_agent);
        }
        if let Some(referer) = &request.referer {
            builder = builder.header(REFERER, referer);
        }
        builder
    }

    async fn fetch_with_retry(&self, request: &FetchRequest) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            match self.build_request(request).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let content_type = resp
                            .headers()
                            .get(CONTENT_TYPE)
                            .and_then(|v| v.to_str().ok())
                            .map(ToString::to_string);
                        let body = resp.bytes().await?.to_vec();
                        debug!(status = status.as_u16(), bytes = body.len(), "fetched");
                        return Ok(FetchedResponse {
                            status: status.as_u16(),
                            final_url,
                            content_type,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(status = status.as_u16(), attempt, "transient http status; retrying");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(error = %err, attempt, "transient request failure; retrying");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

#[async_trait]
impl PageSource for HttpFetcher {
    async fn fetch(
        &self,
        run_id: Uuid,
        source_id: &str,
        request: &FetchRequest,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, source_id, url = %request.url);
        self.fetch_with_retry(request).instrument(span).await
    }
}

#[derive(Debug, Clone)]
pub struct StaticResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl StaticResponse {
    pub fn html(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            content_type: Some("text/html; charset=utf-8".to_string()),
            body: body.into().into_bytes(),
        }
    }

    pub fn bytes(content_type: &str, body: Vec<u8>) -> Self {
        Self {
            status: 200,
            content_type: Some(content_type.to_string()),
            body,
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            content_type: Some("text/html".to_string()),
            body: Vec::new(),
        }
    }
}

/// Fixture-backed `PageSource`; unknown URLs answer 404.
#[derive(Debug, Clone, Default)]
pub struct StaticPageSource {
    pages: HashMap<String, StaticResponse>,
}

impl StaticPageSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, url: impl Into<String>, response: StaticResponse) -> Self {
        self.pages.insert(url.into(), response);
        self
    }
}

#[async_trait]
impl PageSource for StaticPageSource {
    async fn fetch(
        &self,
        _run_id: Uuid,
        _source_id: &str,
        request: &FetchRequest,
    ) -> Result<FetchedResponse, FetchError> {
        let Some(page) = self.pages.get(&request.url) else {
            return Err(FetchError::HttpStatus {
                status: 404,
                url: request.url.clone(),
            });
        };
        if !(200..300).contains(&page.status) {
            return Err(FetchError::HttpStatus {
                status: page.status,
                url: request.url.clone(),
            });
        }
        Ok(FetchedResponse {
            status: page.status,
            final_url: request.url.clone(),
            content_type: page.content_type.clone(),
            body: page.body.clone(),
        })
    }
}

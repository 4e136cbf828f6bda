//! Object storage, HTTP fetch and credential utilities for the feedstock jobs.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use secrecy::{ExposeSecret, Secret, SecretString};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "feedstock-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Key under which a raw payload is archived: `raw/{stamp}/{source}/{hash}.{ext}`.
pub fn archive_key(
    fetched_at: DateTime<Utc>,
    source_id: &str,
    content_hash: &str,
    extension: &str,
) -> String {
    let stamp = fetched_at.format("%Y%m%d_%H%M%S");
    let ext = extension.trim_start_matches('.').trim();
    let ext = if ext.is_empty() { "bin" } else { ext };
    format!("raw/{stamp}/{source_id}/{content_hash}.{ext}")
}

/// Content type inferred from a key's extension.
pub fn content_type_for_key(key: &str) -> &'static str {
    match key.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase()) {
        Some(ext) if ext == "pdf" => "application/pdf",
        Some(ext) if ext == "json" => "application/json",
        Some(ext) if ext == "md" => "text/markdown",
        Some(ext) if ext == "txt" || ext == "log" => "text/plain",
        Some(ext) if ext == "csv" => "text/csv",
        _ => "application/octet-stream",
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub key: String,
    pub content_type: String,
    pub content_hash: String,
    pub byte_size: usize,
    pub deduplicated: bool,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object {0} not found")]
    NotFound(String),
    #[error("invalid object key {0:?}")]
    InvalidKey(String),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        StoreError::Io {
            context: context.into(),
            source,
        }
    }
}

/// Keys are `/`-separated relative names; no empty or `..` segments.
pub fn validate_key(key: &str) -> Result<(), StoreError> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..");
    if bad {
        Err(StoreError::InvalidKey(key.to_string()))
    } else {
        Ok(())
    }
}

/// Blob container holding report files, staged PDFs and run journals.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;

    /// Writes (or replaces) the object at `key`.
    async fn put(
        &self,
        key: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<StoredObject, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Keys starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    async fn rename(&self, from: &str, to: &str) -> Result<StoredObject, StoreError> {
        let bytes = self.get(from).await?;
        let stored = self.put(to, &bytes, content_type_for_key(to)).await?;
        self.delete(from).await?;
        Ok(stored)
    }

    /// Appends to a text object, creating it when absent.
    async fn append(&self, key: &str, bytes: &[u8]) -> Result<StoredObject, StoreError> {
        let mut current = match self.get(key).await {
            Ok(existing) => existing,
            Err(StoreError::NotFound(_)) => Vec::new(),
            Err(err) => return Err(err),
        };
        current.extend_from_slice(bytes);
        self.put(key, &current, content_type_for_key(key)).await
    }

    /// Stores a raw payload under a hash-addressed key; identical payloads
    /// fetched in the same second are written once.
    async fn archive(
        &self,
        fetched_at: DateTime<Utc>,
        source_id: &str,
        extension: &str,
        bytes: &[u8],
    ) -> Result<StoredObject, StoreError> {
        let content_hash = sha256_hex(bytes);
        let key = archive_key(fetched_at, source_id, &content_hash, extension);
        if self.exists(&key).await? {
            return Ok(StoredObject {
                content_type: content_type_for_key(&key).to_string(),
                key,
                content_hash,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }
        let content_type = content_type_for_key(&key);
        self.put(&key, bytes, content_type).await
    }
}

#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        validate_key(key)?;
        Ok(key.split('/').fold(self.root.clone(), |p, seg| p.join(seg)))
    }

    async fn ensure_parent(path: &Path) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io(format!("creating directory {}", parent.display()), e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.path_for(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(key.to_string()))
            }
            Err(err) => Err(StoreError::io(format!("reading {}", path.display()), err)),
        }
    }

    /// Atomic temp-file write followed by rename. The filesystem keeps no
    /// metadata, so `content_type` is only echoed back.
    async fn put(
        &self,
        key: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<StoredObject, StoreError> {
        let absolute_path = self.path_for(key)?;
        Self::ensure_parent(&absolute_path).await?;

        let temp_name = format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len());
        let temp_path = absolute_path.with_file_name(temp_name);

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|e| StoreError::io(format!("opening temp file {}", temp_path.display()), e))?;
        file.write_all(bytes)
            .await
            .map_err(|e| StoreError::io(format!("writing temp file {}", temp_path.display()), e))?;
        file.flush()
            .await
            .map_err(|e| StoreError::io(format!("flushing temp file {}", temp_path.display()), e))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StoreError::io(
                format!(
                    "atomically renaming {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                ),
                err,
            ));
        }

        Ok(StoredObject {
            key: key.to_string(),
            content_type: content_type.to_string(),
            content_hash: sha256_hex(bytes),
            byte_size: bytes.len(),
            deduplicated: false,
        })
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let path = self.path_for(key)?;
        fs::try_exists(&path)
            .await
            .map_err(|e| StoreError::io(format!("checking {}", path.display()), e))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        let mut pending = vec![(self.root.clone(), String::new())];

        while let Some((dir, rel)) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(StoreError::io(format!("listing {}", dir.display()), err)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| StoreError::io(format!("listing {}", dir.display()), e))?
            {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with('.') {
                    continue;
                }
                let key = if rel.is_empty() {
                    name
                } else {
                    format!("{rel}/{name}")
                };
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| StoreError::io(format!("inspecting {key}"), e))?;
                if file_type.is_dir() {
                    pending.push((entry.path(), key));
                } else if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(key.to_string()))
            }
            Err(err) => Err(StoreError::io(format!("deleting {}", path.display()), err)),
        }
    }

    async fn rename(&self, from: &str, to: &str) -> Result<StoredObject, StoreError> {
        let source = self.path_for(from)?;
        let target = self.path_for(to)?;
        let bytes = self.get(from).await?;
        Self::ensure_parent(&target).await?;
        fs::rename(&source, &target).await.map_err(|e| {
            StoreError::io(
                format!("moving {} -> {}", source.display(), target.display()),
                e,
            )
        })?;
        Ok(StoredObject {
            key: to.to_string(),
            content_type: content_type_for_key(to).to_string(),
            content_hash: sha256_hex(&bytes),
            byte_size: bytes.len(),
            deduplicated: false,
        })
    }
}

#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, (Vec<u8>, String)>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn keys(&self) -> Vec<String> {
        self.objects.lock().await.keys().cloned().collect()
    }

    pub async fn content_type(&self, key: &str) -> Option<String> {
        self.objects.lock().await.get(key).map(|(_, ct)| ct.clone())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.objects
            .lock()
            .await
            .get(key)
            .map(|(bytes, _)| bytes.clone())
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn put(
        &self,
        key: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<StoredObject, StoreError> {
        validate_key(key)?;
        self.objects
            .lock()
            .await
            .insert(key.to_string(), (bytes.to_vec(), content_type.to_string()));
        Ok(StoredObject {
            key: key.to_string(),
            content_type: content_type.to_string(),
            content_hash: sha256_hex(bytes),
            byte_size: bytes.len(),
            deduplicated: false,
        })
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.objects.lock().await.contains_key(key))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .objects
            .lock()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.objects
            .lock()
            .await
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Bounded retry with capped exponential backoff, limited to a status set.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub retry_statuses: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            retry_statuses: vec![429, 500, 502, 503, 504],
        }
    }
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    pub fn classify_status(&self, status: StatusCode) -> RetryDisposition {
        if self.retry_statuses.contains(&status.as_u16()) {
            RetryDisposition::Retryable
        } else {
            RetryDisposition::NonRetryable
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

#[derive(Debug, Clone)]
pub struct BasicAuth {
    pub username: String,
    pub password: SecretString,
}

/// Outbound request description. Query pairs are kept apart from `url` so
/// credentials carried in them never reach logs or errors.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub basic_auth: Option<BasicAuth>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
            basic_auth: None,
        }
    }

    pub fn post(url: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            method: HttpMethod::Post,
            body: Some(body),
            ..Self::get(url)
        }
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn with_basic_auth(mut self, username: impl Into<String>, password: SecretString) -> Self {
        self.basic_auth = Some(BasicAuth {
            username: username.into(),
            password,
        });
        self
    }

    /// `url?k=v&...` without percent-encoding; only used for matching canned routes.
    pub fn rendered(&self) -> String {
        if self.query.is_empty() {
            return self.url.clone();
        }
        let pairs = self
            .query
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        format!("{}?{pairs}", self.url)
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
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(
        &self,
        run_id: Uuid,
        source_id: &str,
        request: &HttpRequest,
    ) -> Result<FetchedResponse, FetchError>;
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    retry: RetryPolicy,
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
            retry: config.retry,
        })
    }

    fn build(&self, request: &HttpRequest) -> reqwest::RequestBuilder {
        let method = match request.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
        };
        let mut builder = self.client.request(method, &request.url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(auth) = &request.basic_auth {
            builder = builder.basic_auth(&auth.username, Some(auth.password.expose_secret()));
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }
        builder
    }

    async fn send_with_retry(&self, request: &HttpRequest) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0;
        loop {
            match self.build(request).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let mut final_url = resp.url().clone();
                    final_url.set_query(None);

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url: final_url.to_string(),
                            body,
                        });
                    }

                    if self.retry.classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.retry.max_retries
                    {
                        warn!(status = status.as_u16(), attempt, "retrying request");
                        tokio::time::sleep(self.retry.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url.to_string(),
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.retry.max_retries
                    {
                        warn!(error = %err.without_url(), attempt, "retrying request");
                        tokio::time::sleep(self.retry.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err.without_url()));
                }
            }
        }
    }
}

#[async_trait]
impl HttpTransport for HttpFetcher {
    async fn send(
        &self,
        run_id: Uuid,
        source_id: &str,
        request: &HttpRequest,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, source_id, url = %request.url);
        self.send_with_retry(request).instrument(span).await
    }
}

/// Transport answering from a fixed route table; unmatched requests get 404.
/// A route matches when its needle occurs in the request's rendered URL.
#[derive(Debug, Default)]
pub struct CannedTransport {
    routes: Vec<(String, u16, Vec<u8>)>,
    seen: std::sync::Mutex<Vec<HttpRequest>>,
}

impl CannedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, needle: impl Into<String>, status: u16, body: impl Into<Vec<u8>>) -> Self {
        self.routes.push((needle.into(), status, body.into()));
        self
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.seen
            .lock()
            .map(|seen| seen.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl HttpTransport for CannedTransport {
    async fn send(
        &self,
        _run_id: Uuid,
        _source_id: &str,
        request: &HttpRequest,
    ) -> Result<FetchedResponse, FetchError> {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(request.clone());
        }
        let rendered = request.rendered();
        let Some((_, status, body)) = self
            .routes
            .iter()
            .find(|(needle, _, _)| rendered.contains(needle.as_str()))
        else {
            return Err(FetchError::HttpStatus {
                status: 404,
                url: request.url.clone(),
            });
        };
        let status = StatusCode::from_u16(*status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: request.url.clone(),
            });
        }
        Ok(FetchedResponse {
            status,
            final_url: request.url.clone(),
            body: body.clone(),
        })
    }
}

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("secret {0} not found")]
    NotFound(String),
    #[error("secret backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn get_secret(&self, name: &str) -> Result<SecretString, SecretError>;
}

/// Resolves secret `EIA-API-KEY` from `FEEDSTOCK_SECRET_EIA_API_KEY`.
#[derive(Debug, Clone)]
pub struct EnvCredentialProvider {
    prefix: String,
}

impl Default for EnvCredentialProvider {
    fn default() -> Self {
        Self::new("FEEDSTOCK_SECRET_")
    }
}

impl EnvCredentialProvider {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn env_var_name(&self, name: &str) -> String {
        let normalized: String = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}{normalized}", self.prefix)
    }
}

#[async_trait]
impl CredentialProvider for EnvCredentialProvider {
    async fn get_secret(&self, name: &str) -> Result<SecretString, SecretError> {
        match std::env::var(self.env_var_name(name)) {
            Ok(value) if !value.is_empty() => Ok(Secret::new(value)),
            _ => Err(SecretError::NotFound(name.to_string())),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StaticCredentialProvider {
    secrets: HashMap<String, SecretString>,
}

impl StaticCredentialProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.secrets.insert(name.into(), Secret::new(value.into()));
        self
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentialProvider {
    async fn get_secret(&self, name: &str) -> Result<SecretString, SecretError> {
        self.secrets
            .get(name)
            .cloned()
            .ok_or_else(|| SecretError::NotFound(name.to_string()))
    }
}

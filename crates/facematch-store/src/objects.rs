//! Object storage: `scheme://bucket/key` paths over a directory tree or an
//! HTTP gateway speaking path-style GET/PUT.

use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ObjectStoreError {
    #[error("invalid object path {0:?}: expected scheme://bucket/key")]
    InvalidPath(String),
    #[error("invalid object store endpoint {0:?}")]
    Endpoint(String),
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("object store I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("object store HTTP: {0}")]
    Http(#[from] reqwest::Error),
    #[error("object store returned {status} for {uri}")]
    Status { status: u16, uri: String },
}

/// Validated remote object reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectPath {
    pub scheme: String,
    pub bucket: String,
    pub key: String,
}

impl ObjectPath {
    /// Parse `scheme://bucket/key`.
    ///
    /// Rejects a missing scheme, bucket or key, and any empty, `.` or `..`
    /// segment. No I/O happens here.
    pub fn parse(uri: &str) -> Result<Self, ObjectStoreError> {
        let invalid = || ObjectStoreError::InvalidPath(uri.to_string());

        let (scheme, rest) = uri.split_once("://").ok_or_else(invalid)?;
        let scheme_ok = !scheme.is_empty()
            && scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
        if !scheme_ok {
            return Err(invalid());
        }

        let (bucket, key) = rest.split_once('/').ok_or_else(invalid)?;
        if !valid_segment(bucket) || key.is_empty() || !key.split('/').all(valid_segment) {
            return Err(invalid());
        }

        Ok(Self {
            scheme: scheme.to_string(),
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
    }

    pub fn new(scheme: &str, bucket: &str, key: &str) -> Self {
        Self {
            scheme: scheme.to_string(),
            bucket: bucket.to_string(),
            key: key.to_string(),
        }
    }

    /// Final key segment without its extension.
    pub fn key_stem(&self) -> &str {
        let name = self.key.rsplit('/').next().unwrap_or(&self.key);
        match name.rsplit_once('.') {
            Some((stem, _)) if !stem.is_empty() => stem,
            _ => name,
        }
    }
}

fn valid_segment(segment: &str) -> bool {
    !segment.is_empty() && segment != "." && segment != ".."
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}/{}", self.scheme, self.bucket, self.key)
    }
}

/// Remote object download/upload.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn download(&self, path: &ObjectPath) -> Result<Vec<u8>, ObjectStoreError>;
    async fn upload(&self, path: &ObjectPath, bytes: Vec<u8>, content_type: &str) -> Result<(), ObjectStoreError>;
}

/// Open the store named by `location`: an `http(s)://` endpoint or a local directory.
pub fn open_object_store(location: &str) -> Result<Arc<dyn ObjectStore>, ObjectStoreError> {
    if location.starts_with("http://") || location.starts_with("https://") {
        tracing::info!(endpoint = location, "using HTTP object store");
        Ok(Arc::new(HttpObjectStore::new(location)?))
    } else {
        tracing::info!(root = location, "using filesystem object store");
        Ok(Arc::new(FsObjectStore::new(location)))
    }
}

/// One directory per bucket under `root`; keys map to relative paths.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn file_path(&self, path: &ObjectPath) -> PathBuf {
        let mut file = self.root.join(&path.bucket);
        for segment in path.key.split('/') {
            file.push(segment);
        }
        file
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn download(&self, path: &ObjectPath) -> Result<Vec<u8>, ObjectStoreError> {
        match tokio::fs::read(self.file_path(path)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ObjectStoreError::NotFound(path.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn upload(&self, path: &ObjectPath, bytes: Vec<u8>, content_type: &str) -> Result<(), ObjectStoreError> {
        let file = self.file_path(path);
        if let Some(parent) = file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&file, &bytes).await?;
        tracing::debug!(uri = %path, content_type, size = bytes.len(), "object written");
        Ok(())
    }
}

/// Path-style HTTP gateway: `GET|PUT {endpoint}/{bucket}/{key}`.
pub struct HttpObjectStore {
    endpoint: reqwest::Url,
    client: reqwest::Client,
}

impl HttpObjectStore {
    pub fn new(endpoint: &str) -> Result<Self, ObjectStoreError> {
        let endpoint = reqwest::Url::parse(endpoint).map_err(|e| ObjectStoreError::Endpoint(format!("{endpoint}: {e}")))?;
        if endpoint.cannot_be_a_base() {
            return Err(ObjectStoreError::Endpoint(endpoint.to_string()));
        }
        Ok(Self {
            endpoint,
            client: reqwest::Client::builder().build()?,
        })
    }

    /// Bucket and key segments are percent-encoded one by one.
    fn url(&self, path: &ObjectPath) -> Result<reqwest::Url, ObjectStoreError> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| ObjectStoreError::Endpoint(self.endpoint.to_string()))?
            .pop_if_empty()
            .push(&path.bucket)
            .extend(path.key.split('/'));
        Ok(url)
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn download(&self, path: &ObjectPath) -> Result<Vec<u8>, ObjectStoreError> {
        let resp = self.client.get(self.url(path)?).send().await?;
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ObjectStoreError::NotFound(path.to_string()));
        }
        if !status.is_success() {
            return Err(ObjectStoreError::Status {
                status: status.as_u16(),
                uri: path.to_string(),
            });
        }
        Ok(resp.bytes().await?.to_vec())
    }

    async fn upload(&self, path: &ObjectPath, bytes: Vec<u8>, content_type: &str) -> Result<(), ObjectStoreError> {
        let resp = self
            .client
            .put(self.url(path)?)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(ObjectStoreError::Status {
                status: resp.status().as_u16(),
                uri: path.to_string(),
            });
        }
        Ok(())
    }
}

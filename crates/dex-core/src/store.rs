//! Remote object store holding archives and the registry document.
//!
//! Pipeline code only sees the narrow [`ObjectStore`] trait. The production
//! implementation wraps an `opendal` operator, which covers S3-compatible
//! services (R2 in practice), a local directory and an in-memory store.

use async_trait::async_trait;
use opendal::Operator;
use opendal::services::{Fs, Memory, S3};
use std::path::PathBuf;
use thiserror::Error;

/// Environment variable naming the S3 endpoint.
pub const ENV_ENDPOINT: &str = "DEX_REGISTRY_ENDPOINT";
/// Environment variable naming the S3 region.
pub const ENV_REGION: &str = "DEX_REGISTRY_REGION";
/// Environment variable holding the S3 access key id.
pub const ENV_ACCESS_KEY: &str = "DEX_REGISTRY_ACCESS_KEY";
/// Environment variable holding the S3 secret key.
pub const ENV_SECRET_KEY: &str = "DEX_REGISTRY_SECRET_KEY";

/// Errors from the object store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The key does not exist.
    #[error("object not found: {0}")]
    NotFound(String),

    /// Anything else: network, auth, permissions, backend misconfiguration.
    #[error("store error for '{key}': {source}")]
    Backend {
        /// Key the operation targeted.
        key: String,
        /// Backend error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl StoreError {
    /// Whether this is a missing-object error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Minimal key/value object store interface.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Read the object at `key`.
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;

    /// Create or overwrite the object at `key`.
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<(), StoreError>;

    /// Keys of every object whose key starts with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Short human-readable location, for logs.
    fn describe(&self) -> String;
}

/// Where the remote store lives, parsed from the `--remote` string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    /// `s3://bucket[/root]`
    S3 {
        /// Bucket name.
        bucket: String,
        /// Key prefix inside the bucket.
        root: String,
    },
    /// `memory://`
    Memory,
    /// Any other value: a local directory.
    Fs(PathBuf),
}

impl StoreLocation {
    /// Parse a location string.
    ///
    /// # Errors
    ///
    /// Returns an error for an empty string or an `s3://` URL without a
    /// bucket.
    pub fn parse(location: &str) -> Result<Self, String> {
        let location = location.trim();
        if location.is_empty() {
            return Err("remote location is empty".to_string());
        }
        if let Some(rest) = location.strip_prefix("s3://") {
            let (bucket, root) = rest.split_once('/').unwrap_or((rest, ""));
            if bucket.is_empty() {
                return Err(format!("missing bucket in '{location}'"));
            }
            return Ok(Self::S3 {
                bucket: bucket.to_string(),
                root: format!("/{}", root.trim_matches('/')),
            });
        }
        if location == "memory://" {
            return Ok(Self::Memory);
        }
        let path = location.strip_prefix("file://").unwrap_or(location);
        Ok(Self::Fs(PathBuf::from(path)))
    }
}

impl std::fmt::Display for StoreLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::S3 { bucket, root } if root == "/" => write!(f, "s3://{bucket}"),
            Self::S3 { bucket, root } => write!(f, "s3://{bucket}{root}"),
            Self::Memory => f.write_str("memory://"),
            Self::Fs(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Credentials and endpoint for S3-compatible stores, read once from the
/// environment.
#[derive(Debug, Clone, Default)]
pub struct S3Settings {
    /// Service endpoint, e.g. an R2 account URL.
    pub endpoint: Option<String>,
    /// Region; `auto` when unset.
    pub region: Option<String>,
    /// Access key id.
    pub access_key: Option<String>,
    /// Secret access key.
    pub secret_key: Option<String>,
}

impl S3Settings {
    /// Read settings from `DEX_REGISTRY_*` variables.
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        Self {
            endpoint: var(ENV_ENDPOINT),
            region: var(ENV_REGION),
            access_key: var(ENV_ACCESS_KEY),
            secret_key: var(ENV_SECRET_KEY),
        }
    }
}

/// [`ObjectStore`] backed by an `opendal` operator.
#[derive(Debug, Clone)]
pub struct OperatorStore {
    op: Operator,
    location: String,
}

impl OperatorStore {
    /// Build the operator for `location`.
    ///
    /// # Errors
    ///
    /// Returns a backend error when the service cannot be configured.
    pub fn new(location: &StoreLocation, s3: &S3Settings) -> Result<Self, StoreError> {
        let describe = location.to_string();
        let backend = |source: opendal::Error| StoreError::Backend {
            key: describe.clone(),
            source: Box::new(source),
        };

        let op = match location {
            StoreLocation::S3 { bucket, root } => {
                let mut builder = S3::default();
                builder.bucket(bucket);
                builder.root(root);
                if let Some(endpoint) = &s3.endpoint {
                    builder.endpoint(endpoint);
                }
                builder.region(s3.region.as_deref().unwrap_or("auto"));
                if let Some(access_key) = &s3.access_key {
                    builder.access_key_id(access_key);
                }
                if let Some(secret_key) = &s3.secret_key {
                    builder.secret_access_key(secret_key);
                }
                Operator::new(builder).map_err(backend)?.finish()
            }
            StoreLocation::Memory => Operator::new(Memory::default()).map_err(backend)?.finish(),
            StoreLocation::Fs(path) => {
                std::fs::create_dir_all(path).map_err(|e| StoreError::Backend {
                    key: describe.clone(),
                    source: Box::new(e),
                })?;
                let mut builder = Fs::default();
                builder.root(&path.to_string_lossy());
                Operator::new(builder).map_err(backend)?.finish()
            }
        };

        Ok(Self {
            op,
            location: describe,
        })
    }
}

fn classify(key: &str, err: opendal::Error) -> StoreError {
    if err.kind() == opendal::ErrorKind::NotFound {
        StoreError::NotFound(key.to_string())
    } else {
        StoreError::Backend {
            key: key.to_string(),
            source: Box::new(err),
        }
    }
}

#[async_trait]
impl ObjectStore for OperatorStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.op.read(key).await.map_err(|e| classify(key, e))
    }

    async fn put(&self, key: &str, data: Vec<u8>) -> Result<(), StoreError> {
        self.op.write(key, data).await.map_err(|e| classify(key, e))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let entries = self
            .op
            .list_with("/")
            .recursive(true)
            .await
            .map_err(|e| classify(prefix, e))?;
        let mut keys: Vec<String> = entries
            .into_iter()
            .filter(|e| !e.path().ends_with('/'))
            .map(|e| e.path().trim_start_matches('/').to_string())
            .filter(|k| k.starts_with(prefix))
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn describe(&self) -> String {
        self.location.clone()
    }
}

/// Public URL of `key` under `base`.
pub fn public_url(base: &str, key: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), key.trim_start_matches('/'))
}

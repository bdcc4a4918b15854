//! Fetching the currently published registry document.

use crate::build_dir::{BuildDir, write_atomic};
use crate::store::{ObjectStore, StoreError};
use dex_schema::RegistryDocument;
use thiserror::Error;

/// Default key of the registry document in the store.
pub const DEFAULT_REGISTRY_KEY: &str = "registry.json";

/// Fatal baseline failures. A missing document is not one of them.
#[derive(Error, Debug)]
pub enum FetchError {
    /// The store could not be read.
    #[error("failed to fetch registry baseline: {0}")]
    Store(#[source] StoreError),

    /// The document exists but cannot be used.
    #[error("registry baseline '{key}' is malformed: {source}")]
    Malformed {
        /// Key of the document.
        key: String,
        /// Parse error.
        #[source]
        source: serde_json::Error,
    },
}

/// Retrieve the published registry at `key`.
///
/// A missing document yields an empty registry, which is how the very first
/// publish starts.
///
/// # Errors
///
/// Any store failure other than "not found", or a document that does not
/// parse, is a [`FetchError`].
pub async fn fetch_baseline(store: &dyn ObjectStore, key: &str) -> Result<RegistryDocument, FetchError> {
    let bytes = match store.get(key).await {
        Ok(bytes) => bytes,
        Err(StoreError::NotFound(_)) => {
            tracing::info!("no registry at {}/{key}, starting from an empty baseline", store.describe());
            return Ok(RegistryDocument::new());
        }
        Err(e) => {
            tracing::error!("baseline fetch from {} failed: {e}", store.describe());
            return Err(FetchError::Store(e));
        }
    };

    let doc = RegistryDocument::from_json(&bytes).map_err(|source| FetchError::Malformed {
        key: key.to_string(),
        source,
    })?;
    tracing::debug!(
        "baseline has {} packages / {} versions",
        doc.len(),
        doc.version_count()
    );
    Ok(doc)
}

/// Write `doc` as the build directory's copy of the registry.
///
/// # Errors
///
/// Returns an error if serialization or the write fails.
pub fn write_registry(build_dir: &BuildDir, key: &str, doc: &RegistryDocument) -> anyhow::Result<()> {
    let path = build_dir.registry_path(key);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    write_atomic(&path, &doc.to_json_pretty()?)
}

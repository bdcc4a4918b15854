//! Additive sync of the build directory to the remote store.
//!
//! Local archives and the merged registry are uploaded (overwriting objects
//! with the same key); nothing on the remote side is ever deleted. Archives go
//! first so the registry never points at an object that is not there yet.

use crate::Reporter;
use crate::archive::parse_archive_name;
use crate::build_dir::BuildDir;
use crate::store::{ObjectStore, public_url};
use dex_schema::{BuiltPackage, RegistryDocument};
use futures::stream::{self, StreamExt};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

/// Concurrent archive uploads.
const UPLOAD_CONCURRENCY: usize = 8;

/// File name suffixes of editor and partial-download leftovers.
const TRANSIENT_SUFFIXES: &[&str] = &["~", ".swp", ".swo", ".tmp", ".partial"];

/// OS metadata files.
const TRANSIENT_NAMES: &[&str] = &["Thumbs.db", "desktop.ini"];

/// Errors that stop a publish.
#[derive(Error, Debug)]
pub enum SyncError {
    /// One or more uploads failed. When an archive is among them the
    /// registry was not uploaded.
    #[error("failed to upload {}: {}", pluralize(.failed.len()), .failed.join(", "))]
    Upload {
        /// Keys that failed, sorted.
        failed: Vec<String>,
    },

    /// Archives listed in the build report are gone from the build
    /// directory. Nothing was uploaded.
    #[error("{} missing from the build directory: {}", pluralize(.missing.len()), .missing.join(", "))]
    MissingArchive {
        /// Archive keys that were not found, sorted.
        missing: Vec<String>,
    },

    /// The build directory holds no registry document to publish.
    #[error("registry document {} is missing from the build directory", .0.display())]
    MissingRegistry(PathBuf),

    /// The build directory could not be walked.
    #[error("failed to read build directory: {0}")]
    Walk(#[from] walkdir::Error),
}

fn pluralize(n: usize) -> String {
    if n == 1 {
        "1 object".to_string()
    } else {
        format!("{n} objects")
    }
}

impl SyncError {
    /// Keys that failed to upload or were missing locally.
    pub fn failed_keys(&self) -> &[String] {
        match self {
            Self::Upload { failed } => failed,
            Self::MissingArchive { missing } => missing,
            _ => &[],
        }
    }
}

/// Publish options.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions<'a> {
    /// Key of the registry document in the store and in the build directory.
    pub registry_key: &'a str,
    /// Plan and log only.
    pub dry_run: bool,
    /// Base URL under which uploaded objects are publicly served.
    pub public_base_url: Option<&'a str>,
}

/// What a publish did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishSummary {
    /// Keys uploaded, registry last. In a dry run, the keys that would be.
    pub uploaded: Vec<String>,
    /// Local files left out: transient files, orphans and unrecognized files.
    pub skipped: Vec<String>,
    /// Remote keys that were left untouched.
    pub retained_remote: usize,
}

/// Whether a build-directory path must never be uploaded.
pub fn is_transient(rel: &Path) -> bool {
    let mut components = rel.components().peekable();
    while let Some(component) = components.next() {
        let name = component.as_os_str().to_string_lossy();
        if name.starts_with('.') {
            return true;
        }
        if components.peek().is_none() {
            return TRANSIENT_SUFFIXES.iter().any(|s| name.ends_with(s))
                || TRANSIENT_NAMES.iter().any(|n| name.eq_ignore_ascii_case(n));
        }
    }
    false
}

/// Store key of a relative path: forward slashes, no leading separator.
fn object_key(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

struct Plan {
    archives: Vec<(String, PathBuf)>,
    registry: PathBuf,
    skipped: Vec<String>,
}

fn plan(
    build_dir: &BuildDir,
    registry_key: &str,
    merged: &RegistryDocument,
    built: &[BuiltPackage],
    reporter: &dyn Reporter,
) -> Result<Plan, SyncError> {
    let root = build_dir.path();
    let mut archives = Vec::new();
    let mut skipped = Vec::new();
    let mut registry = None;

    let walker = WalkDir::new(root)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            !e.file_type().is_dir()
                || e.path().strip_prefix(root).is_ok_and(|rel| !is_transient(rel))
        });

    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
        let key = object_key(rel);

        if is_transient(rel) {
            tracing::debug!("skipping transient file {key}");
            skipped.push(key);
            continue;
        }
        if key == registry_key {
            registry = Some(entry.path().to_path_buf());
            continue;
        }

        let file_name = entry.file_name().to_string_lossy();
        match parse_archive_name(&file_name) {
            Some((name, version)) if merged.get(&name).is_some_and(|e| e.contains(&version)) => {
                archives.push((key, entry.path().to_path_buf()));
            }
            Some((name, version)) => {
                reporter.warning(&format!(
                    "skipping {key}: {name} {version} is not in the merged registry"
                ));
                skipped.push(key);
            }
            None => {
                reporter.warning(&format!("skipping {key}: not a package archive"));
                skipped.push(key);
            }
        }
    }

    let planned: BTreeSet<&str> = archives.iter().map(|(k, _)| k.as_str()).collect();
    let mut missing: Vec<String> = built
        .iter()
        .filter(|pkg| !planned.contains(pkg.archive.as_str()))
        .map(|pkg| pkg.archive.clone())
        .collect();
    if !missing.is_empty() {
        missing.sort();
        missing.dedup();
        return Err(SyncError::MissingArchive { missing });
    }

    let registry = registry
        .ok_or_else(|| SyncError::MissingRegistry(build_dir.registry_path(registry_key)))?;
    Ok(Plan {
        archives,
        registry,
        skipped,
    })
}

async fn upload(store: &dyn ObjectStore, key: &str, path: &Path) -> Result<(), String> {
    let data = tokio::fs::read(path)
        .await
        .map_err(|e| format!("read {}: {e}", path.display()))?;
    store.put(key, data).await.map_err(|e| e.to_string())
}

/// Upload the build directory's archives and registry document.
///
/// Every archive in `built` must be present in the build directory; the
/// check runs before anything is uploaded.
///
/// # Errors
///
/// Returns [`SyncError::MissingArchive`] if a built archive is gone, and
/// [`SyncError::Upload`] naming every key that failed. If any archive fails
/// the registry is not uploaded, so the published registry never references
/// a missing archive.
pub async fn publish(
    store: &dyn ObjectStore,
    build_dir: &BuildDir,
    merged: &RegistryDocument,
    built: &[BuiltPackage],
    options: &PublishOptions<'_>,
    reporter: &dyn Reporter,
) -> Result<PublishSummary, SyncError> {
    let plan = plan(build_dir, options.registry_key, merged, built, reporter)?;

    let mut local_keys: BTreeSet<&str> = plan.archives.iter().map(|(k, _)| k.as_str()).collect();
    local_keys.insert(options.registry_key);
    let retained_remote = match store.list("").await {
        Ok(remote) => remote.iter().filter(|k| !local_keys.contains(k.as_str())).count(),
        Err(e) => {
            tracing::warn!("could not list {}: {e}", store.describe());
            0
        }
    };

    let mut summary = PublishSummary {
        uploaded: Vec::new(),
        skipped: plan.skipped,
        retained_remote,
    };

    if options.dry_run {
        for (key, _) in &plan.archives {
            reporter.info(&format!("would upload {key}"));
            summary.uploaded.push(key.clone());
        }
        reporter.info(&format!("would upload {}", options.registry_key));
        summary.uploaded.push(options.registry_key.to_string());
        return Ok(summary);
    }

    let results: Vec<(String, Result<(), String>)> = stream::iter(&plan.archives)
        .map(|(key, path)| async move { (key.clone(), upload(store, key, path).await) })
        .buffer_unordered(UPLOAD_CONCURRENCY)
        .collect()
        .await;

    let mut failed = Vec::new();
    for (key, result) in results {
        match result {
            Ok(()) => {
                let detail = options
                    .public_base_url
                    .map_or_else(|| key.clone(), |base| public_url(base, &key));
                tracing::debug!("uploaded {detail}");
                summary.uploaded.push(key);
            }
            Err(e) => {
                reporter.failed(&key, &e);
                failed.push(key);
            }
        }
    }
    summary.uploaded.sort();

    if !failed.is_empty() {
        failed.sort();
        reporter.error("registry not uploaded because archives failed");
        return Err(SyncError::Upload { failed });
    }

    if let Err(e) = upload(store, options.registry_key, &plan.registry).await {
        reporter.failed(options.registry_key, &e);
        return Err(SyncError::Upload {
            failed: vec![options.registry_key.to_string()],
        });
    }
    summary.uploaded.push(options.registry_key.to_string());

    if let Some(base) = options.public_base_url {
        reporter.info(&format!("registry: {}", public_url(base, options.registry_key)));
    }

    Ok(summary)
}

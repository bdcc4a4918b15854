//! The local output directory of one pipeline run.
//!
//! Every stage receives a [`BuildDir`] explicitly; nothing reaches for a
//! shared `build/` path on its own.
//!
//! ```text
//! build/
//! ├── base-dev-0.3.1.tar.gz   # archives produced this run
//! ├── registry.json           # merged registry (after publish/release)
//! └── .dex-build.json         # build report, never uploaded
//! ```

use anyhow::{Context, Result};
use dex_schema::{BuildReport, PackageName, Version, archive_file_name};
use std::path::{Path, PathBuf};

/// Name of the persisted build report inside the build directory.
pub const BUILD_REPORT_FILE: &str = ".dex-build.json";

/// Handle to an existing, absolute build directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildDir {
    root: PathBuf,
}

impl BuildDir {
    /// Remove and recreate `path`, leaving it empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be removed or created.
    pub fn prepare(path: &Path) -> Result<Self> {
        if path.exists() {
            std::fs::remove_dir_all(path)
                .with_context(|| format!("Failed to clean {}", path.display()))?;
        }
        std::fs::create_dir_all(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        Self::open(path)
    }

    /// Open an existing build directory without touching its contents.
    ///
    /// # Errors
    ///
    /// Returns an error if `path` does not exist or is not a directory.
    pub fn open(path: &Path) -> Result<Self> {
        let root = path
            .canonicalize()
            .with_context(|| format!("Build directory {} not found", path.display()))?;
        if !root.is_dir() {
            anyhow::bail!("{} is not a directory", root.display());
        }
        Ok(Self { root })
    }

    /// Absolute path of the directory.
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Where the archive for `name` at `version` lives.
    pub fn archive_path(&self, name: &PackageName, version: &Version) -> PathBuf {
        self.root.join(archive_file_name(name, version))
    }

    /// Local copy of the registry document.
    pub fn registry_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    /// Path of the persisted build report.
    pub fn report_path(&self) -> PathBuf {
        self.root.join(BUILD_REPORT_FILE)
    }

    /// Persist `report` so a later `publish` can pick it up.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save_report(&self, report: &BuildReport) -> Result<()> {
        let json = serde_json::to_vec_pretty(report)?;
        write_atomic(&self.report_path(), &json)
    }

    /// Load the report written by [`BuildDir::save_report`].
    ///
    /// # Errors
    ///
    /// Returns an error if the report is missing or malformed.
    pub fn load_report(&self) -> Result<BuildReport> {
        let path = self.report_path();
        let data = std::fs::read(&path).with_context(|| {
            format!(
                "No build report at {} (run `dex-pkg build` first)",
                path.display()
            )
        })?;
        serde_json::from_slice(&data).with_context(|| format!("Failed to parse {}", path.display()))
    }
}

/// Write `data` to `path` via a temp file and rename, so readers never see a
/// partially written file.
///
/// # Errors
///
/// Returns an error if the write or the rename fails.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp_path = path.with_file_name(format!(".{file_name}.tmp"));
    std::fs::write(&temp_path, data)
        .with_context(|| format!("Failed to write {}", temp_path.display()))?;
    std::fs::rename(&temp_path, path)
        .with_context(|| format!("Failed to move {} into place", path.display()))?;
    Ok(())
}

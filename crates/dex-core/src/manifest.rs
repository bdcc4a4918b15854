//! `package.hcl` manifest parsing.
//!
//! A manifest declares one package's identity in a `package` block and
//! bundles any number of resource blocks (skills, rules, files, MCP servers):
//!
//! ```hcl
//! package {
//!   name        = "base-dev"
//!   version     = "0.3.1"
//!   description = "Baseline development rules"
//!   platforms   = ["claude-code", "cursor"]
//! }
//!
//! claude_skill "review" {
//!   content = file("skills/review.md")
//! }
//! ```
//!
//! Resource blocks are recorded by kind and label only; their bodies belong
//! to the packer.

use dex_schema::{PackageName, Version};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File name every package manifest uses.
pub const MANIFEST_FILE: &str = "package.hcl";

/// Errors that can occur when loading or parsing a manifest.
#[derive(Error, Debug)]
pub enum ManifestError {
    /// The manifest file could not be read.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not valid HCL, or the `package` block has the wrong shape.
    #[error("Parse error: {0}")]
    Parse(#[from] hcl::Error),

    /// No `package { ... }` block was declared.
    #[error("missing `package` block")]
    MissingPackageBlock,

    /// More than one `package` block was declared.
    #[error("duplicate `package` block")]
    DuplicatePackageBlock,

    /// A required attribute of the `package` block is absent or empty.
    #[error("missing required field `{0}` in `package` block")]
    MissingField(&'static str),

    /// The package name cannot be used as a registry key.
    #[error("invalid package name '{0}': use lowercase letters, digits, '-' and '_'")]
    InvalidName(String),

    /// The version is not a semantic version.
    #[error("invalid version '{version}': {source}")]
    InvalidVersion {
        /// The offending string.
        version: String,
        /// Parser error.
        #[source]
        source: semver::Error,
    },
}

/// A resource block declared by a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDecl {
    /// Block identifier, e.g. `claude_skill` or `mcp_server`.
    pub kind: String,
    /// First block label, if any.
    pub label: Option<String>,
}

/// A parsed package manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    /// Path of the manifest file.
    pub path: PathBuf,
    /// Package name.
    pub name: PackageName,
    /// Package version.
    pub version: Version,
    /// Free-text description (empty when absent).
    pub description: String,
    /// Target platform tags.
    pub platforms: BTreeSet<String>,
    /// Declared resource blocks, in source order.
    pub resources: Vec<ResourceDecl>,
}

/// Attributes of the `package` block.
#[derive(Debug, Deserialize)]
struct PackageBlock {
    name: Option<String>,
    version: Option<String>,
    #[serde(default)]
    description: String,
    #[serde(default)]
    platforms: Vec<String>,
}

impl Manifest {
    /// Read and parse the manifest at `path`.
    ///
    /// # Errors
    ///
    /// Returns a [`ManifestError`] if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(path, &content)
    }

    /// Parse manifest source text; `path` is recorded for reporting.
    ///
    /// # Errors
    ///
    /// Returns a [`ManifestError`] describing the first problem found.
    pub fn parse(path: &Path, src: &str) -> Result<Self, ManifestError> {
        let body = hcl::parse(src)?;

        let mut package = None;
        let mut resources = Vec::new();
        for block in body.into_blocks() {
            if block.identifier.as_str() == "package" {
                if package.replace(block.body).is_some() {
                    return Err(ManifestError::DuplicatePackageBlock);
                }
            } else {
                resources.push(ResourceDecl {
                    kind: block.identifier.to_string(),
                    label: block.labels.first().map(|l| l.as_str().to_owned()),
                });
            }
        }
        let package = package.ok_or(ManifestError::MissingPackageBlock)?;
        let fields: PackageBlock = hcl::from_body(package)?;

        let raw_name = required(fields.name, "name")?;
        let name = PackageName::new(&raw_name);
        if raw_name != name.as_str() || !name.is_valid() {
            return Err(ManifestError::InvalidName(raw_name));
        }

        let raw_version = required(fields.version, "version")?;
        let version = Version::parse(&raw_version).map_err(|source| {
            ManifestError::InvalidVersion {
                version: raw_version.clone(),
                source,
            }
        })?;

        Ok(Self {
            path: path.to_path_buf(),
            name,
            version,
            description: fields.description,
            platforms: fields.platforms.into_iter().collect(),
            resources,
        })
    }

    /// Directory the packer runs in.
    pub fn dir(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }
}

fn required(value: Option<String>, field: &'static str) -> Result<String, ManifestError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ManifestError::MissingField(field)),
    }
}

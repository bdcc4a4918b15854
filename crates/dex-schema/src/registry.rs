//! The published registry document.
//!
//! ```json
//! {
//!   "schema_version": 1,
//!   "packages": {
//!     "base-dev": {
//!       "versions": {
//!         "0.3.1": { "description": "...", "published_at": "2026-01-02T03:04:05Z" }
//!       },
//!       "latest": "0.3.1"
//!     }
//!   }
//! }
//! ```
//!
//! Documents written by the older shell tooling list `versions` as a plain
//! array of strings and carry no `schema_version`. Both shapes deserialize;
//! only the current shape is ever written.

use crate::hash::Sha256Digest;
use crate::types::{PackageName, Version};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Newest document format this crate reads and the one it writes.
pub const REGISTRY_SCHEMA_VERSION: u32 = 1;

/// Metadata recorded for one published version of a package.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VersionRecord {
    /// Free-text description copied from the manifest.
    #[serde(default)]
    pub description: String,
    /// When this version was last built and published.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    /// Checksum of the archive, when the builder recorded one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<Sha256Digest>,
}

/// All known versions of one package plus the version selected as current.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawEntry")]
pub struct RegistryEntry {
    /// Published versions keyed (and therefore ordered) by semantic version.
    pub versions: BTreeMap<Version, VersionRecord>,
    /// The version consumers resolve when no version is requested.
    pub latest: Version,
}

impl RegistryEntry {
    /// Create an entry holding a single version, which is also `latest`.
    pub fn new(version: Version, record: VersionRecord) -> Self {
        let mut versions = BTreeMap::new();
        versions.insert(version.clone(), record);
        Self {
            versions,
            latest: version,
        }
    }

    /// Highest version by semantic-version ordering, if any.
    pub fn max_version(&self) -> Option<&Version> {
        self.versions.keys().next_back()
    }

    /// Reset `latest` to the highest known version.
    ///
    /// Returns `false` (leaving `latest` untouched) when the entry has no
    /// versions at all.
    pub fn recompute_latest(&mut self) -> bool {
        match self.max_version() {
            Some(max) => {
                self.latest = max.clone();
                true
            }
            None => false,
        }
    }

    /// Whether `version` is published for this package.
    pub fn contains(&self, version: &Version) -> bool {
        self.versions.contains_key(version)
    }

    /// The set of published version strings.
    pub fn version_set(&self) -> BTreeSet<Version> {
        self.versions.keys().cloned().collect()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum VersionsRepr {
    Records(BTreeMap<Version, VersionRecord>),
    Legacy(Vec<Version>),
}

#[derive(Deserialize)]
struct RawEntry {
    versions: VersionsRepr,
    #[serde(default)]
    latest: Option<Version>,
}

impl TryFrom<RawEntry> for RegistryEntry {
    type Error = String;

    fn try_from(raw: RawEntry) -> Result<Self, Self::Error> {
        let versions = match raw.versions {
            VersionsRepr::Records(records) => records,
            VersionsRepr::Legacy(list) => list
                .into_iter()
                .map(|v| (v, VersionRecord::default()))
                .collect(),
        };

        let latest = match raw.latest {
            Some(latest) => latest,
            None => versions
                .keys()
                .next_back()
                .cloned()
                .ok_or_else(|| "entry has no versions".to_string())?,
        };

        if !versions.contains_key(&latest) {
            return Err(format!("latest version '{latest}' is not among the published versions"));
        }

        Ok(Self { versions, latest })
    }
}

/// Mapping from package name to [`RegistryEntry`], plus a format version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawDocument")]
pub struct RegistryDocument {
    /// Format version of this document.
    pub schema_version: u32,
    /// Entries keyed by package name.
    pub packages: BTreeMap<PackageName, RegistryEntry>,
}

#[derive(Deserialize)]
struct RawDocument {
    #[serde(default = "legacy_schema_version")]
    schema_version: u32,
    #[serde(default)]
    packages: BTreeMap<String, RegistryEntry>,
}

fn legacy_schema_version() -> u32 {
    1
}

impl TryFrom<RawDocument> for RegistryDocument {
    type Error = String;

    fn try_from(raw: RawDocument) -> Result<Self, Self::Error> {
        if raw.schema_version > REGISTRY_SCHEMA_VERSION {
            return Err(format!(
                "unsupported registry schema_version {} (newest supported is {REGISTRY_SCHEMA_VERSION})",
                raw.schema_version
            ));
        }
        let mut packages = BTreeMap::new();
        for (key, entry) in raw.packages {
            let name = PackageName::new(&key);
            if !name.is_valid() {
                return Err(format!("invalid package name '{key}'"));
            }
            if packages.insert(name, entry).is_some() {
                return Err(format!(
                    "package '{key}' is listed under more than one spelling"
                ));
            }
        }
        Ok(Self {
            schema_version: REGISTRY_SCHEMA_VERSION,
            packages,
        })
    }
}

impl Default for RegistryDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryDocument {
    /// An empty registry, the baseline of the very first publish.
    pub fn new() -> Self {
        Self {
            schema_version: REGISTRY_SCHEMA_VERSION,
            packages: BTreeMap::new(),
        }
    }

    /// Parse a document from JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error for malformed or unsupported documents.
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Serialize as pretty-printed JSON with a trailing newline.
    ///
    /// Output is deterministic: packages and versions are emitted in sorted
    /// order.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error if serialization fails.
    pub fn to_json_pretty(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut out = serde_json::to_vec_pretty(self)?;
        out.push(b'\n');
        Ok(out)
    }

    /// Look up the entry for `name`.
    pub fn get(&self, name: &str) -> Option<&RegistryEntry> {
        self.packages.get(name)
    }

    /// Number of packages in the registry.
    pub fn len(&self) -> usize {
        self.packages.len()
    }

    /// Whether the registry has no packages.
    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    /// Total number of published versions across all packages.
    pub fn version_count(&self) -> usize {
        self.packages.values().map(|e| e.versions.len()).sum()
    }
}

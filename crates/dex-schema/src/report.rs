//! Outcome of a build run, persisted between `build` and `publish`.

use crate::hash::Sha256Digest;
use crate::registry::VersionRecord;
use crate::types::{PackageName, Version};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A package whose archive was produced successfully in this run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuiltPackage {
    /// Package name from the manifest.
    pub name: PackageName,
    /// Package version from the manifest.
    pub version: Version,
    /// Description from the manifest.
    pub description: String,
    /// Archive file name, relative to the build directory.
    pub archive: String,
    /// Checksum of the archive.
    pub sha256: Option<Sha256Digest>,
    /// When the archive was produced; becomes the version's `published_at`.
    pub built_at: DateTime<Utc>,
}

impl BuiltPackage {
    /// The registry record this build contributes.
    pub fn version_record(&self) -> VersionRecord {
        VersionRecord {
            description: self.description.clone(),
            published_at: Some(self.built_at),
            sha256: self.sha256.clone(),
        }
    }
}

/// A manifest that did not produce an archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildFailure {
    /// Package name, when the manifest got far enough to declare one.
    pub name: Option<PackageName>,
    /// Package version, when known.
    pub version: Option<Version>,
    /// Manifest that failed.
    pub manifest: PathBuf,
    /// Human-readable cause.
    pub reason: String,
}

impl BuildFailure {
    /// Label used in summaries: the package name, or the manifest path when
    /// the name could not be read.
    pub fn label(&self) -> String {
        match (&self.name, &self.version) {
            (Some(name), Some(version)) => format!("{name} {version}"),
            (Some(name), None) => name.to_string(),
            _ => self.manifest.display().to_string(),
        }
    }
}

/// Everything one build run produced.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BuildReport {
    /// Successful builds, sorted by name.
    pub built: Vec<BuiltPackage>,
    /// Failed manifests, sorted by label.
    pub failed: Vec<BuildFailure>,
}

impl BuildReport {
    /// Whether every attempted package was built.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// Sort both lists into their canonical order.
    pub fn sort(&mut self) {
        self.built
            .sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.version.cmp(&b.version)));
        self.failed.sort_by_key(BuildFailure::label);
    }

    /// Labels of every failed package, in order.
    pub fn failed_labels(&self) -> Vec<String> {
        self.failed.iter().map(BuildFailure::label).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_label_falls_back_to_path() {
        let failure = BuildFailure {
            name: None,
            version: None,
            manifest: PathBuf::from("pkgs/broken/package.hcl"),
            reason: "missing field".to_string(),
        };
        assert_eq!(failure.label(), "pkgs/broken/package.hcl");

        let named = BuildFailure {
            name: Some(PackageName::new("b")),
            version: Some(Version::from("1.0.0")),
            ..failure
        };
        assert_eq!(named.label(), "b 1.0.0");
    }

    #[test]
    fn test_version_record_uses_build_time() {
        let built_at = "2026-03-01T12:00:00Z".parse().unwrap();
        let pkg = BuiltPackage {
            name: PackageName::new("a"),
            version: Version::from("1.0.0"),
            description: "A".to_string(),
            archive: "a-1.0.0.tar.gz".to_string(),
            sha256: None,
            built_at,
        };
        let record = pkg.version_record();
        assert_eq!(record.description, "A");
        assert_eq!(record.published_at, Some(built_at));
    }
}

//! Source tree traversal and manifest discovery.

use crate::manifest::{MANIFEST_FILE, Manifest, ManifestError};
use dex_schema::{BuildFailure, PackageName, Version};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Directory names never descended into.
const SKIPPED_DIRS: &[&str] = &["target", "node_modules"];

/// How to treat two manifests declaring the same package name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicatePolicy {
    /// Exclude every candidate and report the conflict as a failure.
    #[default]
    Error,
    /// Keep the candidate with the highest version; report the conflict as a
    /// warning. Candidates at the same version are still a failure.
    Latest,
}

impl std::str::FromStr for DuplicatePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "error" => Ok(Self::Error),
            "latest" => Ok(Self::Latest),
            other => Err(format!("unknown duplicate policy '{other}' (expected error or latest)")),
        }
    }
}

impl std::fmt::Display for DuplicatePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Error => "error",
            Self::Latest => "latest",
        })
    }
}

/// One manifest taking part in a duplicate-identity conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// Manifest path.
    pub path: PathBuf,
    /// Version it declares.
    pub version: Version,
}

/// The same package name declared by more than one manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateIdentity {
    /// The contested name.
    pub name: PackageName,
    /// Every manifest declaring it, ordered by path.
    pub candidates: Vec<Candidate>,
    /// Version kept under [`DuplicatePolicy::Latest`], if any.
    pub resolved: Option<Version>,
}

impl std::fmt::Display for DuplicateIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "'{}' is declared by {} manifests:", self.name, self.candidates.len())?;
        for c in &self.candidates {
            write!(f, " {} ({})", c.path.display(), c.version)?;
        }
        Ok(())
    }
}

/// Result of scanning a source tree.
#[derive(Debug, Default)]
pub struct ScanReport {
    /// Number of manifest files found, parsed or not.
    pub found: usize,
    /// Conflict-free manifests, ordered by path.
    pub manifests: Vec<Manifest>,
    /// Manifests that could not be read or parsed.
    pub errors: Vec<(PathBuf, ManifestError)>,
    /// Names declared more than once.
    pub conflicts: Vec<DuplicateIdentity>,
}

impl ScanReport {
    /// Everything that keeps a package out of this build, as failures.
    ///
    /// Resolved conflicts are not failures; their losing candidates are
    /// simply not built.
    pub fn failures(&self) -> Vec<BuildFailure> {
        let mut failures: Vec<BuildFailure> = self
            .errors
            .iter()
            .map(|(path, err)| BuildFailure {
                name: None,
                version: None,
                manifest: path.clone(),
                reason: err.to_string(),
            })
            .collect();

        for conflict in self.conflicts.iter().filter(|c| c.resolved.is_none()) {
            for candidate in &conflict.candidates {
                failures.push(BuildFailure {
                    name: Some(conflict.name.clone()),
                    version: Some(candidate.version.clone()),
                    manifest: candidate.path.clone(),
                    reason: format!("duplicate package identity: {conflict}"),
                });
            }
        }
        failures
    }
}

/// Walk `root` and parse every `package.hcl` below it.
///
/// Hidden directories, `target`, `node_modules` and every path in `exclude`
/// (typically the build directory) are skipped. Malformed manifests are
/// collected in [`ScanReport::errors`] without stopping the walk.
///
/// # Errors
///
/// Returns an error only if `root` itself cannot be read.
pub fn scan(
    root: &Path,
    exclude: &[PathBuf],
    policy: DuplicatePolicy,
) -> Result<ScanReport, std::io::Error> {
    std::fs::read_dir(root)?;
    let excluded: Vec<PathBuf> = exclude
        .iter()
        .filter_map(|p| p.canonicalize().ok())
        .collect();

    let mut report = ScanReport::default();
    let mut parsed = Vec::new();

    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_skipped_dir(e, &excluded));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let path = e.path().map_or_else(|| root.to_path_buf(), Path::to_path_buf);
                tracing::warn!("cannot read {}: {e}", path.display());
                let io = e
                    .into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("filesystem loop"));
                report.errors.push((path, ManifestError::Io(io)));
                continue;
            }
        };
        if !entry.file_type().is_file() || entry.file_name() != MANIFEST_FILE {
            continue;
        }

        report.found += 1;
        let path = entry.into_path();
        match Manifest::load(&path) {
            Ok(manifest) => {
                tracing::debug!("found {} {} at {}", manifest.name, manifest.version, path.display());
                if manifest.resources.is_empty() {
                    tracing::warn!("{} {} declares no resources", manifest.name, manifest.version);
                }
                parsed.push(manifest);
            }
            Err(e) => {
                tracing::warn!("invalid manifest {}: {e}", path.display());
                report.errors.push((path, e));
            }
        }
    }

    let (manifests, conflicts) = resolve_duplicates(parsed, policy);
    report.manifests = manifests;
    report.conflicts = conflicts;
    Ok(report)
}

fn is_skipped_dir(entry: &DirEntry, excluded: &[PathBuf]) -> bool {
    if entry.depth() == 0 || !entry.file_type().is_dir() {
        return false;
    }
    let name = entry.file_name().to_string_lossy();
    if name.starts_with('.') || SKIPPED_DIRS.contains(&&*name) {
        return true;
    }
    !excluded.is_empty()
        && entry
            .path()
            .canonicalize()
            .is_ok_and(|p| excluded.contains(&p))
}

/// Split parsed manifests into buildable ones and duplicate-identity conflicts.
fn resolve_duplicates(
    parsed: Vec<Manifest>,
    policy: DuplicatePolicy,
) -> (Vec<Manifest>, Vec<DuplicateIdentity>) {
    let mut by_name: BTreeMap<PackageName, Vec<Manifest>> = BTreeMap::new();
    for manifest in parsed {
        by_name.entry(manifest.name.clone()).or_default().push(manifest);
    }

    let mut manifests = Vec::new();
    let mut conflicts = Vec::new();
    for (name, mut group) in by_name {
        if group.len() == 1 {
            manifests.append(&mut group);
            continue;
        }

        group.sort_by(|a, b| a.path.cmp(&b.path));
        let candidates: Vec<Candidate> = group
            .iter()
            .map(|m| Candidate {
                path: m.path.clone(),
                version: m.version.clone(),
            })
            .collect();

        let winner = match policy {
            DuplicatePolicy::Error => None,
            DuplicatePolicy::Latest => unique_max(&group),
        };

        let conflict = DuplicateIdentity {
            name,
            candidates,
            resolved: winner.map(|i| group[i].version.clone()),
        };
        match winner {
            Some(i) => {
                tracing::warn!("{conflict}; keeping {}", group[i].version);
                manifests.push(group.swap_remove(i));
            }
            None => tracing::error!("{conflict}; excluded from build"),
        }
        conflicts.push(conflict);
    }

    manifests.sort_by(|a, b| a.path.cmp(&b.path));
    (manifests, conflicts)
}

/// Index of the manifest with the strictly highest version, if there is one.
fn unique_max(group: &[Manifest]) -> Option<usize> {
    let (idx, max) = group
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.version.cmp(&b.version))?;
    let ties = group.iter().filter(|m| m.version == max.version).count();
    (ties == 1).then_some(idx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_manifest(root: &Path, dir: &str, name: &str, version: &str) {
        let path = root.join(dir);
        fs::create_dir_all(&path).unwrap();
        fs::write(
            path.join(MANIFEST_FILE),
            format!(
                "package {{\n  name = \"{name}\"\n  version = \"{version}\"\n}}\n\nclaude_rule \"r\" {{}}\n"
            ),
        )
        .unwrap();
    }

    #[test]
    fn test_scan_finds_nested_manifests_in_order() {
        let tmp = TempDir::new().unwrap();
        write_manifest(tmp.path(), "packages/b", "beta", "1.0.0");
        write_manifest(tmp.path(), "packages/a/nested", "alpha", "0.1.0");

        let report = scan(tmp.path(), &[], DuplicatePolicy::Error).unwrap();
        assert_eq!(report.found, 2);
        let names: Vec<&str> = report.manifests.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "beta"]);
        assert!(report.errors.is_empty());
        assert!(report.conflicts.is_empty());
    }

    #[test]
    fn test_scan_skips_hidden_and_excluded_dirs() {
        let tmp = TempDir::new().unwrap();
        write_manifest(tmp.path(), "pkg", "real", "1.0.0");
        write_manifest(tmp.path(), ".git/pkg", "hidden", "1.0.0");
        write_manifest(tmp.path(), "node_modules/pkg", "vendored", "1.0.0");
        write_manifest(tmp.path(), "build/pkg", "stale", "1.0.0");

        let report = scan(
            tmp.path(),
            &[tmp.path().join("build")],
            DuplicatePolicy::Error,
        )
        .unwrap();
        assert_eq!(report.found, 1);
        assert_eq!(report.manifests[0].name, "real");
    }

    #[test]
    fn test_malformed_manifest_does_not_stop_scan() {
        let tmp = TempDir::new().unwrap();
        write_manifest(tmp.path(), "good", "good", "1.0.0");
        fs::create_dir_all(tmp.path().join("bad")).unwrap();
        fs::write(
            tmp.path().join("bad").join(MANIFEST_FILE),
            "package { name = \"bad\" }",
        )
        .unwrap();

        let report = scan(tmp.path(), &[], DuplicatePolicy::Error).unwrap();
        assert_eq!(report.found, 2);
        assert_eq!(report.manifests.len(), 1);
        assert_eq!(report.errors.len(), 1);
        assert!(matches!(report.errors[0].1, ManifestError::MissingField("version")));

        let failures = report.failures();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].name.is_none());
    }

    #[test]
    fn test_duplicate_identity_is_reported_not_picked() {
        let tmp = TempDir::new().unwrap();
        write_manifest(tmp.path(), "v1/docker-compose", "docker-compose", "0.2.0");
        write_manifest(tmp.path(), "v2/docker-compose", "docker-compose", "0.2.1");
        write_manifest(tmp.path(), "other", "base-dev", "0.3.1");

        let report = scan(tmp.path(), &[], DuplicatePolicy::Error).unwrap();
        assert_eq!(report.manifests.len(), 1);
        assert_eq!(report.manifests[0].name, "base-dev");

        assert_eq!(report.conflicts.len(), 1);
        let conflict = &report.conflicts[0];
        assert_eq!(conflict.name, "docker-compose");
        let versions: Vec<&str> = conflict.candidates.iter().map(|c| c.version.as_str()).collect();
        assert_eq!(versions, vec!["0.2.0", "0.2.1"]);
        assert!(conflict.resolved.is_none());

        let failures = report.failures();
        assert_eq!(failures.len(), 2);
        assert!(failures.iter().all(|f| f.reason.contains("duplicate package identity")));
    }

    #[test]
    fn test_latest_policy_keeps_highest_version() {
        let tmp = TempDir::new().unwrap();
        write_manifest(tmp.path(), "a", "base-dev", "0.3.1");
        write_manifest(tmp.path(), "b", "base-dev", "0.2.0");

        let report = scan(tmp.path(), &[], DuplicatePolicy::Latest).unwrap();
        assert_eq!(report.manifests.len(), 1);
        assert_eq!(report.manifests[0].version, "0.3.1");
        assert_eq!(report.conflicts[0].resolved.as_ref().unwrap().as_str(), "0.3.1");
        assert!(report.failures().is_empty());
    }

    #[test]
    fn test_latest_policy_still_rejects_same_version() {
        let tmp = TempDir::new().unwrap();
        write_manifest(tmp.path(), "a", "twin", "1.0.0");
        write_manifest(tmp.path(), "b", "twin", "1.0.0");

        let report = scan(tmp.path(), &[], DuplicatePolicy::Latest).unwrap();
        assert!(report.manifests.is_empty());
        assert_eq!(report.failures().len(), 2);
    }

    #[test]
    fn test_missing_root_is_error() {
        let tmp = TempDir::new().unwrap();
        assert!(scan(&tmp.path().join("nope"), &[], DuplicatePolicy::Error).is_err());
    }

    #[test]
    fn test_duplicate_policy_parse() {
        assert_eq!("latest".parse::<DuplicatePolicy>().unwrap(), DuplicatePolicy::Latest);
        assert!("newest".parse::<DuplicatePolicy>().is_err());
    }
}

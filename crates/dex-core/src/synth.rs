//! Merging freshly built packages into the published registry.
//!
//! [`synthesize`] is pure: the same baseline and the same build report always
//! produce the same document. Merging only ever adds versions, so the result
//! is a per-package superset of the baseline and `latest` never moves below
//! what was already published.

use dex_schema::{BuiltPackage, PackageName, RegistryDocument, RegistryEntry, Version};
use thiserror::Error;

/// A registry invariant was violated. Always fatal.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SynthesisError {
    /// An entry ended up with no versions.
    #[error("registry entry '{0}' has no versions")]
    EmptyEntry(PackageName),

    /// `latest` does not name one of the entry's versions.
    #[error("registry entry '{name}' has latest '{latest}' which is not a published version")]
    DanglingLatest {
        /// Package name.
        name: PackageName,
        /// The offending `latest`.
        latest: Version,
    },
}

/// What a merge changed, for logging.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeSummary {
    /// Packages that were not in the baseline.
    pub added_packages: Vec<PackageName>,
    /// Versions that were not in the baseline, as `(name, version)`.
    pub added_versions: Vec<(PackageName, Version)>,
    /// Baseline versions whose record was rewritten by a rebuild.
    pub refreshed_versions: Vec<(PackageName, Version)>,
}

impl MergeSummary {
    /// Whether the merge left the baseline unchanged in shape.
    pub fn is_empty(&self) -> bool {
        self.added_packages.is_empty()
            && self.added_versions.is_empty()
            && self.refreshed_versions.is_empty()
    }
}

/// Merge `built` into a copy of `baseline`.
///
/// For every built package the version record is inserted (or overwritten
/// when the version already exists) and `latest` is recomputed as the highest
/// version of the merged set. Packages not built in this run are carried
/// through untouched.
///
/// # Errors
///
/// Returns a [`SynthesisError`] if any entry of the result breaks a registry
/// invariant.
pub fn synthesize(
    baseline: &RegistryDocument,
    built: &[BuiltPackage],
) -> Result<(RegistryDocument, MergeSummary), SynthesisError> {
    let mut merged = baseline.clone();
    let mut summary = MergeSummary::default();

    for pkg in built {
        let record = pkg.version_record();
        match merged.packages.get_mut(&pkg.name) {
            Some(entry) => {
                if entry.versions.insert(pkg.version.clone(), record).is_some() {
                    summary.refreshed_versions.push((pkg.name.clone(), pkg.version.clone()));
                } else {
                    summary.added_versions.push((pkg.name.clone(), pkg.version.clone()));
                }
                if !entry.recompute_latest() {
                    return Err(SynthesisError::EmptyEntry(pkg.name.clone()));
                }
            }
            None => {
                merged
                    .packages
                    .insert(pkg.name.clone(), RegistryEntry::new(pkg.version.clone(), record));
                summary.added_packages.push(pkg.name.clone());
                summary.added_versions.push((pkg.name.clone(), pkg.version.clone()));
            }
        }
    }

    validate(&merged)?;
    Ok((merged, summary))
}

/// Check every entry's invariants.
///
/// Entries touched by a merge always have `latest` at their maximum; a
/// baseline entry this run did not touch is carried as published, so only
/// membership is checked here.
///
/// # Errors
///
/// Returns the first violation found, in package order.
pub fn validate(doc: &RegistryDocument) -> Result<(), SynthesisError> {
    for (name, entry) in &doc.packages {
        if entry.versions.is_empty() {
            return Err(SynthesisError::EmptyEntry(name.clone()));
        }
        if !entry.contains(&entry.latest) {
            return Err(SynthesisError::DanglingLatest {
                name: name.clone(),
                latest: entry.latest.clone(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use dex_schema::VersionRecord;
    use std::collections::{BTreeMap, BTreeSet};

    fn at(ts: &str) -> DateTime<Utc> {
        ts.parse().unwrap()
    }

    fn built(name: &str, version: &str) -> BuiltPackage {
        BuiltPackage {
            name: PackageName::new(name),
            version: Version::from(version),
            description: format!("{name} {version}"),
            archive: format!("{name}-{version}.tar.gz"),
            sha256: None,
            built_at: at("2026-05-01T10:00:00Z"),
        }
    }

    fn record(desc: &str) -> VersionRecord {
        VersionRecord {
            description: desc.to_string(),
            published_at: Some(at("2025-12-24T08:00:00Z")),
            sha256: None,
        }
    }

    fn baseline(entries: &[(&str, &[&str])]) -> RegistryDocument {
        let mut doc = RegistryDocument::new();
        for (name, versions) in entries {
            let versions: BTreeMap<Version, VersionRecord> = versions
                .iter()
                .map(|v| (Version::from(*v), record(&format!("old {v}"))))
                .collect();
            let latest = versions.keys().next_back().unwrap().clone();
            doc.packages
                .insert(PackageName::new(name), RegistryEntry { versions, latest });
        }
        doc
    }

    #[test]
    fn test_empty_baseline_yields_one_entry_per_package() {
        let (doc, summary) =
            synthesize(&RegistryDocument::new(), &[built("a", "1.0.0"), built("b", "2.0.0")]).unwrap();

        assert_eq!(doc.len(), 2);
        assert_eq!(doc.get("a").unwrap().latest, "1.0.0");
        assert_eq!(doc.get("b").unwrap().latest, "2.0.0");
        assert_eq!(doc.get("a").unwrap().versions.len(), 1);
        assert_eq!(summary.added_packages.len(), 2);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let base = baseline(&[("a", &["0.9.0"])]);
        let report = [built("a", "1.0.0"), built("c", "0.1.0")];

        let (once, _) = synthesize(&base, &report).unwrap();
        let (twice, summary) = synthesize(&once, &report).unwrap();

        assert_eq!(once.to_json_pretty().unwrap(), twice.to_json_pretty().unwrap());
        assert!(summary.added_versions.is_empty());
        assert_eq!(summary.refreshed_versions.len(), 2);
    }

    #[test]
    fn test_untouched_packages_are_preserved_exactly() {
        let base = baseline(&[("p", &["1.0.0", "1.1.0"]), ("q", &["0.1.0"])]);
        let (merged, _) = synthesize(&base, &[built("q", "0.2.0")]).unwrap();

        let before = serde_json::to_vec(base.get("p").unwrap()).unwrap();
        let after = serde_json::to_vec(merged.get("p").unwrap()).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_latest_never_regresses() {
        let base = baseline(&[("p", &["1.0.0"])]);
        let (merged, _) = synthesize(&base, &[built("p", "0.9.0")]).unwrap();

        let entry = merged.get("p").unwrap();
        assert_eq!(entry.latest, "1.0.0");
        assert_eq!(entry.versions.len(), 2);
    }

    #[test]
    fn test_versions_are_union_of_baseline_and_build() {
        let base = baseline(&[("x", &["1.0.0", "1.2.0"])]);
        let report = [built("x", "1.1.0"), built("x", "1.2.0"), built("x", "2.0.0-rc.1")];
        let (merged, _) = synthesize(&base, &report).unwrap();

        let mut expected: BTreeSet<Version> = base.get("x").unwrap().version_set();
        expected.extend(report.iter().map(|b| b.version.clone()));
        assert_eq!(merged.get("x").unwrap().version_set(), expected);
        // 2.0.0-rc.1 sorts above 1.2.0
        assert_eq!(merged.get("x").unwrap().latest, "2.0.0-rc.1");
    }

    #[test]
    fn test_mixed_case_baseline_key_merges_with_build() {
        let json = r#"{"packages": {"Base-Dev": {"versions": ["0.3.0"], "latest": "0.3.0"}}}"#;
        let base = RegistryDocument::from_json(json.as_bytes()).unwrap();
        let (merged, summary) = synthesize(&base, &[built("base-dev", "0.4.0")]).unwrap();

        let keys: Vec<&str> = merged.packages.keys().map(PackageName::as_str).collect();
        assert_eq!(keys, ["base-dev"]);
        assert_eq!(merged.get("base-dev").unwrap().versions.len(), 2);
        assert_eq!(merged.get("base-dev").unwrap().latest, "0.4.0");
        assert!(summary.added_packages.is_empty());
    }

    #[test]
    fn test_prerelease_sorts_below_release() {
        let base = baseline(&[("x", &["2.0.0"])]);
        let (merged, _) = synthesize(&base, &[built("x", "2.0.0-beta.2")]).unwrap();
        assert_eq!(merged.get("x").unwrap().latest, "2.0.0");
    }

    #[test]
    fn test_rebuild_overwrites_record() {
        let base = baseline(&[("a", &["1.0.0"])]);
        let (merged, summary) = synthesize(&base, &[built("a", "1.0.0")]).unwrap();

        let rec = &merged.get("a").unwrap().versions[&Version::from("1.0.0")];
        assert_eq!(rec.description, "a 1.0.0");
        assert_eq!(rec.published_at, Some(at("2026-05-01T10:00:00Z")));
        assert_eq!(summary.refreshed_versions, vec![(PackageName::new("a"), Version::from("1.0.0"))]);
    }

    #[test]
    fn test_legacy_invalid_versions_sort_below_semver() {
        let base = baseline(&[("l", &["latest-build"])]);
        let (merged, _) = synthesize(&base, &[built("l", "0.0.1")]).unwrap();
        assert_eq!(merged.get("l").unwrap().latest, "0.0.1");
    }

    #[test]
    fn test_validate_rejects_broken_entries() {
        let mut doc = baseline(&[("e", &["1.0.0"])]);
        doc.packages.get_mut("e").unwrap().versions.clear();
        assert_eq!(
            validate(&doc),
            Err(SynthesisError::EmptyEntry(PackageName::new("e")))
        );

        let mut doc = baseline(&[("d", &["1.0.0"])]);
        doc.packages.get_mut("d").unwrap().latest = Version::from("3.0.0");
        assert!(matches!(validate(&doc), Err(SynthesisError::DanglingLatest { .. })));
    }

    #[test]
    fn test_empty_baseline_entry_is_fatal_on_merge() {
        let mut base = baseline(&[("e", &["1.0.0"])]);
        base.packages.get_mut("e").unwrap().versions.clear();
        let err = synthesize(&base, &[built("other", "1.0.0")]).unwrap_err();
        assert_eq!(err, SynthesisError::EmptyEntry(PackageName::new("e")));
    }
}

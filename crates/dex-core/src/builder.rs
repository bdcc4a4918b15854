//! Package archive builds.
//!
//! The archive format belongs to the external packer; this module only runs
//! it, one subprocess per manifest, and guarantees that an archive appears in
//! the build directory either complete or not at all:
//!
//! 1. Create a private staging directory inside the build directory.
//! 2. Run the packer with the manifest directory as cwd and the staged path
//!    as its output.
//! 3. Hash the staged archive and rename it into place.
//!
//! Any failure drops the staging directory, so a failed package leaves no
//! trace behind.

use crate::Reporter;
use crate::build_dir::BuildDir;
use crate::manifest::Manifest;
use async_trait::async_trait;
use chrono::Utc;
use dex_schema::{BuildFailure, BuildReport, BuiltPackage, Sha256Digest, archive_file_name};
use futures::stream::{self, StreamExt};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use thiserror::Error;

/// Lines of packer stderr kept in error messages.
const STDERR_TAIL_LINES: usize = 20;

/// Errors from a single package build.
#[derive(Error, Debug)]
pub enum PackError {
    /// The packer could not be started.
    #[error("failed to launch packer `{program}`: {source}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// The packer ran and exited unsuccessfully.
    #[error("packer exited with {status}: {stderr}")]
    Failed {
        /// Exit status description.
        status: String,
        /// Tail of the packer's stderr.
        stderr: String,
    },

    /// The packer reported success without writing the archive.
    #[error("packer reported success but produced no archive at {}", .0.display())]
    MissingOutput(PathBuf),

    /// Staging, hashing or moving the archive failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The external tool that turns a manifest directory into an archive.
#[async_trait]
pub trait Packer: Send + Sync {
    /// Pack `manifest_dir` into the archive file `output`.
    async fn pack(&self, manifest_dir: &Path, output: &Path) -> Result<(), PackError>;
}

/// Runs the packer as a subprocess.
///
/// Arguments may contain `{output}` (absolute archive path) and `{dir}`
/// (manifest directory) placeholders. The working directory is the manifest
/// directory.
#[derive(Debug, Clone)]
pub struct CommandPacker {
    program: String,
    args: Vec<String>,
}

impl CommandPacker {
    /// Program used when none is configured.
    pub const DEFAULT_PROGRAM: &'static str = "dex";

    /// Create a packer running `program` with `args`. Empty `args` selects
    /// [`CommandPacker::default_args`].
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        let args = if args.is_empty() {
            Self::default_args()
        } else {
            args
        };
        Self {
            program: program.into(),
            args,
        }
    }

    /// `pack --output {output}`
    pub fn default_args() -> Vec<String> {
        vec!["pack".to_string(), "--output".to_string(), "{output}".to_string()]
    }

    fn render_args(&self, manifest_dir: &Path, output: &Path) -> Vec<String> {
        let dir = manifest_dir.to_string_lossy();
        let out = output.to_string_lossy();
        self.args
            .iter()
            .map(|a| a.replace("{output}", &out).replace("{dir}", &dir))
            .collect()
    }
}

impl Default for CommandPacker {
    fn default() -> Self {
        Self::new(Self::DEFAULT_PROGRAM, Vec::new())
    }
}

#[async_trait]
impl Packer for CommandPacker {
    async fn pack(&self, manifest_dir: &Path, output: &Path) -> Result<(), PackError> {
        let args = self.render_args(manifest_dir, output);
        tracing::debug!("running {} {} in {}", self.program, args.join(" "), manifest_dir.display());

        let result = tokio::process::Command::new(&self.program)
            .args(&args)
            .current_dir(manifest_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| PackError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if result.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&result.stderr);
        let lines: Vec<&str> = stderr.lines().collect();
        let tail = lines[lines.len().saturating_sub(STDERR_TAIL_LINES)..].join("\n");
        Err(PackError::Failed {
            status: result.status.to_string(),
            stderr: tail.trim().to_string(),
        })
    }
}

/// Default worker pool size: one build per logical CPU.
pub fn default_jobs() -> usize {
    num_cpus::get().max(1)
}

/// Build one manifest into `build_dir`.
///
/// # Errors
///
/// Returns a [`PackError`] if the packer fails or the archive cannot be
/// staged, hashed or moved into place. Nothing is left in `build_dir` then.
pub async fn build_one(
    packer: &dyn Packer,
    manifest: &Manifest,
    build_dir: &BuildDir,
) -> Result<BuiltPackage, PackError> {
    let file_name = archive_file_name(&manifest.name, &manifest.version);
    let staging = tempfile::Builder::new()
        .prefix(".pack-")
        .tempdir_in(build_dir.path())?;
    let staged = staging.path().join(&file_name);

    packer.pack(manifest.dir(), &staged).await?;

    if !tokio::fs::metadata(&staged).await.is_ok_and(|m| m.is_file()) {
        return Err(PackError::MissingOutput(staged));
    }

    let data = tokio::fs::read(&staged).await?;
    let sha256 = Sha256Digest::new(hex::encode(Sha256::digest(&data))).ok();

    let dest = build_dir.archive_path(&manifest.name, &manifest.version);
    tokio::fs::rename(&staged, &dest).await?;

    Ok(BuiltPackage {
        name: manifest.name.clone(),
        version: manifest.version.clone(),
        description: manifest.description.clone(),
        archive: file_name,
        sha256,
        built_at: Utc::now(),
    })
}

/// Build every manifest with at most `jobs` packer processes at once.
///
/// A failing package never stops the others; every outcome lands in the
/// returned report, sorted.
pub async fn build_all(
    packer: Arc<dyn Packer>,
    manifests: Vec<Manifest>,
    build_dir: &BuildDir,
    jobs: usize,
    reporter: &dyn Reporter,
) -> BuildReport {
    let mut report = BuildReport::default();

    let mut outcomes = stream::iter(manifests)
        .map(|manifest| {
            let packer = packer.clone();
            async move {
                let result = build_one(packer.as_ref(), &manifest, build_dir).await;
                (manifest, result)
            }
        })
        .buffer_unordered(jobs.max(1));

    while let Some((manifest, result)) = outcomes.next().await {
        match result {
            Ok(built) => {
                reporter.done(&built.name, &built.version, &built.archive);
                report.built.push(built);
            }
            Err(e) => {
                tracing::warn!("build of {} {} failed: {e}", manifest.name, manifest.version);
                let failure = BuildFailure {
                    name: Some(manifest.name),
                    version: Some(manifest.version),
                    manifest: manifest.path,
                    reason: e.to_string(),
                };
                reporter.failed(&failure.label(), &failure.reason);
                report.failed.push(failure);
            }
        }
    }

    report.sort();
    report
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::NullReporter;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Writes the manifest directory name into the archive; fails for
    /// selected package directories.
    #[derive(Default)]
    pub(crate) struct FakePacker {
        pub(crate) fail_dirs: HashSet<String>,
        pub(crate) skip_output_dirs: HashSet<String>,
        pub(crate) calls: Mutex<Vec<PathBuf>>,
    }

    impl FakePacker {
        pub(crate) fn failing(dirs: &[&str]) -> Self {
            Self {
                fail_dirs: dirs.iter().map(ToString::to_string).collect(),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl Packer for FakePacker {
        async fn pack(&self, manifest_dir: &Path, output: &Path) -> Result<(), PackError> {
            self.calls.lock().unwrap().push(manifest_dir.to_path_buf());
            let dir = manifest_dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            // Write something first so a failure has partial output to clean up.
            std::fs::write(output, b"partial")?;
            if self.fail_dirs.contains(&dir) {
                return Err(PackError::Failed {
                    status: "exit status: 1".to_string(),
                    stderr: format!("cannot pack {dir}"),
                });
            }
            if self.skip_output_dirs.contains(&dir) {
                std::fs::remove_file(output)?;
                return Ok(());
            }
            std::fs::write(output, format!("archive of {dir}"))?;
            Ok(())
        }
    }

    /// Tracks how many packs run at once.
    #[derive(Default)]
    struct PeakPacker {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl Packer for PeakPacker {
        async fn pack(&self, _manifest_dir: &Path, output: &Path) -> Result<(), PackError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            std::fs::write(output, b"archive")?;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    pub(crate) fn manifest_in(root: &Path, name: &str, version: &str) -> Manifest {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(crate::manifest::MANIFEST_FILE);
        let src = format!(
            "package {{\n  name = \"{name}\"\n  version = \"{version}\"\n  description = \"{name} package\"\n}}\n"
        );
        std::fs::write(&path, &src).unwrap();
        Manifest::parse(&path, &src).unwrap()
    }

    fn entries(dir: &BuildDir) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_build_one_places_archive_with_checksum() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let build_dir = BuildDir::prepare(out.path()).unwrap();
        let manifest = manifest_in(src.path(), "alpha", "1.0.0");

        let built = build_one(&FakePacker::default(), &manifest, &build_dir)
            .await
            .unwrap();

        assert_eq!(built.archive, "alpha-1.0.0.tar.gz");
        assert_eq!(built.description, "alpha package");
        let expected = hex::encode(Sha256::digest(b"archive of alpha"));
        assert_eq!(built.sha256.unwrap().as_str(), expected);
        assert_eq!(entries(&build_dir), vec!["alpha-1.0.0.tar.gz"]);
    }

    #[tokio::test]
    async fn test_failed_build_leaves_no_partial_file() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let build_dir = BuildDir::prepare(out.path()).unwrap();
        let manifest = manifest_in(src.path(), "beta", "1.0.0");

        let err = build_one(&FakePacker::failing(&["beta"]), &manifest, &build_dir)
            .await
            .unwrap_err();

        assert!(matches!(err, PackError::Failed { .. }));
        assert!(entries(&build_dir).is_empty());
    }

    #[tokio::test]
    async fn test_missing_output_is_error() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let build_dir = BuildDir::prepare(out.path()).unwrap();
        let manifest = manifest_in(src.path(), "ghost", "1.0.0");
        let packer = FakePacker {
            skip_output_dirs: ["ghost".to_string()].into_iter().collect(),
            ..FakePacker::default()
        };

        let err = build_one(&packer, &manifest, &build_dir).await.unwrap_err();
        assert!(matches!(err, PackError::MissingOutput(_)));
        assert!(entries(&build_dir).is_empty());
    }

    #[tokio::test]
    async fn test_build_all_bounds_concurrent_packs() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let build_dir = BuildDir::prepare(out.path()).unwrap();
        let manifests: Vec<Manifest> = (0..8)
            .map(|i| manifest_in(src.path(), &format!("pkg{i}"), "1.0.0"))
            .collect();
        let packer = Arc::new(PeakPacker::default());

        let report = build_all(packer.clone(), manifests, &build_dir, 3, &NullReporter).await;

        assert_eq!(report.built.len(), 8);
        assert_eq!(packer.peak.load(Ordering::SeqCst), 3);
        assert_eq!(packer.in_flight.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_build_all_collects_partial_failures() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let build_dir = BuildDir::prepare(out.path()).unwrap();
        let manifests = vec![
            manifest_in(src.path(), "a", "1.0.0"),
            manifest_in(src.path(), "b", "1.0.0"),
            manifest_in(src.path(), "c", "1.0.0"),
        ];
        let packer = Arc::new(FakePacker::failing(&["b"]));

        let report = build_all(packer.clone(), manifests, &build_dir, 2, &NullReporter).await;

        let built: Vec<&str> = report.built.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(built, vec!["a", "c"]);
        assert_eq!(report.failed_labels(), vec!["b 1.0.0"]);
        assert!(report.failed[0].reason.contains("cannot pack b"));
        assert_eq!(packer.calls.lock().unwrap().len(), 3);
        assert_eq!(entries(&build_dir), vec!["a-1.0.0.tar.gz", "c-1.0.0.tar.gz"]);
    }

    #[tokio::test]
    async fn test_command_packer_success_and_failure() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let build_dir = BuildDir::prepare(out.path()).unwrap();
        let manifest = manifest_in(src.path(), "cmd", "0.1.0");

        let copy = CommandPacker::new(
            "cp",
            vec!["package.hcl".to_string(), "{output}".to_string()],
        );
        let built = build_one(&copy, &manifest, &build_dir).await.unwrap();
        let archived = std::fs::read_to_string(build_dir.path().join(&built.archive)).unwrap();
        assert!(archived.contains("name = \"cmd\""));

        let broken = CommandPacker::new("cp", vec!["missing.file".to_string(), "{output}".to_string()]);
        let err = build_one(&broken, &manifest_in(src.path(), "other", "0.1.0"), &build_dir)
            .await
            .unwrap_err();
        assert!(matches!(err, PackError::Failed { .. }));
    }

    #[tokio::test]
    async fn test_command_packer_spawn_error() {
        let src = TempDir::new().unwrap();
        let packer = CommandPacker::new("definitely-not-a-real-packer-binary", Vec::new());
        let err = packer.pack(src.path(), &src.path().join("x.tar.gz")).await.unwrap_err();
        assert!(matches!(err, PackError::Spawn { .. }));
    }

    #[test]
    fn test_render_args_placeholders() {
        let packer = CommandPacker::new("dex", vec!["pack".into(), "{dir}".into(), "-o={output}".into()]);
        let args = packer.render_args(Path::new("/src/pkg"), Path::new("/out/pkg-1.0.0.tar.gz"));
        assert_eq!(args, vec!["pack", "/src/pkg", "-o=/out/pkg-1.0.0.tar.gz"]);
        assert_eq!(CommandPacker::default().args, CommandPacker::default_args());
    }
}

//! The scan → build → fetch → merge → publish orchestrator.
//!
//! Every stage returns a typed result; the pipeline decides what is fatal.
//! Per-package problems (bad manifests, duplicate names, failed builds) are
//! collected and reported once every package had its chance. Baseline, merge
//! and upload failures stop the run immediately.

use crate::Reporter;
use crate::baseline::{DEFAULT_REGISTRY_KEY, FetchError, fetch_baseline, write_registry};
use crate::build_dir::BuildDir;
use crate::builder::{Packer, build_all, default_jobs};
use crate::publish::{PublishOptions, PublishSummary, SyncError, publish};
use crate::scan::{DuplicatePolicy, ScanReport, scan};
use crate::store::ObjectStore;
use crate::synth::{MergeSummary, SynthesisError, synthesize};
use dex_schema::{BuildReport, RegistryDocument};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Errors that end a pipeline run, each with its own exit code.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Bad configuration or an unexpected local failure.
    #[error("{0}")]
    Config(String),

    /// Local IO around the build directory failed.
    #[error(transparent)]
    Local(#[from] anyhow::Error),

    /// The source tree holds no manifests.
    #[error("no {} found under {}", crate::manifest::MANIFEST_FILE, .0.display())]
    NoManifests(PathBuf),

    /// At least one package was not built.
    #[error("package build failed: {}", .failed.join(", "))]
    BuildFailed {
        /// Labels of the failed packages, sorted.
        failed: Vec<String>,
    },

    /// The published registry could not be fetched.
    #[error(transparent)]
    Baseline(#[from] FetchError),

    /// The merge produced an invalid registry.
    #[error("registry invariant violated: {0}")]
    Invariant(#[from] SynthesisError),

    /// Uploading failed.
    #[error(transparent)]
    Sync(#[from] SyncError),
}

impl PipelineError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::Local(_) => 1,
            Self::NoManifests(_) => 2,
            Self::BuildFailed { .. } => 3,
            Self::Baseline(_) => 4,
            Self::Sync(_) => 5,
            Self::Invariant(_) => 6,
        }
    }
}

/// Explicit settings of one run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Root of the manifest tree.
    pub source_dir: PathBuf,
    /// Local output directory, cleaned at the start of a build.
    pub build_dir: PathBuf,
    /// Key of the registry document.
    pub registry_key: String,
    /// Maximum concurrent packer processes.
    pub jobs: usize,
    /// What to do with duplicate package names.
    pub on_duplicate: DuplicatePolicy,
    /// Plan uploads without performing them.
    pub dry_run: bool,
    /// Base URL the store is served from.
    pub public_base_url: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            source_dir: PathBuf::from("."),
            build_dir: PathBuf::from("build"),
            registry_key: DEFAULT_REGISTRY_KEY.to_string(),
            jobs: default_jobs(),
            on_duplicate: DuplicatePolicy::default(),
            dry_run: false,
            public_base_url: None,
        }
    }
}

/// Result of a successful publish.
#[derive(Debug, Clone)]
pub struct PublishOutcome {
    /// The registry as published.
    pub registry: RegistryDocument,
    /// What the merge changed.
    pub merge: MergeSummary,
    /// What was uploaded.
    pub sync: PublishSummary,
}

/// The pipeline and its injected collaborators.
pub struct Pipeline {
    config: PipelineConfig,
    packer: Arc<dyn Packer>,
    store: Option<Arc<dyn ObjectStore>>,
    reporter: Arc<dyn Reporter>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.config)
            .field("store", &self.store.as_ref().map(|s| s.describe()))
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Create a pipeline without a remote store; `scan` and `build` work,
    /// `publish` and `release` need [`Pipeline::with_store`].
    pub fn new(
        config: PipelineConfig,
        packer: Arc<dyn Packer>,
        reporter: Arc<dyn Reporter>,
    ) -> Self {
        Self {
            config,
            packer,
            store: None,
            reporter,
        }
    }

    /// Attach the remote store.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// The run's configuration.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn store(&self) -> Result<&dyn ObjectStore, PipelineError> {
        self.store.as_deref().ok_or_else(|| {
            PipelineError::Config(
                "no remote store configured (set --remote or DEX_REGISTRY_REMOTE)".to_string(),
            )
        })
    }

    /// Discover manifests.
    ///
    /// # Errors
    ///
    /// [`PipelineError::NoManifests`] if the tree holds none at all, or a
    /// configuration error if the source directory cannot be read.
    pub fn scan(&self) -> Result<ScanReport, PipelineError> {
        let source = &self.config.source_dir;
        let exclude = std::slice::from_ref(&self.config.build_dir);
        let report = scan(source, exclude, self.config.on_duplicate).map_err(|e| {
            PipelineError::Config(format!("cannot read {}: {e}", source.display()))
        })?;

        if report.found == 0 {
            return Err(PipelineError::NoManifests(source.clone()));
        }
        for conflict in &report.conflicts {
            match &conflict.resolved {
                Some(version) => self
                    .reporter
                    .warning(&format!("{conflict}; keeping {version}")),
                None => self.reporter.error(&conflict.to_string()),
            }
        }
        Ok(report)
    }

    /// Refuse build directories whose cleanup would delete the sources.
    fn check_dirs(&self) -> Result<(), PipelineError> {
        let source = self.config.source_dir.canonicalize().map_err(|e| {
            PipelineError::Config(format!("cannot read {}: {e}", self.config.source_dir.display()))
        })?;
        let build = std::path::absolute(&self.config.build_dir)
            .map_err(|e| PipelineError::Config(format!("invalid build directory: {e}")))?;
        let build = build.canonicalize().unwrap_or(build);
        if source.starts_with(&build) {
            return Err(PipelineError::Config(format!(
                "build directory {} contains the source tree {}",
                build.display(),
                source.display()
            )));
        }
        Ok(())
    }

    async fn run_builds(
        &self,
        scanned: ScanReport,
        build_dir: &BuildDir,
    ) -> Result<BuildReport, PipelineError> {
        let started = Instant::now();
        let mut failures = scanned.failures();
        for failure in &failures {
            self.reporter.failed(&failure.label(), &failure.reason);
        }

        self.reporter.section("building");
        let mut report = build_all(
            self.packer.clone(),
            scanned.manifests,
            build_dir,
            self.config.jobs,
            self.reporter.as_ref(),
        )
        .await;
        report.failed.append(&mut failures);
        report.sort();
        build_dir.save_report(&report)?;

        self.reporter
            .summary(report.built.len(), "built", started.elapsed().as_secs_f64());
        Ok(report)
    }

    /// Scan, clean the build directory and build every package.
    ///
    /// The report is saved in the build directory even when packages fail.
    ///
    /// # Errors
    ///
    /// [`PipelineError::BuildFailed`] naming every package that was not
    /// built, after all builds were attempted.
    pub async fn build(&self) -> Result<BuildReport, PipelineError> {
        self.check_dirs()?;
        self.reporter.section("scanning");
        let scanned = self.scan()?;
        let build_dir = BuildDir::prepare(&self.config.build_dir)?;
        let report = self.run_builds(scanned, &build_dir).await?;
        if !report.is_success() {
            return Err(PipelineError::BuildFailed {
                failed: report.failed_labels(),
            });
        }
        Ok(report)
    }

    /// Merge `report` into the published registry and upload.
    ///
    /// # Errors
    ///
    /// Baseline, merge and upload failures, each fatal.
    pub async fn publish(&self, report: &BuildReport) -> Result<PublishOutcome, PipelineError> {
        let store = self.store()?;
        let build_dir = BuildDir::open(&self.config.build_dir)?;
        let baseline = self.fetch(store, &build_dir).await?;
        self.merge_and_upload(store, &build_dir, &baseline, report).await
    }

    /// Publish using the report saved by a previous [`Pipeline::build`].
    ///
    /// # Errors
    ///
    /// As [`Pipeline::publish`], plus a local error if no report exists.
    pub async fn publish_saved(&self) -> Result<PublishOutcome, PipelineError> {
        let build_dir = BuildDir::open(&self.config.build_dir)?;
        let report = build_dir.load_report()?;
        if report.built.is_empty() {
            return Err(PipelineError::Config(
                "the build report lists no built packages".to_string(),
            ));
        }
        self.publish(&report).await
    }

    /// The whole pipeline in one run.
    ///
    /// The baseline is fetched before any build, so an unreachable or broken
    /// registry costs no build time. Packages that built are published even
    /// when others failed; the failures are reported afterwards.
    ///
    /// # Errors
    ///
    /// Any [`PipelineError`]; [`PipelineError::BuildFailed`] only after the
    /// successful packages were published.
    pub async fn release(&self) -> Result<PublishOutcome, PipelineError> {
        self.check_dirs()?;
        let store = self.store()?;

        self.reporter.section("scanning");
        let scanned = self.scan()?;
        let build_dir = BuildDir::prepare(&self.config.build_dir)?;
        let baseline = self.fetch(store, &build_dir).await?;

        let report = self.run_builds(scanned, &build_dir).await?;
        if report.built.is_empty() {
            return Err(PipelineError::BuildFailed {
                failed: report.failed_labels(),
            });
        }

        let outcome = self.merge_and_upload(store, &build_dir, &baseline, &report).await?;
        if !report.is_success() {
            return Err(PipelineError::BuildFailed {
                failed: report.failed_labels(),
            });
        }
        Ok(outcome)
    }

    async fn fetch(
        &self,
        store: &dyn ObjectStore,
        build_dir: &BuildDir,
    ) -> Result<RegistryDocument, PipelineError> {
        self.reporter.section("fetching registry");
        let key = &self.config.registry_key;
        let baseline = fetch_baseline(store, key).await?;
        write_registry(build_dir, key, &baseline)?;
        self.reporter.info(&format!(
            "baseline: {} packages, {} versions",
            baseline.len(),
            baseline.version_count()
        ));
        Ok(baseline)
    }

    async fn merge_and_upload(
        &self,
        store: &dyn ObjectStore,
        build_dir: &BuildDir,
        baseline: &RegistryDocument,
        report: &BuildReport,
    ) -> Result<PublishOutcome, PipelineError> {
        let (registry, merge) = synthesize(baseline, &report.built).inspect_err(|e| {
            tracing::error!("refusing to publish: {e}");
        })?;
        write_registry(build_dir, &self.config.registry_key, &registry)?;
        tracing::info!(
            "merged {} new packages, {} new versions, {} refreshed",
            merge.added_packages.len(),
            merge.added_versions.len(),
            merge.refreshed_versions.len()
        );

        self.reporter.section("publishing");
        let started = Instant::now();
        let options = PublishOptions {
            registry_key: &self.config.registry_key,
            dry_run: self.config.dry_run,
            public_base_url: self.config.public_base_url.as_deref(),
        };
        let sync = publish(
            store,
            build_dir,
            &registry,
            &report.built,
            &options,
            self.reporter.as_ref(),
        )
        .await?;

        let action = if self.config.dry_run { "planned" } else { "uploaded" };
        self.reporter
            .summary(sync.uploaded.len(), action, started.elapsed().as_secs_f64());
        if sync.retained_remote > 0 {
            self.reporter
                .info(&format!("{} remote objects left untouched", sync.retained_remote));
        }

        Ok(PublishOutcome {
            registry,
            merge,
            sync,
        })
    }
}

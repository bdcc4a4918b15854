//! `dex-pkg` - the dex package registry maintainer tool.
#![allow(missing_docs)]
#![allow(clippy::missing_errors_doc)]
//!
//! Scans a source tree for `package.hcl` manifests, builds an archive for
//! each with the external packer, merges the results into the published
//! registry and uploads everything to the object store.
//!
//! ```text
//! dex-pkg scan                       # list manifests, report problems
//! dex-pkg build                      # clean build/ and build every package
//! dex-pkg publish --remote s3://b    # merge build/ into the registry and upload
//! dex-pkg release --remote s3://b    # all of the above in one run
//! ```

pub mod cmd;
pub mod console;

use clap::{Parser, Subcommand};
use dex_core::PipelineConfig;
use dex_core::baseline::DEFAULT_REGISTRY_KEY;
use dex_core::builder::default_jobs;
use dex_core::scan::DuplicatePolicy;
use std::num::NonZeroUsize;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "dex-pkg")]
#[command(author, version, about = "Build and publish dex packages to the registry")]
pub struct Cli {
    /// Root of the package source tree
    #[arg(long, global = true, default_value = ".")]
    pub source: PathBuf,

    /// Local output directory (cleaned by build and release)
    #[arg(long, global = true, default_value = "build")]
    pub build_dir: PathBuf,

    /// Remote store: s3://bucket[/prefix], memory:// or a local directory
    #[arg(long, global = true, env = "DEX_REGISTRY_REMOTE")]
    pub remote: Option<String>,

    /// Maximum concurrent package builds [default: number of CPUs]
    #[arg(short, long, global = true, env = "DEX_BUILD_JOBS")]
    pub jobs: Option<NonZeroUsize>,

    /// Key of the registry document in the store
    #[arg(long, global = true, default_value = DEFAULT_REGISTRY_KEY)]
    pub registry_key: String,

    /// Packer program invoked once per package
    #[arg(long, global = true, env = "DEX_PACKER", default_value = "dex")]
    pub packer: String,

    /// Packer argument (repeatable); supports {output} and {dir}
    #[arg(long = "packer-arg", global = true, allow_hyphen_values = true)]
    pub packer_args: Vec<String>,

    /// What to do when two manifests declare the same package: error or latest
    #[arg(long, global = true, default_value_t = DuplicatePolicy::Error)]
    pub on_duplicate: DuplicatePolicy,

    /// Public base URL of the store, used to print download links
    #[arg(long, global = true, env = "DEX_REGISTRY_PUBLIC_URL")]
    pub public_url: Option<String>,

    /// Show what would be uploaded without uploading
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Suppress progress output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// List manifests and report manifest errors and duplicate names
    Scan,
    /// Clean the build directory and build every package
    Build,
    /// Merge the last build into the published registry and upload it
    Publish,
    /// Scan, build, merge and publish in one run
    Release,
}

impl Cli {
    /// Pipeline settings from the parsed flags.
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            source_dir: self.source.clone(),
            build_dir: self.build_dir.clone(),
            registry_key: self.registry_key.clone(),
            jobs: self.jobs.map_or_else(default_jobs, NonZeroUsize::get),
            on_duplicate: self.on_duplicate,
            dry_run: self.dry_run,
            public_base_url: self.public_url.clone(),
        }
    }
}

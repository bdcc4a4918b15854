//! Build and publish pipeline for the dex package registry.
//!
//! Stages, leaves first: [`scan`] finds manifests, [`builder`] runs the
//! external packer for each, [`baseline`] fetches the published registry,
//! [`synth`] merges the two and [`publish`] uploads the result. The
//! [`pipeline`] module wires them together.

pub mod archive;
pub mod baseline;
pub mod build_dir;
pub mod builder;
pub mod manifest;
pub mod pipeline;
pub mod publish;
pub mod reporter;
pub mod scan;
pub mod store;
pub mod synth;

pub use build_dir::BuildDir;
pub use builder::{CommandPacker, Packer};
pub use manifest::Manifest;
pub use pipeline::{Pipeline, PipelineConfig, PipelineError};
pub use reporter::{NullReporter, Reporter};
pub use store::{ObjectStore, OperatorStore, StoreLocation};

//! Shared types and wire format for the dex package registry.
//!
//! The build pipeline (`dex-core`) produces and consumes these types; the
//! install client reads the same [`RegistryDocument`] from the object store.

pub mod hash;
pub mod registry;
pub mod report;
pub mod types;

// Re-exports
pub use hash::*;
pub use registry::{REGISTRY_SCHEMA_VERSION, RegistryDocument, RegistryEntry, VersionRecord};
pub use report::{BuildFailure, BuildReport, BuiltPackage};
pub use types::*;

/// File extension of package archives produced by the packer.
pub const ARCHIVE_EXT: &str = "tar.gz";

/// File name of the archive for `name` at `version`: `{name}-{version}.tar.gz`.
pub fn archive_file_name(name: &PackageName, version: &Version) -> String {
    format!("{name}-{version}.{ARCHIVE_EXT}")
}

//! Archive file naming: `{name}-{version}.tar.gz`.

use dex_schema::{PackageName, Version};
use regex::Regex;
use std::sync::OnceLock;

fn archive_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        // The version starts at the first `-<digit>.<digit>.<digit>`, so names
        // may themselves contain dashes (`docker-compose-0.2.1.tar.gz`).
        Regex::new(r"^(?P<name>.+?)-(?P<version>\d+\.\d+\.\d+[0-9A-Za-z.+-]*)\.tar\.gz$")
            .unwrap_or_else(|e| unreachable!("archive pattern is valid: {e}"))
    })
}

/// Split an archive file name into package name and version.
///
/// Returns `None` for anything that is not a package archive.
pub fn parse_archive_name(file_name: &str) -> Option<(PackageName, Version)> {
    let caps = archive_pattern().captures(file_name)?;
    let version = Version::parse(&caps["version"]).ok()?;
    Some((PackageName::new(&caps["name"]), version))
}

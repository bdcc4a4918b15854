//! Plain-text terminal reporter.

use dex_core::Reporter;
use dex_schema::{PackageName, Version};

/// Prints short indented progress lines: results to stdout, problems to
/// stderr.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleReporter {
    quiet: bool,
}

impl ConsoleReporter {
    pub fn new(quiet: bool) -> Self {
        Self { quiet }
    }
}

impl Reporter for ConsoleReporter {
    fn section(&self, title: &str) {
        if !self.quiet {
            println!("  {title}");
        }
    }

    fn done(&self, name: &PackageName, version: &Version, detail: &str) {
        if !self.quiet {
            println!("  built {name} {version}  {detail}");
        }
    }

    fn failed(&self, label: &str, reason: &str) {
        eprintln!("  failed {label}: {reason}");
    }

    fn info(&self, msg: &str) {
        if !self.quiet {
            println!("  {msg}");
        }
    }

    fn warning(&self, msg: &str) {
        eprintln!("  warning: {msg}");
    }

    fn error(&self, msg: &str) {
        eprintln!("  error: {msg}");
    }

    fn summary(&self, count: usize, action: &str, elapsed_secs: f64) {
        if !self.quiet {
            println!("  {count} {action} in {elapsed_secs:.1}s");
        }
    }
}

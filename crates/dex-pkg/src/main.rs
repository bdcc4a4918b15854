//! dex-pkg - build and publish dex packages

use clap::Parser;
use dex_pkg::Cli;
use dex_pkg::cmd;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = cmd::run(cli).await {
        eprintln!("  error: {e:#}");
        std::process::exit(cmd::exit_code(&e));
    }
}

//! Subcommand implementations.

use crate::console::ConsoleReporter;
use crate::{Cli, Commands};
use anyhow::{Context, Result};
use comfy_table::{Table, presets};
use dex_core::pipeline::PublishOutcome;
use dex_core::store::S3Settings;
use dex_core::{CommandPacker, ObjectStore, OperatorStore, Pipeline, PipelineError, StoreLocation};
use std::sync::Arc;

/// Run the selected subcommand.
pub async fn run(cli: Cli) -> Result<()> {
    let pipeline = pipeline(&cli)?;
    match cli.command {
        Commands::Scan => scan(&pipeline),
        Commands::Build => build(&pipeline).await,
        Commands::Publish => publish(&pipeline).await,
        Commands::Release => release(&pipeline).await,
    }
}

/// Exit code for an error returned by [`run`].
pub fn exit_code(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<PipelineError>()
        .map_or(1, PipelineError::exit_code)
}

fn pipeline(cli: &Cli) -> Result<Pipeline> {
    let packer = Arc::new(CommandPacker::new(&cli.packer, cli.packer_args.clone()));
    let reporter = Arc::new(ConsoleReporter::new(cli.quiet));
    let mut pipeline = Pipeline::new(cli.pipeline_config(), packer, reporter);

    if let Some(remote) = &cli.remote {
        let location = StoreLocation::parse(remote).map_err(anyhow::Error::msg)?;
        let store = OperatorStore::new(&location, &S3Settings::from_env())
            .with_context(|| format!("Failed to configure remote store {location}"))?;
        tracing::debug!("remote store: {}", store.describe());
        pipeline = pipeline.with_store(Arc::new(store));
    }
    Ok(pipeline)
}

fn scan(pipeline: &Pipeline) -> Result<()> {
    let report = pipeline.scan()?;

    let mut table = Table::new();
    table.load_preset(presets::NOTHING);
    table.set_header(vec!["NAME", "VERSION", "PLATFORMS", "RESOURCES", "MANIFEST"]);
    for m in &report.manifests {
        let platforms: Vec<&str> = m.platforms.iter().map(String::as_str).collect();
        table.add_row(vec![
            m.name.to_string(),
            m.version.to_string(),
            platforms.join(","),
            m.resources.len().to_string(),
            m.path.display().to_string(),
        ]);
    }
    println!("{table}");

    let failures = report.failures();
    for (path, err) in &report.errors {
        eprintln!("  failed {}: {err}", path.display());
    }
    println!();
    println!(
        "  {} manifests, {} valid, {} invalid, {} conflicts",
        report.found,
        report.manifests.len(),
        report.errors.len(),
        report.conflicts.len()
    );

    if failures.is_empty() {
        Ok(())
    } else {
        let mut failed: Vec<String> = failures.iter().map(dex_schema::BuildFailure::label).collect();
        failed.sort();
        failed.dedup();
        Err(PipelineError::BuildFailed { failed }.into())
    }
}

async fn build(pipeline: &Pipeline) -> Result<()> {
    let report = pipeline.build().await?;
    println!();
    println!(
        "  {} packages built in {}",
        report.built.len(),
        pipeline.config().build_dir.display()
    );
    Ok(())
}

async fn publish(pipeline: &Pipeline) -> Result<()> {
    let outcome = pipeline.publish_saved().await?;
    print_outcome(&outcome, pipeline.config().dry_run);
    Ok(())
}

async fn release(pipeline: &Pipeline) -> Result<()> {
    let outcome = pipeline.release().await?;
    print_outcome(&outcome, pipeline.config().dry_run);
    Ok(())
}

fn print_outcome(outcome: &PublishOutcome, dry_run: bool) {
    println!();
    if dry_run {
        println!("  dry run: nothing was uploaded");
    }
    println!(
        "  registry: {} packages, {} versions ({} new packages, {} new versions, {} refreshed)",
        outcome.registry.len(),
        outcome.registry.version_count(),
        outcome.merge.added_packages.len(),
        outcome.merge.added_versions.len(),
        outcome.merge.refreshed_versions.len()
    );
    if !outcome.sync.skipped.is_empty() {
        println!("  skipped {} local files", outcome.sync.skipped.len());
    }
}

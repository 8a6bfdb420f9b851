//! pricestream: daily marketplace price ingestion into Delta Lake.
//!
//! `run` executes one pipeline run and exits, `serve` exposes the HTTP
//! trigger surface, and `validate` checks the configuration.

use clap::{Parser, Subcommand};
use snafu::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use pricestream::config::Config;
use pricestream::error::{AddressParseSnafu, ConfigSnafu, MetricsSnafu, PipelineError, ServiceSnafu};
use pricestream::pipeline::RunOutcome;
use pricestream::service::{AppState, ConfiguredRunner};
use pricestream::{metrics, run_pipeline, service, signal};

/// Marketplace price ingestion into Delta Lake.
#[derive(Parser, Debug)]
#[command(name = "pricestream")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file.
    #[arg(short, long, env = "PRICESTREAM_CONFIG")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute one pipeline run and exit.
    Run,
    /// Serve the HTTP trigger surface until interrupted.
    Serve,
    /// Validate configuration without processing.
    Validate,
}

#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), PipelineError> {
    let args = Args::parse();

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("pricestream starting");

    let config = Config::from_file(&args.config).context(ConfigSnafu)?;

    match args.command {
        Command::Validate => validate(&config),
        Command::Run => run(config).await,
        Command::Serve => serve(config).await,
    }
}

fn validate(config: &Config) -> Result<(), PipelineError> {
    info!("Validating configuration");
    info!("Catalog: {} ({:?})", config.catalog.path, config.catalog.format);
    info!("Staging: {}/{}", config.staging.url, config.staging.prefix);
    info!(
        "Checkpoint: {} (manifest {})",
        config.checkpoint.path, config.checkpoint.manifest_path
    );
    info!("Warehouse: {}", config.warehouse.url);
    info!(
        "Batch size: {}, flush rows: {}",
        config.pipeline.batch_size, config.pipeline.flush_rows
    );
    for (code, marketplace) in &config.marketplaces {
        info!(
            "  - {}: domain {} ({})",
            code, marketplace.domain_id, marketplace.currency
        );
    }
    if config.api.resolved_key().is_none() {
        warn!("API key is not set; runs will fail until it is configured");
    }
    info!("Configuration is valid");
    Ok(())
}

async fn run(config: Config) -> Result<(), PipelineError> {
    if config.metrics.enabled {
        let addr = config.metrics.address.parse().context(AddressParseSnafu)?;
        metrics::init(addr).context(MetricsSnafu)?;
        debug!(
            "Metrics endpoint listening on http://{}/metrics",
            config.metrics.address
        );
    }

    let report = run_pipeline(&config).await?;

    info!("Pipeline finished: {}", report.outcome.as_str());
    info!("  Batches processed: {}", report.batches_processed);
    info!("  Batches failed: {}", report.batches_failed);
    info!("  API calls: {}", report.api_calls);
    info!("  Rows written: {}", report.rows_written);
    info!(
        "  Segments: {} ({} carried over)",
        report.segments.len(),
        report.resumed_segments
    );
    info!("  Rows loaded: {}", report.rows_loaded);
    if report.outcome == RunOutcome::NothingLoaded {
        warn!("Nothing loaded; checkpoint kept for the next run");
    }

    Ok(())
}

async fn serve(config: Config) -> Result<(), PipelineError> {
    let handle = if config.metrics.enabled {
        Some(metrics::install_recorder().context(MetricsSnafu)?)
    } else {
        None
    };

    let address = config.service.address.clone();
    let state = AppState::new(Arc::new(ConfiguredRunner::new(config)));
    let shutdown = signal::shutdown_token();

    service::serve(&address, state, handle, shutdown)
        .await
        .context(ServiceSnafu)
}

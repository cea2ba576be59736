//! CLI entry point for vibration-stream
//!
//! Two long-running roles share one binary:
//! - `stage`: populate shared storage, write the readiness marker, then monitor it
//! - `stream`: wait for the marker, build the catalog and publish batches forever
//!
//! `catalog` prints what the streamer would publish, which is handy when checking a
//! freshly staged volume.
//!
//! # Usage
//!
//! ```bash
//! vibration-stream --config config/stream.toml stage
//! vibration-stream stream
//! vibration-stream catalog --json
//! ```

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::sync::oneshot;
use tracing::{error, info, warn};
use vibration_stream::catalog;
use vibration_stream::config::{StreamConfig, DEFAULT_CONFIG_PATH};
use vibration_stream::logging;
use vibration_stream::readiness::{FileMarker, ReadinessGate};
use vibration_stream::reader::Hdf5Reader;
use vibration_stream::sink::LogSink;
use vibration_stream::stager::DataStager;
use vibration_stream::streamer::Streamer;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "vibration-stream")]
#[command(about = "Stage vibration recordings and stream them in batches", long_about = None)]
struct Cli {
    /// Configuration file (missing file means defaults plus environment)
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Populate shared storage, signal readiness, then monitor
    Stage,

    /// Wait for readiness and publish batches until interrupted
    Stream {
        /// Also log full batch arrays at trace level
        #[arg(long)]
        verbose_values: bool,
    },

    /// Print the catalog built from shared storage
    Catalog {
        /// Wait for the readiness marker first
        #[arg(long)]
        wait: bool,

        /// Print records as JSON instead of a summary
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = StreamConfig::load_from(&cli.config)?;
    config.validate()?;
    logging::init_from_config(&config)?;

    let result = match cli.command {
        Commands::Stage => stage(config).await,
        Commands::Stream { verbose_values } => stream(config, verbose_values).await,
        Commands::Catalog { wait, json } => print_catalog(config, wait, json).await,
    };

    if let Err(err) = &result {
        error!(error = %err, "Fatal error, exiting");
    }
    result
}

async fn stage(config: StreamConfig) -> Result<()> {
    let stager = DataStager::from_config(&config);
    let report = stager.run(shutdown_on_ctrl_c()).await?;
    info!(
        files = report.files,
        source = ?report.source,
        "Stager stopped"
    );
    Ok(())
}

async fn stream(config: StreamConfig, verbose_values: bool) -> Result<()> {
    if !cfg!(feature = "storage_hdf5") {
        bail!("streaming requires the 'storage_hdf5' feature");
    }

    let marker = FileMarker::from_config(&config);
    let reader = Hdf5Reader::new(config.streamer.dataset.clone());
    let sink = LogSink::new().verbose(verbose_values);

    let stats = Streamer::new(config, reader, sink)
        .run(&marker, shutdown_on_ctrl_c())
        .await?;
    info!(
        published = stats.published,
        failed = stats.failed,
        wraps = stats.wraps,
        "Streamer stopped"
    );
    Ok(())
}

async fn print_catalog(config: StreamConfig, wait: bool, json: bool) -> Result<()> {
    if wait {
        let marker = FileMarker::from_config(&config);
        if !marker.wait_ready(config.streamer.ready_timeout()).await.is_ready() {
            bail!("timed out waiting for {}", marker.path().display());
        }
    }

    let catalog = catalog::scan(&config.storage, &config.filter);
    if json {
        println!("{}", serde_json::to_string_pretty(catalog.records())?);
        return Ok(());
    }

    for (index, record) in catalog.iter().enumerate() {
        println!("{index:>5}  {}", record.path.display());
    }
    println!("{}", catalog.summary());
    if catalog.is_empty() {
        warn!(root = %config.storage.shared_root.display(), "No files match the configured filter");
    }
    Ok(())
}

/// Oneshot that fires on Ctrl-C.
fn shutdown_on_ctrl_c() -> oneshot::Receiver<()> {
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received");
                let _ = tx.send(());
            }
            Err(err) => {
                warn!(error = %err, "Could not listen for Ctrl-C, running until killed");
                // dropping the sender would read as a shutdown request
                std::future::pending::<()>().await;
            }
        }
    });
    rx
}

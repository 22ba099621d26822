use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use transferbox::config::EngineConfig;
use transferbox::core::{
    TransferEngine, TransferEvent, TransferResult, checksum_file, cleanup_orphaned_temp_files,
};
use transferbox::logging::{self, LogConfig};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Parser)]
#[command(name = "transferbox")]
#[command(about = "Atomic, verified file transfers for media ingest", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to ./transferbox.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    verbose: bool,

    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy files into a destination directory
    Copy(CopyArgs),
    /// Print the xxHash64 digest of each file
    Checksum {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Remove stale .TBPART files under a directory
    Sweep(SweepArgs),
}

#[derive(Args, Serialize)]
struct CopyArgs {
    #[serde(skip)]
    #[arg(required = true)]
    sources: Vec<PathBuf>,

    #[serde(skip)]
    #[arg(long)]
    dest: PathBuf,

    /// Print results as JSON
    #[serde(skip)]
    #[arg(long)]
    json: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    max_concurrency: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    buffer_size: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    verify_checksum: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, value_parser = ["error", "overwrite", "skip"])]
    on_conflict: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    continue_on_error: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    fsync: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    max_retries: Option<u32>,
}

#[derive(Args, Serialize)]
struct SweepArgs {
    #[serde(skip)]
    root: PathBuf,

    #[serde(rename = "orphan_max_age_hours", skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    max_age_hours: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.command {
        Commands::Copy(args) => load_config(cli.config.as_deref(), Some(args))?,
        Commands::Sweep(args) => load_config(cli.config.as_deref(), Some(args))?,
        Commands::Checksum { .. } => load_config(cli.config.as_deref(), None::<&CopyArgs>)?,
    };

    logging::init(LogConfig {
        json: cli.json_logs || config.json_logs,
        verbose: cli.verbose || config.verbose,
    });
    debug!(?config, "Configuration loaded");

    match &cli.command {
        Commands::Copy(args) => run_copy(&config, args).await.context("Copy failed")?,
        Commands::Checksum { files } => run_checksum(&config, files)
            .await
            .context("Checksum failed")?,
        Commands::Sweep(args) => run_sweep(&config, &args.root).await,
    }

    Ok(())
}

fn load_config<T: Serialize>(path: Option<&Path>, overrides: Option<&T>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load(path, overrides),
        None => EngineConfig::new(overrides),
    }
}

async fn run_copy(config: &EngineConfig, args: &CopyArgs) -> Result<()> {
    let pairs = args
        .sources
        .iter()
        .map(|source| {
            let name = source
                .file_name()
                .with_context(|| format!("Source has no file name: {}", source.display()))?;
            Ok((source.clone(), args.dest.join(name)))
        })
        .collect::<Result<Vec<_>>>()?;

    let engine = TransferEngine::with_stop_timeout(config.stop_timeout());
    let options = config.transfer_options();

    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let drain = tokio::spawn(log_events(rx));

    let stopper = engine.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping transfers");
            stopper.stop().await;
        }
    });

    let outcome = engine.transfer_files(&pairs, &options, &tx).await;
    drop(tx);
    settle_interrupt(&engine, interrupt).await;
    if let Err(e) = drain.await {
        warn!(error = %e, "Event logger ended abnormally");
    }

    let results = outcome.context("Batch transfer aborted")?;
    print_results(&results, args.json)?;

    let failed = results.iter().filter(|r| !r.success).count();
    if failed > 0 {
        bail!("{} of {} transfers failed", failed, results.len());
    }
    Ok(())
}

/// An interrupted batch returns before `stop()` has finished its cleanup, so
/// a stop in progress is awaited. Otherwise the idle handler is cancelled.
async fn settle_interrupt(engine: &TransferEngine, interrupt: JoinHandle<()>) {
    if engine.is_stopping() {
        if let Err(e) = interrupt.await {
            warn!(error = %e, "Stop handler ended abnormally");
        }
    } else {
        interrupt.abort();
    }
}

fn print_results(results: &[TransferResult], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(results)?);
        return Ok(());
    }

    for result in results {
        let status = match (result.success, result.skipped) {
            (true, true) => "SKIP",
            (true, false) => "OK",
            (false, _) => "FAIL",
        };
        let detail = match (&result.error, &result.dest_checksum) {
            (Some(e), _) => e.clone(),
            (None, Some(digest)) => digest.clone(),
            (None, None) => String::new(),
        };
        println!(
            "{:<4}  {} -> {}  {} bytes  {}",
            status,
            result.source.display(),
            result.destination.display(),
            result.bytes_transferred,
            detail
        );
    }
    Ok(())
}

async fn log_events(mut rx: mpsc::Receiver<TransferEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            TransferEvent::FileProgress {
                index,
                source,
                progress,
            } => debug!(
                index,
                source = %source.display(),
                bytes = progress.bytes_transferred,
                total = progress.total_bytes,
                percentage = format!("{:.1}", progress.percentage),
                "File progress"
            ),
            TransferEvent::BatchProgress(progress) => info!(
                files_completed = progress.files_completed,
                files_total = progress.files_total,
                percentage = format!("{:.1}", progress.percentage),
                speed_mbps = format!("{:.1}", progress.speed / 1_000_000.0),
                "Batch progress"
            ),
            TransferEvent::ChecksumProgress { path, progress } => debug!(
                path = %path.display(),
                percentage = format!("{:.1}", progress.percentage),
                "Checksum progress"
            ),
            TransferEvent::Retrying {
                index,
                attempt,
                delay,
                error,
            } => warn!(
                index,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying transfer"
            ),
            TransferEvent::FileComplete { index, result } => {
                if result.success {
                    info!(
                        index,
                        source = %result.source.display(),
                        skipped = result.skipped,
                        verified = result.checksum_verified,
                        "File complete"
                    );
                } else {
                    error!(
                        index,
                        source = %result.source.display(),
                        error = result.error.as_deref().unwrap_or("unknown"),
                        "File failed"
                    );
                }
            }
        }
    }
}

async fn run_checksum(config: &EngineConfig, files: &[PathBuf]) -> Result<()> {
    let buffer_size = config.transfer_options().buffer_size;
    for path in files {
        let digest = checksum_file(path, buffer_size)
            .await
            .with_context(|| format!("Failed to hash {}", path.display()))?;
        println!("{}  {}", digest, path.display());
    }
    Ok(())
}

async fn run_sweep(config: &EngineConfig, root: &Path) {
    let removed = cleanup_orphaned_temp_files(root, config.orphan_max_age()).await;
    println!("Removed {} orphaned temp file(s) under {}", removed, root.display());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn test_stop_in_progress_runs_to_completion() {
        let engine = TransferEngine::with_stop_timeout(Duration::from_millis(200));
        let stopper = engine.clone();
        let started = Instant::now();
        let interrupt = tokio::spawn(async move { stopper.stop().await });
        while !engine.is_stopping() {
            tokio::task::yield_now().await;
        }

        settle_interrupt(&engine, interrupt).await;

        // stop() ends with a 100 ms grace sleep; an aborted handler would return at once
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert!(engine.is_stopped());
        assert!(engine.tracked_temp_files().is_empty());
    }

    #[tokio::test]
    async fn test_idle_handler_is_cancelled() {
        let engine = TransferEngine::new();
        let interrupt = tokio::spawn(std::future::pending::<()>());

        settle_interrupt(&engine, interrupt).await;

        assert!(!engine.is_stopping());
        assert!(!engine.is_stopped());
    }
}

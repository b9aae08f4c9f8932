//! url-copy: the supervised copy process.
//!
//! Spawned by the worker with a task file describing one batch. Runs the
//! transfers one at a time, writes START/END/PERF messages to the local
//! disk queues, and exits. The worker's forwarder takes it from there, so
//! the messages survive even if this process is killed right after a copy.
//!
//! SIGTERM triggers a graceful cancellation: the running transfer is
//! abandoned, it and every transfer not yet run are marked CANCELED, and
//! the terminal message is still written.

mod copy;
mod heuristics;
mod reporter;

use anyhow::{Context, Result};
use clap::Parser;
use copy::UrlCopy;
use fts_types::{Batch, TransferState};
use reporter::Reporter;
use std::fs;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "url-copy", about = "FTS copy process")]
struct Cli {
    /// Log verbosity (trace, debug, info, warn, error).
    #[arg(long = "LogLevel", default_value = "info")]
    log_level: String,

    /// Base dir for the local disk queues.
    #[arg(long = "DirQ", default_value = "/var/lib/fts/dirq")]
    dirq: PathBuf,

    /// Directory for the transfer log file.
    #[arg(long = "LogDir", default_value = "/var/log/fts/transfers")]
    log_dir: PathBuf,

    /// User credential to use for the copy.
    #[arg(long = "Proxy")]
    proxy: Option<PathBuf>,

    /// Do not delete the task file once read.
    #[arg(long = "KeepTaskFile")]
    keep_task_file: bool,

    /// File with the serialized batch to run.
    task_file: PathBuf,
}

/// Redirect logging to a per-batch file under the log directory. Falls back
/// to stderr when the directory cannot be used.
fn init_logging(
    cli: &Cli,
    batch_id: &str,
) -> (
    Option<tracing_appender::non_blocking::WorkerGuard>,
    Option<String>,
) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone()));

    if fs::create_dir_all(&cli.log_dir).is_ok() {
        let file_name = format!("{batch_id}.log");
        let log_path = cli.log_dir.join(&file_name);
        let appender = tracing_appender::rolling::never(&cli.log_dir, &file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(non_blocking)
            .with_ansi(false)
            .init();
        (Some(guard), Some(log_path.display().to_string()))
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        (None, None)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let raw = fs::read(&cli.task_file).context("could not open the task file")?;
    let batch: Batch =
        serde_json::from_slice(&raw).context("failed to parse the task file")?;
    if !cli.keep_task_file {
        let _ = fs::remove_file(&cli.task_file);
    }

    let batch_id = batch.id();
    let (_log_guard, log_path) = init_logging(&cli, &batch_id);

    info!(
        version = fts_types::VERSION,
        batch = %batch_id,
        transfers = batch.transfers.len(),
        proxy = %cli.proxy.as_deref().unwrap_or_else(|| std::path::Path::new("")).display(),
        "url-copy starting"
    );

    // Graceful cancellation on SIGTERM (the supervisor's kill path) and
    // SIGINT.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to install the SIGTERM handler");
            tokio::select! {
                _ = sigterm.recv() => {}
                _ = tokio::signal::ctrl_c() => {}
            }
            warn!("termination requested, canceling");
            cancel.cancel();
        });
    }

    let reporter = Reporter::open(&cli.dirq).context("could not open the local queues")?;
    let done = UrlCopy::new(batch, reporter, cancel, log_path).run().await;

    let failures = done
        .transfers
        .iter()
        .filter(|t| {
            t.info.as_ref().and_then(|i| i.state) == Some(TransferState::Failed)
        })
        .count();
    info!(batch = %batch_id, failures, "url-copy done");
    Ok(())
}

//! FTS Worker daemon.

use anyhow::{Context, Result};
use clap::Parser;
use fts_worker::{Worker, WorkerParams};
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "fts-workerd", about = "FTS Worker")]
struct Cli {
    #[command(flatten)]
    common: fts_config::CommonOpts,

    #[command(flatten)]
    bus: fts_config::BusOpts,

    /// Path of the url-copy binary (default url-copy, resolved via PATH).
    #[arg(long = "UrlCopy")]
    url_copy: Option<PathBuf>,

    /// Base directory for the local disk queues (default /var/lib/fts/dirq).
    #[arg(long = "DirQ")]
    dirq: Option<PathBuf>,

    /// Pid registry path (default /var/lib/fts/pid.db).
    #[arg(long = "PidDB")]
    pid_db: Option<PathBuf>,

    /// Directory for transfer logs (default /var/log/fts/transfers).
    #[arg(long = "TransfersLogDir")]
    transfers_log_dir: Option<PathBuf>,

    /// Credential store endpoint, host:port.
    #[arg(long = "X509d")]
    x509d: Option<String>,
}

#[derive(Debug, Default, serde::Deserialize)]
struct FileConfig {
    #[serde(flatten)]
    bus: fts_config::BusFileConfig,
    #[serde(default)]
    url_copy: Option<PathBuf>,
    #[serde(default)]
    dirq: Option<PathBuf>,
    #[serde(default)]
    pid_db: Option<PathBuf>,
    #[serde(default)]
    transfers_log_dir: Option<PathBuf>,
    #[serde(default)]
    x509d: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = fts_config::init_logging(cli.common.log.as_deref(), cli.common.debug);

    let file: FileConfig = fts_config::load_file(cli.common.config.as_deref())?;
    let params = WorkerParams {
        url_copy_bin: cli
            .url_copy
            .or(file.url_copy)
            .unwrap_or_else(|| PathBuf::from("url-copy")),
        dirq_base: cli
            .dirq
            .or(file.dirq)
            .unwrap_or_else(|| PathBuf::from("/var/lib/fts/dirq")),
        pid_db: cli
            .pid_db
            .or(file.pid_db)
            .unwrap_or_else(|| PathBuf::from("/var/lib/fts/pid.db")),
        transfers_log_dir: cli
            .transfers_log_dir
            .or(file.transfers_log_dir)
            .unwrap_or_else(|| PathBuf::from("/var/log/fts/transfers")),
        x509d: cli.x509d.or(file.x509d),
        debug: cli.common.debug,
    };

    let settings = fts_config::BusSettings::resolve(&cli.bus, &file.bus);
    let client_id = format!("fts-workerd-{}", fts_config::host_name());
    let bus = settings
        .connect(&client_id)
        .await
        .context("connecting to the broker")?;

    let worker = Worker::new(params, bus).context("starting the worker")?;
    info!("all subservices started");
    worker.run().await.context("worker subsystem failed")?;
    Ok(())
}

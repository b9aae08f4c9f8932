//! FTS Scheduler daemon.
//!
//! Persists the echelon either in an embedded RocksDB (`--EchelonDir`) or in
//! Redis (`--Redis`); the scoreboard follows the same choice so slot
//! accounting is server-side atomic when Redis is used.

use anyhow::{bail, Context, Result};
use clap::Parser;
use fts_echelon::{RedisStore, RocksStore};
use fts_scheduler::{Scheduler, DEFAULT_TICK};
use fts_scoreboard::{EmbeddedBackend, RedisBackend};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "fts-schedd", about = "FTS Scheduler")]
struct Cli {
    #[command(flatten)]
    common: fts_config::CommonOpts,

    #[command(flatten)]
    bus: fts_config::BusOpts,

    /// Echelon persistency dir (default /var/lib/fts/echelon).
    #[arg(long = "EchelonDir")]
    echelon_dir: Option<PathBuf>,

    /// Redis host and port; when set, both the echelon and the scoreboard
    /// live in Redis instead of the embedded store.
    #[arg(long = "Redis", num_args = 0..=1, default_missing_value = "localhost:6379")]
    redis: Option<String>,

    /// Seconds between producer passes.
    #[arg(long = "Tick")]
    tick: Option<u64>,
}

#[derive(Debug, Default, serde::Deserialize)]
struct FileConfig {
    #[serde(flatten)]
    bus: fts_config::BusFileConfig,
    #[serde(default)]
    echelon_dir: Option<PathBuf>,
    #[serde(default)]
    redis: Option<String>,
    #[serde(default)]
    tick: Option<u64>,
}

async fn run<S, B>(scheduler: Scheduler<S, B>) -> Result<()>
where
    S: fts_echelon::TreeStore + 'static,
    B: fts_scoreboard::CounterBackend + 'static,
{
    let scheduler = Arc::new(scheduler);
    let consumer = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.run_consumer().await })
    };
    let producer = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.run_producer().await })
    };
    info!("all subservices started");

    tokio::select! {
        result = consumer => match result {
            Ok(Ok(())) => bail!("scheduler consumer stopped"),
            Ok(Err(e)) => bail!("scheduler consumer failed: {e}"),
            Err(e) => bail!("scheduler consumer panicked: {e}"),
        },
        result = producer => match result {
            Ok(Ok(())) => bail!("scheduler producer stopped"),
            Ok(Err(e)) => bail!("scheduler producer failed: {e}"),
            Err(e) => bail!("scheduler producer panicked: {e}"),
        },
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = fts_config::init_logging(cli.common.log.as_deref(), cli.common.debug);

    let file: FileConfig = fts_config::load_file(cli.common.config.as_deref())?;
    let redis = cli.redis.or(file.redis);
    let echelon_dir = cli
        .echelon_dir
        .or(file.echelon_dir)
        .unwrap_or_else(|| PathBuf::from("/var/lib/fts/echelon"));
    let tick = cli
        .tick
        .or(file.tick)
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_TICK);

    let settings = fts_config::BusSettings::resolve(&cli.bus, &file.bus);
    let client_id = format!("fts-schedd-{}", fts_config::host_name());
    let bus = settings
        .connect(&client_id)
        .await
        .context("connecting to the broker")?;

    match redis {
        Some(addr) => {
            info!(redis = %addr, "using redis persistence");
            let store = RedisStore::open(&addr, RedisStore::DEFAULT_PREFIX)
                .with_context(|| format!("connecting to redis at {addr}"))?;
            let backend = RedisBackend::open(&addr)
                .with_context(|| format!("connecting to redis at {addr}"))?;
            let scheduler =
                Scheduler::open(store, backend, bus, tick).context("opening the scheduler")?;
            run(scheduler).await
        }
        None => {
            info!(dir = %echelon_dir.display(), "using embedded persistence");
            let store = RocksStore::open(echelon_dir.join("echelon"))
                .context("opening the echelon store")?;
            let backend = EmbeddedBackend::open(echelon_dir.join("scoreboard"))
                .context("opening the scoreboard store")?;
            let scheduler =
                Scheduler::open(store, backend, bus, tick).context("opening the scheduler")?;
            run(scheduler).await
        }
    }
}

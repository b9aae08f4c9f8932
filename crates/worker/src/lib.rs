//! Worker daemon internals.
//!
//! Each worker host runs one daemon made of three concurrent subsystems
//! sharing a supervised PID registry:
//!
//! - the **runner** consumes READY batches and spawns url-copy children,
//! - the **killer** listens for cancellation orders and signals matching
//!   children,
//! - the **forwarder** drains the local disk queues the children write to
//!   and republishes their events on the bus.
//!
//! The [`Supervisor`] persists `pid -> batch` so a worker restart never
//! orphans running copies.

mod forwarder;
mod killer;
mod runner;
mod supervisor;
mod url_copy;

pub use forwarder::Forwarder;
pub use killer::Killer;
pub use runner::Runner;
pub use supervisor::{Gone, Supervisor, KILL_TIMEOUT};

use fts_bus::Bus;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Errors that terminate a worker subsystem.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("bus: {0}")]
    Bus(#[from] fts_bus::BusError),

    #[error("pid database: {0}")]
    PidDb(String),

    #[error("local queue: {0}")]
    Dirq(#[from] fts_dirq::DirqError),
}

/// Static configuration of a worker host.
#[derive(Debug, Clone)]
pub struct WorkerParams {
    /// Path of the url-copy binary to spawn.
    pub url_copy_bin: PathBuf,
    /// Base directory of the local disk queues (`start/`, `end/`, `perf/`).
    pub dirq_base: PathBuf,
    /// Path of the embedded pid registry.
    pub pid_db: PathBuf,
    /// Directory for per-transfer log files.
    pub transfers_log_dir: PathBuf,
    /// Credential store endpoint; when unset the proxy file is written
    /// empty and the copy runs uncredentialed.
    pub x509d: Option<String>,
    /// Forwarded to the child as its log level.
    pub debug: bool,
}

/// Shared state of the worker subsystems.
pub struct WorkerContext {
    pub params: WorkerParams,
    pub supervisor: Supervisor,
    pub bus: Arc<dyn Bus>,
}

/// The worker daemon: runner + killer + forwarder + reaper.
pub struct Worker {
    context: Arc<WorkerContext>,
}

impl Worker {
    /// Open the pid registry (recovering persisted pids) and assemble the
    /// subsystems.
    pub fn new(params: WorkerParams, bus: Arc<dyn Bus>) -> Result<Self, WorkerError> {
        let supervisor = Supervisor::open(&params.pid_db, KILL_TIMEOUT)?;
        Ok(Self {
            context: Arc::new(WorkerContext {
                params,
                supervisor,
                bus,
            }),
        })
    }

    pub fn context(&self) -> Arc<WorkerContext> {
        self.context.clone()
    }

    /// Run all subsystems until the first of them fails.
    pub async fn run(&self) -> Result<(), WorkerError> {
        let runner = {
            let context = self.context.clone();
            tokio::spawn(async move { Runner::new(context).run().await })
        };
        let killer = {
            let context = self.context.clone();
            tokio::spawn(async move { Killer::new(context).run().await })
        };
        let forwarder = {
            let context = self.context.clone();
            tokio::spawn(async move { Forwarder::new(context)?.run().await })
        };
        let reaper = {
            let context = self.context.clone();
            tokio::spawn(async move { context.supervisor.run_reaper().await })
        };

        tokio::select! {
            result = runner => flatten("runner", result),
            result = killer => flatten("killer", result),
            result = forwarder => flatten("forwarder", result),
            _ = reaper => Ok(()),
        }
    }
}

fn flatten(
    name: &str,
    result: Result<Result<(), WorkerError>, tokio::task::JoinError>,
) -> Result<(), WorkerError> {
    match result {
        Ok(inner) => inner,
        Err(e) => Err(WorkerError::PidDb(format!("{name} task panicked: {e}"))),
    }
}

//! Shared daemon plumbing: CLI flags, YAML configuration overlay, broker
//! wiring and logging setup.
//!
//! Every daemon exposes the same common surface: `--Config <yaml>`,
//! `--Log <file>`, `--Debug`, and the bus flags (`--Stomp`/`--Amqp`,
//! credentials, reconnect policy). Values resolve in order: explicit CLI
//! flag, then configuration file, then built-in default.

use clap::Args;
use fts_bus::{Bus, BusConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

/// Errors from configuration loading and broker wiring.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("could not parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("broker: {0}")]
    Bus(#[from] fts_bus::BusError),
}

/// Flags common to every daemon.
#[derive(Debug, Clone, Args)]
pub struct CommonOpts {
    /// Use configuration from this file.
    #[arg(long = "Config")]
    pub config: Option<PathBuf>,

    /// Log file (default: stderr).
    #[arg(long = "Log")]
    pub log: Option<PathBuf>,

    /// Enable debugging.
    #[arg(long = "Debug", default_value_t = true, action = clap::ArgAction::Set,
          num_args = 0..=1, default_missing_value = "true")]
    pub debug: bool,
}

/// Broker-related flags, shared by every daemon.
#[derive(Debug, Clone, Args)]
pub struct BusOpts {
    /// Stomp host and port.
    #[arg(long = "Stomp")]
    pub stomp: Option<String>,

    /// AMQP host and port. Takes precedence over --Stomp when set.
    #[arg(long = "Amqp")]
    pub amqp: Option<String>,

    /// Stomp user.
    #[arg(long = "StompLogin")]
    pub login: Option<String>,

    /// Stomp passcode.
    #[arg(long = "StompPasscode")]
    pub passcode: Option<String>,

    /// Maximum number of reconnect retries.
    #[arg(long = "StompReconnectRetry")]
    pub reconnect_retry: Option<u32>,

    /// Number of seconds to wait between reconnection attempts.
    #[arg(long = "StompReconnectWait")]
    pub reconnect_wait: Option<u64>,
}

/// Bus keys accepted in the YAML configuration file. Daemons flatten this
/// into their own file schema.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BusFileConfig {
    #[serde(default)]
    pub stomp: Option<String>,
    #[serde(default)]
    pub amqp: Option<String>,
    #[serde(default)]
    pub stomp_login: Option<String>,
    #[serde(default)]
    pub stomp_passcode: Option<String>,
    #[serde(default)]
    pub stomp_reconnect_retry: Option<u32>,
    #[serde(default)]
    pub stomp_reconnect_wait: Option<u64>,
}

/// Which broker flavour to talk to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEndpoint {
    Stomp(String),
    Amqp(String),
}

/// Fully resolved broker settings.
#[derive(Debug, Clone)]
pub struct BusSettings {
    pub endpoint: BrokerEndpoint,
    pub login: String,
    pub passcode: String,
    pub reconnect_retry: u32,
    pub reconnect_wait: Duration,
}

impl BusSettings {
    /// Merge CLI flags over file values over defaults.
    pub fn resolve(cli: &BusOpts, file: &BusFileConfig) -> Self {
        let amqp = cli.amqp.clone().or_else(|| file.amqp.clone());
        let stomp = cli.stomp.clone().or_else(|| file.stomp.clone());
        let endpoint = match (amqp, stomp) {
            (Some(addr), _) => BrokerEndpoint::Amqp(addr),
            (None, Some(addr)) => BrokerEndpoint::Stomp(addr),
            (None, None) => BrokerEndpoint::Stomp("localhost:61613".to_string()),
        };
        Self {
            endpoint,
            login: cli
                .login
                .clone()
                .or_else(|| file.stomp_login.clone())
                .unwrap_or_else(|| "fts".to_string()),
            passcode: cli
                .passcode
                .clone()
                .or_else(|| file.stomp_passcode.clone())
                .unwrap_or_else(|| "fts".to_string()),
            reconnect_retry: cli
                .reconnect_retry
                .or(file.stomp_reconnect_retry)
                .unwrap_or(5),
            reconnect_wait: Duration::from_secs(
                cli.reconnect_wait.or(file.stomp_reconnect_wait).unwrap_or(1),
            ),
        }
    }

    fn bus_config(&self, client_id: &str) -> BusConfig {
        let address = match &self.endpoint {
            BrokerEndpoint::Stomp(addr) | BrokerEndpoint::Amqp(addr) => addr.clone(),
        };
        BusConfig {
            address,
            login: self.login.clone(),
            passcode: self.passcode.clone(),
            client_id: client_id.to_string(),
            reconnect_retry: self.reconnect_retry,
            reconnect_wait: self.reconnect_wait,
        }
    }

    /// Connect to the configured broker.
    pub async fn connect(&self, client_id: &str) -> Result<Arc<dyn Bus>, ConfigError> {
        let config = self.bus_config(client_id);
        match &self.endpoint {
            BrokerEndpoint::Amqp(_) => Ok(fts_bus_amqp::AmqpBus::connect(config).await?),
            BrokerEndpoint::Stomp(_) => {
                Ok(Arc::new(fts_bus_stomp::StompBus::connect(config).await?))
            }
        }
    }
}

/// Read and parse the YAML configuration file. A missing `--Config` flag
/// resolves to the schema's defaults.
pub fn load_file<T>(path: Option<&Path>) -> Result<T, ConfigError>
where
    T: for<'de> Deserialize<'de> + Default,
{
    let Some(path) = path else {
        return Ok(T::default());
    };
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Initialize tracing. With `--Log <file>` the output is redirected to the
/// file (ANSI off); otherwise it goes to stderr. The returned guard must be
/// kept alive for the lifetime of the process.
pub fn init_logging(
    log_file: Option<&Path>,
    debug: bool,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "info" }));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match log_file {
        Some(path) => {
            let directory = path.parent().unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "fts.log".to_string());
            let appender = tracing_appender::rolling::never(directory, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            builder
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true)
                .init();
            Some(guard)
        }
        None => {
            builder.init();
            None
        }
    }
}

/// The machine name, used to derive stable client identifiers.
pub fn host_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

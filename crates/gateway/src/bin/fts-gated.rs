//! FTS Submission Gateway daemon.

use anyhow::{Context, Result};
use clap::Parser;
use fts_gateway::{rpc_routes, Gateway};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "fts-gated", about = "FTS Submission Gateway")]
struct Cli {
    #[command(flatten)]
    common: fts_config::CommonOpts,

    #[command(flatten)]
    bus: fts_config::BusOpts,

    /// Bind to this address (default localhost:42010).
    #[arg(long = "Listen")]
    listen: Option<String>,
}

#[derive(Debug, Default, serde::Deserialize)]
struct FileConfig {
    #[serde(flatten)]
    bus: fts_config::BusFileConfig,
    #[serde(default)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = fts_config::init_logging(cli.common.log.as_deref(), cli.common.debug);

    let file: FileConfig = fts_config::load_file(cli.common.config.as_deref())?;
    let listen = cli
        .listen
        .or(file.listen)
        .unwrap_or_else(|| "localhost:42010".to_string());

    let settings = fts_config::BusSettings::resolve(&cli.bus, &file.bus);
    let client_id = format!("fts-gated-{}", fts_config::host_name());
    let bus = settings
        .connect(&client_id)
        .await
        .context("connecting to the broker")?;

    let gateway = Arc::new(Gateway::new(bus));
    let router = rpc_routes(gateway).into_router();

    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("binding {listen}"))?;
    info!(listen = %listen, "gateway listening");

    axum::serve(listener, router).await.context("rpc server")?;
    Ok(())
}

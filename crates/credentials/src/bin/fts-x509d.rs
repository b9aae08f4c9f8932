//! FTS Credential Store daemon.
//!
//! Serves the delegated-credential RPC surface: `X509.Ping`, `X509.Get`,
//! `X509.Put`, `X509.Delete`, `X509.List`.

use anyhow::{Context, Result};
use clap::Parser;
use fts_credentials::{Credential, CredentialStore, RocksCredentialStore};
use fts_rpc::{RpcError, RpcServer};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Error code for a missing delegation.
const NOT_FOUND: i64 = 404;

#[derive(Debug, Parser)]
#[command(name = "fts-x509d", about = "FTS Credential Store")]
struct Cli {
    #[command(flatten)]
    common: fts_config::CommonOpts,

    /// Bind to this address (default localhost:42011).
    #[arg(long = "Listen")]
    listen: Option<String>,

    /// Credential database path (default /var/lib/fts/x509.db).
    #[arg(long = "CredDB")]
    cred_db: Option<PathBuf>,
}

#[derive(Debug, Default, serde::Deserialize)]
struct FileConfig {
    #[serde(default)]
    listen: Option<String>,
    #[serde(default)]
    cred_db: Option<PathBuf>,
}

#[derive(Debug, serde::Serialize)]
struct PingReply {
    #[serde(rename = "Version")]
    version: String,
    #[serde(rename = "Echo")]
    echo: String,
}

fn rpc_routes(store: Arc<RocksCredentialStore>) -> RpcServer {
    let get_store = store.clone();
    let put_store = store.clone();
    let delete_store = store.clone();
    let list_store = store;

    RpcServer::new()
        .register("X509.Ping", |echo: String| async move {
            Ok::<_, RpcError>(PingReply {
                version: fts_types::VERSION.to_string(),
                echo,
            })
        })
        .register("X509.Get", move |delegation_id: String| {
            let store = get_store.clone();
            async move {
                match store.get(&delegation_id) {
                    Ok(Some(credential)) => Ok(credential),
                    Ok(None) => Err(RpcError::new(
                        NOT_FOUND,
                        format!("no credential delegated as {delegation_id}"),
                    )),
                    Err(e) => Err(RpcError::internal(e.to_string())),
                }
            }
        })
        .register("X509.Put", move |credential: Credential| {
            let store = put_store.clone();
            async move {
                if credential.delegation_id.is_empty() {
                    return Err(RpcError::invalid_params("missing delegation id"));
                }
                match store.put(&credential) {
                    Ok(stored) => {
                        info!(delegation_id = %credential.delegation_id, stored, "put credential");
                        Ok(credential.delegation_id)
                    }
                    Err(e) => Err(RpcError::internal(e.to_string())),
                }
            }
        })
        .register("X509.Delete", move |delegation_id: String| {
            let store = delete_store.clone();
            async move {
                store
                    .delete(&delegation_id)
                    .map_err(|e| RpcError::internal(e.to_string()))?;
                info!(delegation_id = %delegation_id, "deleted credential");
                Ok(delegation_id)
            }
        })
        .register("X509.List", move |_: serde_json::Value| {
            let store = list_store.clone();
            async move {
                store
                    .list()
                    .map_err(|e| RpcError::internal(e.to_string()))
            }
        })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = fts_config::init_logging(cli.common.log.as_deref(), cli.common.debug);

    let file: FileConfig = fts_config::load_file(cli.common.config.as_deref())?;
    let listen = cli
        .listen
        .or(file.listen)
        .unwrap_or_else(|| "localhost:42011".to_string());
    let cred_db = cli
        .cred_db
        .or(file.cred_db)
        .unwrap_or_else(|| PathBuf::from("/var/lib/fts/x509.db"));

    let store = Arc::new(
        RocksCredentialStore::open(&cred_db)
            .with_context(|| format!("opening credential db at {}", cred_db.display()))?,
    );

    let router = rpc_routes(store).into_router();
    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("binding {listen}"))?;
    info!(listen = %listen, "credential store listening");

    axum::serve(listener, router).await.context("rpc server")?;
    Ok(())
}

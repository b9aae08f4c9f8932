//! Spawning the url-copy child.

use crate::WorkerContext;
use fts_credentials::Credential;
use fts_rpc::RpcClient;
use fts_types::Batch;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Errors preparing or spawning a copy. All of them convert into a
/// synthetic FAILED batch with scope AGENT.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("could not fetch the credential for {delegation_id}: {reason}")]
    Credential {
        delegation_id: String,
        reason: String,
    },

    #[error("could not write the proxy file: {0}")]
    Proxy(std::io::Error),

    #[error("failed to serialize the task: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("could not create task file: {0}")]
    TaskFile(std::io::Error),

    #[error("failed to run the command: {0}")]
    Spawn(std::io::Error),
}

/// Path of the proxy file for a delegation.
pub fn proxy_path(delegation_id: &str) -> PathBuf {
    PathBuf::from(format!("/tmp/proxy_{delegation_id}.pem"))
}

/// Write the proxy atomically with owner-only permissions: the content
/// lands in a staging file first, gets its mode fixed, and is renamed into
/// place.
fn write_proxy(path: &Path, pem: &str) -> Result<(), SpawnError> {
    let staging = path.with_file_name(format!(
        ".{}.{}",
        path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default(),
        Uuid::new_v4()
    ));
    fs::write(&staging, pem).map_err(SpawnError::Proxy)?;
    fs::set_permissions(&staging, fs::Permissions::from_mode(0o600))
        .map_err(SpawnError::Proxy)?;
    fs::rename(&staging, path).map_err(SpawnError::Proxy)?;
    Ok(())
}

fn write_task_file(batch: &Batch) -> Result<PathBuf, SpawnError> {
    let path = PathBuf::from("/tmp").join(Uuid::new_v4().to_string());
    let payload = serde_json::to_vec(batch)?;
    fs::write(&path, payload).map_err(SpawnError::TaskFile)?;
    Ok(path)
}

async fn fetch_pem(context: &WorkerContext, delegation_id: &str) -> Result<String, SpawnError> {
    let Some(x509d) = &context.params.x509d else {
        // No credential store configured: the copy runs uncredentialed.
        return Ok(String::new());
    };
    let client = RpcClient::new(x509d);
    let credential: Credential = client
        .call("X509.Get", &delegation_id)
        .await
        .map_err(|e| SpawnError::Credential {
            delegation_id: delegation_id.to_string(),
            reason: e.to_string(),
        })?;
    Ok(credential.pem)
}

/// Materialize the credential and task files and spawn url-copy. Returns
/// the child pid.
pub async fn spawn_copy(context: &WorkerContext, batch: &Batch) -> Result<i32, SpawnError> {
    let pem = fetch_pem(context, &batch.delegation_id).await?;
    let proxy = proxy_path(&batch.delegation_id);
    write_proxy(&proxy, &pem)?;

    let task_file = write_task_file(batch)?;
    let log_level = if context.params.debug { "debug" } else { "info" };

    let mut command = Command::new(&context.params.url_copy_bin);
    command
        .arg("--LogLevel")
        .arg(log_level)
        .arg("--DirQ")
        .arg(&context.params.dirq_base)
        .arg("--LogDir")
        .arg(&context.params.transfers_log_dir)
        .arg("--Proxy")
        .arg(&proxy)
        .arg(&task_file)
        .current_dir("/tmp")
        .stdin(Stdio::null())
        // The child leads its own process group so a kill reaches the whole
        // subtree.
        .process_group(0);

    debug!(command = ?command, "spawning");
    match command.spawn() {
        Ok(child) => Ok(child.id() as i32),
        Err(e) => {
            let _ = fs::remove_file(&task_file);
            Err(SpawnError::Spawn(e))
        }
    }
}

//! PID registry and child supervision.
//!
//! Every spawned url-copy is persisted as `pid -> serialized batch` in an
//! embedded database and watched by a blocking task sitting in `waitpid`.
//! The watcher is the only `waitpid` caller for its pid; when the child
//! goes away — normal exit, signal, or `ECHILD` for a process that died
//! while the worker was down — it flips the pid's exit notification and
//! emits a [`Gone`] event, and the reaper drops the registry entry. The
//! kill path waits on that notification rather than reaping on its own.
//!
//! Persistence is what makes worker restarts safe: on startup every stored
//! pid gets a fresh watcher, and pids whose process died while the worker
//! was down resolve immediately through `ECHILD`.

use crate::WorkerError;
use fts_types::{Batch, Kill};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Default grace period between SIGTERM and SIGKILL.
pub const KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// A child that is no longer running.
#[derive(Debug)]
pub struct Gone {
    pub pid: i32,
    /// Exit description for normal terminations.
    pub status: Option<String>,
    /// Errno description when the wait itself failed (e.g. ECHILD).
    pub error: Option<String>,
}

/// Watches url-copy processes and keeps the pid registry.
pub struct Supervisor {
    db: rocksdb::DB,
    timeout: Duration,
    gone_tx: mpsc::Sender<Gone>,
    gone_rx: Mutex<Option<mpsc::Receiver<Gone>>>,
    /// Per-pid exit notification, flipped to `true` by the watcher when the
    /// process goes away. The watcher is the only `waitpid` caller for a
    /// pid; `kill` waits on this instead of reaping on its own.
    exits: Mutex<HashMap<i32, watch::Receiver<bool>>>,
}

impl Supervisor {
    /// Open the registry and spawn a watcher for every persisted pid.
    pub fn open<P: AsRef<Path>>(path: P, timeout: Duration) -> Result<Self, WorkerError> {
        let mut opts = rocksdb::Options::default();
        opts.create_if_missing(true);
        let db = rocksdb::DB::open(&opts, path)
            .map_err(|e| WorkerError::PidDb(e.to_string()))?;
        let (gone_tx, gone_rx) = mpsc::channel(16);
        let supervisor = Self {
            db,
            timeout,
            gone_tx,
            gone_rx: Mutex::new(Some(gone_rx)),
            exits: Mutex::new(HashMap::new()),
        };
        supervisor.recover()?;
        Ok(supervisor)
    }

    /// Spawn watchers for every pid found in the registry. Processes that
    /// died while the worker was down resolve through ECHILD and are
    /// reaped normally.
    fn recover(&self) -> Result<(), WorkerError> {
        for item in self.db.iterator(rocksdb::IteratorMode::Start) {
            let (key, _) = item.map_err(|e| WorkerError::PidDb(e.to_string()))?;
            match std::str::from_utf8(&key).ok().and_then(|k| k.parse().ok()) {
                Some(pid) => {
                    info!(pid, "recovered pid from the registry");
                    self.spawn_watcher(pid);
                }
                None => warn!("failed to recover an entry from the pid database"),
            }
        }
        Ok(())
    }

    /// Persist `pid -> batch` and start watching the process.
    pub fn register(&self, batch: &Batch, pid: i32) -> Result<(), WorkerError> {
        let payload =
            serde_json::to_vec(batch).map_err(|e| WorkerError::PidDb(e.to_string()))?;
        debug!(pid, batch = %batch.id(), "storing batch");
        self.db
            .put(pid.to_string().as_bytes(), payload)
            .map_err(|e| WorkerError::PidDb(e.to_string()))?;
        self.spawn_watcher(pid);
        Ok(())
    }

    /// Blocks in `waitpid` until the process goes away, then reports it.
    /// The watcher owns the one and only `waitpid` on its pid; anyone else
    /// interested in the exit listens on the `exits` notification.
    fn spawn_watcher(&self, pid: i32) {
        let (exit_tx, exit_rx) = watch::channel(false);
        self.exits.lock().unwrap().insert(pid, exit_rx);

        let gone_tx = self.gone_tx.clone();
        tokio::task::spawn_blocking(move || {
            info!(pid, "watching");
            let gone = loop {
                match waitpid(Pid::from_raw(pid), None) {
                    Ok(status) => {
                        break Gone {
                            pid,
                            status: Some(format!("{status:?}")),
                            error: None,
                        }
                    }
                    Err(Errno::EINTR) => continue,
                    Err(errno) => {
                        break Gone {
                            pid,
                            status: None,
                            error: Some(errno.desc().to_string()),
                        }
                    }
                }
            };
            info!(pid, "watcher done");
            let _ = exit_tx.send(true);
            let _ = gone_tx.blocking_send(gone);
        });
    }

    /// Consume [`Gone`] events and drop registry entries. Terminates when
    /// every watcher and the supervisor handle are gone.
    pub async fn run_reaper(&self) {
        let mut gone_rx = self
            .gone_rx
            .lock()
            .unwrap()
            .take()
            .expect("reaper started twice");
        info!("supervisor started");
        while let Some(gone) = gone_rx.recv().await {
            match &gone.error {
                None => info!(pid = gone.pid, status = ?gone.status, "process finished"),
                Some(e) => warn!(pid = gone.pid, error = %e, "process gone"),
            }
            if let Err(e) = self.db.delete(gone.pid.to_string().as_bytes()) {
                error!(pid = gone.pid, error = %e, "failed to delete pid from the database");
            }
            self.exits.lock().unwrap().remove(&gone.pid);
        }
        info!("supervisor finished");
    }

    /// Graceful then forceful termination: SIGTERM, wait up to the
    /// configured timeout for the pid's watcher to report the exit, then
    /// SIGKILL and trust the reaper to clean up. The watcher keeps the
    /// only `waitpid` on the pid; this method never reaps.
    pub async fn kill(&self, pid: i32) {
        info!(pid, "sending SIGTERM");
        if let Err(e) = signal::kill(Pid::from_raw(pid), Signal::SIGTERM) {
            warn!(pid, error = %e, "failed to signal pid");
        }

        let exit = self.exits.lock().unwrap().get(&pid).cloned();
        let Some(mut exit) = exit else {
            // Not a supervised pid (or already reaped): nothing to wait on.
            debug!(pid, "no watcher for pid, not waiting");
            return;
        };

        match tokio::time::timeout(self.timeout, exit.wait_for(|exited| *exited)).await {
            Ok(Ok(_)) => {}
            Ok(Err(_)) => warn!(pid, "watcher went away without reporting an exit"),
            Err(_) => {
                warn!(pid, "sending SIGKILL");
                let _ = signal::kill(Pid::from_raw(pid), Signal::SIGKILL);
            }
        }
    }

    /// Registered pids whose batch contains the killed transfer. A kill for
    /// an unknown transfer id resolves to an empty list.
    pub fn pids_for_kill(&self, kill: &Kill) -> Vec<i32> {
        let mut pids = Vec::new();
        for item in self.db.iterator(rocksdb::IteratorMode::Start) {
            let Ok((key, value)) = item else {
                error!("failed to iterate the pid database");
                break;
            };
            let batch: Batch = match serde_json::from_slice(&value) {
                Ok(batch) => batch,
                Err(e) => {
                    error!(error = %e, "failed to parse entry in the local db");
                    continue;
                }
            };
            let Some(pid) = std::str::from_utf8(&key).ok().and_then(|k| k.parse().ok())
            else {
                error!("failed to parse entry pid in the local db");
                continue;
            };

            let found = !kill.transfer_id.is_empty()
                && batch
                    .transfers
                    .iter()
                    .any(|t| t.transfer_id == kill.transfer_id);
            if found {
                info!(transfer_id = %kill.transfer_id, pid, "found kill target");
                pids.push(pid);
            }
        }
        pids
    }

    /// Drop a registry entry. Test hook; the reaper is the normal path.
    #[cfg(test)]
    pub(crate) fn delete(&self, pid: i32) -> Result<(), WorkerError> {
        self.db
            .delete(pid.to_string().as_bytes())
            .map_err(|e| WorkerError::PidDb(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fts_types::{BatchState, BatchType, Surl, Timestamp, Transfer, TransferParameters};
    use std::process::Command;
    use tempfile::TempDir;

    fn batch_with_transfer(transfer_id: &str) -> Batch {
        Batch {
            batch_type: BatchType::Simple,
            state: BatchState::Ready,
            delegation_id: "d".into(),
            vo: "v".into(),
            source_se: "mock://a".into(),
            dest_se: "mock://b".into(),
            activity: "default".into(),
            submitted: Timestamp::now(),
            transfers: vec![Transfer {
                transfer_id: transfer_id.into(),
                job_id: "j".into(),
                source: Surl::parse("mock://a/f").unwrap(),
                destination: Surl::parse("mock://b/f").unwrap(),
                checksum: None,
                filesize: None,
                activity: "default".into(),
                retry: 0,
                metadata: String::new(),
                params: TransferParameters::default(),
                info: None,
            }],
        }
    }

    #[tokio::test]
    async fn stored_batches_resolve_kills() {
        let dir = TempDir::new().unwrap();
        let supervisor = Supervisor::open(dir.path(), KILL_TIMEOUT).unwrap();

        let batch1 = batch_with_transfer("t-one");
        let batch2 = batch_with_transfer("t-two");
        // Persist without watchers: these pids are synthetic.
        let payload1 = serde_json::to_vec(&batch1).unwrap();
        let payload2 = serde_json::to_vec(&batch2).unwrap();
        supervisor.db.put(b"64", payload1).unwrap();
        supervisor.db.put(b"896", payload2).unwrap();

        let pids = supervisor.pids_for_kill(&Kill {
            transfer_id: "t-one".into(),
        });
        assert_eq!(pids, vec![64]);

        // Unknown transfer id is a no-op.
        let pids = supervisor.pids_for_kill(&Kill {
            transfer_id: "nope".into(),
        });
        assert!(pids.is_empty());

        // Empty transfer id never matches.
        let pids = supervisor.pids_for_kill(&Kill {
            transfer_id: String::new(),
        });
        assert!(pids.is_empty());

        supervisor.delete(64).unwrap();
        let pids = supervisor.pids_for_kill(&Kill {
            transfer_id: "t-one".into(),
        });
        assert!(pids.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn kill_terminates_and_reaps() {
        let dir = TempDir::new().unwrap();
        let supervisor =
            std::sync::Arc::new(Supervisor::open(dir.path(), KILL_TIMEOUT).unwrap());

        let child = Command::new("sleep").arg("100").spawn().unwrap();
        let pid = child.id() as i32;
        supervisor
            .register(&batch_with_transfer("t-kill"), pid)
            .unwrap();

        let reaper = {
            let supervisor = supervisor.clone();
            tokio::spawn(async move { supervisor.run_reaper().await })
        };

        tokio::time::sleep(Duration::from_millis(200)).await;
        supervisor.kill(pid).await;

        // The watcher reports the death and the reaper drops the entry.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let pids = supervisor.pids_for_kill(&Kill {
                transfer_id: "t-kill".into(),
            });
            if pids.is_empty() {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "pid entry was never reaped"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        reaper.abort();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stubborn_child_gets_sigkill() {
        let dir = TempDir::new().unwrap();
        // Short grace period to keep the test fast.
        let supervisor = std::sync::Arc::new(
            Supervisor::open(dir.path(), Duration::from_millis(300)).unwrap(),
        );

        let child = Command::new("bash")
            .args(["-c", "trap 'sleep 100' TERM; sleep 100"])
            .spawn()
            .unwrap();
        let pid = child.id() as i32;
        supervisor
            .register(&batch_with_transfer("t-stubborn"), pid)
            .unwrap();

        let reaper = {
            let supervisor = supervisor.clone();
            tokio::spawn(async move { supervisor.run_reaper().await })
        };

        // Give bash a moment to install the trap.
        tokio::time::sleep(Duration::from_millis(300)).await;
        supervisor.kill(pid).await;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if supervisor
                .pids_for_kill(&Kill {
                    transfer_id: "t-stubborn".into(),
                })
                .is_empty()
            {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "stubborn child was never reaped"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        reaper.abort();
    }
}

//! Directory-backed durable FIFO.
//!
//! Supervised copy children hand messages to the forwarder across process
//! boundaries through one of these queues. The contract:
//!
//! - [`Dirq::produce`] is an atomic append: the message is fully on disk when
//!   the call returns, and survives a crash of either side.
//! - [`Dirq::consume`] yields entries in production order (per producer),
//!   at-least-once across restarts. An entry's file is removed only after the
//!   consumer iterates *past* it, so a crash mid-handling redelivers.
//!
//! # On-disk format
//!
//! One file per message. A message is first written and fsynced under
//! `tmp/`, then renamed into the queue directory with a sortable name
//! `<nanos-since-epoch>-<counter>`. Readers ignore anything that does not
//! match that shape, so partially renamed or foreign files are harmless.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use uuid::Uuid;

/// Errors from queue operations.
#[derive(Debug, Error)]
pub enum DirqError {
    #[error("failed to create queue directory {path}: {source}")]
    Create {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write message: {0}")]
    Write(#[from] std::io::Error),

    #[error("message file {path} vanished before it could be read")]
    Vanished { path: PathBuf },
}

/// A directory-backed FIFO.
pub struct Dirq {
    dir: PathBuf,
    tmp: PathBuf,
    counter: AtomicU64,
}

impl Dirq {
    /// Open (creating if needed) the queue rooted at `dir`.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, DirqError> {
        let dir = dir.as_ref().to_path_buf();
        let tmp = dir.join("tmp");
        fs::create_dir_all(&tmp).map_err(|source| DirqError::Create {
            path: tmp.clone(),
            source,
        })?;
        Ok(Self {
            dir,
            tmp,
            counter: AtomicU64::new(0),
        })
    }

    /// Append a message. On return the message is durably on disk.
    pub fn produce(&self, message: &[u8]) -> Result<(), DirqError> {
        let staging = self.tmp.join(Uuid::new_v4().to_string());
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&staging)?;
            file.write_all(message)?;
            file.sync_all()?;
        }

        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        let name = format!("{nanos:020}-{seq:08}");
        fs::rename(&staging, self.dir.join(name))?;

        // The rename itself must survive a crash.
        if let Ok(dir) = File::open(&self.dir) {
            let _ = dir.sync_all();
        }
        Ok(())
    }

    /// Iterate over the queued messages in order. The file backing an entry
    /// is removed when the iterator moves past it, giving at-least-once
    /// delivery if the consumer dies mid-entry.
    pub fn consume(&self) -> Consumer<'_> {
        let mut entries: Vec<PathBuf> = match fs::read_dir(&self.dir) {
            Ok(rd) => rd
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_file() && is_message_name(p))
                .collect(),
            Err(_) => Vec::new(),
        };
        entries.sort();
        Consumer {
            _queue: self,
            entries: entries.into_iter(),
            handled: None,
        }
    }

    /// Queue directory path.
    pub fn path(&self) -> &Path {
        &self.dir
    }
}

fn is_message_name(path: &Path) -> bool {
    match path.file_name().and_then(|n| n.to_str()) {
        Some(name) => {
            let mut parts = name.splitn(2, '-');
            matches!(
                (parts.next(), parts.next()),
                (Some(ts), Some(seq))
                    if !ts.is_empty()
                        && ts.chars().all(|c| c.is_ascii_digit())
                        && seq.chars().all(|c| c.is_ascii_digit())
            )
        }
        None => false,
    }
}

/// Iterator over queued messages. See [`Dirq::consume`].
pub struct Consumer<'a> {
    _queue: &'a Dirq,
    entries: std::vec::IntoIter<PathBuf>,
    handled: Option<PathBuf>,
}

impl Iterator for Consumer<'_> {
    type Item = Result<Vec<u8>, DirqError>;

    fn next(&mut self) -> Option<Self::Item> {
        // The previous entry was iterated past: it is now handled.
        if let Some(prev) = self.handled.take() {
            let _ = fs::remove_file(prev);
        }

        let path = self.entries.next()?;
        match fs::read(&path) {
            Ok(message) => {
                self.handled = Some(path);
                Some(Ok(message))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Some(Err(DirqError::Vanished { path }))
            }
            Err(e) => Some(Err(DirqError::Write(e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn produce_consume_in_order() {
        let dir = TempDir::new().unwrap();
        let q = Dirq::open(dir.path()).unwrap();
        q.produce(b"one").unwrap();
        q.produce(b"two").unwrap();
        q.produce(b"three").unwrap();

        let got: Vec<Vec<u8>> = q.consume().map(|r| r.unwrap()).collect();
        assert_eq!(got, vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]);

        // Fully iterated: everything is gone.
        assert_eq!(q.consume().count(), 0);
    }

    #[test]
    fn abandoned_entry_is_redelivered() {
        let dir = TempDir::new().unwrap();
        let q = Dirq::open(dir.path()).unwrap();
        q.produce(b"one").unwrap();
        q.produce(b"two").unwrap();

        {
            let mut consumer = q.consume();
            assert_eq!(consumer.next().unwrap().unwrap(), b"one");
            assert_eq!(consumer.next().unwrap().unwrap(), b"two");
            // Dropped here: "one" was iterated past and is gone, but "two"
            // was never moved past, so it comes back.
        }

        let got: Vec<Vec<u8>> = q.consume().map(|r| r.unwrap()).collect();
        assert_eq!(got, vec![b"two".to_vec()]);
    }

    #[test]
    fn survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let q = Dirq::open(dir.path()).unwrap();
            q.produce(b"persisted").unwrap();
        }
        let q = Dirq::open(dir.path()).unwrap();
        let got: Vec<Vec<u8>> = q.consume().map(|r| r.unwrap()).collect();
        assert_eq!(got, vec![b"persisted".to_vec()]);
    }

    #[test]
    fn ignores_foreign_files() {
        let dir = TempDir::new().unwrap();
        let q = Dirq::open(dir.path()).unwrap();
        fs::write(dir.path().join("README"), b"not a message").unwrap();
        q.produce(b"real").unwrap();

        let got: Vec<Vec<u8>> = q.consume().map(|r| r.unwrap()).collect();
        assert_eq!(got, vec![b"real".to_vec()]);
        assert!(dir.path().join("README").exists());
    }

    #[test]
    fn empty_queue_yields_nothing() {
        let dir = TempDir::new().unwrap();
        let q = Dirq::open(dir.path()).unwrap();
        assert_eq!(q.consume().count(), 0);
    }
}

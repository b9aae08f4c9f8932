//! Counter backends.

use crate::ScoreboardError;
use redis::Commands;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

const FIELD_COUNTER: &str = "counter";
const FIELD_MAX: &str = "max";

/// Storage for `{count, max}` pairs. Increment semantics must be atomic with
/// respect to every other writer of the same store.
pub trait CounterBackend: Send + Sync {
    /// `(count, max)` for a key; `(0, 0)` when absent.
    fn fetch(&self, key: &str) -> Result<(i64, i64), ScoreboardError>;
    fn set_max(&self, key: &str, max: i64) -> Result<(), ScoreboardError>;
    /// Add `delta` to the counter and return the new value.
    fn incr(&self, key: &str, delta: i64) -> Result<i64, ScoreboardError>;
    /// Reset the counter to zero, keeping `max`.
    fn reset_count(&self, key: &str) -> Result<(), ScoreboardError>;
}

// ═══════════════════════════════════════════════════════════════════════
// In-memory backend (tests)
// ═══════════════════════════════════════════════════════════════════════

#[derive(Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, (i64, i64)>>,
}

impl CounterBackend for MemoryBackend {
    fn fetch(&self, key: &str) -> Result<(i64, i64), ScoreboardError> {
        Ok(*self.entries.lock().unwrap().get(key).unwrap_or(&(0, 0)))
    }

    fn set_max(&self, key: &str, max: i64) -> Result<(), ScoreboardError> {
        self.entries.lock().unwrap().entry(key.to_string()).or_default().1 = max;
        Ok(())
    }

    fn incr(&self, key: &str, delta: i64) -> Result<i64, ScoreboardError> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.entry(key.to_string()).or_default();
        entry.0 += delta;
        Ok(entry.0)
    }

    fn reset_count(&self, key: &str) -> Result<(), ScoreboardError> {
        self.entries.lock().unwrap().entry(key.to_string()).or_default().0 = 0;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Redis backend
// ═══════════════════════════════════════════════════════════════════════

/// Counters in a Redis hash per key; increments are server-side `HINCRBY`,
/// atomic across any number of scheduler hosts.
pub struct RedisBackend {
    connection: Mutex<redis::Connection>,
}

impl RedisBackend {
    pub fn open(addr: &str) -> Result<Self, ScoreboardError> {
        let client = redis::Client::open(format!("redis://{addr}/"))
            .map_err(|e| ScoreboardError::Backend(e.to_string()))?;
        let connection = client
            .get_connection()
            .map_err(|e| ScoreboardError::Backend(e.to_string()))?;
        Ok(Self {
            connection: Mutex::new(connection),
        })
    }
}

impl CounterBackend for RedisBackend {
    fn fetch(&self, key: &str) -> Result<(i64, i64), ScoreboardError> {
        let mut connection = self.connection.lock().unwrap();
        let values: Vec<Option<i64>> = connection
            .hget(key, &[FIELD_COUNTER, FIELD_MAX])
            .map_err(|e| ScoreboardError::Backend(e.to_string()))?;
        let count = values.first().copied().flatten().unwrap_or(0);
        let max = values.get(1).copied().flatten().unwrap_or(0);
        Ok((count, max))
    }

    fn set_max(&self, key: &str, max: i64) -> Result<(), ScoreboardError> {
        let mut connection = self.connection.lock().unwrap();
        connection
            .hset::<_, _, _, ()>(key, FIELD_MAX, max)
            .map_err(|e| ScoreboardError::Backend(e.to_string()))
    }

    fn incr(&self, key: &str, delta: i64) -> Result<i64, ScoreboardError> {
        let mut connection = self.connection.lock().unwrap();
        connection
            .hincr(key, FIELD_COUNTER, delta)
            .map_err(|e| ScoreboardError::Backend(e.to_string()))
    }

    fn reset_count(&self, key: &str) -> Result<(), ScoreboardError> {
        let mut connection = self.connection.lock().unwrap();
        connection
            .hset::<_, _, _, ()>(key, FIELD_COUNTER, 0)
            .map_err(|e| ScoreboardError::Backend(e.to_string()))
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Embedded RocksDB backend
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Default, Serialize, Deserialize)]
struct Entry {
    count: i64,
    max: i64,
}

/// Counters in an embedded RocksDB. Writers serialize behind a process
/// mutex; single-scheduler deployments only.
pub struct EmbeddedBackend {
    db: rocksdb::DB,
    write_lock: Mutex<()>,
}

impl EmbeddedBackend {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ScoreboardError> {
        let mut opts = rocksdb::Options::default();
        opts.create_if_missing(true);
        let db = rocksdb::DB::open(&opts, path)
            .map_err(|e| ScoreboardError::Backend(e.to_string()))?;
        Ok(Self {
            db,
            write_lock: Mutex::new(()),
        })
    }

    fn read(&self, key: &str) -> Result<Entry, ScoreboardError> {
        let raw = self
            .db
            .get(key.as_bytes())
            .map_err(|e| ScoreboardError::Backend(e.to_string()))?;
        match raw {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| ScoreboardError::Backend(e.to_string())),
            None => Ok(Entry::default()),
        }
    }

    fn write(&self, key: &str, entry: &Entry) -> Result<(), ScoreboardError> {
        let bytes =
            serde_json::to_vec(entry).map_err(|e| ScoreboardError::Backend(e.to_string()))?;
        self.db
            .put(key.as_bytes(), bytes)
            .map_err(|e| ScoreboardError::Backend(e.to_string()))
    }
}

impl CounterBackend for EmbeddedBackend {
    fn fetch(&self, key: &str) -> Result<(i64, i64), ScoreboardError> {
        let entry = self.read(key)?;
        Ok((entry.count, entry.max))
    }

    fn set_max(&self, key: &str, max: i64) -> Result<(), ScoreboardError> {
        let _guard = self.write_lock.lock().unwrap();
        let mut entry = self.read(key)?;
        entry.max = max;
        self.write(key, &entry)
    }

    fn incr(&self, key: &str, delta: i64) -> Result<i64, ScoreboardError> {
        let _guard = self.write_lock.lock().unwrap();
        let mut entry = self.read(key)?;
        entry.count += delta;
        self.write(key, &entry)?;
        Ok(entry.count)
    }

    fn reset_count(&self, key: &str) -> Result<(), ScoreboardError> {
        let _guard = self.write_lock.lock().unwrap();
        let mut entry = self.read(key)?;
        entry.count = 0;
        self.write(key, &entry)
    }
}

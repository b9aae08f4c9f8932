//! Concurrency-slot accounting.
//!
//! The scoreboard keeps `{count, max}` pairs keyed by storage name or by a
//! `source#dest` link, and answers the echelon's slot-gating questions:
//!
//! - depth 0 (root): always open,
//! - depth 1 (destination): `count < max` for the destination,
//! - depth 2 and 3 (vo, activity): no caps, always open,
//! - depth 4 (full route): both the source and the `source#dest` link must
//!   be under their caps.
//!
//! A key with no configured `max` is materialized with [`DEFAULT_SLOTS`] on
//! first read. `consume_slot` increments three counters (source, dest,
//! link); `release_slot` decrements them, clamping at zero — a negative
//! counter only appears after crash-recovery drift and is logged.
//!
//! Increments must be atomic against concurrent readers of the same backing
//! store. The Redis backend uses server-side `HINCRBY`; the embedded
//! RocksDB backend serializes writers behind a process-local mutex and is
//! only correct with a single scheduler process, which the exclusive
//! submissions queue already enforces.

mod backend;

pub use backend::{CounterBackend, EmbeddedBackend, MemoryBackend, RedisBackend};

use fts_echelon::{InfoProvider, ProviderError};
use thiserror::Error;
use tracing::{debug, warn};

/// Number of parallel batches allowed by default on a storage or link.
pub const DEFAULT_SLOTS: i64 = 2;

/// Separator joining scoreboard keys together.
pub const KEY_SEPARATOR: char = '#';

/// Errors from scoreboard operations.
#[derive(Debug, Error)]
pub enum ScoreboardError {
    #[error("backend: {0}")]
    Backend(String),
}

/// Slot accounting over a counter backend.
pub struct Scoreboard<B> {
    backend: B,
}

impl<B: CounterBackend> Scoreboard<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    fn link_key(source: &str, dest: &str) -> String {
        format!("{source}{KEY_SEPARATOR}{dest}")
    }

    /// `count < max` for one key, materializing a default `max` on first
    /// contact.
    fn available(&self, key: &str) -> Result<bool, ScoreboardError> {
        let (count, max) = self.backend.fetch(key)?;
        if max == 0 {
            debug!(key, "no entry, assuming there are available slots");
            self.backend.set_max(key, DEFAULT_SLOTS)?;
            return Ok(true);
        }
        debug!(key, slots = max, count, "available slots");
        Ok(count < max)
    }

    /// Whether a new batch may run for the given partial route
    /// (`[dest, vo, activity, source]` order).
    pub fn slots_available(&self, route: &[String]) -> Result<bool, ScoreboardError> {
        match route.len() {
            // Root: the instance as a whole has no cap.
            0 => Ok(true),
            // Destination storage.
            1 => self.available(&route[0]),
            // No caps per VO nor per activity.
            2 | 3 => Ok(true),
            // Full route: the source and the link both gate.
            _ => {
                let source = &route[3];
                let dest = &route[0];
                Ok(self.available(source)?
                    && self.available(&Self::link_key(source, dest))?)
            }
        }
    }

    /// Account one running batch: increments source, destination and link.
    pub fn consume(&self, source: &str, dest: &str) -> Result<(), ScoreboardError> {
        for key in [source, dest, &Self::link_key(source, dest) as &str] {
            let count = self.backend.incr(key, 1)?;
            debug!(key, count, "increment active count");
        }
        Ok(())
    }

    /// Release one running batch: decrements source, destination and link,
    /// clamping at zero.
    pub fn release(&self, source: &str, dest: &str) -> Result<(), ScoreboardError> {
        for key in [source, dest, &Self::link_key(source, dest) as &str] {
            let count = self.backend.incr(key, -1)?;
            if count < 0 {
                warn!(key, count, "active counter below zero, resetting");
                self.backend.reset_count(key)?;
            } else {
                debug!(key, count, "decrement active count");
            }
        }
        Ok(())
    }

    /// Configure the cap for a storage or link key.
    pub fn set_max(&self, key: &str, max: i64) -> Result<(), ScoreboardError> {
        self.backend.set_max(key, max)
    }

    /// Current counter for a key. Test and operations hook.
    pub fn count(&self, key: &str) -> Result<i64, ScoreboardError> {
        Ok(self.backend.fetch(key)?.0)
    }
}

impl<B: CounterBackend> InfoProvider for Scoreboard<B> {
    fn weight(&self, _route: &[String]) -> f32 {
        // Flat policy; share weights come from configuration in a future
        // schema.
        1.0
    }

    fn slots_available(&self, route: &[String]) -> Result<bool, ProviderError> {
        Scoreboard::slots_available(self, route).map_err(Into::into)
    }

    fn consume_slot(&self, route: &[String]) -> Result<(), ProviderError> {
        if route.len() < 4 {
            return Ok(());
        }
        self.consume(&route[3], &route[0]).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn board() -> Scoreboard<MemoryBackend> {
        Scoreboard::new(MemoryBackend::default())
    }

    fn route(dest: &str, source: &str) -> Vec<String> {
        vec![
            dest.to_string(),
            "vo".to_string(),
            "default".to_string(),
            source.to_string(),
        ]
    }

    #[test]
    fn root_vo_activity_depths_are_uncapped() {
        let b = board();
        assert!(b.slots_available(&[]).unwrap());
        assert!(b.slots_available(&route("d", "s")[..2]).unwrap());
        assert!(b.slots_available(&route("d", "s")[..3]).unwrap());
    }

    #[test]
    fn unknown_key_materializes_default_max() {
        let b = board();
        assert!(b.slots_available(&route("d", "s")[..1]).unwrap());
        // The default cap is now in place and visible.
        for _ in 0..DEFAULT_SLOTS {
            b.consume("s", "d").unwrap();
        }
        assert!(!b.slots_available(&route("d", "s")[..1]).unwrap());
    }

    #[test]
    fn full_route_gates_on_source_and_link() {
        let b = board();
        b.set_max("s", 1).unwrap();
        b.set_max("s#d", 5).unwrap();
        b.set_max("d", 5).unwrap();

        assert!(b.slots_available(&route("d", "s")).unwrap());
        b.consume("s", "d").unwrap();
        // Source is saturated even though the link is not.
        assert!(!b.slots_available(&route("d", "s")).unwrap());

        b.release("s", "d").unwrap();
        assert!(b.slots_available(&route("d", "s")).unwrap());
    }

    #[test]
    fn link_cap_gates_independently() {
        let b = board();
        b.set_max("s", 5).unwrap();
        b.set_max("d", 5).unwrap();
        b.set_max("s#d", 1).unwrap();

        b.consume("s", "d").unwrap();
        assert!(!b.slots_available(&route("d", "s")).unwrap());
    }

    #[test]
    fn consume_release_round_trips_to_zero() {
        let b = board();
        for _ in 0..3 {
            b.consume("s", "d").unwrap();
        }
        for _ in 0..3 {
            b.release("s", "d").unwrap();
        }
        assert_eq!(b.count("s").unwrap(), 0);
        assert_eq!(b.count("d").unwrap(), 0);
        assert_eq!(b.count("s#d").unwrap(), 0);
    }

    #[test]
    fn release_clamps_at_zero() {
        let b = board();
        b.release("s", "d").unwrap();
        assert_eq!(b.count("s").unwrap(), 0);
        assert_eq!(b.count("s#d").unwrap(), 0);
        // A later consume still counts from zero, not minus one.
        b.consume("s", "d").unwrap();
        assert_eq!(b.count("s").unwrap(), 1);
    }

    #[test]
    fn provider_consume_uses_full_route() {
        let b = board();
        InfoProvider::consume_slot(&b, &route("d", "s")).unwrap();
        assert_eq!(b.count("s").unwrap(), 1);
        assert_eq!(b.count("d").unwrap(), 1);
        assert_eq!(b.count("s#d").unwrap(), 1);
    }
}

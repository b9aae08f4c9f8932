//! Persistent hierarchical fair-share queue.
//!
//! The echelon is an N-ary tree whose path from root to leaf is the
//! scheduling route — for batches, `[dest_se, vo, activity, source_se]`.
//! Leaves hold FIFO queues. Dequeuing walks the tree depth-first, picking
//! children by weighted round-robin among those that still have concurrency
//! slots available, so the scheduler is fair across destinations, VOs,
//! activities and sources while respecting hard caps.
//!
//! Policy is injected through [`InfoProvider`]; persistence through
//! [`TreeStore`] (RocksDB, Redis, or in-memory for tests). The echelon never
//! mutates slot counters itself — `consume_slot` lives on the provider and
//! is invoked by the scheduler after a successful dequeue, which keeps
//! ownership acyclic.
//!
//! # Concurrency
//!
//! A single scheduler process owns the tree; within it, the structure is
//! internally synchronized and safe to share between the consumer and
//! producer loops. All operations are synchronous blocking I/O — callers in
//! async contexts should use `spawn_blocking`.

mod node;
mod provider;
mod store;

pub use provider::{InfoProvider, ProviderError};
pub use store::{MemoryStore, RedisStore, RocksStore, StoreError, TreeStore};

use node::{DequeueOutcome, Node};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info};

/// Items the echelon can schedule.
pub trait Schedulable: Serialize + DeserializeOwned + Clone + Send + 'static {
    /// Stable identifier, used for logging.
    fn id(&self) -> String;
    /// The scheduling route, root to leaf. Must have the same length for
    /// every item in one echelon.
    fn route(&self) -> Vec<String>;
}

/// Errors from echelon operations.
#[derive(Debug, Error)]
pub enum EchelonError {
    /// The tree holds no items at all.
    #[error("echelon is empty")]
    Empty,

    /// Items exist but every candidate branch is blocked on slots.
    #[error("not enough slots available")]
    NotEnoughSlots,

    #[error("backing store: {0}")]
    Storage(#[from] StoreError),

    #[error("info provider: {0}")]
    Provider(#[from] ProviderError),

    #[error("serializing queue contents: {0}")]
    Codec(#[from] serde_json::Error),
}

/// The fair-share queue. See the crate docs.
pub struct Echelon<T, P, S> {
    root: Mutex<Node<T>>,
    provider: Arc<P>,
    store: S,
    _marker: PhantomData<T>,
}

impl<T, P, S> Echelon<T, P, S>
where
    T: Schedulable,
    P: InfoProvider,
    S: TreeStore,
{
    /// Open the echelon, rehydrating any persisted state from the store.
    pub fn open(store: S, provider: Arc<P>) -> Result<Self, EchelonError> {
        let echelon = Self {
            root: Mutex::new(Node::interior()),
            provider,
            store,
            _marker: PhantomData,
        };
        echelon.restore()?;
        Ok(echelon)
    }

    /// Append an item to its leaf FIFO. The leaf is durably persisted before
    /// the in-memory structure is updated, so a crash after `enqueue`
    /// returns cannot lose the item.
    pub fn enqueue(&self, item: T) -> Result<(), EchelonError> {
        let route = item.route();
        let mut root = self.root.lock().unwrap();

        let mut persisted: Vec<&T> = root.leaf_items(&route);
        persisted.push(&item);
        let value = serde_json::to_vec(&persisted)?;
        self.store.put(&store::leaf_key(&route), &value)?;

        root.push(&route, item);
        Ok(())
    }

    /// Remove and return the next item according to weighted round-robin
    /// with slot gating.
    ///
    /// Returns [`EchelonError::Empty`] when the tree holds nothing, and
    /// [`EchelonError::NotEnoughSlots`] when items exist but every candidate
    /// branch is gated.
    pub fn dequeue(&self) -> Result<T, EchelonError> {
        let mut root = self.root.lock().unwrap();
        let mut path = Vec::new();
        let outcome = root.dequeue(&mut path, self.provider.as_ref())?;

        let (item, leaf_route) = match outcome {
            DequeueOutcome::Item { item, leaf_route } => (item, leaf_route),
            DequeueOutcome::Empty => return Err(EchelonError::Empty),
            DequeueOutcome::NoSlots => return Err(EchelonError::NotEnoughSlots),
        };

        // Persist the shrunk leaf; an empty leaf disappears from the store.
        let remaining = root.leaf_items(&leaf_route);
        let key = store::leaf_key(&leaf_route);
        if remaining.is_empty() {
            self.store.delete(&key)?;
            root.prune(&leaf_route);
        } else {
            let value = serde_json::to_vec(&remaining)?;
            self.store.put(&key, &value)?;
        }

        debug!(item = %item.id(), "dequeued");
        Ok(item)
    }

    /// Rebuild the in-memory tree from the backing store.
    fn restore(&self) -> Result<(), EchelonError> {
        let mut root = self.root.lock().unwrap();
        *root = Node::interior();
        let mut leaves = 0usize;
        for (key, value) in self.store.scan()? {
            let route = store::parse_leaf_key(&key);
            if route.is_empty() {
                continue;
            }
            let items: Vec<T> = serde_json::from_slice(&value)?;
            for item in items {
                root.push(&route, item);
            }
            leaves += 1;
        }
        if leaves > 0 {
            info!(leaves, items = root.len(), "restored echelon state");
        }
        Ok(())
    }

    /// Flush the backing store.
    pub fn close(&self) -> Result<(), EchelonError> {
        self.store.flush()?;
        Ok(())
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.root.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::collections::HashSet;
    use std::sync::Mutex as StdMutex;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Job {
        name: String,
        route: Vec<String>,
    }

    impl Job {
        fn new(name: &str, dest: &str, vo: &str, activity: &str, source: &str) -> Self {
            Self {
                name: name.into(),
                route: vec![dest.into(), vo.into(), activity.into(), source.into()],
            }
        }
    }

    impl Schedulable for Job {
        fn id(&self) -> String {
            self.name.clone()
        }
        fn route(&self) -> Vec<String> {
            self.route.clone()
        }
    }

    /// Provider with per-segment weights and a blockable segment set.
    #[derive(Default)]
    struct TestProvider {
        weights: Vec<(String, f32)>,
        blocked: StdMutex<HashSet<String>>,
    }

    impl TestProvider {
        fn block(&self, segment: &str) {
            self.blocked.lock().unwrap().insert(segment.to_string());
        }
        fn unblock(&self, segment: &str) {
            self.blocked.lock().unwrap().remove(segment);
        }
    }

    impl InfoProvider for TestProvider {
        fn weight(&self, route: &[String]) -> f32 {
            let Some(last) = route.last() else {
                return 1.0;
            };
            self.weights
                .iter()
                .find(|(seg, _)| seg == last)
                .map(|(_, w)| *w)
                .unwrap_or(1.0)
        }

        fn slots_available(&self, route: &[String]) -> Result<bool, ProviderError> {
            let blocked = self.blocked.lock().unwrap();
            Ok(!route.iter().any(|seg| blocked.contains(seg)))
        }

        fn consume_slot(&self, _route: &[String]) -> Result<(), ProviderError> {
            Ok(())
        }
    }

    fn echelon(
        provider: Arc<TestProvider>,
    ) -> Echelon<Job, TestProvider, MemoryStore> {
        Echelon::open(MemoryStore::default(), provider).unwrap()
    }

    #[test]
    fn empty_tree_reports_empty() {
        let e = echelon(Arc::new(TestProvider::default()));
        assert!(matches!(e.dequeue(), Err(EchelonError::Empty)));
    }

    #[test]
    fn fifo_within_a_leaf() {
        let e = echelon(Arc::new(TestProvider::default()));
        e.enqueue(Job::new("first", "d1", "vo", "a", "s1")).unwrap();
        e.enqueue(Job::new("second", "d1", "vo", "a", "s1")).unwrap();
        e.enqueue(Job::new("third", "d1", "vo", "a", "s1")).unwrap();

        assert_eq!(e.dequeue().unwrap().name, "first");
        assert_eq!(e.dequeue().unwrap().name, "second");
        assert_eq!(e.dequeue().unwrap().name, "third");
        assert!(matches!(e.dequeue(), Err(EchelonError::Empty)));
    }

    #[test]
    fn equal_weights_alternate_between_destinations() {
        let e = echelon(Arc::new(TestProvider::default()));
        e.enqueue(Job::new("a1", "d1", "vo", "act", "s1")).unwrap();
        e.enqueue(Job::new("a2", "d1", "vo", "act", "s1")).unwrap();
        e.enqueue(Job::new("b1", "d2", "vo", "act", "s1")).unwrap();
        e.enqueue(Job::new("b2", "d2", "vo", "act", "s1")).unwrap();

        let first = e.dequeue().unwrap();
        let second = e.dequeue().unwrap();
        // One from each destination, not both from the same.
        assert_ne!(first.route[0], second.route[0]);
    }

    #[test]
    fn weighted_destination_served_more_often() {
        let provider = Arc::new(TestProvider {
            weights: vec![("heavy".into(), 2.0), ("light".into(), 1.0)],
            blocked: StdMutex::default(),
        });
        let e = echelon(provider);
        for i in 0..6 {
            e.enqueue(Job::new(&format!("h{i}"), "heavy", "vo", "a", "s"))
                .unwrap();
            e.enqueue(Job::new(&format!("l{i}"), "light", "vo", "a", "s"))
                .unwrap();
        }

        let mut heavy = 0;
        for _ in 0..6 {
            if e.dequeue().unwrap().route[0] == "heavy" {
                heavy += 1;
            }
        }
        assert_eq!(heavy, 4, "2:1 weights should serve heavy twice as often");
    }

    #[test]
    fn blocked_branch_is_skipped() {
        let provider = Arc::new(TestProvider::default());
        let e = echelon(provider.clone());
        e.enqueue(Job::new("a", "d1", "vo", "act", "s1")).unwrap();
        e.enqueue(Job::new("b", "d2", "vo", "act", "s1")).unwrap();

        provider.block("d1");
        assert_eq!(e.dequeue().unwrap().name, "b");
        assert!(matches!(e.dequeue(), Err(EchelonError::NotEnoughSlots)));

        provider.unblock("d1");
        assert_eq!(e.dequeue().unwrap().name, "a");
    }

    #[test]
    fn all_blocked_is_no_slots_not_empty() {
        let provider = Arc::new(TestProvider::default());
        let e = echelon(provider.clone());
        e.enqueue(Job::new("a", "d1", "vo", "act", "s1")).unwrap();
        provider.block("s1");
        assert!(matches!(e.dequeue(), Err(EchelonError::NotEnoughSlots)));
    }

    #[test]
    fn deep_block_does_not_starve_siblings() {
        let provider = Arc::new(TestProvider::default());
        let e = echelon(provider.clone());
        // Same destination, two sources; one source blocked.
        e.enqueue(Job::new("a", "d1", "vo", "act", "s1")).unwrap();
        e.enqueue(Job::new("b", "d1", "vo", "act", "s2")).unwrap();
        provider.block("s1");

        assert_eq!(e.dequeue().unwrap().name, "b");
        assert!(matches!(e.dequeue(), Err(EchelonError::NotEnoughSlots)));
    }

    #[test]
    fn state_survives_reopen() {
        let store = MemoryStore::default();
        let provider = Arc::new(TestProvider::default());
        {
            let e = Echelon::open(store.clone(), provider.clone()).unwrap();
            e.enqueue(Job::new("one", "d1", "vo", "a", "s1")).unwrap();
            e.enqueue(Job::new("two", "d1", "vo", "a", "s1")).unwrap();
            e.enqueue(Job::new("other", "d2", "vo", "a", "s2")).unwrap();
            e.close().unwrap();
        }

        let e: Echelon<Job, _, _> = Echelon::open(store, provider).unwrap();
        assert_eq!(e.len(), 3);
        let mut names = Vec::new();
        while let Ok(job) = e.dequeue() {
            names.push(job.name);
        }
        assert_eq!(names.len(), 3);
        // FIFO preserved inside the restored leaf.
        let one = names.iter().position(|n| n == "one").unwrap();
        let two = names.iter().position(|n| n == "two").unwrap();
        assert!(one < two);
    }

    #[test]
    fn dequeued_items_do_not_come_back_after_reopen() {
        let store = MemoryStore::default();
        let provider = Arc::new(TestProvider::default());
        {
            let e = Echelon::open(store.clone(), provider.clone()).unwrap();
            e.enqueue(Job::new("gone", "d1", "vo", "a", "s1")).unwrap();
            e.enqueue(Job::new("kept", "d1", "vo", "a", "s1")).unwrap();
            assert_eq!(e.dequeue().unwrap().name, "gone");
        }

        let e: Echelon<Job, _, _> = Echelon::open(store, provider).unwrap();
        assert_eq!(e.len(), 1);
        assert_eq!(e.dequeue().unwrap().name, "kept");
    }
}

//! Scheduler daemon internals.
//!
//! One scheduler process runs two cooperative loops over shared state:
//!
//! - the **consumer** drains the submissions queue, feeding SUBMITTED
//!   batches into the echelon and releasing scoreboard slots on DONE;
//! - the **producer** ticks every `tick` seconds, draining the echelon:
//!   each dequeued batch is marked READY, its slots are consumed, and it is
//!   published persistently for the workers.
//!
//! If consuming the slot or publishing fails, the batch is re-enqueued; if
//! the re-enqueue itself fails the daemon terminates — losing a dequeued
//! batch is the one thing the scheduler must never do. Exclusive
//! consumption of the submissions queue is what prevents a second scheduler
//! from corrupting the echelon store.

use fts_bus::{AckMode, Bus, BusError, PublishProps, Source, EXCHANGE_TRANSITION, QUEUE_SUBMISSIONS};
use fts_echelon::{Echelon, EchelonError, Schedulable, TreeStore};
use fts_scoreboard::{CounterBackend, Scoreboard};
use fts_types::{Batch, BatchState};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Default producer tick.
pub const DEFAULT_TICK: Duration = Duration::from_secs(15);

/// A batch as the echelon sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Routed(pub Batch);

impl Schedulable for Routed {
    fn id(&self) -> String {
        self.0.id()
    }

    fn route(&self) -> Vec<String> {
        self.0.route().to_vec()
    }
}

/// Errors that terminate a scheduler loop.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("bus: {0}")]
    Bus(#[from] BusError),

    #[error("echelon: {0}")]
    Echelon(#[from] EchelonError),

    #[error("scoreboard: {0}")]
    Scoreboard(#[from] fts_scoreboard::ScoreboardError),

    /// A dequeued batch could not be put back after a dispatch failure.
    /// Continuing would lose it; the process must exit and restore from the
    /// backing store.
    #[error("failed to requeue batch {batch_id} after a dispatch failure: {reason}")]
    RequeueFailed { batch_id: String, reason: String },
}

/// The scheduler: echelon + scoreboard + bus.
pub struct Scheduler<S, B>
where
    S: TreeStore + 'static,
    B: CounterBackend + 'static,
{
    echelon: Arc<Echelon<Routed, Scoreboard<B>, S>>,
    scoreboard: Arc<Scoreboard<B>>,
    bus: Arc<dyn Bus>,
    tick: Duration,
}

impl<S, B> Scheduler<S, B>
where
    S: TreeStore + 'static,
    B: CounterBackend + 'static,
{
    /// Open the scheduler over its backing stores. Restores any persisted
    /// echelon state.
    pub fn open(
        store: S,
        backend: B,
        bus: Arc<dyn Bus>,
        tick: Duration,
    ) -> Result<Self, SchedulerError> {
        let scoreboard = Arc::new(Scoreboard::new(backend));
        let echelon = Arc::new(Echelon::open(store, scoreboard.clone())?);
        Ok(Self {
            echelon,
            scoreboard,
            bus,
            tick,
        })
    }

    /// Consumer loop: SUBMITTED batches enter the echelon, DONE batches
    /// release their slots. Anything else is ignored.
    pub async fn run_consumer(&self) -> Result<(), SchedulerError> {
        let consumer_id = format!("fts-scheduler-{}", Uuid::new_v4());
        let mut subscription = self
            .bus
            .subscribe(
                Source::Queue(&QUEUE_SUBMISSIONS),
                &consumer_id,
                AckMode::Individual,
            )
            .await?;
        info!("consumer started");

        loop {
            tokio::select! {
                delivery = subscription.deliveries.recv() => {
                    let Some(delivery) = delivery else {
                        return Ok(());
                    };

                    let batch: Batch = match serde_json::from_slice(&delivery.body) {
                        Ok(batch) => batch,
                        Err(e) => {
                            error!(error = %e, "could not parse batch");
                            let _ = delivery.nack().await;
                            continue;
                        }
                    };

                    self.handle_batch(batch).await?;
                    delivery.ack().await?;
                }
                bus_error = subscription.errors.recv() => {
                    match bus_error {
                        Some(e @ BusError::ReconnectExhausted { .. }) => return Err(e.into()),
                        Some(e) => warn!(error = %e, "error from the subscription channel"),
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    async fn handle_batch(&self, batch: Batch) -> Result<(), SchedulerError> {
        let batch_id = batch.id();
        match batch.state {
            BatchState::Submitted => {
                let echelon = self.echelon.clone();
                tokio::task::spawn_blocking(move || echelon.enqueue(Routed(batch)))
                    .await
                    .expect("enqueue task panicked")?;
                info!(batch = %batch_id, "enqueued batch");
            }
            BatchState::Done => {
                let scoreboard = self.scoreboard.clone();
                let (source, dest) = (batch.source_se.clone(), batch.dest_se.clone());
                tokio::task::spawn_blocking(move || scoreboard.release(&source, &dest))
                    .await
                    .expect("release task panicked")?;
                info!(batch = %batch_id, "batch done, released slots");
            }
            other => {
                debug!(batch = %batch_id, state = other.routing_key(), "ignoring batch");
            }
        }
        Ok(())
    }

    /// Producer loop: drain the echelon every tick.
    pub async fn run_producer(&self) -> Result<(), SchedulerError> {
        info!("producer started");
        loop {
            self.drain().await?;
            tokio::time::sleep(self.tick).await;
        }
    }

    /// One producer pass: dequeue until the echelon reports empty or
    /// slot-blocked. Returns the number of batches dispatched.
    pub async fn drain(&self) -> Result<usize, SchedulerError> {
        let mut dispatched = 0;
        loop {
            let echelon = self.echelon.clone();
            let outcome = tokio::task::spawn_blocking(move || echelon.dequeue())
                .await
                .expect("dequeue task panicked");

            let routed = match outcome {
                Ok(routed) => routed,
                Err(EchelonError::Empty) => {
                    debug!("empty queue");
                    break;
                }
                Err(EchelonError::NotEnoughSlots) => {
                    info!("run out of available slots");
                    break;
                }
                Err(e) => {
                    // Transient storage/provider trouble; retry next tick.
                    error!(error = %e, "dequeue failed");
                    break;
                }
            };

            self.dispatch(routed).await?;
            dispatched += 1;
        }
        Ok(dispatched)
    }

    /// Mark READY, consume the slots, publish. Exactly one `consume` per
    /// published batch; the matching release happens when DONE comes back.
    async fn dispatch(&self, routed: Routed) -> Result<(), SchedulerError> {
        let mut batch = routed.0;
        let batch_id = batch.id();
        batch.state = BatchState::Ready;

        let result = self.consume_and_publish(&batch).await;
        if let Err(e) = result {
            warn!(batch = %batch_id, error = %e, "dispatch failed, requeueing the batch");
            let echelon = self.echelon.clone();
            let requeue = tokio::task::spawn_blocking(move || echelon.enqueue(Routed(batch)))
                .await
                .expect("requeue task panicked");
            if let Err(requeue_error) = requeue {
                return Err(SchedulerError::RequeueFailed {
                    batch_id,
                    reason: requeue_error.to_string(),
                });
            }
            return Ok(());
        }

        for transfer in &batch.transfers {
            info!(
                batch = %batch_id,
                job_id = %transfer.job_id,
                transfer_id = %transfer.transfer_id,
                "scheduled"
            );
        }
        Ok(())
    }

    async fn consume_and_publish(&self, batch: &Batch) -> Result<(), SchedulerError> {
        let payload = serde_json::to_vec(batch).map_err(EchelonError::Codec)?;

        let scoreboard = self.scoreboard.clone();
        let (source, dest) = (batch.source_se.clone(), batch.dest_se.clone());
        tokio::task::spawn_blocking(move || scoreboard.consume(&source, &dest))
            .await
            .expect("consume task panicked")?;

        self.bus
            .publish(
                &EXCHANGE_TRANSITION,
                BatchState::Ready.routing_key(),
                payload,
                PublishProps::persistent_json(),
            )
            .await?;
        Ok(())
    }

    /// Queued batches. Test and operations hook.
    pub fn backlog(&self) -> usize {
        self.echelon.len()
    }

    /// Scoreboard counter for a key. Test and operations hook.
    pub fn slot_count(&self, key: &str) -> Result<i64, SchedulerError> {
        Ok(self.scoreboard.count(key)?)
    }

    /// Configure the cap for a storage or link key.
    pub fn set_max(&self, key: &str, max: i64) -> Result<(), SchedulerError> {
        Ok(self.scoreboard.set_max(key, max)?)
    }

    /// Flush the echelon store.
    pub fn close(&self) -> Result<(), SchedulerError> {
        Ok(self.echelon.close()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fts_bus::Bus as _;
    use fts_bus_memory::MemoryBus;
    use fts_echelon::MemoryStore;
    use fts_scoreboard::MemoryBackend;
    use fts_types::{BatchType, Surl, Timestamp, Transfer, TransferParameters};

    fn simple_batch(id: &str, source: &str, dest: &str) -> Batch {
        let transfer = Transfer {
            transfer_id: id.into(),
            job_id: "j".into(),
            source: Surl::parse(&format!("{source}/f")).unwrap(),
            destination: Surl::parse(&format!("{dest}/f")).unwrap(),
            checksum: None,
            filesize: None,
            activity: "default".into(),
            retry: 0,
            metadata: String::new(),
            params: TransferParameters::default(),
            info: None,
        };
        Batch {
            batch_type: BatchType::Simple,
            state: BatchState::Submitted,
            delegation_id: "d".into(),
            vo: "v".into(),
            source_se: source.into(),
            dest_se: dest.into(),
            activity: "default".into(),
            submitted: Timestamp::now(),
            transfers: vec![transfer],
        }
    }

    async fn scheduler_with_bus() -> (
        Scheduler<MemoryStore, MemoryBackend>,
        MemoryBus,
        fts_bus::Subscription,
    ) {
        let bus = MemoryBus::new();
        let worker_sub = bus
            .subscribe(
                Source::Queue(&fts_bus::QUEUE_WORKER),
                "worker",
                AckMode::Individual,
            )
            .await
            .unwrap();
        let scheduler = Scheduler::open(
            MemoryStore::default(),
            MemoryBackend::default(),
            Arc::new(bus.clone()),
            DEFAULT_TICK,
        )
        .unwrap();
        (scheduler, bus, worker_sub)
    }

    #[tokio::test]
    async fn submitted_batch_flows_to_ready() {
        let (scheduler, _bus, mut worker) = scheduler_with_bus().await;

        scheduler
            .handle_batch(simple_batch("t1", "mock://s", "mock://d"))
            .await
            .unwrap();
        assert_eq!(scheduler.backlog(), 1);

        assert_eq!(scheduler.drain().await.unwrap(), 1);
        assert_eq!(scheduler.backlog(), 0);

        let delivery = worker.deliveries.recv().await.unwrap();
        assert_eq!(delivery.routing_key(), Some("READY"));
        let batch: Batch = serde_json::from_slice(&delivery.body).unwrap();
        assert_eq!(batch.state, BatchState::Ready);

        // One consume per published batch, at all three keys.
        assert_eq!(scheduler.slot_count("mock://s").unwrap(), 1);
        assert_eq!(scheduler.slot_count("mock://d").unwrap(), 1);
        assert_eq!(scheduler.slot_count("mock://s#mock://d").unwrap(), 1);
    }

    #[tokio::test]
    async fn done_releases_the_slots() {
        let (scheduler, _bus, _worker) = scheduler_with_bus().await;

        scheduler
            .handle_batch(simple_batch("t1", "mock://s", "mock://d"))
            .await
            .unwrap();
        scheduler.drain().await.unwrap();
        assert_eq!(scheduler.slot_count("mock://s").unwrap(), 1);

        let mut done = simple_batch("t1", "mock://s", "mock://d");
        done.state = BatchState::Done;
        scheduler.handle_batch(done).await.unwrap();

        assert_eq!(scheduler.slot_count("mock://s").unwrap(), 0);
        assert_eq!(scheduler.slot_count("mock://d").unwrap(), 0);
        assert_eq!(scheduler.slot_count("mock://s#mock://d").unwrap(), 0);
    }

    #[tokio::test]
    async fn two_destinations_share_the_first_two_dispatches() {
        let (scheduler, _bus, mut worker) = scheduler_with_bus().await;

        scheduler
            .handle_batch(simple_batch("a1", "mock://s1", "mock://d1"))
            .await
            .unwrap();
        scheduler
            .handle_batch(simple_batch("a2", "mock://s1", "mock://d1"))
            .await
            .unwrap();
        scheduler
            .handle_batch(simple_batch("b1", "mock://s2", "mock://d2"))
            .await
            .unwrap();
        scheduler
            .handle_batch(simple_batch("b2", "mock://s2", "mock://d2"))
            .await
            .unwrap();

        scheduler.drain().await.unwrap();

        let first: Batch =
            serde_json::from_slice(&worker.deliveries.recv().await.unwrap().body).unwrap();
        let second: Batch =
            serde_json::from_slice(&worker.deliveries.recv().await.unwrap().body).unwrap();
        assert_ne!(
            first.dest_se, second.dest_se,
            "weighted round-robin must interleave destinations"
        );
    }

    #[tokio::test]
    async fn source_cap_blocks_until_done() {
        let (scheduler, _bus, mut worker) = scheduler_with_bus().await;
        scheduler.set_max("mock://s", 1).unwrap();

        scheduler
            .handle_batch(simple_batch("t1", "mock://s", "mock://d1"))
            .await
            .unwrap();
        scheduler
            .handle_batch(simple_batch("t2", "mock://s", "mock://d2"))
            .await
            .unwrap();

        // First pass dispatches one batch, then runs out of source slots.
        assert_eq!(scheduler.drain().await.unwrap(), 1);
        assert_eq!(scheduler.backlog(), 1);
        let first: Batch =
            serde_json::from_slice(&worker.deliveries.recv().await.unwrap().body).unwrap();

        // Still blocked on the next pass.
        assert_eq!(scheduler.drain().await.unwrap(), 0);

        // DONE for the first batch releases the source slot.
        let mut done = first;
        done.state = BatchState::Done;
        scheduler.handle_batch(done).await.unwrap();

        assert_eq!(scheduler.drain().await.unwrap(), 1);
        assert_eq!(scheduler.backlog(), 0);
    }

    #[tokio::test]
    async fn ignores_unrelated_states() {
        let (scheduler, _bus, _worker) = scheduler_with_bus().await;
        let mut batch = simple_batch("t1", "mock://s", "mock://d");
        batch.state = BatchState::Running;
        scheduler.handle_batch(batch).await.unwrap();
        assert_eq!(scheduler.backlog(), 0);
    }
}

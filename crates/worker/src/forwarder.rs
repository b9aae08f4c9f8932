//! Forwarder subsystem: local disk queues to the bus.
//!
//! Supervised children report through three directory queues under the
//! worker's dirq base. The forwarder republishes:
//!
//! - `start/` entries as ACTIVE transitions (persistent),
//! - `end/` entries under their terminal routing key — FAILED wins over
//!   CANCELED wins over FINISHED — with the batch payload forwarded as-is
//!   (the child sets the batch state to DONE so the scheduler releases its
//!   slots),
//! - `perf/` entries onto the performance fan-out (transient).
//!
//! A publish failure stops the pass at the failing entry; the entry stays
//! in its queue and is retried on the next pass, so delivery to the bus is
//! at-least-once.

use crate::{WorkerContext, WorkerError};
use fts_bus::{PublishProps, EXCHANGE_PERFORMANCE, EXCHANGE_TRANSITION};
use fts_dirq::Dirq;
use fts_types::{Batch, BatchType, TransferState};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Sleep between passes that found nothing to forward.
const IDLE_BACKOFF: Duration = Duration::from_secs(5);

pub struct Forwarder {
    context: Arc<WorkerContext>,
    start: Dirq,
    end: Dirq,
    perf: Dirq,
}

impl Forwarder {
    /// Open the three local queues under the worker's dirq base.
    pub fn new(context: Arc<WorkerContext>) -> Result<Self, WorkerError> {
        let base = &context.params.dirq_base;
        let start = Dirq::open(base.join("start"))?;
        let end = Dirq::open(base.join("end"))?;
        let perf = Dirq::open(base.join("perf"))?;
        Ok(Self {
            context,
            start,
            end,
            perf,
        })
    }

    pub async fn run(&self) -> Result<(), WorkerError> {
        info!("forwarder started");
        loop {
            let forwarded = self.forward_pass().await?;
            if forwarded == 0 {
                tokio::time::sleep(IDLE_BACKOFF).await;
            }
        }
    }

    /// One pass over all three queues. Returns how many messages moved.
    pub async fn forward_pass(&self) -> Result<usize, WorkerError> {
        let mut forwarded = 0;
        forwarded += self.forward_start().await?;
        forwarded += self.forward_end().await?;
        forwarded += self.forward_perf().await?;
        Ok(forwarded)
    }

    async fn forward_start(&self) -> Result<usize, WorkerError> {
        let mut forwarded = 0;
        for entry in self.start.consume() {
            let message = match entry {
                Ok(message) => message,
                Err(e) => {
                    warn!(error = %e, "skipping unreadable start entry");
                    continue;
                }
            };
            if let Err(e) = self
                .context
                .bus
                .publish(
                    &EXCHANGE_TRANSITION,
                    TransferState::Active.routing_key(),
                    message,
                    PublishProps::persistent_json(),
                )
                .await
            {
                warn!(error = %e, "failed to forward start message, will retry");
                break;
            }
            debug!("forwarded start message");
            forwarded += 1;
        }
        Ok(forwarded)
    }

    async fn forward_end(&self) -> Result<usize, WorkerError> {
        let mut forwarded = 0;
        for entry in self.end.consume() {
            let message = match entry {
                Ok(message) => message,
                Err(e) => {
                    warn!(error = %e, "skipping unreadable end entry");
                    continue;
                }
            };
            // Only enough of the payload is inspected to pick the routing
            // key; the body is forwarded untouched.
            let routing_key = match serde_json::from_slice::<Batch>(&message) {
                Ok(batch) => terminal_routing_key(&batch),
                Err(e) => {
                    error!(error = %e, "unparsable end message, dropping");
                    continue;
                }
            };
            if let Err(e) = self
                .context
                .bus
                .publish(
                    &EXCHANGE_TRANSITION,
                    routing_key,
                    message,
                    PublishProps::persistent_json(),
                )
                .await
            {
                warn!(error = %e, "failed to forward end message, will retry");
                break;
            }
            debug!(routing_key, "forwarded end message");
            forwarded += 1;
        }
        Ok(forwarded)
    }

    async fn forward_perf(&self) -> Result<usize, WorkerError> {
        let mut forwarded = 0;
        for entry in self.perf.consume() {
            let message = match entry {
                Ok(message) => message,
                Err(e) => {
                    warn!(error = %e, "skipping unreadable perf entry");
                    continue;
                }
            };
            if let Err(e) = self
                .context
                .bus
                .publish(
                    &EXCHANGE_PERFORMANCE,
                    "perf",
                    message,
                    PublishProps::transient_json(),
                )
                .await
            {
                warn!(error = %e, "failed to forward performance message, will retry");
                break;
            }
            debug!("forwarded performance message");
            forwarded += 1;
        }
        Ok(forwarded)
    }
}

/// The routing key a finished batch is published under.
///
/// For most batch types failure dominates cancellation dominates success, so
/// a partially failed batch surfaces as FAILED. Multisource is the
/// exception: alternatives are expected to fail until one succeeds, so any
/// FINISHED transfer makes the whole batch FINISHED.
fn terminal_routing_key(batch: &Batch) -> &'static str {
    let states: Vec<TransferState> = batch
        .transfers
        .iter()
        .filter_map(|t| t.info.as_ref().and_then(|i| i.state))
        .collect();

    if batch.batch_type == BatchType::Multisource
        && states.contains(&TransferState::Finished)
    {
        return TransferState::Finished.routing_key();
    }

    if states.contains(&TransferState::Failed) {
        TransferState::Failed.routing_key()
    } else if states.contains(&TransferState::Canceled) {
        TransferState::Canceled.routing_key()
    } else {
        TransferState::Finished.routing_key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Supervisor, WorkerParams, KILL_TIMEOUT};
    use fts_bus::{AckMode, Bind, Bus, Queue, Source};
    use fts_bus_memory::MemoryBus;
    use fts_types::{
        BatchState, BatchType, PerfMarker, Surl, Timestamp, Transfer, TransferInfo,
        TransferParameters,
    };
    use tempfile::TempDir;

    static ACTIVE_QUEUE: Queue = Queue {
        name: "test.q.active",
        durable: false,
        exclusive_consumer: false,
        bind: Some(Bind {
            exchange: &EXCHANGE_TRANSITION,
            routing_key: "ACTIVE",
        }),
    };

    static FINISHED_QUEUE: Queue = Queue {
        name: "test.q.finished",
        durable: false,
        exclusive_consumer: false,
        bind: Some(Bind {
            exchange: &EXCHANGE_TRANSITION,
            routing_key: "FINISHED",
        }),
    };

    fn batch(states: &[TransferState]) -> Batch {
        Batch {
            batch_type: BatchType::Simple,
            state: BatchState::Done,
            delegation_id: "d".into(),
            vo: "v".into(),
            source_se: "mock://a".into(),
            dest_se: "mock://b".into(),
            activity: "default".into(),
            submitted: Timestamp::now(),
            transfers: states
                .iter()
                .enumerate()
                .map(|(i, state)| Transfer {
                    transfer_id: format!("t{i}"),
                    job_id: "j".into(),
                    source: Surl::parse("mock://a/f").unwrap(),
                    destination: Surl::parse("mock://b/f").unwrap(),
                    checksum: None,
                    filesize: None,
                    activity: "default".into(),
                    retry: 0,
                    metadata: String::new(),
                    params: TransferParameters::default(),
                    info: Some(TransferInfo {
                        state: Some(*state),
                        ..Default::default()
                    }),
                })
                .collect(),
        }
    }

    #[test]
    fn terminal_routing_prefers_failures() {
        assert_eq!(
            terminal_routing_key(&batch(&[TransferState::Finished])),
            "FINISHED"
        );
        assert_eq!(
            terminal_routing_key(&batch(&[
                TransferState::Finished,
                TransferState::Failed,
                TransferState::Canceled
            ])),
            "FAILED"
        );
        assert_eq!(
            terminal_routing_key(&batch(&[
                TransferState::Finished,
                TransferState::Canceled
            ])),
            "CANCELED"
        );
    }

    #[test]
    fn multisource_success_wins_over_failed_alternatives() {
        let mut multisource = batch(&[
            TransferState::Failed,
            TransferState::Finished,
            TransferState::Unused,
        ]);
        multisource.batch_type = BatchType::Multisource;
        assert_eq!(terminal_routing_key(&multisource), "FINISHED");

        // All alternatives exhausted: the batch failed.
        let mut exhausted = batch(&[TransferState::Failed, TransferState::Failed]);
        exhausted.batch_type = BatchType::Multisource;
        assert_eq!(terminal_routing_key(&exhausted), "FAILED");
    }

    #[tokio::test]
    async fn forwards_all_three_queues() {
        let dir = TempDir::new().unwrap();
        let bus = MemoryBus::new();
        let mut active_sub = bus
            .subscribe(Source::Queue(&ACTIVE_QUEUE), "t", AckMode::Individual)
            .await
            .unwrap();
        let mut finished_sub = bus
            .subscribe(Source::Queue(&FINISHED_QUEUE), "t", AckMode::Individual)
            .await
            .unwrap();
        let mut perf_sub = bus
            .subscribe(Source::Exchange(&EXCHANGE_PERFORMANCE), "t", AckMode::Auto)
            .await
            .unwrap();

        let context = Arc::new(WorkerContext {
            params: WorkerParams {
                url_copy_bin: "/usr/bin/true".into(),
                dirq_base: dir.path().to_path_buf(),
                pid_db: dir.path().join("pid.db"),
                transfers_log_dir: dir.path().join("logs"),
                x509d: None,
                debug: false,
            },
            supervisor: Supervisor::open(dir.path().join("pid.db"), KILL_TIMEOUT).unwrap(),
            bus: Arc::new(bus),
        });
        let forwarder = Forwarder::new(context).unwrap();

        // A running batch, a finished batch, and a marker, as the child
        // would write them.
        let mut running = batch(&[TransferState::Active]);
        running.state = BatchState::Running;
        forwarder
            .start
            .produce(&serde_json::to_vec(&running).unwrap())
            .unwrap();
        forwarder
            .end
            .produce(&serde_json::to_vec(&batch(&[TransferState::Finished])).unwrap())
            .unwrap();
        let marker = PerfMarker {
            timestamp: Timestamp::now(),
            job_id: "j".into(),
            transfer_id: "t0".into(),
            source_se: "mock://a".into(),
            dest_se: "mock://b".into(),
            throughput: 100,
            transferred: 1000,
        };
        forwarder
            .perf
            .produce(&serde_json::to_vec(&marker).unwrap())
            .unwrap();

        assert_eq!(forwarder.forward_pass().await.unwrap(), 3);

        let active = active_sub.deliveries.recv().await.unwrap();
        assert_eq!(active.routing_key(), Some("ACTIVE"));
        let finished = finished_sub.deliveries.recv().await.unwrap();
        let finished_batch: Batch = serde_json::from_slice(&finished.body).unwrap();
        assert_eq!(finished_batch.state, BatchState::Done);
        let perf = perf_sub.deliveries.recv().await.unwrap();
        let forwarded_marker: PerfMarker = serde_json::from_slice(&perf.body).unwrap();
        assert_eq!(forwarded_marker.transfer_id, "t0");

        // Queues drained: an idle pass forwards nothing.
        assert_eq!(forwarder.forward_pass().await.unwrap(), 0);
    }
}

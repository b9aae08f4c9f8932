//! Runner subsystem: consumes READY batches and spawns copies.

use crate::url_copy::{self, SpawnError};
use crate::{WorkerContext, WorkerError};
use fts_bus::{AckMode, BusError, Delivery, PublishProps, Source, EXCHANGE_TRANSITION, QUEUE_WORKER};
use fts_types::{Batch, BatchState, ErrorScope, TransferError, TransferState};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

pub struct Runner {
    context: Arc<WorkerContext>,
}

impl Runner {
    pub fn new(context: Arc<WorkerContext>) -> Self {
        Self { context }
    }

    /// Consume the worker queue until the subscription dies.
    pub async fn run(&self) -> Result<(), WorkerError> {
        let consumer_id = format!("fts-worker-{}", Uuid::new_v4());
        let mut subscription = self
            .context
            .bus
            .subscribe(Source::Queue(&QUEUE_WORKER), &consumer_id, AckMode::Individual)
            .await?;
        info!("runner started");

        loop {
            tokio::select! {
                delivery = subscription.deliveries.recv() => {
                    let Some(delivery) = delivery else {
                        return Ok(());
                    };
                    // Spawning involves a credential fetch and process
                    // setup; handle each batch concurrently.
                    let context = self.context.clone();
                    tokio::spawn(handle_delivery(context, delivery));
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
}

async fn handle_delivery(context: Arc<WorkerContext>, delivery: Delivery) {
    let batch: Batch = match serde_json::from_slice(&delivery.body) {
        Ok(batch) => batch,
        Err(e) => {
            error!(error = %e, "malformed task");
            let _ = delivery.nack().await;
            return;
        }
    };

    if let Err(e) = batch.validate() {
        error!(error = %e, "invalid task");
        let _ = delivery.ack().await;
        return;
    }

    let batch_id = batch.id();
    if batch.state != BatchState::Ready {
        info!(batch = %batch_id, state = batch.state.routing_key(), "ignoring batch");
        let _ = delivery.ack().await;
        return;
    }

    info!(batch = %batch_id, "received batch");
    match url_copy::spawn_copy(&context, &batch).await {
        Ok(pid) => {
            info!(batch = %batch_id, pid, "spawned url-copy");
            if let Err(e) = context.supervisor.register(&batch, pid) {
                error!(batch = %batch_id, error = %e, "failed to register batch into local db");
            }
        }
        Err(e) => {
            error!(batch = %batch_id, error = %e, "failed to run the batch");
            notify_batch_failure(&context, batch, &e).await;
        }
    }
    let _ = delivery.ack().await;
}

/// Publish a synthetic terminal batch when the copy could not even start.
/// Every transfer is flagged scope AGENT, non-recoverable; the batch state
/// is DONE so the scheduler releases its slots.
async fn notify_batch_failure(context: &WorkerContext, mut batch: Batch, spawn_error: &SpawnError) {
    batch.state = BatchState::Done;
    let transfer_error = TransferError {
        scope: ErrorScope::Agent,
        code: libc::EINPROGRESS,
        description: spawn_error.to_string(),
        recoverable: false,
    };
    for transfer in &mut batch.transfers {
        let info = transfer.info.get_or_insert_with(Default::default);
        info.state = Some(TransferState::Failed);
        info.error = Some(transfer_error.clone());
    }

    let payload = match serde_json::to_vec(&batch) {
        Ok(payload) => payload,
        Err(e) => {
            error!(error = %e, "failed to marshal the message with the error");
            return;
        }
    };
    if let Err(e) = context
        .bus
        .publish(
            &EXCHANGE_TRANSITION,
            TransferState::Failed.routing_key(),
            payload,
            PublishProps::persistent_json(),
        )
        .await
    {
        error!(error = %e, "failed to publish the batch failure");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Supervisor, WorkerParams, KILL_TIMEOUT};
    use fts_bus::{Bind, Bus, Queue};
    use fts_bus_memory::MemoryBus;
    use fts_types::{BatchType, Surl, Timestamp, Transfer, TransferParameters};
    use std::path::PathBuf;
    use tempfile::TempDir;

    static FAILED_QUEUE: Queue = Queue {
        name: "test.q.failed",
        durable: false,
        exclusive_consumer: false,
        bind: Some(Bind {
            exchange: &EXCHANGE_TRANSITION,
            routing_key: "FAILED",
        }),
    };

    fn ready_batch() -> Batch {
        Batch {
            batch_type: BatchType::Simple,
            state: BatchState::Ready,
            delegation_id: "deleg".into(),
            vo: "v".into(),
            source_se: "mock://a".into(),
            dest_se: "mock://b".into(),
            activity: "default".into(),
            submitted: Timestamp::now(),
            transfers: vec![Transfer {
                transfer_id: "t1".into(),
                job_id: "j1".into(),
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

    #[tokio::test(flavor = "multi_thread")]
    async fn spawn_failure_publishes_synthetic_failed_batch() {
        let dir = TempDir::new().unwrap();
        let bus = MemoryBus::new();
        let mut failed_sub = bus
            .subscribe(Source::Queue(&FAILED_QUEUE), "t", AckMode::Individual)
            .await
            .unwrap();

        let context = Arc::new(WorkerContext {
            params: WorkerParams {
                // A binary that does not exist forces the spawn error path.
                url_copy_bin: PathBuf::from("/nonexistent/url-copy"),
                dirq_base: dir.path().join("dirq"),
                pid_db: dir.path().join("pid.db"),
                transfers_log_dir: dir.path().join("logs"),
                x509d: None,
                debug: false,
            },
            supervisor: Supervisor::open(dir.path().join("pid.db"), KILL_TIMEOUT).unwrap(),
            bus: Arc::new(bus),
        });

        let batch = ready_batch();
        let err = url_copy::spawn_copy(&context, &batch).await.unwrap_err();
        notify_batch_failure(&context, batch, &err).await;

        let delivery = failed_sub.deliveries.recv().await.unwrap();
        assert_eq!(delivery.routing_key(), Some("FAILED"));
        let failed: Batch = serde_json::from_slice(&delivery.body).unwrap();
        assert_eq!(failed.state, BatchState::Done);
        let info = failed.transfers[0].info.as_ref().unwrap();
        assert_eq!(info.state, Some(TransferState::Failed));
        let error = info.error.as_ref().unwrap();
        assert_eq!(error.scope, ErrorScope::Agent);
        assert!(!error.recoverable);
        assert!(error.description.contains("failed to run the command"));
    }
}

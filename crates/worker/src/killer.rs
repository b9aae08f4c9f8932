//! Killer subsystem: cancellation orders reach running children.

use crate::{WorkerContext, WorkerError};
use fts_bus::{AckMode, BusError, Source, EXCHANGE_KILL};
use fts_types::Kill;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

pub struct Killer {
    context: Arc<WorkerContext>,
}

impl Killer {
    pub fn new(context: Arc<WorkerContext>) -> Self {
        Self { context }
    }

    /// Listen on the kill fan-out; each order is resolved against the pid
    /// registry and every matching child is signalled.
    pub async fn run(&self) -> Result<(), WorkerError> {
        let consumer_id = format!("fts-worker-{}", Uuid::new_v4());
        let mut subscription = self
            .context
            .bus
            .subscribe(Source::Exchange(&EXCHANGE_KILL), &consumer_id, AckMode::Auto)
            .await?;
        info!("killer started");

        loop {
            tokio::select! {
                delivery = subscription.deliveries.recv() => {
                    let Some(delivery) = delivery else {
                        return Ok(());
                    };
                    let kill: Kill = match serde_json::from_slice(&delivery.body) {
                        Ok(kill) => kill,
                        Err(e) => {
                            error!(error = %e, "malformed kill message");
                            continue;
                        }
                    };
                    info!(transfer_id = %kill.transfer_id, "got kill signal");
                    self.execute(kill).await;
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

    async fn execute(&self, kill: Kill) {
        // The registry scan deserializes every stored batch.
        let context = self.context.clone();
        let pids = tokio::task::spawn_blocking(move || context.supervisor.pids_for_kill(&kill))
            .await
            .unwrap_or_default();
        for pid in pids {
            self.context.supervisor.kill(pid).await;
        }
    }
}

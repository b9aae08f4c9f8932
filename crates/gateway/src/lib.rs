//! Submission gateway.
//!
//! The gateway is the system's front door: it validates a submitted batch,
//! normalizes it into scheduler-consumable units, stamps them SUBMITTED and
//! publishes each one persistently on the transition exchange. It holds no
//! local state, so any number of gateways can run behind a load balancer.
//!
//! A submit fails at the first publish error; partial publishes are
//! acceptable because normalized batches are independent and resubmission
//! is idempotent from the scheduler's point of view (same `batch_id`, same
//! route).

use fts_bus::{Bus, PublishProps, EXCHANGE_TRANSITION};
use fts_rpc::{RpcError, RpcServer};
use fts_types::{Batch, BatchState, Timestamp};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

/// Error code carried by validation failures.
pub const VALIDATION_ERROR: i64 = 400;
/// Error code carried by publish failures.
pub const PUBLISH_ERROR: i64 = 502;

/// Reply of `Gate.Ping`.
#[derive(Debug, Clone, Serialize)]
pub struct PingReply {
    #[serde(rename = "Version")]
    pub version: String,
    #[serde(rename = "Echo")]
    pub echo: String,
}

/// The gateway service behind the RPC surface.
pub struct Gateway {
    bus: Arc<dyn Bus>,
}

impl Gateway {
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self { bus }
    }

    pub fn ping(&self, echo: String) -> PingReply {
        debug!(echo = %echo, "ping");
        PingReply {
            version: fts_types::VERSION.to_string(),
            echo,
        }
    }

    /// Validate, normalize and publish. Returns the number of batches the
    /// submission was split into.
    pub async fn submit(&self, mut batch: Batch) -> Result<usize, RpcError> {
        // Validation errors go back to the submitter verbatim. Routing
        // fields are filled by normalization, so only transfer-level
        // problems are rejected here.
        if batch.transfers.is_empty() {
            return Err(RpcError::new(VALIDATION_ERROR, "empty batch"));
        }
        if batch.vo.is_empty() {
            return Err(RpcError::new(VALIDATION_ERROR, "missing vo"));
        }
        for transfer in &batch.transfers {
            transfer
                .validate()
                .map_err(|e| RpcError::new(VALIDATION_ERROR, e.to_string()))?;
        }

        if batch.submitted.is_zero() {
            batch.submitted = Timestamp::now();
        }
        let delegation_id = batch.delegation_id.clone();
        let normalized = batch.normalize();
        let count = normalized.len();

        for mut batch in normalized {
            batch.state = BatchState::Submitted;
            let payload = serde_json::to_vec(&batch)
                .map_err(|e| RpcError::internal(e.to_string()))?;
            self.bus
                .publish(
                    &EXCHANGE_TRANSITION,
                    BatchState::Submitted.routing_key(),
                    payload,
                    PublishProps::persistent_json(),
                )
                .await
                .map_err(|e| RpcError::new(PUBLISH_ERROR, e.to_string()))?;
            info!(
                batch = %batch.id(),
                source_se = %batch.source_se,
                dest_se = %batch.dest_se,
                activity = %batch.activity,
                "submitted batch"
            );
        }

        info!(delegation_id = %delegation_id, count, "accepted submission");
        Ok(count)
    }
}

/// RPC routes for the gateway: `Gate.Ping` and `Gate.Submit`.
pub fn rpc_routes(gateway: Arc<Gateway>) -> RpcServer {
    let ping_gateway = gateway.clone();
    RpcServer::new()
        .register("Gate.Ping", move |echo: String| {
            let gateway = ping_gateway.clone();
            async move { Ok::<_, RpcError>(gateway.ping(echo)) }
        })
        .register("Gate.Submit", move |batch: Batch| {
            let gateway = gateway.clone();
            async move { gateway.submit(batch).await }
        })
}

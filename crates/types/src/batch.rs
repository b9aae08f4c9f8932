//! Batches: the scheduler-addressable unit of work.

use crate::status::TransferState;
use crate::time::Timestamp;
use crate::transfer::Transfer;
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Activity assigned to transfers that do not carry one.
pub const DEFAULT_ACTIVITY: &str = "default";

/// How the transfers inside a batch must be run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchType {
    /// Each transfer is independent.
    #[serde(rename = "SIMPLE")]
    Simple,
    /// Transfers are independent, but connection and session state is reused.
    #[serde(rename = "BULK")]
    Bulk,
    /// Ordered hops. If one fails, the following do not run.
    #[serde(rename = "MULTIHOP")]
    Multihop,
    /// Ordered alternatives. If one succeeds, the following do not run.
    #[serde(rename = "MULTISOURCE")]
    Multisource,
}

/// State machine for a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchState {
    #[serde(rename = "SUBMITTED")]
    Submitted,
    #[serde(rename = "READY")]
    Ready,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "DONE")]
    Done,
}

impl BatchState {
    /// Routing key used when this state is published on the transition
    /// exchange.
    pub fn routing_key(&self) -> &'static str {
        match self {
            BatchState::Submitted => "SUBMITTED",
            BatchState::Ready => "READY",
            BatchState::Running => "RUNNING",
            BatchState::Done => "DONE",
        }
    }
}

/// Errors from batch validation and merging.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BatchError {
    #[error("empty batch")]
    EmptyTransferSet,
    #[error("missing fields required for routing")]
    MissingInformation,
    #[error("batches can not be merged")]
    CannotMerge,
    #[error("missing transfer id")]
    MissingTransferId,
    #[error("missing job id for {transfer_id}")]
    MissingJobId { transfer_id: String },
    #[error("empty source SURL for {transfer_id}")]
    EmptySource { transfer_id: String },
    #[error("empty destination SURL for {transfer_id}")]
    EmptyDestination { transfer_id: String },
}

/// A set of transfers forming a logical unit of work.
///
/// Batches are scheduled using `(dest_se, vo, activity, source_se)` as key,
/// so after [`Batch::normalize`] every batch carries a single consistent
/// routing tuple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    #[serde(rename = "type")]
    pub batch_type: BatchType,
    pub state: BatchState,
    #[serde(default)]
    pub delegation_id: String,
    #[serde(default)]
    pub vo: String,
    #[serde(default)]
    pub source_se: String,
    #[serde(default)]
    pub dest_se: String,
    #[serde(default)]
    pub activity: String,
    /// Submission time, stamped by the gateway.
    #[serde(default)]
    pub submitted: Timestamp,
    pub transfers: Vec<Transfer>,
}

impl Batch {
    /// Check the batch is properly defined: non-empty, routable, and with
    /// every transfer valid.
    pub fn validate(&self) -> Result<(), BatchError> {
        if self.transfers.is_empty() {
            return Err(BatchError::EmptyTransferSet);
        }
        if self.source_se.is_empty()
            || self.dest_se.is_empty()
            || self.vo.is_empty()
            || self.activity.is_empty()
        {
            return Err(BatchError::MissingInformation);
        }
        for t in &self.transfers {
            t.validate()?;
        }
        Ok(())
    }

    /// Deterministic batch id: hex MD5 over the transfer ids, in order.
    /// Stable across processes and serialization round-trips.
    pub fn id(&self) -> String {
        let mut hash = Md5::new();
        for transfer in &self.transfers {
            hash.update(transfer.transfer_id.as_bytes());
        }
        hex::encode(hash.finalize())
    }

    /// The scheduling route: `[dest_se, vo, activity, source_se]`.
    ///
    /// Depth order is fixed: destinations first (most contended), then VO,
    /// then activity, then source (least contended).
    pub fn route(&self) -> [String; 4] {
        [
            self.dest_se.clone(),
            self.vo.clone(),
            self.activity.clone(),
            self.source_se.clone(),
        ]
    }

    /// Merge `other` into a new batch. Only BULK batches sharing the same
    /// delegation and routing tuple are mergeable; transfer order is
    /// preserved (`self` first).
    pub fn merge(&self, other: &Batch) -> Result<Batch, BatchError> {
        if self.batch_type != BatchType::Bulk || other.batch_type != BatchType::Bulk {
            return Err(BatchError::CannotMerge);
        }
        if self.delegation_id != other.delegation_id {
            return Err(BatchError::CannotMerge);
        }
        if self.source_se != other.source_se
            || self.dest_se != other.dest_se
            || self.vo != other.vo
            || self.activity != other.activity
        {
            return Err(BatchError::CannotMerge);
        }

        let mut transfers = Vec::with_capacity(self.transfers.len() + other.transfers.len());
        transfers.extend(self.transfers.iter().cloned());
        transfers.extend(other.transfers.iter().cloned());

        Ok(Batch {
            batch_type: BatchType::Bulk,
            state: self.state,
            delegation_id: self.delegation_id.clone(),
            vo: self.vo.clone(),
            source_se: self.source_se.clone(),
            dest_se: self.dest_se.clone(),
            activity: self.activity.clone(),
            submitted: self.submitted,
            transfers,
        })
    }

    /// Split into as many batches as necessary to keep routing consistent:
    /// all transfers within a batch must be scheduled together, so they must
    /// apply to the same source, destination, vo and activity.
    ///
    /// Idempotent on its own output.
    pub fn normalize(self) -> Vec<Batch> {
        match self.batch_type {
            BatchType::Simple => self.split_simple(),
            BatchType::Bulk => self.split_bulk(),
            // For both multihop and multisource, the first transfer decides
            // the routing; the rest wait on its outcome.
            BatchType::Multihop | BatchType::Multisource => self.normalize_ordered(),
        }
    }

    /// One SIMPLE batch per transfer.
    fn split_simple(self) -> Vec<Batch> {
        let Batch {
            delegation_id,
            vo,
            state,
            submitted,
            transfers,
            ..
        } = self;

        transfers
            .into_iter()
            .map(|mut transfer| {
                if transfer.activity.is_empty() {
                    transfer.activity = DEFAULT_ACTIVITY.to_string();
                }
                set_state(&mut transfer, TransferState::Submitted);
                let source_se = transfer.source.storage_name();
                let dest_se = transfer.destination.storage_name();
                let activity = transfer.activity.clone();
                Batch {
                    batch_type: BatchType::Simple,
                    state,
                    delegation_id: delegation_id.clone(),
                    vo: vo.clone(),
                    source_se,
                    dest_se,
                    activity,
                    submitted,
                    transfers: vec![transfer],
                }
            })
            .collect()
    }

    /// One BULK batch per `(source storage, dest storage, activity)` group.
    /// Transfer order is preserved within each group; groups come out in
    /// key order, so the fan-out is deterministic.
    fn split_bulk(self) -> Vec<Batch> {
        let Batch {
            delegation_id,
            vo,
            state,
            submitted,
            transfers,
            ..
        } = self;

        let mut groups: BTreeMap<(String, String, String), Vec<Transfer>> = BTreeMap::new();
        for mut transfer in transfers {
            if transfer.activity.is_empty() {
                transfer.activity = DEFAULT_ACTIVITY.to_string();
            }
            set_state(&mut transfer, TransferState::Submitted);
            let key = (
                transfer.source.storage_name(),
                transfer.destination.storage_name(),
                transfer.activity.clone(),
            );
            groups.entry(key).or_default().push(transfer);
        }

        groups
            .into_iter()
            .map(|((source_se, dest_se, activity), transfers)| Batch {
                batch_type: BatchType::Bulk,
                state,
                delegation_id: delegation_id.clone(),
                vo: vo.clone(),
                source_se,
                dest_se,
                activity,
                submitted,
                transfers,
            })
            .collect()
    }

    /// Multihop/multisource: routing fields come from the first transfer;
    /// the first transfer is SUBMITTED, the rest ON_HOLD.
    fn normalize_ordered(mut self) -> Vec<Batch> {
        if let Some(first) = self.transfers.first() {
            self.source_se = first.source.storage_name();
            self.dest_se = first.destination.storage_name();
            self.activity = if first.activity.is_empty() {
                DEFAULT_ACTIVITY.to_string()
            } else {
                first.activity.clone()
            };
        }
        for (i, transfer) in self.transfers.iter_mut().enumerate() {
            let state = if i == 0 {
                TransferState::Submitted
            } else {
                TransferState::OnHold
            };
            set_state(transfer, state);
        }
        vec![self]
    }
}

fn set_state(transfer: &mut Transfer, state: TransferState) {
    transfer.info.get_or_insert_with(Default::default).state = Some(state);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surl::Surl;
    use crate::transfer::TransferParameters;

    fn transfer(id: &str, source: &str, dest: &str) -> Transfer {
        Transfer {
            transfer_id: id.into(),
            job_id: "job".into(),
            source: Surl::parse(source).unwrap(),
            destination: Surl::parse(dest).unwrap(),
            checksum: None,
            filesize: None,
            activity: String::new(),
            retry: 0,
            metadata: String::new(),
            params: TransferParameters::default(),
            info: None,
        }
    }

    fn batch(batch_type: BatchType, transfers: Vec<Transfer>) -> Batch {
        Batch {
            batch_type,
            state: BatchState::Submitted,
            delegation_id: "1234".into(),
            vo: "atlas".into(),
            source_se: String::new(),
            dest_se: String::new(),
            activity: String::new(),
            submitted: Timestamp::default(),
            transfers,
        }
    }

    #[test]
    fn validate_empty() {
        let b = batch(BatchType::Simple, vec![]);
        assert_eq!(b.validate(), Err(BatchError::EmptyTransferSet));
    }

    #[test]
    fn validate_missing_routing() {
        let b = batch(
            BatchType::Simple,
            vec![transfer("t1", "mock://a/p", "mock://b/p")],
        );
        assert_eq!(b.validate(), Err(BatchError::MissingInformation));
    }

    #[test]
    fn validate_normalized_batch() {
        let b = batch(
            BatchType::Simple,
            vec![transfer("t1", "mock://a/p", "mock://b/p")],
        );
        let normalized = b.normalize();
        assert!(normalized[0].validate().is_ok());
    }

    #[test]
    fn id_is_deterministic_and_order_sensitive() {
        let a = batch(
            BatchType::Bulk,
            vec![
                transfer("t1", "mock://a/p", "mock://b/p"),
                transfer("t2", "mock://a/q", "mock://b/q"),
            ],
        );
        let b = a.clone();
        assert_eq!(a.id(), b.id());

        let mut reversed = a.clone();
        reversed.transfers.reverse();
        assert_ne!(a.id(), reversed.id());
    }

    #[test]
    fn id_survives_serde_roundtrip() {
        let b = batch(
            BatchType::Bulk,
            vec![
                transfer("t1", "mock://a/p", "mock://b/p"),
                transfer("t2", "mock://c/q", "mock://d/q"),
            ],
        );
        let json = serde_json::to_string(&b).unwrap();
        let back: Batch = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id(), b.id());
        assert_eq!(back, b);
    }

    #[test]
    fn merge_preserves_order() {
        let mut a = batch(BatchType::Bulk, vec![transfer("t1", "mock://a/p", "mock://b/p")]);
        let mut b = batch(BatchType::Bulk, vec![transfer("t2", "mock://a/q", "mock://b/q")]);
        for x in [&mut a, &mut b] {
            x.source_se = "mock://a".into();
            x.dest_se = "mock://b".into();
            x.activity = "default".into();
        }

        let merged = a.merge(&b).unwrap();
        assert_eq!(merged.batch_type, BatchType::Bulk);
        assert_eq!(merged.transfers.len(), 2);
        assert_eq!(merged.transfers[0].transfer_id, "t1");
        assert_eq!(merged.transfers[1].transfer_id, "t2");
        assert_eq!(merged.delegation_id, a.delegation_id);
    }

    #[test]
    fn merge_rejects_mismatched() {
        let a = batch(BatchType::Simple, vec![transfer("t1", "mock://a/p", "mock://b/p")]);
        let b = batch(BatchType::Bulk, vec![transfer("t2", "mock://a/q", "mock://b/q")]);
        assert_eq!(a.merge(&b), Err(BatchError::CannotMerge));

        let mut c = batch(BatchType::Bulk, vec![transfer("t3", "mock://a/p", "mock://b/p")]);
        c.delegation_id = "other".into();
        assert_eq!(b.merge(&c), Err(BatchError::CannotMerge));
    }

    #[test]
    fn normalize_simple_splits_per_transfer() {
        let b = batch(
            BatchType::Simple,
            vec![
                transfer("t1", "mock://a/p", "mock://b/p"),
                transfer("t2", "mock://c/p", "mock://d/p"),
            ],
        );
        let normalized = b.normalize();
        assert_eq!(normalized.len(), 2);
        for nb in &normalized {
            assert_eq!(nb.transfers.len(), 1);
            assert_eq!(nb.activity, "default");
            assert_eq!(
                nb.transfers[0].info.as_ref().unwrap().state,
                Some(TransferState::Submitted)
            );
        }
        assert_eq!(normalized[0].source_se, "mock://a");
        assert_eq!(normalized[0].dest_se, "mock://b");
        assert_eq!(normalized[1].source_se, "mock://c");
    }

    #[test]
    fn normalize_bulk_groups_by_route() {
        let b = batch(
            BatchType::Bulk,
            vec![
                transfer("t1", "mock://a/1", "mock://b/1"),
                transfer("t2", "mock://c/2", "mock://d/2"),
                transfer("t3", "mock://a/3", "mock://b/3"),
            ],
        );
        let normalized = b.normalize();
        assert_eq!(normalized.len(), 2);

        let ab = normalized
            .iter()
            .find(|nb| nb.source_se == "mock://a")
            .unwrap();
        assert_eq!(ab.transfers.len(), 2);
        assert_eq!(ab.transfers[0].transfer_id, "t1");
        assert_eq!(ab.transfers[1].transfer_id, "t3");
        assert_eq!(ab.dest_se, "mock://b");
    }

    #[test]
    fn normalize_bulk_consistent_stays_together() {
        let b = batch(
            BatchType::Bulk,
            vec![
                transfer("t1", "mock://a/1", "mock://b/1"),
                transfer("t2", "mock://a/2", "mock://b/2"),
                transfer("t3", "mock://a/3", "mock://b/3"),
            ],
        );
        let normalized = b.normalize();
        assert_eq!(normalized.len(), 1);
        assert_eq!(normalized[0].transfers.len(), 3);
        assert_eq!(normalized[0].batch_type, BatchType::Bulk);
    }

    #[test]
    fn normalize_multihop_keeps_order_and_holds_tail() {
        let b = batch(
            BatchType::Multihop,
            vec![
                transfer("h1", "mock://a/p", "mock://b/p"),
                transfer("h2", "mock://b/p", "mock://c/p"),
            ],
        );
        let normalized = b.normalize();
        assert_eq!(normalized.len(), 1);
        let nb = &normalized[0];
        assert_eq!(nb.source_se, "mock://a");
        assert_eq!(nb.dest_se, "mock://b");
        assert_eq!(nb.activity, "default");
        assert_eq!(
            nb.transfers[0].info.as_ref().unwrap().state,
            Some(TransferState::Submitted)
        );
        assert_eq!(
            nb.transfers[1].info.as_ref().unwrap().state,
            Some(TransferState::OnHold)
        );
    }

    #[test]
    fn normalize_is_idempotent() {
        let b = batch(
            BatchType::Bulk,
            vec![
                transfer("t1", "mock://a/1", "mock://b/1"),
                transfer("t2", "mock://c/2", "mock://d/2"),
            ],
        );
        let first = b.normalize();
        let second: Vec<Batch> = first
            .iter()
            .cloned()
            .flat_map(Batch::normalize)
            .collect();
        assert_eq!(first, second);
    }

    #[test]
    fn route_order() {
        let mut b = batch(BatchType::Simple, vec![transfer("t1", "mock://a/p", "mock://b/p")]);
        b.source_se = "mock://a".into();
        b.dest_se = "mock://b".into();
        b.activity = "default".into();
        assert_eq!(
            b.route(),
            [
                "mock://b".to_string(),
                "atlas".to_string(),
                "default".to_string(),
                "mock://a".to_string()
            ]
        );
    }
}

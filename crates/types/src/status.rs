//! Transfer states and execution info.

use crate::time::Interval;
use serde::{Deserialize, Serialize};
use std::fmt;

/// State machine for a single transfer.
///
/// Normal flow:
/// ```text
/// SUBMITTED -> READY -> ACTIVE -> FINISHED | FAILED | CANCELED
/// ```
/// With staging in front: `STAGING -> STARTED -> SUBMITTED -> ...`.
///
/// `ON_HOLD` marks transfers waiting on the outcome of a previous hop or
/// alternative; `UNUSED` is the terminal state for multisource alternatives
/// short-circuited by an earlier success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferState {
    #[serde(rename = "STAGING")]
    Staging,
    #[serde(rename = "STARTED")]
    Started,
    #[serde(rename = "SUBMITTED")]
    Submitted,
    #[serde(rename = "READY")]
    Ready,
    #[serde(rename = "ACTIVE")]
    Active,
    #[serde(rename = "FINISHED")]
    Finished,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "CANCELED")]
    Canceled,
    #[serde(rename = "ON_HOLD")]
    OnHold,
    #[serde(rename = "UNUSED")]
    Unused,
}

impl TransferState {
    /// The routing key used when this state is published on the transition
    /// exchange.
    pub fn routing_key(&self) -> &'static str {
        match self {
            TransferState::Staging => "STAGING",
            TransferState::Started => "STARTED",
            TransferState::Submitted => "SUBMITTED",
            TransferState::Ready => "READY",
            TransferState::Active => "ACTIVE",
            TransferState::Finished => "FINISHED",
            TransferState::Failed => "FAILED",
            TransferState::Canceled => "CANCELED",
            TransferState::OnHold => "ON_HOLD",
            TransferState::Unused => "UNUSED",
        }
    }

    /// True for states a transfer can never leave.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::Finished
                | TransferState::Failed
                | TransferState::Canceled
                | TransferState::Unused
        )
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.routing_key())
    }
}

/// Axis on which a transfer error is blamed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorScope {
    /// Triggered by the source storage.
    #[serde(rename = "SOURCE")]
    Source,
    /// Triggered by the destination storage.
    #[serde(rename = "DESTINATION")]
    Destination,
    /// Triggered during the transfer itself.
    #[serde(rename = "TRANSFER")]
    Transfer,
    /// Related to FTS itself: misconfiguration, spawn failures, bugs.
    #[serde(rename = "AGENT")]
    Agent,
}

/// Details about a transfer error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferError {
    pub scope: ErrorScope,
    /// POSIX-like numeric code.
    pub code: i32,
    pub description: String,
    /// Whether a retry could reasonably succeed.
    pub recoverable: bool,
}

/// Time spent in each stage of the transfer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferIntervals {
    #[serde(default)]
    pub total: Interval,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_time: Option<Interval>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_checksum: Option<Interval>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest_checksum: Option<Interval>,
}

/// Execution statistics filled in by the copy process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransferStats {
    /// Average throughput in bytes per second.
    #[serde(default)]
    pub throughput: f64,
    /// Bytes moved so far.
    #[serde(default)]
    pub transferred: u64,
    #[serde(default)]
    pub intervals: TransferIntervals,
}

/// Runtime information for a transfer, populated solely by the copy process.
/// Pipeline observers are read-only with respect to it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransferInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<TransferState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TransferError>,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<TransferStats>,
    /// Path of the per-transfer log file on the worker host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_serialize_as_routing_keys() {
        for state in [
            TransferState::Submitted,
            TransferState::Ready,
            TransferState::Active,
            TransferState::Finished,
            TransferState::Failed,
            TransferState::Canceled,
            TransferState::OnHold,
            TransferState::Unused,
        ] {
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{}\"", state.routing_key()));
        }
    }

    #[test]
    fn terminal_states() {
        assert!(TransferState::Finished.is_terminal());
        assert!(TransferState::Unused.is_terminal());
        assert!(!TransferState::Active.is_terminal());
        assert!(!TransferState::OnHold.is_terminal());
    }

    #[test]
    fn error_roundtrip() {
        let err = TransferError {
            scope: ErrorScope::Source,
            code: 2,
            description: "No such file or directory".into(),
            recoverable: false,
        };
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"SOURCE\""));
        let back: TransferError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);
    }
}

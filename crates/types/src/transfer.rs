//! A single source→destination copy.

use crate::batch::BatchError;
use crate::status::TransferInfo;
use crate::surl::Surl;
use serde::{Deserialize, Serialize};

/// How (and whether) checksum validation is performed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChecksumMode {
    /// Skip the checksum validation.
    #[default]
    Skip,
    /// Validate, but a missing checksum on the source is not a failure.
    Relaxed,
    /// Full end-to-end checksum validation.
    Strict,
}

/// Parameters tuning the transfer behaviour. Opaque to the scheduling
/// pipeline; interpreted only by the copy process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransferParameters {
    /// If true, there will be no preparatory steps.
    #[serde(default)]
    pub only_copy: bool,
    /// TCP buffer size.
    #[serde(default)]
    pub tcp_buffer_size: u32,
    /// Number of TCP streams, if supported by the protocol.
    #[serde(default)]
    pub nstreams: u8,
    /// Transfer timeout in seconds. Zero means derive from the file size.
    #[serde(default)]
    pub timeout: u64,
    /// Number of times to retry on failure.
    #[serde(default)]
    pub retry: u8,
    /// Seconds to wait between attempts.
    #[serde(default)]
    pub retry_delay: u64,
    /// Staging operation timeout, enforced by the storage.
    #[serde(default)]
    pub staging_timeout: u32,
    /// How long the storage should keep the file pinned on disk.
    #[serde(default)]
    pub pin_lifetime: u32,
    /// Source space token, for staging operations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_spacetoken: Option<String>,
    /// Destination space token, for the transfer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest_spacetoken: Option<String>,
    #[serde(default)]
    pub checksum_mode: ChecksumMode,
    #[serde(default)]
    pub overwrite: bool,
    /// Try UDT for GridFTP transfers.
    #[serde(default)]
    pub enable_udt: bool,
    /// Enable IPv6 for GridFTP transfers.
    #[serde(default)]
    pub enable_ipv6: bool,
}

/// A transfer to be run by FTS.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transfer {
    pub transfer_id: String,
    /// Job this transfer belongs to, from the user's point of view.
    pub job_id: String,
    pub source: Surl,
    pub destination: Surl,
    /// Checksum of the form `algorithm:value`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    /// Expected file size, when the user provided one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filesize: Option<u64>,
    /// Activity share label.
    #[serde(default)]
    pub activity: String,
    /// Retry index.
    #[serde(default)]
    pub retry: u32,
    /// Free-form user metadata.
    #[serde(default)]
    pub metadata: String,
    #[serde(default)]
    pub params: TransferParameters,
    /// Populated during execution by the copy process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<TransferInfo>,
}

impl Transfer {
    /// Check the transfer is properly defined.
    pub fn validate(&self) -> Result<(), BatchError> {
        if self.transfer_id.is_empty() {
            return Err(BatchError::MissingTransferId);
        }
        if self.job_id.is_empty() {
            return Err(BatchError::MissingJobId {
                transfer_id: self.transfer_id.clone(),
            });
        }
        if self.source.host_name().is_empty() {
            return Err(BatchError::EmptySource {
                transfer_id: self.transfer_id.clone(),
            });
        }
        if self.destination.host_name().is_empty() {
            return Err(BatchError::EmptyDestination {
                transfer_id: self.transfer_id.clone(),
            });
        }
        Ok(())
    }

    /// The checksum split into `(algorithm, value)`, when well-formed.
    pub fn checksum_parts(&self) -> Option<(&str, &str)> {
        self.checksum.as_deref()?.split_once(':')
    }
}

//! Performance markers.

use crate::time::Timestamp;
use serde::{Deserialize, Serialize};

/// Progress of a running transfer, published on the performance exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerfMarker {
    pub timestamp: Timestamp,
    #[serde(default)]
    pub job_id: String,
    pub transfer_id: String,
    pub source_se: String,
    pub dest_se: String,
    /// Average throughput in bytes per second.
    #[serde(rename = "throughput_bps")]
    pub throughput: u64,
    #[serde(rename = "transferred_bytes")]
    pub transferred: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_field_names() {
        let marker = PerfMarker {
            timestamp: Timestamp {
                seconds: 1,
                nanos: 2,
            },
            job_id: "j".into(),
            transfer_id: "t".into(),
            source_se: "mock://a".into(),
            dest_se: "mock://b".into(),
            throughput: 1024,
            transferred: 4096,
        };
        let json = serde_json::to_value(&marker).unwrap();
        assert_eq!(json["throughput_bps"], 1024);
        assert_eq!(json["transferred_bytes"], 4096);
        assert_eq!(json["transfer_id"], "t");
    }
}

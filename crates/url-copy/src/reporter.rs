//! Reporting through the local disk queues.
//!
//! The child never talks to the bus: everything goes through the three
//! directory queues under the dirq base, and the worker's forwarder
//! republishes after the fact. That way a message survives even if the
//! child dies right after producing it.

use fts_dirq::{Dirq, DirqError};
use fts_types::{Batch, BatchState, PerfMarker, Timestamp};
use std::path::Path;
use tracing::debug;

pub struct Reporter {
    start: Dirq,
    end: Dirq,
    perf: Dirq,
    terminal_sent: bool,
}

impl Reporter {
    pub fn open(base: &Path) -> Result<Self, DirqError> {
        Ok(Self {
            start: Dirq::open(base.join("start"))?,
            end: Dirq::open(base.join("end"))?,
            perf: Dirq::open(base.join("perf"))?,
            terminal_sent: false,
        })
    }

    /// Announce the batch as running. Written before the first copy starts.
    pub fn batch_start(&self, batch: &mut Batch) -> Result<(), DirqError> {
        batch.state = BatchState::Running;
        let payload = serde_json::to_vec(batch).expect("batch must serialize");
        self.start.produce(&payload)?;
        debug!(batch = %batch.id(), "reported batch start");
        Ok(())
    }

    /// Write the terminal message, exactly once. The batch state goes to
    /// DONE so the scheduler releases the slots when the message reaches it.
    pub fn batch_end(&mut self, batch: &mut Batch) -> Result<(), DirqError> {
        if self.terminal_sent {
            return Ok(());
        }
        batch.state = BatchState::Done;
        let payload = serde_json::to_vec(batch).expect("batch must serialize");
        self.end.produce(&payload)?;
        self.terminal_sent = true;
        debug!(batch = %batch.id(), "reported batch end");
        Ok(())
    }

    /// Write a progress marker. Losing one is harmless, so errors only
    /// bubble for the caller to log.
    pub fn performance(&self, marker: &mut PerfMarker) -> Result<(), DirqError> {
        marker.timestamp = Timestamp::now();
        let payload = serde_json::to_vec(marker).expect("marker must serialize");
        self.perf.produce(&payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fts_types::{BatchType, Surl, Transfer, TransferParameters};
    use tempfile::TempDir;

    fn batch() -> Batch {
        Batch {
            batch_type: BatchType::Simple,
            state: BatchState::Ready,
            delegation_id: "d".into(),
            vo: "v".into(),
            source_se: "mock://a".into(),
            dest_se: "mock://b".into(),
            activity: "default".into(),
            submitted: Timestamp::now(),
            transfers: vec![Transfer {
                transfer_id: "t1".into(),
                job_id: "j".into(),
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

    #[test]
    fn start_and_end_written_with_expected_states() {
        let dir = TempDir::new().unwrap();
        let mut reporter = Reporter::open(dir.path()).unwrap();
        let mut b = batch();

        reporter.batch_start(&mut b).unwrap();
        reporter.batch_end(&mut b).unwrap();

        let start_q = Dirq::open(dir.path().join("start")).unwrap();
        let started: Batch =
            serde_json::from_slice(&start_q.consume().next().unwrap().unwrap()).unwrap();
        assert_eq!(started.state, BatchState::Running);

        let end_q = Dirq::open(dir.path().join("end")).unwrap();
        let ended: Batch =
            serde_json::from_slice(&end_q.consume().next().unwrap().unwrap()).unwrap();
        assert_eq!(ended.state, BatchState::Done);
    }

    #[test]
    fn terminal_message_sent_once() {
        let dir = TempDir::new().unwrap();
        let mut reporter = Reporter::open(dir.path()).unwrap();
        let mut b = batch();

        reporter.batch_end(&mut b).unwrap();
        reporter.batch_end(&mut b).unwrap();

        let end_q = Dirq::open(dir.path().join("end")).unwrap();
        assert_eq!(end_q.consume().count(), 1);
    }
}

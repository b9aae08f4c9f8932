//! Wire timestamps and intervals.

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Seconds/nanos pair used on the wire for every timestamp.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp {
    pub seconds: i64,
    pub nanos: i32,
}

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        SystemTime::now().into()
    }

    /// True when the timestamp was never set.
    pub fn is_zero(&self) -> bool {
        self.seconds == 0 && self.nanos == 0
    }

    /// Convert to a [`SystemTime`]. Saturates at the epoch for negative values.
    pub fn to_system_time(self) -> SystemTime {
        UNIX_EPOCH + Duration::new(self.seconds.max(0) as u64, self.nanos.max(0) as u32)
    }
}

impl From<SystemTime> for Timestamp {
    fn from(t: SystemTime) -> Self {
        let since = t.duration_since(UNIX_EPOCH).unwrap_or_default();
        Self {
            seconds: since.as_secs() as i64,
            nanos: since.subsec_nanos() as i32,
        }
    }
}

/// A time interval spanning a stage of a transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<Timestamp>,
}

impl Interval {
    /// An interval starting now, with no end yet.
    pub fn started() -> Self {
        Self {
            start: Some(Timestamp::now()),
            end: None,
        }
    }

    /// Close the interval at the current time.
    pub fn finish(&mut self) {
        self.end = Some(Timestamp::now());
    }

    /// Elapsed time between start and end, or start and now when still open.
    /// Zero when the interval never started.
    pub fn elapsed(&self) -> Duration {
        let start = match self.start {
            Some(s) => s.to_system_time(),
            None => return Duration::ZERO,
        };
        let end = self
            .end
            .map(Timestamp::to_system_time)
            .unwrap_or_else(SystemTime::now);
        end.duration_since(start).unwrap_or_default()
    }
}

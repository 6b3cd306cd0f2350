use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, Time, UtcOffset};

use crate::RelayResult;

/// One chat message as it goes over the wire.
///
/// Field order is part of the wire format: `username`, `timestamp`, `content`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub username: String,
    /// Local time of day, `HH:MM:SS`.
    pub timestamp: String,
    pub content: String,
}

impl MessageRecord {
    pub fn new(username: impl Into<String>, at: Time, content: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            timestamp: format_timestamp(at),
            content: content.into(),
        }
    }

    pub fn encode(&self) -> RelayResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// 24h, zero padded.
pub fn format_timestamp(at: Time) -> String {
    format!("{:02}:{:02}:{:02}", at.hour(), at.minute(), at.second())
}

/// Joins already-encoded records into the single frame a joining peer gets
/// for one contributing peer: a JSON array in the order they were sent.
pub fn replay_frame<'a>(records: impl IntoIterator<Item = &'a String>) -> String {
    let mut frame = String::from("[");
    for (i, record) in records.into_iter().enumerate() {
        if i > 0 {
            frame.push(',');
        }
        frame.push_str(record);
    }
    frame.push(']');
    frame
}

pub trait Clock: Send + Sync {
    fn now(&self) -> Time;
}

/// Wall clock in the process-local time zone.
///
/// The offset is resolved once. On Unix the `time` crate refuses to read the
/// local offset once other threads exist, so build this before the runtime.
#[derive(Debug, Clone, Copy)]
pub struct LocalClock {
    offset: UtcOffset,
}

impl LocalClock {
    pub fn detect() -> Self {
        match UtcOffset::current_local_offset() {
            Ok(offset) => Self { offset },
            Err(error) => {
                tracing::warn!(%error, "local time zone unavailable, timestamps will be UTC");
                Self::utc()
            }
        }
    }

    pub fn utc() -> Self {
        Self { offset: UtcOffset::UTC }
    }

    pub fn offset(&self) -> UtcOffset {
        self.offset
    }
}

impl Clock for LocalClock {
    fn now(&self) -> Time {
        OffsetDateTime::now_utc().to_offset(self.offset).time()
    }
}

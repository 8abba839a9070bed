//! Trace records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind tag carried by every record the tracer produces.
pub const TRACE_KIND: &str = "trace";

/// A captured MQTT message.
///
/// Stored as JSON; the payload is kept as text (invalid UTF-8 is replaced).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceMessage {
    /// Wall-clock reception time, nanosecond precision.
    pub timestamp: DateTime<Utc>,
    /// Concrete topic the message was published on.
    pub topic: String,
    pub payload: String,
    pub kind: String,
}

impl TraceMessage {
    /// Builds a `"trace"` record from a received publish.
    pub fn trace(timestamp: DateTime<Utc>, topic: &str, payload: &[u8]) -> Self {
        Self {
            timestamp,
            topic: topic.to_string(),
            payload: String::from_utf8_lossy(payload).into_owned(),
            kind: TRACE_KIND.to_string(),
        }
    }

    /// Reception time as nanoseconds since the Unix epoch.
    ///
    /// Times before the epoch clamp to 0; times past the `i64` range (year
    /// 2262) clamp to `u64::MAX`.
    pub fn timestamp_nanos(&self) -> u64 {
        match self.timestamp.timestamp_nanos_opt() {
            Some(nanos) => u64::try_from(nanos).unwrap_or(0),
            None if self.timestamp.timestamp() > 0 => u64::MAX,
            None => 0,
        }
    }
}

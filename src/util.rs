//! Utility functions shared by the driver and the broker adapter.

use crate::error::TracerError;
use chrono::{DateTime, Utc};
use std::time::{SystemTime, UNIX_EPOCH};

fn unix_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
}

/// Generate a client ID from an optional string.
///
/// If `client_id` is `Some` and non-empty, returns a clone of the string.
/// Otherwise, generates a unique client ID using timestamp-based hashing.
#[must_use]
pub fn generate_client_id(client_id: &Option<String>) -> String {
    match client_id {
        Some(id) if !id.is_empty() => id.clone(),
        _ => {
            let timestamp = unix_nanos();
            let hash = timestamp ^ (timestamp >> 32);
            format!("mqtt-tracer-{:08x}", hash as u32)
        }
    }
}

/// Append a `-<unix nanos>` suffix so concurrent sessions of one profile do
/// not kick each other off the broker.
#[must_use]
pub fn with_random_suffix(client_id: &str) -> String {
    format!("{}-{}", client_id, unix_nanos())
}

/// Parse an RFC 3339 timestamp (`2024-01-15T10:30:00Z`, offsets allowed).
///
/// `what` names the argument in the error message.
pub fn parse_rfc3339(what: &str, s: &str) -> Result<DateTime<Utc>, TracerError> {
    DateTime::parse_from_rfc3339(s.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| TracerError::Config(format!("invalid {} time '{}': {}", what, s, e)))
}

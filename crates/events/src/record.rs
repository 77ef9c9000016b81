use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::Event;

/// Envelope delivered to sinks: the event plus the emitting daemon.
///
/// `daemon_id` is unique within a process and assigned in start order;
/// `daemon_name` is the configured name with its role suffix
/// (e.g. `"billing-worker"`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub daemon_id: u64,
    pub daemon_name: String,
    pub event: Event,
    pub timestamp: DateTime<Utc>,
}

impl EventRecord {
    /// Stamp an event with the current time.
    pub fn now(daemon_id: u64, daemon_name: impl Into<String>, event: Event) -> Self {
        Self {
            daemon_id,
            daemon_name: daemon_name.into(),
            event,
            timestamp: Utc::now(),
        }
    }
}

//! Job definition policy: the persisted half of a job definition.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Channel used when a definition or worker does not name one.
pub const DEFAULT_CHANNEL: &str = "_default";

const DEFAULT_NUM_ATTEMPTS: i32 = 1;
const DEFAULT_LOCK_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_TIMEOUT_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);

/// Scheduling policy of a job definition, keyed by `name`.
///
/// Upserted into the store on first use; every field except `name` may change
/// between deployments and the latest registration wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPolicy {
    /// Unique definition name
    pub name: String,
    /// Channel polled by workers
    pub channel: String,
    /// Attempt budget given to each new job
    pub num_attempts: i32,
    /// `None` for one-off definitions
    pub repeat_interval: Option<Duration>,
    /// Minimum spacing between successive claims of this definition
    pub release_interval: Duration,
    /// Lease length granted per claim
    pub lock_interval: Duration,
    /// Maximum job age before the orchestrator fails it
    pub timeout_interval: Duration,
}

impl JobPolicy {
    /// Create a policy with default settings.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            channel: DEFAULT_CHANNEL.to_string(),
            num_attempts: DEFAULT_NUM_ATTEMPTS,
            repeat_interval: None,
            release_interval: Duration::ZERO,
            lock_interval: DEFAULT_LOCK_INTERVAL,
            timeout_interval: DEFAULT_TIMEOUT_INTERVAL,
        }
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    pub fn with_num_attempts(mut self, num_attempts: i32) -> Self {
        self.num_attempts = num_attempts;
        self
    }

    pub fn with_repeat_interval(mut self, interval: Duration) -> Self {
        self.repeat_interval = Some(interval);
        self
    }

    pub fn with_release_interval(mut self, interval: Duration) -> Self {
        self.release_interval = interval;
        self
    }

    pub fn with_lock_interval(mut self, interval: Duration) -> Self {
        self.lock_interval = interval;
        self
    }

    pub fn with_timeout_interval(mut self, interval: Duration) -> Self {
        self.timeout_interval = interval;
        self
    }

    /// Check the fields that cannot be repaired by clamping.
    pub fn validate(&self) -> DomainResult<()> {
        if self.name.trim().is_empty() {
            return Err(DomainError::validation("job definition name must not be empty"));
        }
        if self.channel.trim().is_empty() {
            return Err(DomainError::validation(format!(
                "job definition '{}' has an empty channel",
                self.name
            )));
        }
        Ok(())
    }

    /// Copy of this policy as it is written to the store.
    ///
    /// `num_attempts` is raised to at least 1 and a zero repeat interval means
    /// the definition does not repeat.
    pub fn normalized(&self) -> Self {
        Self {
            num_attempts: self.num_attempts.max(1),
            repeat_interval: self.repeat_interval.filter(|d| !d.is_zero()),
            ..self.clone()
        }
    }

    pub fn is_repeating(&self) -> bool {
        self.repeat_interval.is_some_and(|d| !d.is_zero())
    }
}

/// Milliseconds of `duration`, saturating at `i64::MAX`.
pub fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

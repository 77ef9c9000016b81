//! Persisted job rows and the reasons a job can be failed by the orchestrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{JobDefinitionId, JobId};

/// A job row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_definition_id: JobDefinitionId,
    /// Opaque JSON payload handed to the job function
    pub payload: serde_json::Value,
    /// Remaining attempts; the job is never claimed once this reaches zero
    pub num_attempts: i32,
    pub created_at: DateTime<Utc>,
    /// Earliest claim time. Serves as the initial delay and as the lease expiry.
    pub unlocked_at: DateTime<Utc>,
    pub finalized_at: Option<DateTime<Utc>>,
    pub is_success: Option<bool>,
}

impl Job {
    pub fn is_finalized(&self) -> bool {
        self.finalized_at.is_some()
    }

    pub fn is_failed(&self) -> bool {
        self.is_finalized() && self.is_success == Some(false)
    }

    pub fn is_succeeded(&self) -> bool {
        self.is_finalized() && self.is_success == Some(true)
    }

    pub fn has_attempts_remaining(&self) -> bool {
        self.num_attempts > 0
    }
}

/// Directed edge: `job_id` may only run after `required_job_id` succeeded.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobDependency {
    pub job_id: JobId,
    pub required_job_id: JobId,
}

/// A job definition row as stored.
///
/// Interval columns are kept in milliseconds, matching the relational layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDefinitionRecord {
    pub id: JobDefinitionId,
    pub name: String,
    pub channel: String,
    pub num_attempts: i32,
    pub repeat_interval_ms: Option<i64>,
    pub release_interval_ms: i64,
    pub lock_interval_ms: i64,
    pub timeout_interval_ms: i64,
    pub last_repeated_at: Option<DateTime<Utc>>,
    pub last_released_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Why a job is eligible to be finalized as a failure.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalizeReason {
    /// Older than the definition's timeout interval
    Timeout,
    /// No attempts remaining
    AttemptsExhausted,
    /// A required job was finalized as a failure
    UnmetDependency,
}

/// All finalize conditions evaluated for one job.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizeReasons {
    pub timed_out: bool,
    pub attempts_exhausted: bool,
    pub unmet_dependency: bool,
}

impl FinalizeReasons {
    pub fn any(&self) -> bool {
        self.timed_out || self.attempts_exhausted || self.unmet_dependency
    }

    /// The reason reported when several hold: timeout, then attempts, then dependencies.
    pub fn primary(&self) -> Option<FinalizeReason> {
        if self.timed_out {
            Some(FinalizeReason::Timeout)
        } else if self.attempts_exhausted {
            Some(FinalizeReason::AttemptsExhausted)
        } else if self.unmet_dependency {
            Some(FinalizeReason::UnmetDependency)
        } else {
            None
        }
    }
}

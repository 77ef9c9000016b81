//! Persistence for job definitions, jobs and dependencies.
//!
//! Every trait method runs as one transaction. Methods that select a row and
//! then act on it (claim, finalize, sweep, repeat) skip rows locked by other
//! transactions, so any number of workers and orchestrators can share one
//! store without coordinating.

mod in_memory;
mod postgres;

pub use in_memory::InMemoryJobStore;
pub use postgres::PostgresJobStore;

use std::time::Duration;

use async_trait::async_trait;

use crate::config::ConfigError;

use jobforge_core::{
    FinalizeReasons, Job, JobDefinitionId, JobDefinitionRecord, JobId, JobPolicy,
};

/// Job store abstraction.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert or update the definition keyed by `policy.name`, stamping its heartbeat.
    async fn upsert_job_definition(&self, policy: &JobPolicy)
    -> Result<JobDefinitionId, StoreError>;

    /// Insert a job and its dependency edges atomically.
    ///
    /// Fails with [`StoreError::MissingDependency`] (and inserts nothing) when a
    /// required job does not exist.
    async fn insert_job(&self, job: NewJob) -> Result<JobId, StoreError>;

    /// Claim one eligible job on `channel`: extend its lease by the definition's
    /// lock interval and stamp the definition as released.
    async fn claim_available_job(&self, channel: &str) -> Result<Option<ClaimedJob>, StoreError>;

    /// Mark a job finalized. Returns `false` when it was already finalized.
    async fn finalize_job(&self, job_id: JobId, is_success: bool) -> Result<bool, StoreError>;

    /// Consume one attempt of an unfinalized job.
    async fn decrement_attempts(&self, job_id: JobId) -> Result<(), StoreError>;

    /// Fail one unfinalized job that timed out, ran out of attempts or has a
    /// failed dependency.
    async fn finalize_next_failed_job(&self) -> Result<Option<FinalizedJob>, StoreError>;

    /// Delete one job finalized more than `threshold` ago that no unfinalized
    /// job still depends on.
    async fn sweep_next_finalized_job(
        &self,
        threshold: Duration,
    ) -> Result<Option<SweptJob>, StoreError>;

    /// Delete one definition whose heartbeat is older than `threshold` and
    /// that no job references.
    async fn sweep_next_stale_job_definition(
        &self,
        threshold: Duration,
    ) -> Result<Option<SweptJobDefinition>, StoreError>;

    /// Enqueue one job for a repeating definition whose interval has elapsed.
    async fn repeat_next_job_definition(&self) -> Result<Option<RepeatedJob>, StoreError>;

    /// Stamp a definition's heartbeat. Returns `false` when the row no longer exists.
    async fn heartbeat(&self, id: JobDefinitionId) -> Result<bool, StoreError>;

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, StoreError>;

    async fn get_job_definition(&self, name: &str)
    -> Result<Option<JobDefinitionRecord>, StoreError>;
}

/// Store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("database error in {operation}: {message}")]
    Database {
        operation: &'static str,
        message: String,
    },
    #[error("required job does not exist: {0}")]
    MissingDependency(JobId),
    #[error("job definition does not exist: {0}")]
    UnknownDefinition(JobDefinitionId),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("invalid store configuration: {0}")]
    Config(#[from] ConfigError),
}

/// A job to insert.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub job_definition_id: JobDefinitionId,
    pub payload: serde_json::Value,
    pub num_attempts: i32,
    /// Delay before the job first becomes claimable
    pub delay: Duration,
    /// Jobs that must succeed before this one may run
    pub dependencies: Vec<JobId>,
}

impl NewJob {
    pub fn new(job_definition_id: JobDefinitionId, payload: serde_json::Value) -> Self {
        Self {
            job_definition_id,
            payload,
            num_attempts: 1,
            delay: Duration::ZERO,
            dependencies: Vec::new(),
        }
    }

    pub fn with_num_attempts(mut self, num_attempts: i32) -> Self {
        self.num_attempts = num_attempts;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<JobId>) -> Self {
        self.dependencies = dependencies;
        self
    }
}

/// A job claimed by a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedJob {
    pub id: JobId,
    pub job_definition_id: JobDefinitionId,
    pub job_definition_name: String,
    pub payload: serde_json::Value,
    pub num_attempts: i32,
}

/// A job the orchestrator finalized as failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizedJob {
    pub job_id: JobId,
    pub job_definition_name: String,
    pub reasons: FinalizeReasons,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweptJob {
    pub job_id: JobId,
    pub job_definition_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweptJobDefinition {
    pub id: JobDefinitionId,
    pub name: String,
}

/// The job enqueued for a repeating definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepeatedJob {
    pub job_id: JobId,
    pub job_definition_id: JobDefinitionId,
    pub job_definition_name: String,
}

/// `base + ms`, saturating at the representable maximum.
pub(crate) fn add_millis(
    base: chrono::DateTime<chrono::Utc>,
    ms: i64,
) -> chrono::DateTime<chrono::Utc> {
    chrono::TimeDelta::try_milliseconds(ms)
        .and_then(|delta| base.checked_add_signed(delta))
        .unwrap_or(chrono::DateTime::<chrono::Utc>::MAX_UTC)
}

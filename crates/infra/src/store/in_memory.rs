//! In-memory job store for tests/dev.
//!
//! Mirrors the predicates of the Postgres store. A single lock around the
//! whole state makes each method one serializable transaction, so "skip
//! locked rows" degenerates to "nobody else is looking".

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};

use jobforge_core::{
    FinalizeReasons, Job, JobDefinitionId, JobDefinitionRecord, JobDependency, JobId, JobPolicy,
    duration_millis,
};

use super::{
    ClaimedJob, FinalizedJob, JobStore, NewJob, RepeatedJob, StoreError, SweptJob,
    SweptJobDefinition, add_millis,
};

#[derive(Debug, Default)]
struct State {
    definitions: BTreeMap<JobDefinitionId, JobDefinitionRecord>,
    jobs: BTreeMap<JobId, Job>,
    dependencies: Vec<JobDependency>,
    next_definition_id: i64,
    next_job_id: i64,
    clock_offset: TimeDelta,
    injected_failures: Vec<&'static str>,
}

impl State {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
            .checked_add_signed(self.clock_offset)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    fn check_failure(&mut self, operation: &'static str) -> Result<(), StoreError> {
        match self.injected_failures.iter().position(|op| *op == operation) {
            Some(index) => {
                self.injected_failures.remove(index);
                Err(StoreError::Unavailable(format!("injected failure in {operation}")))
            }
            None => Ok(()),
        }
    }

    fn requirements_of(&self, job_id: JobId) -> impl Iterator<Item = &Job> {
        self.dependencies
            .iter()
            .filter(move |dep| dep.job_id == job_id)
            .filter_map(|dep| self.jobs.get(&dep.required_job_id))
    }

    fn is_claimable(&self, job: &Job, channel: &str, now: DateTime<Utc>) -> bool {
        let Some(definition) = self.definitions.get(&job.job_definition_id) else {
            return false;
        };
        let released = definition
            .last_released_at
            .is_none_or(|at| add_millis(at, definition.release_interval_ms) <= now);

        job.finalized_at.is_none()
            && job.unlocked_at <= now
            && definition.channel == channel
            && job.num_attempts > 0
            && released
            && self.requirements_of(job.id).all(Job::is_succeeded)
    }

    fn finalize_reasons(&self, job: &Job, now: DateTime<Utc>) -> FinalizeReasons {
        let timeout_ms = self
            .definitions
            .get(&job.job_definition_id)
            .map_or(i64::MAX, |d| d.timeout_interval_ms);

        FinalizeReasons {
            timed_out: add_millis(job.created_at, timeout_ms) < now,
            attempts_exhausted: job.num_attempts <= 0,
            unmet_dependency: self
                .requirements_of(job.id)
                .any(|required| required.is_finalized() && !required.is_succeeded()),
        }
    }

    fn has_pending_dependents(&self, job_id: JobId) -> bool {
        self.dependencies
            .iter()
            .filter(|dep| dep.required_job_id == job_id)
            .filter_map(|dep| self.jobs.get(&dep.job_id))
            .any(|dependent| !dependent.is_finalized())
    }

    fn definition_name(&self, id: JobDefinitionId) -> String {
        self.definitions
            .get(&id)
            .map(|d| d.name.clone())
            .unwrap_or_default()
    }

    fn insert_job_row(
        &mut self,
        job_definition_id: JobDefinitionId,
        payload: serde_json::Value,
        num_attempts: i32,
        unlocked_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> JobId {
        self.next_job_id += 1;
        let id = JobId::from_i64(self.next_job_id);
        self.jobs.insert(
            id,
            Job {
                id,
                job_definition_id,
                payload,
                num_attempts,
                created_at: now,
                unlocked_at,
                finalized_at: None,
                is_success: None,
            },
        );
        id
    }

    fn delete_job(&mut self, job_id: JobId) {
        self.jobs.remove(&job_id);
        self.dependencies
            .retain(|dep| dep.job_id != job_id && dep.required_job_id != job_id);
    }
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    state: RwLock<State>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Move this store's clock forward. Affects every time predicate.
    pub fn advance(&self, by: Duration) {
        if let Ok(mut state) = self.state.write() {
            let by = TimeDelta::try_milliseconds(duration_millis(by)).unwrap_or(TimeDelta::MAX);
            state.clock_offset = state.clock_offset.checked_add(&by).unwrap_or(TimeDelta::MAX);
        }
    }

    /// Make the next call of `operation` (a trait method name) fail with
    /// [`StoreError::Unavailable`].
    pub fn fail_next(&self, operation: &'static str) {
        if let Ok(mut state) = self.state.write() {
            state.injected_failures.push(operation);
        }
    }

    pub fn jobs(&self) -> Vec<Job> {
        self.state
            .read()
            .map(|s| s.jobs.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn job_definitions(&self) -> Vec<JobDefinitionRecord> {
        self.state
            .read()
            .map(|s| s.definitions.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn dependencies(&self) -> Vec<JobDependency> {
        self.state
            .read()
            .map(|s| s.dependencies.clone())
            .unwrap_or_default()
    }

    fn write(&self, operation: &'static str) -> Result<RwLockWriteGuard<'_, State>, StoreError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| StoreError::Unavailable("in-memory store lock poisoned".to_string()))?;
        state.check_failure(operation)?;
        Ok(state)
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn upsert_job_definition(
        &self,
        policy: &JobPolicy,
    ) -> Result<JobDefinitionId, StoreError> {
        let mut state = self.write("upsert_job_definition")?;
        let now = state.now();
        let policy = policy.normalized();

        let existing = state
            .definitions
            .values_mut()
            .find(|d| d.name == policy.name);

        if let Some(record) = existing {
            record.channel = policy.channel;
            record.num_attempts = policy.num_attempts;
            record.repeat_interval_ms = policy.repeat_interval.map(duration_millis);
            record.release_interval_ms = duration_millis(policy.release_interval);
            record.lock_interval_ms = duration_millis(policy.lock_interval);
            record.timeout_interval_ms = duration_millis(policy.timeout_interval);
            record.last_heartbeat_at = Some(now);
            record.updated_at = now;
            return Ok(record.id);
        }

        state.next_definition_id += 1;
        let id = JobDefinitionId::from_i64(state.next_definition_id);
        state.definitions.insert(
            id,
            JobDefinitionRecord {
                id,
                name: policy.name,
                channel: policy.channel,
                num_attempts: policy.num_attempts,
                repeat_interval_ms: policy.repeat_interval.map(duration_millis),
                release_interval_ms: duration_millis(policy.release_interval),
                lock_interval_ms: duration_millis(policy.lock_interval),
                timeout_interval_ms: duration_millis(policy.timeout_interval),
                last_repeated_at: None,
                last_released_at: None,
                last_heartbeat_at: Some(now),
                created_at: now,
                updated_at: now,
            },
        );
        Ok(id)
    }

    async fn insert_job(&self, job: NewJob) -> Result<JobId, StoreError> {
        let mut state = self.write("insert_job")?;
        let now = state.now();

        if !state.definitions.contains_key(&job.job_definition_id) {
            return Err(StoreError::UnknownDefinition(job.job_definition_id));
        }
        if let Some(missing) = job
            .dependencies
            .iter()
            .find(|required| !state.jobs.contains_key(required))
        {
            return Err(StoreError::MissingDependency(*missing));
        }

        let unlocked_at = add_millis(now, duration_millis(job.delay));
        let id = state.insert_job_row(
            job.job_definition_id,
            job.payload,
            job.num_attempts,
            unlocked_at,
            now,
        );
        for required_job_id in job.dependencies {
            state.dependencies.push(JobDependency {
                job_id: id,
                required_job_id,
            });
        }
        Ok(id)
    }

    async fn claim_available_job(&self, channel: &str) -> Result<Option<ClaimedJob>, StoreError> {
        let mut state = self.write("claim_available_job")?;
        let now = state.now();

        let Some(job_id) = state
            .jobs
            .values()
            .find(|job| state.is_claimable(job, channel, now))
            .map(|job| job.id)
        else {
            return Ok(None);
        };

        let definition_id = state.jobs[&job_id].job_definition_id;
        let Some(definition) = state.definitions.get_mut(&definition_id) else {
            return Ok(None);
        };
        definition.last_released_at = Some(now);
        let lock_interval_ms = definition.lock_interval_ms;
        let job_definition_name = definition.name.clone();

        let Some(job) = state.jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        job.unlocked_at = add_millis(now, lock_interval_ms);

        Ok(Some(ClaimedJob {
            id: job.id,
            job_definition_id: definition_id,
            job_definition_name,
            payload: job.payload.clone(),
            num_attempts: job.num_attempts,
        }))
    }

    async fn finalize_job(&self, job_id: JobId, is_success: bool) -> Result<bool, StoreError> {
        let mut state = self.write("finalize_job")?;
        let now = state.now();

        match state.jobs.get_mut(&job_id) {
            Some(job) if job.finalized_at.is_none() => {
                job.finalized_at = Some(now);
                job.is_success = Some(is_success);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn decrement_attempts(&self, job_id: JobId) -> Result<(), StoreError> {
        let mut state = self.write("decrement_attempts")?;
        if let Some(job) = state
            .jobs
            .get_mut(&job_id)
            .filter(|job| job.finalized_at.is_none())
        {
            job.num_attempts -= 1;
        }
        Ok(())
    }

    async fn finalize_next_failed_job(&self) -> Result<Option<FinalizedJob>, StoreError> {
        let mut state = self.write("finalize_next_failed_job")?;
        let now = state.now();

        let Some((job_id, reasons)) = state
            .jobs
            .values()
            .filter(|job| job.finalized_at.is_none())
            .map(|job| (job.id, state.finalize_reasons(job, now)))
            .find(|(_, reasons)| reasons.any())
        else {
            return Ok(None);
        };

        let Some(job) = state.jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        job.finalized_at = Some(now);
        job.is_success = Some(false);
        let definition_id = job.job_definition_id;

        Ok(Some(FinalizedJob {
            job_id,
            job_definition_name: state.definition_name(definition_id),
            reasons,
        }))
    }

    async fn sweep_next_finalized_job(
        &self,
        threshold: Duration,
    ) -> Result<Option<SweptJob>, StoreError> {
        let mut state = self.write("sweep_next_finalized_job")?;
        let now = state.now();
        let threshold_ms = duration_millis(threshold);

        let Some((job_id, definition_id)) = state
            .jobs
            .values()
            .filter(|job| {
                job.finalized_at
                    .is_some_and(|at| add_millis(at, threshold_ms) < now)
            })
            .find(|job| !state.has_pending_dependents(job.id))
            .map(|job| (job.id, job.job_definition_id))
        else {
            return Ok(None);
        };

        let job_definition_name = state.definition_name(definition_id);
        state.delete_job(job_id);
        Ok(Some(SweptJob {
            job_id,
            job_definition_name,
        }))
    }

    async fn sweep_next_stale_job_definition(
        &self,
        threshold: Duration,
    ) -> Result<Option<SweptJobDefinition>, StoreError> {
        let mut state = self.write("sweep_next_stale_job_definition")?;
        let now = state.now();
        let threshold_ms = duration_millis(threshold);

        let Some(id) = state
            .definitions
            .values()
            .filter(|d| {
                d.last_heartbeat_at
                    .is_some_and(|at| add_millis(at, threshold_ms) < now)
            })
            .find(|d| !state.jobs.values().any(|job| job.job_definition_id == d.id))
            .map(|d| d.id)
        else {
            return Ok(None);
        };

        Ok(state
            .definitions
            .remove(&id)
            .map(|record| SweptJobDefinition {
                id,
                name: record.name,
            }))
    }

    async fn repeat_next_job_definition(&self) -> Result<Option<RepeatedJob>, StoreError> {
        let mut state = self.write("repeat_next_job_definition")?;
        let now = state.now();

        let Some(definition) = state.definitions.values_mut().find(|d| {
            d.repeat_interval_ms.is_some_and(|interval| {
                d.last_repeated_at
                    .is_none_or(|at| add_millis(at, interval) <= now)
            })
        }) else {
            return Ok(None);
        };

        definition.last_repeated_at = Some(now);
        let job_definition_id = definition.id;
        let job_definition_name = definition.name.clone();
        let num_attempts = definition.num_attempts;

        let job_id = state.insert_job_row(
            job_definition_id,
            serde_json::json!({}),
            num_attempts,
            now,
            now,
        );
        Ok(Some(RepeatedJob {
            job_id,
            job_definition_id,
            job_definition_name,
        }))
    }

    async fn heartbeat(&self, id: JobDefinitionId) -> Result<bool, StoreError> {
        let mut state = self.write("heartbeat")?;
        let now = state.now();
        match state.definitions.get_mut(&id) {
            Some(definition) => {
                definition.last_heartbeat_at = Some(now);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        let state = self
            .state
            .read()
            .map_err(|_| StoreError::Unavailable("in-memory store lock poisoned".to_string()))?;
        Ok(state.jobs.get(&job_id).cloned())
    }

    async fn get_job_definition(
        &self,
        name: &str,
    ) -> Result<Option<JobDefinitionRecord>, StoreError> {
        let state = self
            .state
            .read()
            .map_err(|_| StoreError::Unavailable("in-memory store lock poisoned".to_string()))?;
        Ok(state.definitions.values().find(|d| d.name == name).cloned())
    }
}

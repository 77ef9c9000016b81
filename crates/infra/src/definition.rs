//! Job definitions: a policy plus the function that runs each job.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use jobforge_core::{DomainError, JobDefinitionId, JobId, JobPolicy};

use crate::store::{JobStore, NewJob, StoreError};

/// The function a definition runs for each claimed job.
///
/// Returning `Err` consumes one attempt; the job is retried while attempts
/// remain.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn run(&self, payload: serde_json::Value) -> anyhow::Result<()>;
}

/// Adapts an async closure over the raw JSON payload.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn run(&self, payload: serde_json::Value) -> anyhow::Result<()> {
        (self.0)(payload).await
    }
}

/// Adapts an async closure over a typed payload.
///
/// A payload that fails to deserialize is a job error like any other.
pub struct TypedHandler<T, F> {
    f: F,
    _payload: std::marker::PhantomData<fn(T)>,
}

#[async_trait]
impl<T, F, Fut> JobHandler for TypedHandler<T, F>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn run(&self, payload: serde_json::Value) -> anyhow::Result<()> {
        let payload: T = serde_json::from_value(payload)?;
        (self.f)(payload).await
    }
}

/// Errors raised while initializing, registering or deferring a definition.
#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    #[error(transparent)]
    Invalid(#[from] DomainError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("payload serialization failed: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Options for [`JobDefinition::defer`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeferOptions {
    /// Jobs that must succeed before the new job may run
    pub dependencies: Vec<JobId>,
    /// Delay before the new job first becomes claimable
    pub delay: Duration,
}

impl DeferOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn depends_on(mut self, job_id: JobId) -> Self {
        self.dependencies.push(job_id);
        self
    }

    pub fn with_dependencies(mut self, dependencies: impl IntoIterator<Item = JobId>) -> Self {
        self.dependencies.extend(dependencies);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// A named, configured unit of work.
///
/// The policy is persisted (upserted by name) the first time the definition is
/// initialized; the handler only lives in this process.
pub struct JobDefinition {
    policy: JobPolicy,
    handler: Arc<dyn JobHandler>,
    id: Mutex<Option<JobDefinitionId>>,
}

impl JobDefinition {
    pub fn new<F, Fut>(policy: JobPolicy, f: F) -> Self
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::with_handler(policy, FnHandler(f))
    }

    /// Definition whose function receives the payload deserialized as `T`.
    pub fn typed<T, F, Fut>(policy: JobPolicy, f: F) -> Self
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::with_handler(
            policy,
            TypedHandler {
                f,
                _payload: std::marker::PhantomData,
            },
        )
    }

    pub fn with_handler(policy: JobPolicy, handler: impl JobHandler) -> Self {
        Self {
            policy: policy.normalized(),
            handler: Arc::new(handler),
            id: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.policy.name
    }

    pub fn channel(&self) -> &str {
        &self.policy.channel
    }

    pub fn policy(&self) -> &JobPolicy {
        &self.policy
    }

    /// The store id, once initialized.
    pub fn id(&self) -> Option<JobDefinitionId> {
        self.id.lock().ok().and_then(|id| *id)
    }

    /// Upsert the policy and cache the resulting id. Later calls reuse the cache.
    pub async fn initialize<S>(&self, store: &S) -> Result<JobDefinitionId, DefinitionError>
    where
        S: JobStore + ?Sized,
    {
        if let Some(id) = self.id() {
            return Ok(id);
        }
        self.policy.validate()?;

        // Racing initializers upsert the same row and get the same id.
        let id = store.upsert_job_definition(&self.policy).await?;
        if let Ok(mut cached) = self.id.lock() {
            *cached = Some(id);
        }
        Ok(id)
    }

    /// Drop the cached id so the next `initialize` upserts again.
    pub(crate) fn forget_id(&self) {
        if let Ok(mut cached) = self.id.lock() {
            *cached = None;
        }
    }

    /// Enqueue a job. Initializes the definition first if needed.
    ///
    /// The job and its dependency edges are written atomically; a missing
    /// required job fails the whole call with nothing inserted. If the cached
    /// definition row has been swept since it was initialized, the definition
    /// is upserted again and the insert retried once.
    pub async fn defer<S, P>(
        &self,
        store: &S,
        payload: &P,
        options: DeferOptions,
    ) -> Result<JobId, DefinitionError>
    where
        S: JobStore + ?Sized,
        P: Serialize + ?Sized,
    {
        let payload = serde_json::to_value(payload)?;
        let job_definition_id = self.initialize(store).await?;

        let job = NewJob::new(job_definition_id, payload)
            .with_num_attempts(self.policy.num_attempts)
            .with_delay(options.delay)
            .with_dependencies(options.dependencies);

        match store.insert_job(job.clone()).await {
            Err(StoreError::UnknownDefinition(stale)) => {
                warn!(
                    job_definition = %self.policy.name,
                    job_definition_id = stale.as_i64(),
                    "job definition row is gone, initializing again"
                );
                self.forget_id();
                let job_definition_id = self.initialize(store).await?;
                Ok(store
                    .insert_job(NewJob {
                        job_definition_id,
                        ..job
                    })
                    .await?)
            }
            result => Ok(result?),
        }
    }

    /// Invoke the job function directly.
    pub async fn run(&self, payload: serde_json::Value) -> anyhow::Result<()> {
        self.handler.run(payload).await
    }
}

impl std::fmt::Debug for JobDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobDefinition")
            .field("policy", &self.policy)
            .field("id", &self.id())
            .finish()
    }
}

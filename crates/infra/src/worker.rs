//! Worker daemon: claims jobs on one channel and runs them with bounded concurrency.
//!
//! Each poll drains the channel: claim, wait for a free execution slot, spawn
//! the job, repeat until nothing is claimable. Job outcomes are written back
//! by the spawned task:
//!
//! - definition not registered here: finalized as failure (orphaned)
//! - job function `Ok`: finalized as success
//! - job function `Err` or panic: one attempt consumed, job left for retry
//!   once its lease expires
//!
//! Stopping waits for every in-flight job to complete.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tracing::{debug, error, warn};

use jobforge_events::{Event, EventSink, TracingEventSink};

use crate::config::WorkerConfig;
use crate::daemon::{self, Daemon, DaemonContext, DaemonHandle, EventEmitter, IntervalTimer, TICK};
use crate::definition::JobDefinition;
use crate::registry::JobRegistry;
use crate::store::{ClaimedJob, JobStore, StoreError};

/// Polls a job store and executes claimed jobs with registered definitions.
pub struct Worker<S> {
    store: Arc<S>,
    registry: Arc<JobRegistry>,
    config: WorkerConfig,
    slots: Arc<Semaphore>,
}

impl<S: JobStore + 'static> Worker<S> {
    pub fn new(store: Arc<S>, registry: Arc<JobRegistry>, config: WorkerConfig) -> Self {
        let config = WorkerConfig {
            concurrency: config.concurrency.max(1),
            ..config
        };
        Self {
            slots: Arc::new(Semaphore::new(config.concurrency)),
            store,
            registry,
            config,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Start in the background, logging events through `tracing`.
    pub fn start(self) -> DaemonHandle {
        self.start_with_sink(Arc::new(TracingEventSink))
    }

    pub fn start_with_sink(self, sink: Arc<dyn EventSink>) -> DaemonHandle {
        daemon::spawn(self, sink)
    }

    /// Claim and dispatch jobs until none is claimable or a stop is requested.
    async fn process_jobs(&self, ctx: &DaemonContext) -> Result<usize, StoreError> {
        let mut dispatched = 0;

        while !ctx.stop.is_stopped() {
            let Some(job) = self.store.claim_available_job(&self.config.channel).await? else {
                break;
            };

            ctx.events.emit(Event::WorkerJobDequeue {
                job_id: job.id,
                job_definition_name: job.job_definition_name.clone(),
            });

            let Ok(permit) = self.slots.clone().acquire_owned().await else {
                break;
            };

            let store = self.store.clone();
            let definition = self.registry.get(&job.job_definition_name);
            let events = ctx.events.clone();
            tokio::spawn(async move {
                execute_job(store.as_ref(), definition, &events, job).await;
                drop(permit);
            });
            dispatched += 1;
        }

        Ok(dispatched)
    }

    /// Wait until every execution slot is free again.
    async fn drain(&self) {
        let permits = u32::try_from(self.config.concurrency).unwrap_or(u32::MAX);
        if let Ok(all) = self.slots.acquire_many(permits).await {
            drop(all);
        }
    }
}

#[async_trait]
impl<S: JobStore + 'static> Daemon for Worker<S> {
    fn role(&self) -> &'static str {
        "worker"
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    async fn run(&self, ctx: &DaemonContext) {
        let mut poll = IntervalTimer::new(self.config.poll_interval);

        while !ctx.stop.is_stopped() {
            if poll.has_elapsed() {
                match self.process_jobs(ctx).await {
                    Ok(0) => {}
                    Ok(dispatched) => debug!(
                        daemon = %ctx.events.daemon_name(),
                        channel = %self.config.channel,
                        dispatched,
                        "dispatched jobs"
                    ),
                    Err(e) => error!(
                        daemon = %ctx.events.daemon_name(),
                        channel = %self.config.channel,
                        error = %e,
                        "failed to claim jobs"
                    ),
                }
                poll.reset();
            }
            ctx.stop.sleep(TICK).await;
        }

        self.drain().await;
    }
}

async fn execute_job<S: JobStore + ?Sized>(
    store: &S,
    definition: Option<Arc<JobDefinition>>,
    events: &EventEmitter,
    job: ClaimedJob,
) {
    let Some(definition) = definition else {
        match store.finalize_job(job.id, false).await {
            Ok(_) => events.emit(Event::WorkerJobFinalizeFailureOrphaned {
                job_id: job.id,
                job_definition_name: job.job_definition_name,
            }),
            Err(e) => error!(
                daemon = %events.daemon_name(),
                job_id = job.id.as_i64(),
                job_definition = %job.job_definition_name,
                error = %e,
                "failed to finalize orphaned job"
            ),
        }
        return;
    };

    match run_isolated(definition, job.payload).await {
        Ok(()) => match store.finalize_job(job.id, true).await {
            Ok(true) => events.emit(Event::WorkerJobFinalizeSuccess {
                job_id: job.id,
                job_definition_name: job.job_definition_name,
            }),
            Ok(false) => warn!(
                daemon = %events.daemon_name(),
                job_id = job.id.as_i64(),
                job_definition = %job.job_definition_name,
                "job was already finalized; success not recorded"
            ),
            Err(e) => error!(
                daemon = %events.daemon_name(),
                job_id = job.id.as_i64(),
                job_definition = %job.job_definition_name,
                error = %e,
                "failed to finalize job"
            ),
        },
        Err(err) => {
            if let Err(e) = store.decrement_attempts(job.id).await {
                error!(
                    daemon = %events.daemon_name(),
                    job_id = job.id.as_i64(),
                    job_definition = %job.job_definition_name,
                    error = %e,
                    "failed to decrement attempts"
                );
            }
            events.emit(Event::WorkerJobError {
                job_id: job.id,
                job_definition_name: job.job_definition_name,
                error: format!("{err:#}"),
            });
        }
    }
}

/// Run the job function on its own task so a panic surfaces as an error.
async fn run_isolated(
    definition: Arc<JobDefinition>,
    payload: serde_json::Value,
) -> anyhow::Result<()> {
    match tokio::spawn(async move { definition.run(payload).await }).await {
        Ok(result) => result,
        Err(join_err) if join_err.is_panic() => Err(anyhow::anyhow!("job function panicked")),
        Err(join_err) => Err(anyhow::anyhow!("job function task failed: {join_err}")),
    }
}

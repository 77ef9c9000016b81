//! Orchestrator daemon: store housekeeping.
//!
//! On start every registered definition is initialized (upserted). Each tick
//! then runs three independently timed passes, in this order:
//!
//! 1. heartbeat: stamp every registered definition so it is not swept as stale
//! 2. repeat: enqueue one job per repeating definition whose interval elapsed
//! 3. clean: fail finalizeable jobs, sweep old finalized jobs, then sweep
//!    stale unreferenced definitions
//!
//! Every drain loop stops at the first store error for the current tick and
//! resumes on the next one.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, warn};

use jobforge_core::JobDefinitionId;
use jobforge_events::{Event, EventSink, TracingEventSink};

use crate::config::OrchestratorConfig;
use crate::daemon::{self, Daemon, DaemonContext, DaemonHandle, IntervalTimer, TICK};
use crate::definition::JobDefinition;
use crate::registry::JobRegistry;
use crate::store::JobStore;

pub struct Orchestrator<S> {
    store: Arc<S>,
    registry: Arc<JobRegistry>,
    config: OrchestratorConfig,
}

impl<S: JobStore + 'static> Orchestrator<S> {
    pub fn new(store: Arc<S>, registry: Arc<JobRegistry>, config: OrchestratorConfig) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Start in the background, logging events through `tracing`.
    pub fn start(self) -> DaemonHandle {
        self.start_with_sink(Arc::new(TracingEventSink))
    }

    pub fn start_with_sink(self, sink: Arc<dyn EventSink>) -> DaemonHandle {
        daemon::spawn(self, sink)
    }

    /// Initialize a definition once per orchestrator run, emitting an event the first time.
    async fn ensure_initialized(
        &self,
        ctx: &DaemonContext,
        definition: &JobDefinition,
        initialized: &mut HashSet<String>,
    ) -> Option<JobDefinitionId> {
        match definition.initialize(self.store.as_ref()).await {
            Ok(id) => {
                if initialized.insert(definition.name().to_string()) {
                    ctx.events.emit(Event::OrchestratorJobDefinitionInitialize {
                        job_definition_name: definition.name().to_string(),
                    });
                }
                Some(id)
            }
            Err(e) => {
                error!(
                    daemon = %ctx.events.daemon_name(),
                    job_definition = %definition.name(),
                    error = %e,
                    "failed to initialize job definition"
                );
                None
            }
        }
    }

    async fn heartbeat(&self, ctx: &DaemonContext, initialized: &mut HashSet<String>) {
        for definition in self.registry.definitions() {
            if ctx.stop.is_stopped() {
                return;
            }
            let Some(id) = self.ensure_initialized(ctx, definition, initialized).await else {
                continue;
            };

            match self.store.heartbeat(id).await {
                Ok(true) => ctx.events.emit(Event::OrchestratorJobDefinitionHeartbeat {
                    job_definition_name: definition.name().to_string(),
                }),
                Ok(false) => {
                    // Swept while this process was not heartbeating it; write it back.
                    warn!(
                        daemon = %ctx.events.daemon_name(),
                        job_definition = %definition.name(),
                        "job definition missing from store, re-initializing"
                    );
                    definition.forget_id();
                    initialized.remove(definition.name());
                    self.ensure_initialized(ctx, definition, initialized).await;
                }
                Err(e) => {
                    error!(
                        daemon = %ctx.events.daemon_name(),
                        job_definition = %definition.name(),
                        error = %e,
                        "heartbeat failed"
                    );
                    return;
                }
            }
        }
    }

    async fn repeat_jobs(&self, ctx: &DaemonContext) {
        while !ctx.stop.is_stopped() {
            match self.store.repeat_next_job_definition().await {
                Ok(Some(repeated)) => ctx.events.emit(Event::OrchestratorJobRepeat {
                    job_id: repeated.job_id,
                    job_definition_name: repeated.job_definition_name,
                }),
                Ok(None) => return,
                Err(e) => {
                    error!(daemon = %ctx.events.daemon_name(), error = %e, "repeat pass failed");
                    return;
                }
            }
        }
    }

    async fn finalize_failed_jobs(&self, ctx: &DaemonContext) {
        while !ctx.stop.is_stopped() {
            match self.store.finalize_next_failed_job().await {
                Ok(Some(job)) => {
                    let Some(reason) = job.reasons.primary() else {
                        continue;
                    };
                    ctx.events.emit(Event::finalize_failure(
                        reason,
                        job.job_id,
                        job.job_definition_name,
                    ));
                }
                Ok(None) => return,
                Err(e) => {
                    error!(daemon = %ctx.events.daemon_name(), error = %e, "finalize pass failed");
                    return;
                }
            }
        }
    }

    async fn sweep_finalized_jobs(&self, ctx: &DaemonContext) {
        while !ctx.stop.is_stopped() {
            match self
                .store
                .sweep_next_finalized_job(self.config.finalized_job_sweep_threshold)
                .await
            {
                Ok(Some(job)) => ctx.events.emit(Event::OrchestratorFinalizedJobSweep {
                    job_id: job.job_id,
                    job_definition_name: job.job_definition_name,
                }),
                Ok(None) => return,
                Err(e) => {
                    error!(daemon = %ctx.events.daemon_name(), error = %e, "job sweep failed");
                    return;
                }
            }
        }
    }

    async fn sweep_stale_job_definitions(&self, ctx: &DaemonContext) {
        while !ctx.stop.is_stopped() {
            match self
                .store
                .sweep_next_stale_job_definition(self.config.stale_definition_sweep_threshold)
                .await
            {
                Ok(Some(definition)) => {
                    ctx.events.emit(Event::OrchestratorStaleJobDefinitionSweep {
                        job_definition_name: definition.name,
                    })
                }
                Ok(None) => return,
                Err(e) => {
                    error!(
                        daemon = %ctx.events.daemon_name(),
                        error = %e,
                        "job definition sweep failed"
                    );
                    return;
                }
            }
        }
    }

    async fn clean(&self, ctx: &DaemonContext) {
        self.finalize_failed_jobs(ctx).await;
        self.sweep_finalized_jobs(ctx).await;
        self.sweep_stale_job_definitions(ctx).await;
    }
}

#[async_trait]
impl<S: JobStore + 'static> Daemon for Orchestrator<S> {
    fn role(&self) -> &'static str {
        "orchestrator"
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    async fn run(&self, ctx: &DaemonContext) {
        let mut initialized = HashSet::new();
        for definition in self.registry.definitions() {
            self.ensure_initialized(ctx, definition, &mut initialized)
                .await;
        }
        debug!(
            daemon = %ctx.events.daemon_name(),
            definitions = initialized.len(),
            "job definitions initialized"
        );

        let mut heartbeat = IntervalTimer::new(self.config.heartbeat_interval);
        let mut repeat = IntervalTimer::new(self.config.repeat_interval);
        let mut clean = IntervalTimer::new(self.config.clean_interval);

        while !ctx.stop.is_stopped() {
            if heartbeat.has_elapsed() {
                self.heartbeat(ctx, &mut initialized).await;
                heartbeat.reset();
            }
            if repeat.has_elapsed() {
                self.repeat_jobs(ctx).await;
                repeat.reset();
            }
            if clean.has_elapsed() {
                self.clean(ctx).await;
                clean.reset();
            }
            ctx.stop.sleep(TICK).await;
        }
    }
}

//! The closed set of lifecycle events.

use serde::{Deserialize, Serialize};

use jobforge_core::{FinalizeReason, JobId};

/// One lifecycle event. Each variant carries only the fields it needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "kebab-case")]
pub enum Event {
    DaemonStart,
    DaemonStopSignalSent,
    DaemonStop,

    /// A worker claimed a job and is about to run it.
    WorkerJobDequeue {
        job_id: JobId,
        job_definition_name: String,
    },
    WorkerJobFinalizeSuccess {
        job_id: JobId,
        job_definition_name: String,
    },
    /// The claimed job's definition is not registered in this process.
    WorkerJobFinalizeFailureOrphaned {
        job_id: JobId,
        job_definition_name: String,
    },
    /// The job function failed; one attempt was consumed.
    WorkerJobError {
        job_id: JobId,
        job_definition_name: String,
        error: String,
    },

    OrchestratorJobDefinitionInitialize {
        job_definition_name: String,
    },
    OrchestratorJobDefinitionHeartbeat {
        job_definition_name: String,
    },
    OrchestratorJobRepeat {
        job_id: JobId,
        job_definition_name: String,
    },
    OrchestratorJobFinalizeFailureTimeout {
        job_id: JobId,
        job_definition_name: String,
    },
    OrchestratorJobFinalizeFailureNoAttemptsRemaining {
        job_id: JobId,
        job_definition_name: String,
    },
    OrchestratorJobFinalizeFailureUnmetDependencies {
        job_id: JobId,
        job_definition_name: String,
    },
    OrchestratorFinalizedJobSweep {
        job_id: JobId,
        job_definition_name: String,
    },
    OrchestratorStaleJobDefinitionSweep {
        job_definition_name: String,
    },
}

impl Event {
    /// Event for an orchestrator-driven failure with the given reason.
    pub fn finalize_failure(
        reason: FinalizeReason,
        job_id: JobId,
        job_definition_name: impl Into<String>,
    ) -> Self {
        let job_definition_name = job_definition_name.into();
        match reason {
            FinalizeReason::Timeout => Self::OrchestratorJobFinalizeFailureTimeout {
                job_id,
                job_definition_name,
            },
            FinalizeReason::AttemptsExhausted => {
                Self::OrchestratorJobFinalizeFailureNoAttemptsRemaining {
                    job_id,
                    job_definition_name,
                }
            }
            FinalizeReason::UnmetDependency => Self::OrchestratorJobFinalizeFailureUnmetDependencies {
                job_id,
                job_definition_name,
            },
        }
    }

    /// Stable kebab-case name, identical to the serialized `event_type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::DaemonStart => "daemon-start",
            Event::DaemonStopSignalSent => "daemon-stop-signal-sent",
            Event::DaemonStop => "daemon-stop",
            Event::WorkerJobDequeue { .. } => "worker-job-dequeue",
            Event::WorkerJobFinalizeSuccess { .. } => "worker-job-finalize-success",
            Event::WorkerJobFinalizeFailureOrphaned { .. } => "worker-job-finalize-failure-orphaned",
            Event::WorkerJobError { .. } => "worker-job-error",
            Event::OrchestratorJobDefinitionInitialize { .. } => {
                "orchestrator-job-definition-initialize"
            }
            Event::OrchestratorJobDefinitionHeartbeat { .. } => {
                "orchestrator-job-definition-heartbeat"
            }
            Event::OrchestratorJobRepeat { .. } => "orchestrator-job-repeat",
            Event::OrchestratorJobFinalizeFailureTimeout { .. } => {
                "orchestrator-job-finalize-failure-timeout"
            }
            Event::OrchestratorJobFinalizeFailureNoAttemptsRemaining { .. } => {
                "orchestrator-job-finalize-failure-no-attempts-remaining"
            }
            Event::OrchestratorJobFinalizeFailureUnmetDependencies { .. } => {
                "orchestrator-job-finalize-failure-unmet-dependencies"
            }
            Event::OrchestratorFinalizedJobSweep { .. } => "orchestrator-finalized-job-sweep",
            Event::OrchestratorStaleJobDefinitionSweep { .. } => {
                "orchestrator-stale-job-definition-sweep"
            }
        }
    }

    pub fn job_id(&self) -> Option<JobId> {
        match self {
            Event::WorkerJobDequeue { job_id, .. }
            | Event::WorkerJobFinalizeSuccess { job_id, .. }
            | Event::WorkerJobFinalizeFailureOrphaned { job_id, .. }
            | Event::WorkerJobError { job_id, .. }
            | Event::OrchestratorJobRepeat { job_id, .. }
            | Event::OrchestratorJobFinalizeFailureTimeout { job_id, .. }
            | Event::OrchestratorJobFinalizeFailureNoAttemptsRemaining { job_id, .. }
            | Event::OrchestratorJobFinalizeFailureUnmetDependencies { job_id, .. }
            | Event::OrchestratorFinalizedJobSweep { job_id, .. } => Some(*job_id),
            _ => None,
        }
    }

    pub fn job_definition_name(&self) -> Option<&str> {
        match self {
            Event::DaemonStart | Event::DaemonStopSignalSent | Event::DaemonStop => None,
            Event::WorkerJobDequeue { job_definition_name, .. }
            | Event::WorkerJobFinalizeSuccess { job_definition_name, .. }
            | Event::WorkerJobFinalizeFailureOrphaned { job_definition_name, .. }
            | Event::WorkerJobError { job_definition_name, .. }
            | Event::OrchestratorJobDefinitionInitialize { job_definition_name }
            | Event::OrchestratorJobDefinitionHeartbeat { job_definition_name }
            | Event::OrchestratorJobRepeat { job_definition_name, .. }
            | Event::OrchestratorJobFinalizeFailureTimeout { job_definition_name, .. }
            | Event::OrchestratorJobFinalizeFailureNoAttemptsRemaining { job_definition_name, .. }
            | Event::OrchestratorJobFinalizeFailureUnmetDependencies { job_definition_name, .. }
            | Event::OrchestratorFinalizedJobSweep { job_definition_name, .. }
            | Event::OrchestratorStaleJobDefinitionSweep { job_definition_name } => {
                Some(job_definition_name.as_str())
            }
        }
    }

    /// Failures worth surfacing at warn level.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Event::WorkerJobError { .. }
                | Event::WorkerJobFinalizeFailureOrphaned { .. }
                | Event::OrchestratorJobFinalizeFailureTimeout { .. }
                | Event::OrchestratorJobFinalizeFailureNoAttemptsRemaining { .. }
                | Event::OrchestratorJobFinalizeFailureUnmetDependencies { .. }
        )
    }
}

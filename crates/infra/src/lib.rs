//! Infrastructure layer: job store adapters, definitions, and the worker and
//! orchestrator daemons.

pub mod config;
pub mod daemon;
pub mod definition;
pub mod orchestrator;
pub mod registry;
pub mod store;
pub mod worker;

mod integration_tests;

pub use config::{ConfigError, OrchestratorConfig, StoreConfig, WorkerConfig};
pub use daemon::{Daemon, DaemonContext, DaemonHandle, EventEmitter, StopSignal};
pub use definition::{DeferOptions, DefinitionError, FnHandler, JobDefinition, JobHandler};
pub use orchestrator::Orchestrator;
pub use registry::JobRegistry;
pub use store::{
    ClaimedJob, FinalizedJob, InMemoryJobStore, JobStore, NewJob, PostgresJobStore, RepeatedJob,
    StoreError, SweptJob, SweptJobDefinition,
};
pub use worker::Worker;

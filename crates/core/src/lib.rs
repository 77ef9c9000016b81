//! `jobforge-core`: job queue domain building blocks.
//!
//! This crate contains **pure domain** types (no storage or runtime concerns):
//! identifiers, definition policies, persisted job rows and finalize reasons.

pub mod error;
pub mod id;
pub mod job;
pub mod policy;

pub use error::{DomainError, DomainResult};
pub use id::{JobDefinitionId, JobId};
pub use job::{FinalizeReason, FinalizeReasons, Job, JobDefinitionRecord, JobDependency};
pub use policy::{DEFAULT_CHANNEL, JobPolicy, duration_millis};

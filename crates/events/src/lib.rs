//! Lifecycle events emitted by workers and orchestrators.
//!
//! Events are purely observational: sinks receive a record for every state
//! transition a daemon drives, but nothing a sink does feeds back into
//! control flow.

pub mod event;
pub mod in_memory_sink;
pub mod record;
pub mod sink;

pub use event::Event;
pub use in_memory_sink::InMemoryEventSink;
pub use record::EventRecord;
pub use sink::{EventSink, FanoutEventSink, FnEventSink, TracingEventSink};

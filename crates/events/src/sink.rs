//! Event sink abstraction.
//!
//! A sink is the observability hook of a daemon. It is called synchronously
//! from the control loop, once per lifecycle event, and must not block for
//! long: anything slow should be handed off to a channel.
//!
//! Sinks cannot fail. A sink that needs to report a problem should log it.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::event::Event;
use crate::record::EventRecord;

/// Receives every lifecycle event of the daemons it is attached to.
pub trait EventSink: Send + Sync {
    fn on_event(&self, record: &EventRecord);
}

impl<S> EventSink for Arc<S>
where
    S: EventSink + ?Sized,
{
    fn on_event(&self, record: &EventRecord) {
        (**self).on_event(record)
    }
}

/// Logs each event through `tracing`.
///
/// Failures go to `warn`, high-frequency bookkeeping (dequeue, heartbeat)
/// to `debug`, everything else to `info`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn on_event(&self, record: &EventRecord) {
        let event = &record.event;
        let job_id = event.job_id().map(|id| id.as_i64());
        let job_definition = event.job_definition_name().unwrap_or("");

        if let Event::WorkerJobError { error, .. } = event {
            warn!(
                daemon = %record.daemon_name,
                daemon_id = record.daemon_id,
                job_id = ?job_id,
                job_definition,
                error = %error,
                "{}",
                event.kind()
            );
        } else if event.is_failure() {
            warn!(
                daemon = %record.daemon_name,
                daemon_id = record.daemon_id,
                job_id = ?job_id,
                job_definition,
                "{}",
                event.kind()
            );
        } else if matches!(
            event,
            Event::WorkerJobDequeue { .. } | Event::OrchestratorJobDefinitionHeartbeat { .. }
        ) {
            debug!(
                daemon = %record.daemon_name,
                daemon_id = record.daemon_id,
                job_id = ?job_id,
                job_definition,
                "{}",
                event.kind()
            );
        } else {
            info!(
                daemon = %record.daemon_name,
                daemon_id = record.daemon_id,
                job_id = ?job_id,
                job_definition,
                "{}",
                event.kind()
            );
        }
    }
}

/// Adapts a closure into a sink.
pub struct FnEventSink<F>(pub F);

impl<F> EventSink for FnEventSink<F>
where
    F: Fn(&EventRecord) + Send + Sync,
{
    fn on_event(&self, record: &EventRecord) {
        (self.0)(record)
    }
}

impl<F> core::fmt::Debug for FnEventSink<F> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("FnEventSink")
    }
}

/// Forwards each event to every inner sink, in order.
#[derive(Default, Clone)]
pub struct FanoutEventSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl core::fmt::Debug for FanoutEventSink {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FanoutEventSink")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

impl EventSink for FanoutEventSink {
    fn on_event(&self, record: &EventRecord) {
        for sink in &self.sinks {
            sink.on_event(record);
        }
    }
}

//! Shared lifecycle for background daemons (workers and orchestrators).
//!
//! A daemon is started with [`spawn`], which emits `daemon-start`, runs the
//! daemon's loop on the tokio runtime and emits `daemon-stop` once the loop
//! (including any draining) has returned. The returned [`DaemonHandle`]
//! requests a cooperative stop and awaits completion.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info};

use jobforge_events::{Event, EventRecord, EventSink};

/// Sleep between control-loop iterations.
pub(crate) const TICK: Duration = Duration::from_millis(50);

static NEXT_DAEMON_ID: AtomicU64 = AtomicU64::new(0);

/// Cooperative stop flag. Loops check it at iteration boundaries.
#[derive(Debug, Default)]
pub struct StopSignal {
    stopped: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag. Returns `true` only for the first request.
    pub fn request(&self) -> bool {
        let first = !self.stopped.swap(true, Ordering::SeqCst);
        self.notify.notify_waiters();
        first
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Sleep for `duration`, waking early if a stop is requested.
    pub async fn sleep(&self, duration: Duration) {
        let notified = self.notify.notified();
        if self.is_stopped() {
            return;
        }
        tokio::select! {
            _ = notified => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }
}

/// Fires once per interval; elapsed from the start so the first check runs immediately.
#[derive(Debug)]
pub(crate) struct IntervalTimer {
    interval: Duration,
    last: Option<Instant>,
}

impl IntervalTimer {
    pub(crate) fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    pub(crate) fn has_elapsed(&self) -> bool {
        self.last.is_none_or(|last| last.elapsed() >= self.interval)
    }

    pub(crate) fn reset(&mut self) {
        self.last = Some(Instant::now());
    }
}

/// Stamps events with the daemon's identity and hands them to the sink.
#[derive(Clone)]
pub struct EventEmitter {
    daemon_id: u64,
    daemon_name: Arc<str>,
    sink: Arc<dyn EventSink>,
}

impl EventEmitter {
    pub fn new(daemon_name: impl Into<Arc<str>>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            daemon_id: NEXT_DAEMON_ID.fetch_add(1, Ordering::SeqCst),
            daemon_name: daemon_name.into(),
            sink,
        }
    }

    pub fn daemon_id(&self) -> u64 {
        self.daemon_id
    }

    pub fn daemon_name(&self) -> &str {
        &self.daemon_name
    }

    pub fn emit(&self, event: Event) {
        self.sink.on_event(&EventRecord::now(
            self.daemon_id,
            self.daemon_name.as_ref(),
            event,
        ));
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("daemon_id", &self.daemon_id)
            .field("daemon_name", &self.daemon_name)
            .finish()
    }
}

/// What a running daemon loop gets to work with.
#[derive(Debug, Clone)]
pub struct DaemonContext {
    pub stop: Arc<StopSignal>,
    pub events: EventEmitter,
}

/// A background control loop.
#[async_trait]
pub trait Daemon: Send + Sync + 'static {
    /// Role suffix appended to the configured name (`"worker"`, `"orchestrator"`).
    fn role(&self) -> &'static str;

    /// Configured name, without the role suffix.
    fn name(&self) -> &str;

    /// Run until `ctx.stop` is requested. Must finish any in-flight work before returning.
    async fn run(&self, ctx: &DaemonContext);
}

/// Handle to a spawned daemon.
#[derive(Debug)]
pub struct DaemonHandle {
    ctx: DaemonContext,
    join: JoinHandle<()>,
}

impl DaemonHandle {
    /// Ask the daemon to stop after its current iteration. Idempotent.
    pub fn request_stop(&self) {
        if self.ctx.stop.request() {
            info!(daemon = %self.ctx.events.daemon_name(), "stop requested");
            self.ctx.events.emit(Event::DaemonStopSignalSent);
        }
    }

    /// Wait for the daemon to finish.
    pub async fn join(self) {
        if let Err(e) = self.join.await {
            error!(daemon = %self.ctx.events.daemon_name(), error = %e, "daemon task failed");
        }
    }

    /// Request a stop and wait for completion.
    pub async fn shutdown(self) {
        self.request_stop();
        self.join().await;
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub fn daemon_id(&self) -> u64 {
        self.ctx.events.daemon_id()
    }

    pub fn daemon_name(&self) -> &str {
        self.ctx.events.daemon_name()
    }
}

/// Start a daemon on the current tokio runtime.
pub fn spawn<D: Daemon>(daemon: D, sink: Arc<dyn EventSink>) -> DaemonHandle {
    let daemon_name = format!("{}-{}", daemon.name(), daemon.role());
    let ctx = DaemonContext {
        stop: Arc::new(StopSignal::new()),
        events: EventEmitter::new(daemon_name, sink),
    };

    info!(
        daemon = %ctx.events.daemon_name(),
        daemon_id = ctx.events.daemon_id(),
        "daemon starting"
    );
    ctx.events.emit(Event::DaemonStart);

    let task_ctx = ctx.clone();
    let join = tokio::spawn(async move {
        daemon.run(&task_ctx).await;
        info!(daemon = %task_ctx.events.daemon_name(), "daemon stopped");
        task_ctx.events.emit(Event::DaemonStop);
    });

    DaemonHandle { ctx, join }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobforge_events::InMemoryEventSink;

    struct Idle;

    #[async_trait]
    impl Daemon for Idle {
        fn role(&self) -> &'static str {
            "idle"
        }

        fn name(&self) -> &str {
            "test"
        }

        async fn run(&self, ctx: &DaemonContext) {
            while !ctx.stop.is_stopped() {
                ctx.stop.sleep(Duration::from_secs(3600)).await;
            }
        }
    }

    #[tokio::test]
    async fn lifecycle_events_in_order() {
        let sink = Arc::new(InMemoryEventSink::new());
        let handle = spawn(Idle, sink.clone());
        assert_eq!(handle.daemon_name(), "test-idle");

        handle.request_stop();
        handle.request_stop();
        handle.join().await;

        assert_eq!(
            sink.kinds(),
            vec!["daemon-start", "daemon-stop-signal-sent", "daemon-stop"]
        );
        let records = sink.records();
        assert!(records.iter().all(|r| r.daemon_name == "test-idle"));
    }

    #[tokio::test]
    async fn daemon_ids_are_unique() {
        let sink = Arc::new(InMemoryEventSink::new());
        let a = spawn(Idle, sink.clone());
        let b = spawn(Idle, sink.clone());
        assert_ne!(a.daemon_id(), b.daemon_id());
        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn stop_wakes_sleepers() {
        let stop = Arc::new(StopSignal::new());
        let sleeper = {
            let stop = stop.clone();
            tokio::spawn(async move { stop.sleep(Duration::from_secs(3600)).await })
        };
        tokio::task::yield_now().await;
        assert!(stop.request());
        assert!(!stop.request());
        tokio::time::timeout(Duration::from_secs(5), sleeper)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn interval_timer_fires_immediately_then_waits() {
        let mut timer = IntervalTimer::new(Duration::from_secs(10));
        assert!(timer.has_elapsed());
        timer.reset();
        assert!(!timer.has_elapsed());
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(timer.has_elapsed());
    }
}

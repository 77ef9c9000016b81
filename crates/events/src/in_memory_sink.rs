//! In-memory event sink for tests/dev.

use std::sync::{Mutex, mpsc};

use crate::event::Event;
use crate::record::EventRecord;
use crate::sink::EventSink;

/// Records every event and fans it out to subscribers.
///
/// - No IO / no async
/// - Subscribers that hung up are dropped on the next event
#[derive(Debug, Default)]
pub struct InMemoryEventSink {
    records: Mutex<Vec<EventRecord>>,
    subscribers: Mutex<Vec<mpsc::Sender<EventRecord>>>,
}

impl InMemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive every event recorded after this call.
    pub fn subscribe(&self) -> mpsc::Receiver<EventRecord> {
        let (tx, rx) = mpsc::channel();

        // A poisoned lock still yields a receiver; it just never gets messages.
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }

        rx
    }

    pub fn records(&self) -> Vec<EventRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.records().into_iter().map(|r| r.event).collect()
    }

    /// Kinds of all recorded events, in emission order.
    pub fn kinds(&self) -> Vec<&'static str> {
        self.records().iter().map(|r| r.event.kind()).collect()
    }

    pub fn count_kind(&self, kind: &str) -> usize {
        self.records()
            .iter()
            .filter(|r| r.event.kind() == kind)
            .count()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut records) = self.records.lock() {
            records.clear();
        }
    }
}

impl EventSink for InMemoryEventSink {
    fn on_event(&self, record: &EventRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record.clone());
        }

        if let Ok(mut subs) = self.subscribers.lock() {
            subs.retain(|tx| tx.send(record.clone()).is_ok());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobforge_core::JobId;
    use std::time::Duration;

    #[test]
    fn records_in_order() {
        let sink = InMemoryEventSink::new();
        sink.on_event(&EventRecord::now(0, "a-worker", Event::DaemonStart));
        sink.on_event(&EventRecord::now(
            0,
            "a-worker",
            Event::WorkerJobDequeue {
                job_id: JobId::from_i64(1),
                job_definition_name: "x".into(),
            },
        ));

        assert_eq!(sink.kinds(), vec!["daemon-start", "worker-job-dequeue"]);
        assert_eq!(sink.count_kind("worker-job-dequeue"), 1);

        sink.clear();
        assert!(sink.is_empty());
    }

    #[test]
    fn subscribers_receive_later_events() {
        let sink = InMemoryEventSink::new();
        sink.on_event(&EventRecord::now(0, "a", Event::DaemonStart));

        let rx = sink.subscribe();
        sink.on_event(&EventRecord::now(0, "a", Event::DaemonStop));

        let received = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(received.event, Event::DaemonStop);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dropped_subscriber_is_pruned() {
        let sink = InMemoryEventSink::new();
        drop(sink.subscribe());
        sink.on_event(&EventRecord::now(0, "a", Event::DaemonStart));
        assert_eq!(sink.subscribers.lock().unwrap().len(), 0);
    }
}

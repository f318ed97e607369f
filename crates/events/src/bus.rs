//! Per-job fan-out of live events to an arbitrary number of subscribers.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::JobEvent;

/// Fan-out bus for live job events.
///
/// Each subscriber owns an unbounded inbox. Publishing never blocks: a
/// subscriber whose receiver is gone is silently dropped. Publishing a
/// terminal event closes every inbox for that job, which subscribers
/// observe as end-of-stream.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<JobEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a job's live events.
    ///
    /// The returned receiver yields events in publication order and closes
    /// after the job's terminal event. Subscribing after the terminal event
    /// yields a receiver that closes immediately; late subscribers are
    /// served by replay from the store, not by the bus.
    pub fn subscribe(&self, job_id: &str) -> mpsc::UnboundedReceiver<JobEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self.subscribers.lock().expect("event bus mutex poisoned");
        subscribers.entry(job_id.to_string()).or_default().push(tx);
        rx
    }

    /// Publish a non-terminal event to every live subscriber of its job.
    ///
    /// Terminal events must go through [`EventBus::publish_terminal`] so the
    /// job's inboxes are closed afterwards.
    pub fn publish(&self, event: &JobEvent) {
        let mut subscribers = self.subscribers.lock().expect("event bus mutex poisoned");
        if let Some(inboxes) = subscribers.get_mut(&event.job_id) {
            inboxes.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    /// Publish a job's terminal event and drop all of its subscribers.
    pub fn publish_terminal(&self, event: &JobEvent) {
        debug_assert!(event.is_terminal());
        let mut subscribers = self.subscribers.lock().expect("event bus mutex poisoned");
        if let Some(inboxes) = subscribers.remove(&event.job_id) {
            let delivered = inboxes
                .iter()
                .filter(|tx| tx.send(event.clone()).is_ok())
                .count();
            tracing::debug!(
                job_id = %event.job_id,
                delivered,
                "terminal event published, stream closed"
            );
        }
    }

    /// Drop subscribers whose receiver is gone, and the job's entry once
    /// none remain. Called when a subscription is abandoned without a
    /// terminal event (e.g. replay took over).
    pub fn prune_closed(&self, job_id: &str) {
        let mut subscribers = self.subscribers.lock().expect("event bus mutex poisoned");
        if let Some(inboxes) = subscribers.get_mut(job_id) {
            inboxes.retain(|tx| !tx.is_closed());
            if inboxes.is_empty() {
                subscribers.remove(job_id);
            }
        }
    }

    /// Number of live subscribers for a job.
    pub fn subscriber_count(&self, job_id: &str) -> usize {
        self.subscribers
            .lock()
            .expect("event bus mutex poisoned")
            .get(job_id)
            .map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{JobStatus, SegmentPayload};

    fn running(job_id: &str, progress: f64) -> JobEvent {
        JobEvent::status(job_id, JobStatus::Running, progress)
    }

    #[tokio::test]
    async fn delivers_events_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe("job-1");

        for i in 0..5 {
            bus.publish(&running("job-1", i as f64 / 10.0));
        }

        for i in 0..5 {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.progress, i as f64 / 10.0);
        }
    }

    #[tokio::test]
    async fn fans_out_to_all_subscribers() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe("job-1");
        let mut rx2 = bus.subscribe("job-1");

        bus.publish(&running("job-1", 0.5));

        assert_eq!(rx1.recv().await.unwrap().progress, 0.5);
        assert_eq!(rx2.recv().await.unwrap().progress, 0.5);
    }

    #[tokio::test]
    async fn unrelated_jobs_do_not_cross() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe("job-1");

        bus.publish(&running("job-2", 0.3));
        bus.publish(&running("job-1", 0.7));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.job_id, "job-1");
        assert_eq!(event.progress, 0.7);
    }

    #[tokio::test]
    async fn terminal_event_closes_stream() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe("job-1");

        bus.publish(&running("job-1", 0.5));
        bus.publish_terminal(&JobEvent::status("job-1", JobStatus::Completed, 1.0));

        assert_eq!(rx.recv().await.unwrap().status, JobStatus::Running);
        let terminal = rx.recv().await.unwrap();
        assert_eq!(terminal.status, JobStatus::Completed);
        assert!(rx.recv().await.is_none(), "stream must end after terminal");
        assert_eq!(bus.subscriber_count("job-1"), 0);
    }

    #[tokio::test]
    async fn dropped_subscriber_does_not_affect_others() {
        let bus = EventBus::new();
        let rx1 = bus.subscribe("job-1");
        let mut rx2 = bus.subscribe("job-1");
        drop(rx1);

        bus.publish(&running("job-1", 0.2));

        assert_eq!(rx2.recv().await.unwrap().progress, 0.2);
        assert_eq!(bus.subscriber_count("job-1"), 1);
    }

    #[tokio::test]
    async fn subscribe_after_terminal_receives_nothing_live() {
        let bus = EventBus::new();
        let _rx = bus.subscribe("job-1");
        bus.publish_terminal(&JobEvent::status("job-1", JobStatus::Canceled, 0.0));

        // A subscriber joining after the terminal event sees no live events;
        // the service layer serves such subscribers via store replay.
        let mut late = bus.subscribe("job-1");
        assert!(late.try_recv().is_err());
    }

    #[tokio::test]
    async fn prune_removes_dead_subscribers() {
        let bus = EventBus::new();
        let rx1 = bus.subscribe("job-1");
        let _rx2 = bus.subscribe("job-1");
        drop(rx1);

        bus.prune_closed("job-1");
        assert_eq!(bus.subscriber_count("job-1"), 1);

        drop(_rx2);
        bus.prune_closed("job-1");
        assert_eq!(bus.subscriber_count("job-1"), 0);
    }

    #[tokio::test]
    async fn segment_events_carry_payload() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe("job-1");

        bus.publish(&JobEvent::segment(
            "job-1",
            JobStatus::Running,
            0.5,
            SegmentPayload {
                idx: 0,
                start: 0.0,
                end: 5.0,
                text: "hello".into(),
            },
        ));

        let event = rx.recv().await.unwrap();
        let segment = event.segment.unwrap();
        assert_eq!(segment.idx, 0);
        assert_eq!(segment.text, "hello");
    }
}

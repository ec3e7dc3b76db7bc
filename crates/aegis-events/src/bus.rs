// bus.rs — The event bus.
//
// Topology: every source gets its own bounded queue (its backpressure
// budget); a forwarder task per source moves events into the single
// merged channel the correlator consumes, and mirrors them onto a
// broadcast channel for API subscribers. Per-source ordering is preserved
// end to end; cross-source ordering is unspecified.
//
// Drop policy under backpressure: low and medium severity events are shed
// when the source queue is full, counted, and reported as a source_drop
// event on the next successful publish. High and critical events apply
// backpressure instead; they are never shed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::{broadcast, mpsc};

use aegis_deploy::{CausalSink, CausalWindow};
use aegis_store::{EventKind, SecurityEvent, Severity};

/// Default per-source queue budget when config does not override it.
pub const DEFAULT_SOURCE_BUDGET: usize = 256;

/// The bus. One per daemon.
pub struct EventBus {
    merged_tx: mpsc::Sender<SecurityEvent>,
    merged_rx: Mutex<Option<mpsc::Receiver<SecurityEvent>>>,
    broadcast_tx: broadcast::Sender<SecurityEvent>,
    windows: Mutex<Vec<CausalWindow>>,
}

impl EventBus {
    pub fn new(merged_capacity: usize) -> Arc<Self> {
        let (merged_tx, merged_rx) = mpsc::channel(merged_capacity);
        let (broadcast_tx, _) = broadcast::channel(1024);
        Arc::new(Self {
            merged_tx,
            merged_rx: Mutex::new(Some(merged_rx)),
            broadcast_tx,
            windows: Mutex::new(Vec::new()),
        })
    }

    /// Take the single consumer end. The correlator pump calls this once.
    pub fn take_consumer(&self) -> Option<mpsc::Receiver<SecurityEvent>> {
        self.merged_rx.lock().expect("bus lock poisoned").take()
    }

    /// Live event stream for API subscribers. Slow subscribers lag and
    /// lose, they never block the pipeline.
    pub fn subscribe(&self) -> broadcast::Receiver<SecurityEvent> {
        self.broadcast_tx.subscribe()
    }

    /// Register a source and get its publisher handle.
    pub fn register_source(self: &Arc<Self>, name: impl Into<String>, budget: usize) -> SourcePublisher {
        let name = name.into();
        let (tx, mut rx) = mpsc::channel::<SecurityEvent>(budget.max(1));
        let bus = Arc::clone(self);
        let source = name.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let _ = bus.broadcast_tx.send(event.clone());
                if bus.merged_tx.send(event).await.is_err() {
                    tracing::warn!(source = %source, "merged channel closed; forwarder exiting");
                    break;
                }
            }
        });
        SourcePublisher {
            source_name: name,
            bus: Arc::clone(self),
            tx,
            dropped: AtomicU64::new(0),
        }
    }

    /// Stamp an event with the deployment that plausibly caused it.
    fn stamp(&self, event: &mut SecurityEvent) {
        if event.causal_tag.is_some() {
            return;
        }
        let now = Utc::now();
        let mut windows = self.windows.lock().expect("bus lock poisoned");
        windows.retain(|w| w.valid_until >= now);
        if let Some(window) = windows
            .iter()
            .find(|w| w.matches(event.source_ip, event.kind, event.observed_at))
        {
            event.causal_tag = Some(window.deployment_id);
        }
    }

    /// Currently active causal windows (status output).
    pub fn active_windows(&self) -> Vec<CausalWindow> {
        let now = Utc::now();
        self.windows
            .lock()
            .expect("bus lock poisoned")
            .iter()
            .filter(|w| w.valid_until >= now)
            .cloned()
            .collect()
    }
}

impl CausalSink for EventBus {
    fn publish(&self, window: CausalWindow) {
        tracing::debug!(deployment = %window.deployment_id, "causal window opened");
        self.windows.lock().expect("bus lock poisoned").push(window);
    }
}

/// A source's handle onto the bus.
pub struct SourcePublisher {
    source_name: String,
    bus: Arc<EventBus>,
    tx: mpsc::Sender<SecurityEvent>,
    dropped: AtomicU64,
}

impl SourcePublisher {
    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    /// Publish one event. Severity decides what happens when the queue is
    /// full: low/medium are shed and counted, high/critical wait.
    pub async fn publish(&self, mut event: SecurityEvent) -> Result<(), crate::error::SourceError> {
        self.bus.stamp(&mut event);

        match event.severity {
            Severity::High | Severity::Critical => {
                self.tx
                    .send(event)
                    .await
                    .map_err(|_| crate::error::SourceError::BusClosed)?;
            }
            Severity::Low | Severity::Medium => {
                if let Err(mpsc::error::TrySendError::Full(dropped)) = self.tx.try_send(event) {
                    let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    tracing::trace!(
                        source = %self.source_name,
                        severity = dropped.severity.as_str(),
                        total,
                        "queue full; event shed"
                    );
                    return Ok(());
                }
            }
        }

        self.flush_drop_count().await;
        Ok(())
    }

    /// Report shed events as a source_drop event. Called after successful
    /// publishes and by the supervisor on a timer, so the count always
    /// reaches the audit trail eventually.
    pub async fn flush_drop_count(&self) {
        let count = self.dropped.swap(0, Ordering::Relaxed);
        if count == 0 {
            return;
        }
        let event = SecurityEvent::new(&self.source_name, EventKind::SourceDrop, Severity::Low)
            .with_raw(format!("dropped={}", count));
        if self.tx.try_send(event).is_err() {
            // Still congested; put the count back for the next flush.
            self.dropped.fetch_add(count, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn event(severity: Severity) -> SecurityEvent {
        SecurityEvent::new("test", EventKind::AuthFail, severity)
            .with_source_ip("203.0.113.7".parse().unwrap())
    }

    #[tokio::test]
    async fn events_flow_to_consumer_in_order() {
        let bus = EventBus::new(64);
        let mut rx = bus.take_consumer().unwrap();
        let publisher = bus.register_source("test", 8);

        for _ in 0..3 {
            publisher.publish(event(Severity::Medium)).await.unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(rx.recv().await.unwrap());
        }
        assert_eq!(seen.len(), 3);
        // Observation order preserved.
        assert!(seen.windows(2).all(|w| w[0].observed_at <= w[1].observed_at));
    }

    #[tokio::test]
    async fn consumer_can_only_be_taken_once() {
        let bus = EventBus::new(8);
        assert!(bus.take_consumer().is_some());
        assert!(bus.take_consumer().is_none());
    }

    #[tokio::test]
    async fn low_severity_shed_under_backpressure_and_counted() {
        let bus = EventBus::new(1);
        // Do not drain the consumer: queues fill up.
        let _rx = bus.take_consumer().unwrap();
        let publisher = bus.register_source("floody", 2);

        for _ in 0..50 {
            publisher.publish(event(Severity::Low)).await.unwrap();
        }
        // Something was shed and counted rather than blocking.
        assert!(publisher.dropped.load(Ordering::Relaxed) > 0);
    }

    #[tokio::test]
    async fn drop_count_is_reported_when_queue_drains() {
        let bus = EventBus::new(64);
        let mut rx = bus.take_consumer().unwrap();
        let publisher = bus.register_source("floody", 1);

        // Saturate the tiny queue without draining it.
        for _ in 0..20 {
            publisher.publish(event(Severity::Low)).await.unwrap();
        }

        // Drain; the backlog plus an eventual source_drop report comes out.
        let mut kinds = Vec::new();
        publisher.flush_drop_count().await;
        while let Ok(ev) = tokio::time::timeout(std::time::Duration::from_millis(200), rx.recv()).await
        {
            match ev {
                Some(ev) => kinds.push(ev.kind),
                None => break,
            }
            if kinds.contains(&EventKind::SourceDrop) {
                break;
            }
            publisher.flush_drop_count().await;
        }
        assert!(
            kinds.contains(&EventKind::SourceDrop),
            "drop count never reported: {:?}",
            kinds
        );
    }

    #[tokio::test]
    async fn critical_events_are_never_shed() {
        let bus = EventBus::new(64);
        let mut rx = bus.take_consumer().unwrap();
        let publisher = bus.register_source("critical", 1);

        // Publisher blocks rather than sheds; drain concurrently.
        let send = tokio::spawn(async move {
            for _ in 0..10 {
                publisher.publish(event(Severity::Critical)).await.unwrap();
            }
        });

        let mut received = 0;
        while received < 10 {
            if rx.recv().await.is_some() {
                received += 1;
            }
        }
        send.await.unwrap();
        assert_eq!(received, 10);
    }

    #[tokio::test]
    async fn causal_window_stamps_matching_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.take_consumer().unwrap();
        let deployment_id = Uuid::new_v4();
        bus.publish(CausalWindow {
            deployment_id,
            subject: Some("198.51.100.9/32".parse().unwrap()),
            kinds: vec![EventKind::ConnDrop],
            valid_until: Utc::now() + chrono::Duration::hours(1),
        });

        let publisher = bus.register_source("kernel", 8);
        let tagged = SecurityEvent::new("kernel", EventKind::ConnDrop, Severity::Low)
            .with_source_ip("198.51.100.9".parse().unwrap());
        let untagged = SecurityEvent::new("kernel", EventKind::ConnDrop, Severity::Low)
            .with_source_ip("203.0.113.1".parse().unwrap());
        publisher.publish(tagged).await.unwrap();
        publisher.publish(untagged).await.unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.causal_tag, Some(deployment_id));
        assert_eq!(second.causal_tag, None);
    }

    #[tokio::test]
    async fn subscribers_see_published_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.take_consumer().unwrap();
        let mut sub = bus.subscribe();
        let publisher = bus.register_source("test", 8);

        publisher.publish(event(Severity::Medium)).await.unwrap();
        let consumed = rx.recv().await.unwrap();
        let observed = sub.recv().await.unwrap();
        assert_eq!(consumed.id, observed.id);
    }
}

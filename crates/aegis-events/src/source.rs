// source.rs — The log source contract and its supervisor.
//
// A source is a long-running task that turns an external input (log file,
// journal, feed) into SecurityEvents. Sources run independently: one
// stalled or crashing source never blocks the others. The supervisor
// restarts failed sources with exponential backoff and jitter, audits each
// restart, and stops cleanly on shutdown.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use aegis_store::{AuditAction, Store};

use crate::bus::{EventBus, SourcePublisher};
use crate::error::SourceError;

/// A producer of SecurityEvents.
#[async_trait]
pub trait LogSource: Send + Sync + 'static {
    /// Stable name (config key, event `source_name`).
    fn name(&self) -> &str;

    /// Per-source queue budget.
    fn budget(&self) -> usize {
        crate::bus::DEFAULT_SOURCE_BUDGET
    }

    /// Run until shutdown flips or an error occurs. Restartable: called
    /// again by the supervisor after failures, so implementations must
    /// resume from their persisted cursor.
    async fn run(
        &self,
        publisher: SourcePublisher,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), SourceError>;
}

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Run a source under supervision: panics and errors are contained,
/// logged, audited, and followed by a backoff-restart.
pub fn supervise(
    source: Arc<dyn LogSource>,
    bus: Arc<EventBus>,
    store: Arc<Store>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut failures: u32 = 0;
        loop {
            if *shutdown.borrow() {
                break;
            }
            let publisher = bus.register_source(source.name().to_string(), source.budget());
            let run_source = Arc::clone(&source);
            let run_shutdown = shutdown.clone();
            // Run in its own task so a panic is a JoinError here, not a
            // crash of the supervisor.
            let handle =
                tokio::spawn(async move { run_source.run(publisher, run_shutdown).await });

            let failure: Option<String> = match handle.await {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(err.to_string()),
                Err(join) if join.is_panic() => Some("source panicked".to_string()),
                Err(join) => Some(join.to_string()),
            };

            if *shutdown.borrow() {
                break;
            }
            let Some(reason) = failure else {
                // Clean exit without shutdown: treat as done.
                break;
            };

            failures += 1;
            let backoff = BACKOFF_BASE
                .saturating_mul(2u32.saturating_pow(failures.saturating_sub(1).min(16)))
                .min(BACKOFF_CAP);
            let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
            tracing::warn!(
                source = source.name(),
                %reason,
                failures,
                backoff_secs = backoff.as_secs(),
                "log source failed; restarting"
            );
            let _ = store.append_audit(
                source.name(),
                AuditAction::SourceRestarted,
                None,
                None,
                serde_json::json!({ "reason": reason, "failures": failures }),
            );

            tokio::select! {
                _ = tokio::time::sleep(backoff + jitter) => {}
                _ = shutdown.changed() => {}
            }
        }
        tracing::debug!(source = source.name(), "source supervisor stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakySource {
        runs: AtomicU32,
        fail_times: u32,
    }

    #[async_trait]
    impl LogSource for FlakySource {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn run(
            &self,
            _publisher: SourcePublisher,
            _shutdown: watch::Receiver<bool>,
        ) -> Result<(), SourceError> {
            let run = self.runs.fetch_add(1, Ordering::SeqCst);
            if run < self.fail_times {
                Err(SourceError::BusClosed)
            } else {
                Ok(())
            }
        }
    }

    struct PanickySource {
        runs: AtomicU32,
    }

    #[async_trait]
    impl LogSource for PanickySource {
        fn name(&self) -> &str {
            "panicky"
        }

        async fn run(
            &self,
            _publisher: SourcePublisher,
            _shutdown: watch::Receiver<bool>,
        ) -> Result<(), SourceError> {
            if self.runs.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("boom");
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_source_is_restarted_and_audited() {
        let bus = EventBus::new(16);
        let store = Arc::new(Store::open_in_memory().unwrap());
        let (_tx, shutdown) = watch::channel(false);
        let source = Arc::new(FlakySource {
            runs: AtomicU32::new(0),
            fail_times: 2,
        });

        let handle = supervise(source.clone(), bus, store.clone(), shutdown);
        handle.await.unwrap();

        // Two failures, then a clean run.
        assert_eq!(source.runs.load(Ordering::SeqCst), 3);
        let restarts = store
            .audit_tail(20)
            .unwrap()
            .iter()
            .filter(|r| r.action == AuditAction::SourceRestarted)
            .count();
        assert_eq!(restarts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn panic_does_not_kill_the_supervisor() {
        let bus = EventBus::new(16);
        let store = Arc::new(Store::open_in_memory().unwrap());
        let (_tx, shutdown) = watch::channel(false);
        let source = Arc::new(PanickySource {
            runs: AtomicU32::new(0),
        });

        let handle = supervise(source.clone(), bus, store, shutdown);
        handle.await.unwrap();
        assert_eq!(source.runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn shutdown_stops_supervision() {
        let bus = EventBus::new(16);
        let store = Arc::new(Store::open_in_memory().unwrap());
        let (tx, shutdown) = watch::channel(false);
        let source = Arc::new(FlakySource {
            runs: AtomicU32::new(0),
            fail_times: u32::MAX,
        });

        let handle = supervise(source, bus, store, shutdown);
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("supervisor exits on shutdown")
            .unwrap();
    }
}

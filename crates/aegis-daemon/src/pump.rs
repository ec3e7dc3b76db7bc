// pump.rs — The correlation pump.
//
// Single consumer of the event bus: every event is persisted, fed to the
// correlator, and any resulting assessments go to the autonomy
// controller. The pump is the only task that touches the correlator, so
// scoring stays deterministic.
//
// An optional slow-path classifier gets a second opinion on ambiguous
// assessments. It is best-effort with a hard timeout: unreachable, slow,
// or failing classification silently falls back to the fast path's kind.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use aegis_autonomy::AutonomyOutcome;
use aegis_correlate::{Correlator, SlowClassifier, ThreatAssessment};
use aegis_service::Facade;

use crate::flood_warning_event;

/// How often aggregation-mode counters are drained into assessments.
const AGGREGATE_DRAIN_INTERVAL: Duration = Duration::from_secs(30);

/// Budget for one slow-path classification.
const SLOW_PATH_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn run(
    facade: Arc<Facade>,
    mut correlator: Correlator,
    classifier: Option<Arc<dyn SlowClassifier>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let Some(mut rx) = facade.bus().take_consumer() else {
        tracing::error!("event bus consumer already taken; pump not running");
        return;
    };
    let mut drain_tick = tokio::time::interval(AGGREGATE_DRAIN_INTERVAL);

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else {
                    tracing::info!("event bus closed; pump exiting");
                    return;
                };
                if let Err(e) = facade.store().insert_event(&event) {
                    tracing::warn!(error = %e, "could not persist event");
                }

                let outcome = correlator.ingest(&event);
                if let Some(entering) = outcome.mode_switch {
                    let warning = flood_warning_event(entering);
                    let _ = facade.store().insert_event(&warning);
                }
                for mut assessment in outcome.assessments {
                    if correlator.is_ambiguous(&assessment) {
                        refine(&mut assessment, classifier.as_deref()).await;
                    }
                    dispatch(&facade, &assessment).await;
                }
            }
            _ = drain_tick.tick() => {
                if correlator.aggregation_mode() {
                    continue;
                }
                for assessment in correlator.drain_aggregates(chrono::Utc::now()) {
                    dispatch(&facade, &assessment).await;
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    tracing::info!("pump draining on shutdown");
                    return;
                }
            }
        }
    }
}

/// Ask the slow path to re-classify; keep the fast path's verdict on any
/// failure.
async fn refine(assessment: &mut ThreatAssessment, classifier: Option<&dyn SlowClassifier>) {
    let Some(classifier) = classifier else {
        return;
    };
    match tokio::time::timeout(SLOW_PATH_TIMEOUT, classifier.classify(assessment)).await {
        Ok(Ok(kind)) if kind != assessment.kind => {
            tracing::debug!(
                subject = %assessment.subject,
                from = assessment.kind.as_str(),
                to = kind.as_str(),
                "slow path re-classified assessment"
            );
            assessment.kind = kind;
        }
        Ok(Ok(_)) => {}
        Ok(Err(reason)) => {
            tracing::debug!(reason, "slow path declined; keeping fast-path kind");
        }
        Err(_) => {
            tracing::debug!("slow path timed out; keeping fast-path kind");
        }
    }
}

async fn dispatch(facade: &Arc<Facade>, assessment: &ThreatAssessment) {
    match facade.autonomy().handle(assessment).await {
        Ok(AutonomyOutcome::Deployed { deployment, .. }) => {
            tracing::info!(
                subject = %assessment.subject,
                deployment = %deployment.id,
                "autonomous block deployed"
            );
        }
        Ok(AutonomyOutcome::Proposed(proposal)) => {
            tracing::info!(
                subject = %assessment.subject,
                proposal = %proposal.id,
                "block proposed for operator approval"
            );
        }
        Ok(AutonomyOutcome::Suppressed { reason }) => {
            tracing::debug!(subject = %assessment.subject, reason, "response suppressed");
        }
        Err(e) => {
            tracing::error!(subject = %assessment.subject, error = %e, "autonomy handling failed");
        }
    }
}

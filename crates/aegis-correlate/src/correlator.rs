// correlator.rs — Windowed correlation over the event stream.
//
// One window per (subject, kind) holds an exponentially-decayed count,
// the distinct targets and sources seen, and the recent evidence ids.
// Scoring is pure arithmetic over the window: deterministic for a given
// event sequence, which is why the correlator is the stream's single
// consumer.
//
// Causal-tagged events never reach a window: an event the daemon caused
// must not feed the next escalation.

use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use aegis_store::{EventKind, SecurityEvent};

use crate::assessment::{Recommendation, ThreatAssessment, ThreatKind};

/// Correlator tuning. Thresholds are per threat kind; `emit_threshold`
/// is the score at which an assessment leaves the correlator.
#[derive(Debug, Clone)]
pub struct CorrelatorConfig {
    /// Half-life of the decayed per-window count.
    pub half_life_secs: f64,
    /// Decayed auth-fail count that saturates the brute-force score.
    pub brute_force_count: f64,
    /// Distinct ports/targets that saturate the port-scan score.
    pub scan_distinct_targets: usize,
    /// Decayed event count that saturates the rate-spike score.
    pub rate_spike_count: f64,
    /// Score at which an assessment is emitted.
    pub emit_threshold: f64,
    /// Per-subject quiet period after an assessment.
    pub cooldown_secs: i64,
    /// Global arrival rate (events/second, decayed) that flips the
    /// correlator into aggregation mode.
    pub flood_ceiling: f64,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            half_life_secs: 120.0,
            brute_force_count: 20.0,
            scan_distinct_targets: 10,
            rate_spike_count: 200.0,
            emit_threshold: 0.7,
            cooldown_secs: 600,
            flood_ceiling: 500.0,
        }
    }
}

/// What one ingested event produced.
#[derive(Debug, Default)]
pub struct IngestOutcome {
    pub assessments: Vec<ThreatAssessment>,
    /// Set when this event flipped aggregation mode on or off.
    pub mode_switch: Option<bool>,
}

/// Optional slow-path classifier for ambiguous assessments. The fast path
/// never depends on it; errors and timeouts degrade silently.
#[async_trait]
pub trait SlowClassifier: Send + Sync {
    async fn classify(&self, assessment: &ThreatAssessment) -> Result<ThreatKind, String>;
}

#[derive(Debug, Default)]
struct Window {
    count: f64,
    last_seen: Option<DateTime<Utc>>,
    targets: BTreeSet<String>,
    sources: BTreeSet<String>,
    evidence: Vec<Uuid>,
}

const EVIDENCE_CAP: usize = 64;
const TARGET_CAP: usize = 512;

impl Window {
    fn observe(&mut self, event: &SecurityEvent, half_life_secs: f64) {
        if let Some(last) = self.last_seen {
            let dt = (event.observed_at - last).num_milliseconds() as f64 / 1000.0;
            if dt > 0.0 {
                self.count *= 0.5f64.powf(dt / half_life_secs);
            }
        }
        self.count += 1.0;
        self.last_seen = Some(event.observed_at);
        if let Some(target) = &event.target {
            if self.targets.len() < TARGET_CAP {
                self.targets.insert(target.clone());
            }
        }
        self.sources.insert(event.source_name.clone());
        if self.evidence.len() == EVIDENCE_CAP {
            self.evidence.remove(0);
        }
        self.evidence.push(event.id);
    }
}

/// The correlator. Single-consumer: `ingest` is called from exactly one
/// task, in per-source observation order.
pub struct Correlator {
    config: CorrelatorConfig,
    windows: HashMap<(IpAddr, ThreatKind), Window>,
    cooldowns: HashMap<IpAddr, DateTime<Utc>>,
    /// Decayed global arrival rate, for flood detection.
    arrival_rate: f64,
    last_arrival: Option<DateTime<Utc>>,
    aggregation_mode: bool,
    /// Per-subject counters while in aggregation mode.
    aggregates: HashMap<IpAddr, u64>,
}

impl Correlator {
    pub fn new(config: CorrelatorConfig) -> Self {
        Self {
            config,
            windows: HashMap::new(),
            cooldowns: HashMap::new(),
            arrival_rate: 0.0,
            last_arrival: None,
            aggregation_mode: false,
            aggregates: HashMap::new(),
        }
    }

    pub fn aggregation_mode(&self) -> bool {
        self.aggregation_mode
    }

    /// Feed one event through the fast path.
    pub fn ingest(&mut self, event: &SecurityEvent) -> IngestOutcome {
        let mut outcome = IngestOutcome::default();

        // The daemon's own side effects are not threat evidence.
        if event.causal_tag.is_some() {
            return outcome;
        }
        // Bookkeeping events carry no subject signal.
        if event.kind == EventKind::SourceDrop {
            return outcome;
        }
        let Some(subject) = event.source_ip else {
            return outcome;
        };

        outcome.mode_switch = self.track_arrival(event.observed_at);

        if self.aggregation_mode {
            *self.aggregates.entry(subject).or_insert(0) += 1;
            return outcome;
        }

        let Some(kind) = threat_kind_for(event.kind) else {
            return outcome;
        };
        let window = self
            .windows
            .entry((subject, kind))
            .or_default();
        window.observe(event, self.config.half_life_secs);

        // Port scans accumulate across conn-drop evidence too; the scan
        // window sees every probe regardless of which kind keyed it.
        let score = self.score(subject, kind);
        if score >= self.config.emit_threshold && !self.cooldown_active(subject, event.observed_at)
        {
            let assessment = self.emit(subject, kind, score, event.observed_at);
            outcome.assessments.push(assessment);
        }
        outcome
    }

    /// Drain aggregation-mode counters into rate-spike assessments.
    /// Called by the pump once the flood subsides (or periodically).
    pub fn drain_aggregates(&mut self, now: DateTime<Utc>) -> Vec<ThreatAssessment> {
        let counters: Vec<(IpAddr, u64)> = self.aggregates.drain().collect();
        let mut out = Vec::new();
        for (subject, count) in counters {
            let score = (count as f64 / self.config.rate_spike_count).min(1.0);
            if score >= self.config.emit_threshold && !self.cooldown_active(subject, now) {
                self.cooldowns
                    .insert(subject, now + chrono::Duration::seconds(self.config.cooldown_secs));
                out.push(ThreatAssessment {
                    id: Uuid::new_v4(),
                    kind: ThreatKind::RateSpike,
                    subject,
                    score,
                    recommendation: Recommendation::RateLimit,
                    evidence: Vec::new(),
                    distinct_targets: 0,
                    targets: Vec::new(),
                    distinct_sources: 1,
                    expires_suggestion: now + ThreatKind::RateSpike.default_ttl(),
                    created_at: now,
                });
            }
        }
        out
    }

    /// An assessment in the band below certainty may be worth a second
    /// opinion from the slow path.
    pub fn is_ambiguous(&self, assessment: &ThreatAssessment) -> bool {
        assessment.score < 0.85 && assessment.kind != ThreatKind::FeedHit
    }

    fn track_arrival(&mut self, at: DateTime<Utc>) -> Option<bool> {
        if let Some(last) = self.last_arrival {
            let dt = (at - last).num_milliseconds() as f64 / 1000.0;
            if dt > 0.0 {
                // One-second half-life: the rate tracks the current burst.
                self.arrival_rate *= 0.5f64.powf(dt);
            }
        }
        self.arrival_rate += 1.0;
        self.last_arrival = Some(at);

        if !self.aggregation_mode && self.arrival_rate > self.config.flood_ceiling {
            self.aggregation_mode = true;
            tracing::warn!(
                rate = self.arrival_rate,
                "event flood; switching to aggregation mode"
            );
            Some(true)
        } else if self.aggregation_mode && self.arrival_rate < self.config.flood_ceiling / 2.0 {
            self.aggregation_mode = false;
            tracing::info!("event flood subsided; resuming full correlation");
            Some(false)
        } else {
            None
        }
    }

    fn cooldown_active(&self, subject: IpAddr, now: DateTime<Utc>) -> bool {
        self.cooldowns
            .get(&subject)
            .is_some_and(|until| *until > now)
    }

    fn score(&self, subject: IpAddr, kind: ThreatKind) -> f64 {
        let Some(window) = self.windows.get(&(subject, kind)) else {
            return 0.0;
        };
        let base = match kind {
            ThreatKind::BruteForce => (window.count / self.config.brute_force_count).min(1.0),
            ThreatKind::PortScan => {
                (window.targets.len() as f64 / self.config.scan_distinct_targets as f64).min(1.0)
            }
            ThreatKind::RateSpike => (window.count / self.config.rate_spike_count).min(1.0),
            // Listed is listed; corroborating local activity adds weight.
            ThreatKind::FeedHit => {
                if self.has_other_activity(subject, kind) {
                    1.0
                } else {
                    0.9
                }
            }
        };
        // Evidence from several independent sources is harder to spoof.
        let diversity_bonus = if window.sources.len() > 1 { 0.05 } else { 0.0 };
        (base + diversity_bonus).min(1.0)
    }

    fn has_other_activity(&self, subject: IpAddr, except: ThreatKind) -> bool {
        self.windows
            .iter()
            .any(|((ip, kind), w)| *ip == subject && *kind != except && w.count > 0.5)
    }

    fn emit(
        &mut self,
        subject: IpAddr,
        kind: ThreatKind,
        score: f64,
        now: DateTime<Utc>,
    ) -> ThreatAssessment {
        self.cooldowns
            .insert(subject, now + chrono::Duration::seconds(self.config.cooldown_secs));
        let window = &self.windows[&(subject, kind)];
        let recommendation = match kind {
            ThreatKind::RateSpike => Recommendation::RateLimit,
            _ if score >= self.config.emit_threshold => Recommendation::BlockSubject,
            _ => Recommendation::AlertOnly,
        };
        tracing::info!(
            subject = %subject,
            kind = kind.as_str(),
            score,
            "threat assessment emitted"
        );
        ThreatAssessment {
            id: Uuid::new_v4(),
            kind,
            subject,
            score,
            recommendation,
            evidence: window.evidence.clone(),
            distinct_targets: window.targets.len(),
            targets: window.targets.iter().take(8).cloned().collect(),
            distinct_sources: window.sources.len(),
            expires_suggestion: now + kind.default_ttl(),
            created_at: now,
        }
    }
}

/// Which threat kind an event kind feeds.
fn threat_kind_for(kind: EventKind) -> Option<ThreatKind> {
    match kind {
        EventKind::AuthFail => Some(ThreatKind::BruteForce),
        EventKind::PortScanHit | EventKind::ConnDrop => Some(ThreatKind::PortScan),
        EventKind::RateAnomaly => Some(ThreatKind::RateSpike),
        EventKind::FeedIndicator => Some(ThreatKind::FeedHit),
        EventKind::SourceDrop => None,
    }
}

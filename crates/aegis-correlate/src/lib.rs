//! # aegis-correlate
//!
//! The threat correlator: a single consumer over the event stream that
//! keeps exponentially-decayed windows per `(subject, kind)` and turns
//! sustained signal into [`ThreatAssessment`]s.
//!
//! Two-tier processing: the fast deterministic path handles the known
//! threat kinds (brute force, port scan, rate spike, feed hit) with no
//! external help, and stays fully functional when the optional slow-path
//! classifier is unreachable. Under event floods the correlator collapses
//! per-subject activity into aggregate counters and announces the mode
//! switch, so scoring cost stays bounded at any arrival rate.

pub mod assessment;
pub mod correlator;

pub use assessment::{Recommendation, ThreatAssessment, ThreatKind};
pub use correlator::{Correlator, CorrelatorConfig, IngestOutcome, SlowClassifier};

//! # aegis-autonomy
//!
//! The autonomous response controller: turns [`ThreatAssessment`]s into
//! deployed block rules, under hard safety gates evaluated in a fixed
//! order. Any gate failure aborts with an audit record. Nothing here ever
//! produces an `accept` rule, and rule bodies come from deterministic
//! templates keyed by threat kind, never from model output.
//!
//! Gate order: never-block, circuit breaker, per-subject cooldown,
//! conflict against operator rules, management self-lockout, autonomy
//! level. A global creation rate limit applies after the gates,
//! independently of the breaker.
//!
//! [`ThreatAssessment`]: aegis_correlate::ThreatAssessment

pub mod controller;
pub mod error;
pub mod template;

pub use controller::{AutonomyConfig, AutonomyController, AutonomyLevel, AutonomyOutcome};
pub use error::AutonomyError;
pub use template::{scope_within, template_rule};

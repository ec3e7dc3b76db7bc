//! # aegis-deploy
//!
//! The deployment controller: the only code path that mutates a live
//! firewall ruleset.
//!
//! State machine per deployment:
//!
//! ```text
//! queued ──▶ applying ──ok──▶ probation ──heartbeat-ok──▶ committed
//!               │                  │
//!               │                  └──heartbeat-miss──▶ rolled_back
//!               └──error──▶ failed
//! ```
//!
//! Before any apply the controller snapshots the ruleset and persists the
//! backup reference; rollback is a single atomic restore of that snapshot.
//! While in probation a reachability probe must keep succeeding, or the
//! deployment rolls back: a firewall change that cuts the operator off
//! undoes itself.

pub mod causal;
pub mod controller;
pub mod error;
pub mod probe;

pub use causal::{CausalSink, CausalWindow};
pub use controller::{DeployConfig, DeploymentController};
pub use error::DeployError;
pub use probe::{DisabledProbe, FnProbe, ReachabilityProbe, TcpProbe};

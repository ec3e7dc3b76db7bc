//! # aegis-analyzer
//!
//! Conflict and shadowing analysis over parsed rulesets.
//!
//! Given a candidate rule and the current ruleset, the analyzer reports
//! where the candidate is shadowed, redundant, contradicted, or partially
//! overlapped. It is pure: it never touches the store or the backend, and
//! its findings are warnings: deployment over conflicts is permitted,
//! except that autonomous logic refuses to deploy over a shadow or
//! contradiction of an operator rule (enforced by the autonomy gates).
//!
//! Shadowing semantics respect the backend's evaluation order: under
//! first-match an earlier subsuming rule shadows; under last-match a later
//! one does.

pub mod analyzer;
pub mod matchset;

pub use analyzer::{analyze, ConflictFinding, ConflictKind, ConflictReport};
pub use matchset::MatchSet;

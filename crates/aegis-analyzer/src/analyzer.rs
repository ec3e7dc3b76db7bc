// analyzer.rs — Conflict detection between a candidate and the ruleset.
//
// The candidate is analyzed as if appended to the current ruleset: it
// evaluates after every existing rule of equal priority (insertion order
// breaks priority ties, and the candidate is newest).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use aegis_backend::EvaluationOrder;
use aegis_policy::{PolicyRule, RuleOrigin};

use crate::matchset::MatchSet;

/// What kind of conflict a finding describes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// An earlier rule fully subsumes the candidate; it will never match.
    Shadow,
    /// A later rule subsumes the candidate (last-match backends only).
    ShadowedByLater,
    /// Exact duplicate after canonicalization.
    Redundant,
    /// Same match set, opposite action.
    Contradiction,
    /// Partial intersection with a differing action.
    Overlap,
}

/// One conflict between the candidate and an existing rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictFinding {
    pub kind: ConflictKind,
    /// The existing rule involved.
    pub other_rule_id: Uuid,
    pub other_origin: RuleOrigin,
    pub detail: String,
}

/// All findings for one candidate. Findings are warnings, not errors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConflictReport {
    pub findings: Vec<ConflictFinding>,
}

impl ConflictReport {
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }

    /// Does any finding shadow or contradict a rule with the given origin?
    /// Autonomous deployment refuses when this is true for operator rules.
    pub fn shadows_or_contradicts_origin(&self, origin: RuleOrigin) -> bool {
        self.findings.iter().any(|f| {
            f.other_origin == origin
                && matches!(
                    f.kind,
                    ConflictKind::Shadow | ConflictKind::ShadowedByLater | ConflictKind::Contradiction
                )
        })
    }
}

/// Analyze a candidate against the current ruleset.
///
/// `existing` must be in ruleset insertion order (as reported by the
/// adapter's rule listing); the analyzer re-sorts by priority with
/// insertion order as the tie-break.
pub fn analyze(
    candidate: &PolicyRule,
    existing: &[PolicyRule],
    order: EvaluationOrder,
) -> ConflictReport {
    let candidate_set = MatchSet::of(candidate);
    let mut report = ConflictReport::default();

    for other in existing {
        if other.id == candidate.id {
            continue;
        }
        let other_set = MatchSet::of(other);
        if !candidate_set.overlaps(&other_set) {
            continue;
        }

        // Equal priority: the existing rule was inserted first, so it
        // evaluates before the candidate.
        let other_evaluates_first = other.priority <= candidate.priority;

        let finding = if candidate.same_match(other) {
            if candidate.action == other.action {
                Some((
                    ConflictKind::Redundant,
                    format!("exact duplicate of rule {}", other.id),
                ))
            } else {
                Some((
                    ConflictKind::Contradiction,
                    format!(
                        "same match as rule {} with action {} vs {}",
                        other.id, candidate.action, other.action
                    ),
                ))
            }
        } else if other_set.contains(&candidate_set) {
            match order {
                EvaluationOrder::FirstMatch if other_evaluates_first => Some((
                    ConflictKind::Shadow,
                    format!("rule {} evaluates first and subsumes this rule", other.id),
                )),
                EvaluationOrder::LastMatch if !other_evaluates_first => Some((
                    ConflictKind::ShadowedByLater,
                    format!("rule {} evaluates later and subsumes this rule", other.id),
                )),
                _ if candidate.action != other.action => Some((
                    ConflictKind::Overlap,
                    format!("subsumed by rule {} with a different action", other.id),
                )),
                _ => None,
            }
        } else if candidate.action != other.action {
            Some((
                ConflictKind::Overlap,
                format!(
                    "partially intersects rule {} with action {} vs {}",
                    other.id, candidate.action, other.action
                ),
            ))
        } else {
            None
        };

        if let Some((kind, detail)) = finding {
            report.findings.push(ConflictFinding {
                kind,
                other_rule_id: other.id,
                other_origin: other.origin,
                detail,
            });
        }
    }

    if !report.is_clean() {
        tracing::debug!(
            candidate = %candidate.id,
            findings = report.findings.len(),
            "conflict analysis produced findings"
        );
    }
    report
}

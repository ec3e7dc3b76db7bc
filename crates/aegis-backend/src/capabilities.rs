// capabilities.rs — What a backend can express.
//
// The facade checks a rule against the active adapter's capabilities
// before accepting it, so an unsupported feature is a typed validation
// failure instead of a backend syntax error at apply time.

use serde::{Deserialize, Serialize};

use aegis_policy::{Action, Family, PolicyRule};

/// Whether the backend evaluates the first or the last matching rule.
/// Shadowing analysis depends on this.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationOrder {
    FirstMatch,
    LastMatch,
}

/// Capability set advertised by an adapter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Capabilities {
    pub supports_deny: bool,
    pub supports_stateful: bool,
    pub supports_rate_limit: bool,
    pub supports_ipv6: bool,
    pub supports_priority: bool,
    pub evaluation_order: EvaluationOrder,
    pub supports_atomic_replace: bool,
    pub supports_delta_ops: bool,
}

impl Capabilities {
    /// Capability names a rule requires that this backend lacks.
    /// Empty means the rule is expressible.
    pub fn missing_for(&self, rule: &PolicyRule) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if !self.supports_deny && matches!(rule.action, Action::Drop | Action::Reject) {
            missing.push("deny");
        }
        if !self.supports_stateful && rule.stateful {
            missing.push("stateful");
        }
        if !self.supports_rate_limit && rule.rate_limit.is_some() {
            missing.push("rate_limit");
        }
        if !self.supports_ipv6 && self.rule_needs_ipv6(rule) {
            missing.push("ipv6");
        }
        if !self.supports_priority && rule.priority != 0 {
            missing.push("priority");
        }
        missing
    }

    fn rule_needs_ipv6(&self, rule: &PolicyRule) -> bool {
        if rule.family == Family::Ipv6 {
            return true;
        }
        [rule.source_net(), rule.destination_net()]
            .into_iter()
            .flatten()
            .any(|net| !net.is_ipv4())
    }
}

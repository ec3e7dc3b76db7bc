// template.rs — Deterministic rule templates.
//
// Every autonomous rule body is produced here, parameterized only by the
// assessment: same assessment, same rule. Drop-only, narrowest subject the
// evidence names (/32 or /128 for a single address), ports when the
// evidence identifies them, kind-specific expiry, and the assessment id in
// the comment so the audit trail links rule to evidence.

use aegis_correlate::{ThreatAssessment, ThreatKind};
use aegis_policy::{
    Action, Direction, IpNet, PolicyError, PolicyRule, PortSpec, Protocol, RuleOrigin,
};

/// Is a subject network at or narrower than the configured widest CIDR?
/// Broader is refused; exactly `max` is accepted.
pub fn scope_within(net: &IpNet, max_v4: u8, max_v6: u8) -> bool {
    let max = if net.is_ipv4() { max_v4 } else { max_v6 };
    !net.broader_than(max)
}

/// Build the block rule for an assessment.
///
/// `origin` is `daemon-auto` when autonomy deploys it itself and
/// `daemon-propose` when it goes to the approval queue instead.
pub fn template_rule(
    assessment: &ThreatAssessment,
    origin: RuleOrigin,
) -> Result<PolicyRule, PolicyError> {
    let subject = IpNet::host(assessment.subject);

    let mut builder = PolicyRule::builder()
        .direction(Direction::Input)
        .action(Action::Drop)
        .source_net(subject)
        .origin(origin)
        .log(true)
        .expires_at(assessment.expires_suggestion)
        .comment(format!(
            "auto {} assessment {}",
            assessment.kind.as_str(),
            assessment.id
        ));

    // Scope to ports only when the evidence names them; a scan or a feed
    // hit blocks the subject outright.
    if let Some(ports) = evidence_ports(assessment) {
        builder = builder.protocol(Protocol::Tcp).destination_port(ports);
    }

    builder.build()
}

// Targets look like "ssh:<user>" or "port/<n>". A brute-force assessment
// against ssh maps to 22; explicit port targets map to themselves.
fn evidence_ports(assessment: &ThreatAssessment) -> Option<PortSpec> {
    match assessment.kind {
        ThreatKind::FeedHit | ThreatKind::RateSpike | ThreatKind::PortScan => None,
        ThreatKind::BruteForce => {
            let mut ports: Vec<u16> = assessment
                .targets
                .iter()
                .filter_map(|t| t.strip_prefix("port/")?.parse().ok())
                .collect();
            if ports.is_empty() && assessment.targets.iter().any(|t| t.starts_with("ssh:")) {
                ports.push(22);
            }
            match ports.len() {
                0 => None,
                1 => Some(PortSpec::Single(ports[0])),
                _ => Some(PortSpec::List(ports)),
            }
        }
    }
}

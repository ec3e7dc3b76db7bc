// parse.rs — Lifting nft list output back into the neutral model.
//
// `nft list table inet aegis` prints the table body. We walk it line by
// line, tracking the current chain, and lift each rule line into a
// PolicyRule. Features we cannot express neutrally are reported as
// warnings, never dropped on the floor.

use regex::Regex;
use uuid::Uuid;

use aegis_backend::RenderedRule;
use aegis_policy::{Action, Direction, PolicyRule, PortSpec, Protocol, RuleOrigin};

/// A rule line with its surrounding context.
#[derive(Debug, Clone)]
pub struct RuleLine {
    pub chain: String,
    pub text: String,
    /// `# handle N` suffix when listed with `nft -a`.
    pub handle: Option<u64>,
    /// Rule id recovered from an `aegis:<uuid>` comment.
    pub rule_id: Option<Uuid>,
}

/// Extract the rule lines from a table listing.
pub fn rule_lines(listing: &str) -> Vec<RuleLine> {
    let chain_re = Regex::new(r"^\s*chain\s+(\S+)\s*\{").unwrap();
    let handle_re = Regex::new(r"#\s*handle\s+(\d+)\s*$").unwrap();
    let id_re = Regex::new(r#"comment "aegis:([0-9a-fA-F-]{36})"#).unwrap();

    let mut lines = Vec::new();
    let mut current_chain: Option<String> = None;

    for raw in listing.lines() {
        let line = raw.trim();
        if let Some(caps) = chain_re.captures(raw) {
            current_chain = Some(caps[1].to_string());
            continue;
        }
        if line == "}" {
            current_chain = None;
            continue;
        }
        let Some(chain) = &current_chain else { continue };
        if line.is_empty()
            || line.starts_with("type ")
            || line.starts_with("policy ")
            || line.starts_with("table ")
        {
            continue;
        }

        let handle = handle_re
            .captures(line)
            .and_then(|c| c[1].parse::<u64>().ok());
        let text = handle_re.replace(line, "").trim().to_string();
        let rule_id = id_re
            .captures(&text)
            .and_then(|c| c[1].parse::<Uuid>().ok());

        lines.push(RuleLine {
            chain: chain.clone(),
            text,
            handle,
            rule_id,
        });
    }
    lines
}

/// The active rules as opaque rendered text.
pub fn list_rendered(listing: &str, backend_name: &str) -> Vec<RenderedRule> {
    rule_lines(listing)
        .into_iter()
        .map(|line| RenderedRule {
            backend_name: backend_name.to_string(),
            rule_id: line.rule_id,
            placement: Some(line.chain),
            text: line.text,
        })
        .collect()
}

/// Find the kernel handle of the rule with the given id (listing must come
/// from `nft -a`).
pub fn find_handle(listing: &str, rule_id: Uuid) -> Option<(String, u64)> {
    rule_lines(listing)
        .into_iter()
        .find(|line| line.rule_id == Some(rule_id))
        .and_then(|line| line.handle.map(|h| (line.chain, h)))
}

/// Best-effort lift of a table listing into PolicyRules. Returns the rules
/// plus warnings for anything that would not survive the round trip.
pub fn lift_rules(listing: &str) -> (Vec<PolicyRule>, Vec<String>) {
    let mut rules = Vec::new();
    let mut warnings = Vec::new();

    for line in rule_lines(listing) {
        match lift_rule(&line) {
            Ok((rule, mut warns)) => {
                rules.push(rule);
                warnings.append(&mut warns);
            }
            Err(reason) => {
                warnings.push(format!(
                    "could not lift rule in chain {}: {} ({})",
                    line.chain, line.text, reason
                ));
            }
        }
    }
    (rules, warnings)
}

fn lift_rule(line: &RuleLine) -> Result<(PolicyRule, Vec<String>), String> {
    let addr_re = Regex::new(r"\b(ip6?)\s+(saddr|daddr)\s+([0-9a-fA-F:.]+(?:/\d+)?)").unwrap();
    let port_re = Regex::new(r"\b(tcp|udp)\s+(sport|dport)\s+(?:\{\s*([^}]*)\}|(\d+)(?:-(\d+))?)")
        .unwrap();
    let l4_re = Regex::new(r"meta l4proto\s+(?:\{\s*)?(tcp|udp|icmp)").unwrap();
    let rate_re = Regex::new(r"limit rate (\d+)/(second|minute|hour|day)").unwrap();
    let comment_re = Regex::new(r#"comment "aegis:[0-9a-fA-F-]{36}\s*([^"]*)""#).unwrap();

    let direction = match line.chain.as_str() {
        "input" => Direction::Input,
        "output" => Direction::Output,
        "forward" => Direction::Forward,
        other => return Err(format!("unknown chain '{}'", other)),
    };

    let action = if line.text.contains(" drop") || line.text.ends_with("drop") {
        Action::Drop
    } else if line.text.contains(" reject") {
        Action::Reject
    } else if line.text.contains(" accept") {
        Action::Accept
    } else {
        return Err("no recognizable verdict".to_string());
    };

    let mut warnings = Vec::new();
    let mut builder = PolicyRule::builder()
        .direction(direction)
        .action(action)
        .origin(RuleOrigin::Imported);

    for caps in addr_re.captures_iter(&line.text) {
        let net = caps[3]
            .parse()
            .map_err(|_| format!("bad address '{}'", &caps[3]))?;
        builder = match &caps[2] {
            "saddr" => builder.source_net(net),
            _ => builder.destination_net(net),
        };
    }

    let mut protocol = None;
    for caps in port_re.captures_iter(&line.text) {
        protocol = Some(match &caps[1] {
            "tcp" => Protocol::Tcp,
            _ => Protocol::Udp,
        });
        let spec = if let Some(list) = caps.get(3) {
            let ports: Result<Vec<u16>, _> = list
                .as_str()
                .split(',')
                .map(|p| p.trim().parse::<u16>())
                .collect();
            PortSpec::List(ports.map_err(|_| "bad port list".to_string())?)
        } else if let (Some(start), Some(end)) = (caps.get(4), caps.get(5)) {
            PortSpec::Range {
                start: start.as_str().parse().map_err(|_| "bad port".to_string())?,
                end: end.as_str().parse().map_err(|_| "bad port".to_string())?,
            }
        } else if let Some(single) = caps.get(4) {
            PortSpec::Single(single.as_str().parse().map_err(|_| "bad port".to_string())?)
        } else {
            return Err("unparseable port match".to_string());
        };
        builder = match &caps[2] {
            "sport" => builder.source_port(spec),
            _ => builder.destination_port(spec),
        };
    }

    if protocol.is_none() {
        if let Some(caps) = l4_re.captures(&line.text) {
            protocol = Some(match &caps[1] {
                "tcp" => Protocol::Tcp,
                "udp" => Protocol::Udp,
                _ => Protocol::Icmp,
            });
        }
    }
    builder = builder.protocol(protocol.unwrap_or(Protocol::Any));

    builder = builder.stateful(line.text.contains("ct state new"));

    if let Some(caps) = rate_re.captures(&line.text) {
        let count: u32 = caps[1].parse().map_err(|_| "bad rate".to_string())?;
        let per_secs = match &caps[2] {
            "second" => 1,
            "minute" => 60,
            "hour" => 3600,
            _ => 86400,
        };
        builder = builder.rate_limit(count, per_secs);
    }

    builder = builder.log(line.text.contains("log prefix"));

    if let Some(caps) = comment_re.captures(&line.text) {
        builder = builder.comment(caps[1].trim().to_string());
    } else if line.text.contains("comment") && line.rule_id.is_none() {
        warnings.push(format!(
            "foreign comment preserved only as text in chain {}",
            line.chain
        ));
    }

    let mut rule = builder.build().map_err(|e| e.to_string())?;
    if let Some(id) = line.rule_id {
        rule.id = id;
    }

    // Statements we knowingly do not model.
    for feature in ["jump ", "goto ", "masquerade", "dnat ", "snat ", "queue"] {
        if line.text.contains(feature) {
            warnings.push(format!(
                "rule in chain {} uses '{}' which the neutral model cannot express",
                line.chain,
                feature.trim()
            ));
        }
    }

    Ok((rule, warnings))
}

// render.rs — PolicyRule → nft syntax.
//
// Rendering is pure text assembly. Each rule becomes one line of matches,
// statements, a verdict, and a comment carrying the rule id
// (`"aegis:<uuid> ..."`), which is how list/import/delta find the rule
// again later.

use aegis_backend::AdapterError;
use aegis_policy::{Action, AddrSpec, Direction, Family, PolicyRule, PortSpec, Protocol};

/// Chain name for a direction; chains are named after their hooks.
pub fn chain_for(direction: Direction) -> &'static str {
    match direction {
        Direction::Input => "input",
        Direction::Output => "output",
        Direction::Forward => "forward",
    }
}

/// Render one rule body (everything after `add rule <table> <chain>`).
pub fn render_rule(rule: &PolicyRule) -> Result<String, AdapterError> {
    let rule = rule.canonical();
    let mut parts: Vec<String> = Vec::new();

    // Family narrowing when no address pins it down.
    if rule.source_net().is_none() && rule.destination_net().is_none() {
        match rule.family {
            Family::Ipv4 => parts.push("meta nfproto ipv4".to_string()),
            Family::Ipv6 => parts.push("meta nfproto ipv6".to_string()),
            Family::Both => {}
        }
    }

    if let Some(spec) = &rule.source {
        parts.push(render_addr(spec, rule.family, "saddr"));
    }
    if let Some(spec) = &rule.destination {
        parts.push(render_addr(spec, rule.family, "daddr"));
    }

    match rule.protocol {
        Protocol::Tcp | Protocol::Udp => {
            let proto = rule.protocol.to_string();
            let mut port_match = false;
            if let Some(ports) = &rule.source_port {
                parts.push(format!("{} sport {}", proto, render_ports(ports)));
                port_match = true;
            }
            if let Some(ports) = &rule.destination_port {
                parts.push(format!("{} dport {}", proto, render_ports(ports)));
                port_match = true;
            }
            if !port_match {
                parts.push(format!("meta l4proto {}", proto));
            }
        }
        Protocol::Icmp => parts.push("meta l4proto { icmp, ipv6-icmp }".to_string()),
        Protocol::Any => {}
    }

    if rule.stateful {
        parts.push("ct state new".to_string());
    }

    if let Some(rate) = &rule.rate_limit {
        parts.push(format!("limit rate {}", render_rate(rate.count, rate.per_secs)));
    }

    parts.push("counter".to_string());

    if rule.log {
        parts.push(format!("log prefix \"aegis-{} \"", rule.action));
    }

    match rule.action {
        Action::Drop => parts.push("drop".to_string()),
        Action::Reject => parts.push("reject".to_string()),
        Action::Accept => parts.push("accept".to_string()),
    }

    let comment = if rule.comment.is_empty() {
        format!("aegis:{}", rule.id)
    } else {
        format!("aegis:{} {}", rule.id, rule.comment)
    };
    parts.push(format!("comment \"{}\"", comment));

    Ok(parts.join(" "))
}

fn render_addr(spec: &AddrSpec, family: Family, side: &str) -> String {
    match spec {
        AddrSpec::Net(net) => {
            let proto = if net.is_ipv4() { "ip" } else { "ip6" };
            if net.prefix() == if net.is_ipv4() { 32 } else { 128 } {
                format!("{} {} {}", proto, side, net.addr())
            } else {
                format!("{} {} {}", proto, side, net)
            }
        }
        AddrSpec::Set(name) => {
            let proto = if family == Family::Ipv6 { "ip6" } else { "ip" };
            format!("{} {} @{}", proto, side, name)
        }
    }
}

fn render_ports(spec: &PortSpec) -> String {
    match spec.canonical() {
        PortSpec::Single(p) => p.to_string(),
        PortSpec::Range { start, end } => format!("{}-{}", start, end),
        PortSpec::List(ports) => {
            let items: Vec<String> = ports.iter().map(u16::to_string).collect();
            format!("{{ {} }}", items.join(", "))
        }
    }
}

// nft limit units are second/minute/hour/day; pick the unit the window
// divides into evenly, scaling the count when needed.
fn render_rate(count: u32, per_secs: u32) -> String {
    match per_secs {
        1 => format!("{}/second", count),
        60 => format!("{}/minute", count),
        3600 => format!("{}/hour", count),
        86400 => format!("{}/day", count),
        secs if secs % 3600 == 0 => {
            format!("{}/hour", ((count as u64) / (secs as u64 / 3600).max(1)).max(1))
        }
        secs if secs % 60 == 0 => {
            format!("{}/minute", ((count as u64) / (secs as u64 / 60).max(1)).max(1))
        }
        secs => format!("{}/second", ((count as u64) / (secs as u64).max(1)).max(1)),
    }
}

/// Build the complete replacement image: add-if-missing, flush, and the
/// full table body, loaded by nft as a single transaction. An image with
/// no rules is valid and atomically empties the table.
pub fn build_image(table_spec: &str, rendered: &[(Direction, String)]) -> String {
    let mut image = String::new();
    image.push_str(&format!("add table {}\n", table_spec));
    image.push_str(&format!("flush table {}\n", table_spec));
    image.push_str(&format!("table {} {{\n", table_spec));

    for direction in [Direction::Input, Direction::Output, Direction::Forward] {
        let chain = chain_for(direction);
        image.push_str(&format!(
            "\tchain {} {{\n\t\ttype filter hook {} priority 0; policy accept;\n",
            chain, chain
        ));
        for (dir, body) in rendered {
            if *dir == direction {
                image.push_str(&format!("\t\t{}\n", body));
            }
        }
        image.push_str("\t}\n");
    }

    image.push_str("}\n");
    image
}

// parsers.rs — Log line parsers.
//
// Each log source declares a parser; a parser turns one line into at most
// one SecurityEvent (source_name and observed_at are filled by the
// caller). Unrecognized lines are simply skipped; log files are full of
// noise that is not security signal.

use std::net::IpAddr;

use regex::Regex;

use aegis_store::{EventKind, SecurityEvent, Severity};

/// Turns log lines into events.
pub trait LineParser: Send + Sync {
    fn parse(&self, line: &str) -> Option<SecurityEvent>;
}

/// Parser for sshd authentication logs.
///
/// Matches `Failed password for [invalid user] <user> from <ip> port <p>`
/// and `Invalid user <user> from <ip>` shapes.
pub struct SshdParser {
    failed: Regex,
    invalid: Regex,
}

impl SshdParser {
    pub fn new() -> Self {
        Self {
            failed: Regex::new(
                r"Failed (?:password|publickey|keyboard-interactive\S*) for (?:invalid user )?(\S+) from (\S+) port (\d+)",
            )
            .expect("static regex"),
            invalid: Regex::new(r"Invalid user (\S+) from (\S+)").expect("static regex"),
        }
    }

    fn event(&self, user: &str, ip: &str, line: &str) -> Option<SecurityEvent> {
        let ip: IpAddr = ip.parse().ok()?;
        Some(
            SecurityEvent::new("", EventKind::AuthFail, Severity::Medium)
                .with_source_ip(ip)
                .with_target(format!("ssh:{}", user))
                .with_raw(line),
        )
    }
}

impl Default for SshdParser {
    fn default() -> Self {
        Self::new()
    }
}

impl LineParser for SshdParser {
    fn parse(&self, line: &str) -> Option<SecurityEvent> {
        if let Some(caps) = self.failed.captures(line) {
            return self.event(&caps[1], &caps[2], line);
        }
        if let Some(caps) = self.invalid.captures(line) {
            return self.event(&caps[1], &caps[2], line);
        }
        None
    }
}

/// Parser for kernel netfilter log lines (the `log prefix` statements our
/// own rules emit, and any other `SRC=`/`DPT=` formatted drop logging).
pub struct KernelDropParser {
    src: Regex,
    dpt: Regex,
}

impl KernelDropParser {
    pub fn new() -> Self {
        Self {
            src: Regex::new(r"\bSRC=(\S+)").expect("static regex"),
            dpt: Regex::new(r"\bDPT=(\d+)").expect("static regex"),
        }
    }
}

impl Default for KernelDropParser {
    fn default() -> Self {
        Self::new()
    }
}

impl LineParser for KernelDropParser {
    fn parse(&self, line: &str) -> Option<SecurityEvent> {
        let caps = self.src.captures(line)?;
        let ip: IpAddr = caps.get(1)?.as_str().parse().ok()?;
        let mut event = SecurityEvent::new("", EventKind::ConnDrop, Severity::Low)
            .with_source_ip(ip)
            .with_raw(line);
        if let Some(caps) = self.dpt.captures(line) {
            event = event.with_target(format!("port/{}", &caps[1]));
        }
        Some(event)
    }
}

/// Look up a parser by its config name.
pub fn parser_by_name(name: &str) -> Option<Box<dyn LineParser>> {
    match name {
        "sshd" => Some(Box::new(SshdParser::new())),
        "kernel" => Some(Box::new(KernelDropParser::new())),
        _ => None,
    }
}

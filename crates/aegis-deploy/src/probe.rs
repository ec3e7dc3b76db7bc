// probe.rs — Reachability probes for the probation heartbeat.
//
// A deployment survives probation only while its probe keeps passing.
// The production probe checks two legs, both mandatory: the host can
// still reach a configured liveness target, and the management endpoint
// still accepts connections. An environment that cannot configure both
// legs fails closed; the DisabledProbe variant must be chosen explicitly
// in config to opt out.

use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

/// The heartbeat's view of the world. `probe()` blocks up to its own
/// timeout; the heartbeat task runs it off the async scheduler.
pub trait ReachabilityProbe: Send + Sync {
    /// Ok when the host is still reachable; Err carries the reason.
    fn probe(&self) -> Result<(), String>;

    /// Human-readable description for logs and status output.
    fn describe(&self) -> String;
}

/// TCP connect probe: an outbound liveness target and the management
/// endpoint. Both legs must succeed; either failing is a heartbeat miss.
pub struct TcpProbe {
    /// Something the host must always be able to reach (gateway, resolver).
    pub liveness_target: SocketAddr,
    /// The management endpoint that must keep accepting connections
    /// (e.g. the local sshd).
    pub management_endpoint: SocketAddr,
    pub timeout: Duration,
}

impl ReachabilityProbe for TcpProbe {
    fn probe(&self) -> Result<(), String> {
        TcpStream::connect_timeout(&self.liveness_target, self.timeout)
            .map_err(|e| format!("liveness target {} unreachable: {}", self.liveness_target, e))?;
        TcpStream::connect_timeout(&self.management_endpoint, self.timeout).map_err(|e| {
            format!(
                "management endpoint {} unreachable: {}",
                self.management_endpoint, e
            )
        })?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!(
            "tcp {} + management {}",
            self.liveness_target, self.management_endpoint
        )
    }
}

/// Probe explicitly disabled by the operator. Always passes; the
/// deployment commits when probation elapses.
pub struct DisabledProbe;

impl ReachabilityProbe for DisabledProbe {
    fn probe(&self) -> Result<(), String> {
        Ok(())
    }

    fn describe(&self) -> String {
        "disabled".to_string()
    }
}

/// Closure-backed probe for tests.
pub struct FnProbe<F>(pub F);

impl<F> ReachabilityProbe for FnProbe<F>
where
    F: Fn() -> Result<(), String> + Send + Sync,
{
    fn probe(&self) -> Result<(), String> {
        (self.0)()
    }

    fn describe(&self) -> String {
        "fn".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn dead_port() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener); // port now closed
        addr
    }

    #[test]
    fn tcp_probe_succeeds_when_both_legs_answer() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let probe = TcpProbe {
            liveness_target: addr,
            management_endpoint: addr,
            timeout: Duration::from_millis(500),
        };
        assert!(probe.probe().is_ok());
    }

    #[test]
    fn tcp_probe_fails_when_liveness_leg_is_down() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let live = listener.local_addr().unwrap();
        let probe = TcpProbe {
            liveness_target: dead_port(),
            management_endpoint: live,
            timeout: Duration::from_millis(200),
        };
        let err = probe.probe().unwrap_err();
        assert!(err.contains("liveness target"));
    }

    #[test]
    fn tcp_probe_fails_when_management_leg_is_down() {
        // Liveness answering is not enough; the management leg must too.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let live = listener.local_addr().unwrap();
        let probe = TcpProbe {
            liveness_target: live,
            management_endpoint: dead_port(),
            timeout: Duration::from_millis(200),
        };
        let err = probe.probe().unwrap_err();
        assert!(err.contains("management endpoint"));
    }

    #[test]
    fn disabled_probe_always_passes() {
        assert!(DisabledProbe.probe().is_ok());
    }
}

// config.rs — The aegis.toml configuration surface.
//
// The recognized option set is closed: every section carries
// deny_unknown_fields, so a typoed key is a startup error instead of a
// silently ignored setting. The loaded AegisConfig is an immutable value;
// a HUP reload parses a fresh one and the daemon swaps it in a controlled
// handoff.

use std::collections::BTreeMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use aegis_autonomy::{AutonomyConfig, AutonomyLevel};
use aegis_deploy::{DeployConfig, DisabledProbe, FnProbe, ReachabilityProbe, TcpProbe};

use crate::error::{ErrorKind, ServiceError};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AegisConfig {
    #[serde(default)]
    pub backend: BackendSection,
    #[serde(default)]
    pub autonomy: AutonomySection,
    #[serde(default)]
    pub deploy: DeploySection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub sources: BTreeMap<String, SourceSection>,
    #[serde(default)]
    pub never_block: NeverBlockSection,
    #[serde(default)]
    pub feeds: BTreeMap<String, FeedSection>,
    #[serde(default)]
    pub translator: TranslatorSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendSection {
    pub name: String,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl Default for BackendSection {
    fn default() -> Self {
        Self {
            name: "nftables".to_string(),
            options: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AutonomySection {
    pub level: String,
    pub max_cidr: u8,
    pub max_cidr_v6: u8,
    pub rate_per_min: u32,
    #[serde(default)]
    pub breaker: BreakerSection,
}

impl Default for AutonomySection {
    fn default() -> Self {
        Self {
            level: "monitor".to_string(),
            max_cidr: 24,
            max_cidr_v6: 64,
            rate_per_min: 10,
            breaker: BreakerSection::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BreakerSection {
    pub count: u32,
    pub window_secs: i64,
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            count: 5,
            window_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeploySection {
    #[serde(default)]
    pub heartbeat: HeartbeatSection,
    #[serde(default)]
    pub lock: LockSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeartbeatSection {
    pub timeout_secs: u64,
    pub interval_secs: u64,
    /// "disabled", or "tcp:<addr>:<port>,mgmt:<addr>:<port>" (both legs).
    /// Absent or partial means no usable probe, which fails closed.
    #[serde(default)]
    pub probe: Option<String>,
}

impl Default for HeartbeatSection {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            interval_secs: 10,
            probe: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LockSection {
    pub timeout_secs: u64,
}

impl Default for LockSection {
    fn default() -> Self {
        Self { timeout_secs: 60 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreSection {
    pub path: PathBuf,
    pub retain_days: u32,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/aegis/state.db"),
            retain_days: 30,
        }
    }
}

impl StoreSection {
    /// Backups live next to the state file unless overridden via
    /// backend options.
    pub fn backup_dir(&self) -> PathBuf {
        self.path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("backups")
    }

    pub fn feed_cache_dir(&self) -> PathBuf {
        self.path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("feed-cache")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub path: PathBuf,
    pub parser: String,
    #[serde(default = "default_budget")]
    pub budget: usize,
}

fn default_true() -> bool {
    true
}

fn default_budget() -> usize {
    256
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NeverBlockSection {
    #[serde(default)]
    pub entries: Vec<String>,
    /// Discover and protect the host's own management addresses.
    #[serde(default = "default_true")]
    pub management_discovery: bool,
}

impl Default for NeverBlockSection {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            management_discovery: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FeedSection {
    pub url: String,
    #[serde(default = "default_feed_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_feed_age_max")]
    pub age_max_secs: u64,
    #[serde(default = "default_feed_format")]
    pub format: String,
}

fn default_feed_interval() -> u64 {
    300
}

fn default_feed_age_max() -> u64 {
    86400
}

fn default_feed_format() -> String {
    "text".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TranslatorSection {
    /// Inference endpoint URL; absent disables natural-language drafting.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_translator_timeout")]
    pub timeout_secs: u64,
}

fn default_translator_timeout() -> u64 {
    20
}

impl AegisConfig {
    /// Parse a TOML document. Unknown keys anywhere are errors.
    pub fn from_toml(text: &str) -> Result<Self, ServiceError> {
        toml::from_str(text)
            .map_err(|e| ServiceError::new(ErrorKind::Validation, format!("config: {}", e)))
    }

    /// Load from a file path.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ServiceError> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ServiceError::new(
                ErrorKind::Validation,
                format!("config {}: {}", path.as_ref().display(), e),
            )
        })?;
        Self::from_toml(&text)
    }

    pub fn deploy_config(&self) -> DeployConfig {
        DeployConfig {
            heartbeat_timeout: Duration::from_secs(self.deploy.heartbeat.timeout_secs),
            heartbeat_interval: Duration::from_secs(self.deploy.heartbeat.interval_secs.max(1)),
            lock_timeout: Duration::from_secs(self.deploy.lock.timeout_secs),
            ..DeployConfig::default()
        }
    }

    pub fn autonomy_config(&self) -> Result<AutonomyConfig, ServiceError> {
        let level: AutonomyLevel = self
            .autonomy
            .level
            .parse()
            .map_err(|e: String| ServiceError::new(ErrorKind::Validation, e))?;
        Ok(AutonomyConfig {
            level,
            max_cidr_v4: self.autonomy.max_cidr,
            max_cidr_v6: self.autonomy.max_cidr_v6,
            rate_per_min: self.autonomy.rate_per_min,
            breaker_count: self.autonomy.breaker.count,
            breaker_window_secs: self.autonomy.breaker.window_secs,
            ..AutonomyConfig::default()
        })
    }

    /// Build the heartbeat probe from `deploy.heartbeat.probe`.
    ///
    /// The probe needs both legs: an outbound liveness target and the
    /// inbound management endpoint. No probe, or a spec missing either
    /// leg, fails closed: every probation rolls back until the operator
    /// configures both legs or sets "disabled" explicitly.
    pub fn build_probe(&self) -> Result<Arc<dyn ReachabilityProbe>, ServiceError> {
        let Some(spec) = self.deploy.heartbeat.probe.as_deref() else {
            return Ok(fail_closed_probe(
                "no reachability probe configured (set deploy.heartbeat.probe, \
                 or \"disabled\" to accept the risk)",
            ));
        };
        if spec == "disabled" {
            return Ok(Arc::new(DisabledProbe));
        }

        let mut liveness: Option<SocketAddr> = None;
        let mut management: Option<SocketAddr> = None;
        for part in spec.split(',') {
            let part = part.trim();
            if let Some(target) = part.strip_prefix("tcp:") {
                liveness = Some(resolve_target(target)?);
            } else if let Some(target) = part.strip_prefix("mgmt:") {
                management = Some(resolve_target(target)?);
            } else {
                return Err(ServiceError::new(
                    ErrorKind::Validation,
                    format!("unrecognized probe spec '{}'", part),
                ));
            }
        }
        match (liveness, management) {
            (Some(liveness), Some(management)) => Ok(Arc::new(TcpProbe {
                liveness_target: liveness,
                management_endpoint: management,
                timeout: Duration::from_secs(5),
            })),
            (Some(_), None) => Ok(fail_closed_probe(
                "probe spec has no mgmt:<addr>:<port> leg (add one, or set \
                 deploy.heartbeat.probe = \"disabled\" to accept the risk)",
            )),
            (None, _) => Ok(fail_closed_probe(
                "probe spec has no tcp:<addr>:<port> liveness leg (add one, or set \
                 deploy.heartbeat.probe = \"disabled\" to accept the risk)",
            )),
        }
    }
}

// A probe that never passes: probation always rolls back until the
// operator supplies a complete spec or disables probing explicitly.
fn fail_closed_probe(reason: &'static str) -> Arc<dyn ReachabilityProbe> {
    Arc::new(FnProbe(move || Err(reason.to_string())))
}

fn resolve_target(target: &str) -> Result<SocketAddr, ServiceError> {
    target
        .to_socket_addrs()
        .map_err(|e| {
            ServiceError::new(
                ErrorKind::Validation,
                format!("probe target '{}': {}", target, e),
            )
        })?
        .next()
        .ok_or_else(|| {
            ServiceError::new(
                ErrorKind::Validation,
                format!("probe target '{}' resolved to nothing", target),
            )
        })
}

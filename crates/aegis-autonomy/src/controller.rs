// controller.rs — The autonomy controller and its hard gates.
//
// Gates run in a fixed order and any failure aborts with an audit record:
//
//   1. never-block          — the subject is protected
//   2. circuit breaker      — too many autonomous deployments in the window
//   3. per-subject cooldown — a block for this subject just happened
//   4. operator conflict    — would shadow/contradict an operator rule
//   5. management self-block
//   6. autonomy level       — monitor proposes, cautious needs corroboration
//
// A global creation rate limit runs after the gates, independent of the
// breaker. The breaker and the catastrophic force-to-monitor flag live in
// daemon_state so they survive restarts and require an operator reset.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use aegis_analyzer::analyze;
use aegis_correlate::ThreatAssessment;
use aegis_deploy::controller::FORCED_MONITOR_KEY;
use aegis_deploy::DeploymentController;
use aegis_policy::{NeverBlockList, PolicyRule, RuleOrigin};
use aegis_store::{
    AuditAction, Deployment, DeploymentState, Proposal, ProposalState, Store,
};

use crate::error::AutonomyError;
use crate::template::{scope_within, template_rule};

/// Daemon-state key for the breaker latch.
pub const BREAKER_KEY: &str = "autonomy.breaker_tripped";
/// Daemon-state key for the persisted autonomy level.
pub const LEVEL_KEY: &str = "autonomy.level";

/// The autonomy dial.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AutonomyLevel {
    /// Never deploys; writes proposals to the approval queue.
    Monitor,
    /// Deploys only on high score corroborated by multiple sources.
    Cautious,
    /// Deploys on a single high-score signal.
    Aggressive,
}

impl fmt::Display for AutonomyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AutonomyLevel::Monitor => "monitor",
            AutonomyLevel::Cautious => "cautious",
            AutonomyLevel::Aggressive => "aggressive",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for AutonomyLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "monitor" => Ok(AutonomyLevel::Monitor),
            "cautious" => Ok(AutonomyLevel::Cautious),
            "aggressive" => Ok(AutonomyLevel::Aggressive),
            other => Err(format!("unknown autonomy level '{}'", other)),
        }
    }
}

/// Autonomy tuning, from configuration.
#[derive(Debug, Clone)]
pub struct AutonomyConfig {
    pub level: AutonomyLevel,
    /// Widest CIDR an autonomous rule may target (v4 prefix length).
    pub max_cidr_v4: u8,
    pub max_cidr_v6: u8,
    /// Global cap on autonomous rule creation.
    pub rate_per_min: u32,
    /// Breaker: more than this many autonomous deployments in the window
    /// trips it.
    pub breaker_count: u32,
    pub breaker_window_secs: i64,
    /// Minimum score for autonomous deployment.
    pub min_score: f64,
    /// Cautious additionally requires this many distinct event sources.
    pub cautious_min_sources: usize,
    /// Per-subject quiet period after autonomy acts on it.
    pub cooldown_secs: i64,
}

impl Default for AutonomyConfig {
    fn default() -> Self {
        Self {
            level: AutonomyLevel::Monitor,
            max_cidr_v4: 24,
            max_cidr_v6: 64,
            rate_per_min: 10,
            breaker_count: 5,
            breaker_window_secs: 600,
            min_score: 0.8,
            cautious_min_sources: 2,
            cooldown_secs: 600,
        }
    }
}

/// What handling one assessment produced.
#[derive(Debug)]
pub enum AutonomyOutcome {
    /// Gates passed; the rule is deployed and in probation.
    Deployed {
        proposal: Proposal,
        deployment: Deployment,
    },
    /// Monitor level: a proposal awaits operator approval.
    Proposed(Proposal),
    /// A gate aborted the response; the reason is audited.
    Suppressed { reason: &'static str },
}

/// The autonomy controller.
pub struct AutonomyController {
    store: Arc<Store>,
    deploy: Arc<DeploymentController>,
    never_block: Arc<RwLock<NeverBlockList>>,
    config: RwLock<AutonomyConfig>,
    management: RwLock<Vec<IpAddr>>,
    recent_creations: Mutex<VecDeque<DateTime<Utc>>>,
    cooldowns: Mutex<HashMap<IpAddr, DateTime<Utc>>>,
}

impl AutonomyController {
    /// Build the controller, resuming a persisted level if one exists.
    pub fn new(
        store: Arc<Store>,
        deploy: Arc<DeploymentController>,
        never_block: Arc<RwLock<NeverBlockList>>,
        mut config: AutonomyConfig,
    ) -> Arc<Self> {
        if let Ok(Some(level)) = store.daemon_state_get(LEVEL_KEY) {
            if let Ok(level) = level.parse() {
                config.level = level;
            }
        }
        Arc::new(Self {
            store,
            deploy,
            never_block,
            config: RwLock::new(config),
            management: RwLock::new(Vec::new()),
            recent_creations: Mutex::new(VecDeque::new()),
            cooldowns: Mutex::new(HashMap::new()),
        })
    }

    /// Management addresses discovered at startup (self-lockout gate).
    pub fn set_management(&self, addrs: Vec<IpAddr>) {
        *self.management.write().expect("management lock poisoned") = addrs;
    }

    /// The level autonomy actually operates at: a catastrophic failure
    /// forces monitor regardless of configuration.
    pub fn effective_level(&self) -> AutonomyLevel {
        if self.flag_set(FORCED_MONITOR_KEY) {
            return AutonomyLevel::Monitor;
        }
        self.config.read().expect("config lock poisoned").level
    }

    pub fn breaker_tripped(&self) -> bool {
        self.flag_set(BREAKER_KEY) || self.flag_set(FORCED_MONITOR_KEY)
    }

    /// Operator: change the autonomy level.
    pub fn set_level(&self, level: AutonomyLevel, actor: &str) -> Result<(), AutonomyError> {
        self.config.write().expect("config lock poisoned").level = level;
        self.store.daemon_state_set(LEVEL_KEY, &level.to_string())?;
        self.store.append_audit(
            actor,
            AuditAction::AutonomyLevelChanged,
            None,
            None,
            serde_json::json!({ "level": level.to_string() }),
        )?;
        Ok(())
    }

    /// Adopt new tuning after a config reload. The persisted level wins
    /// over the reloaded file so an operator's runtime change sticks.
    pub fn replace_config(&self, mut new: AutonomyConfig) {
        if let Ok(Some(level)) = self.store.daemon_state_get(LEVEL_KEY) {
            if let Ok(level) = level.parse() {
                new.level = level;
            }
        }
        *self.config.write().expect("config lock poisoned") = new;
    }

    /// Operator: re-arm the breaker and clear a forced-monitor latch.
    pub fn reset_breaker(&self, actor: &str) -> Result<(), AutonomyError> {
        self.store.daemon_state_set(BREAKER_KEY, "false")?;
        self.store.daemon_state_set(FORCED_MONITOR_KEY, "false")?;
        self.store.append_audit(
            actor,
            AuditAction::BreakerReset,
            None,
            None,
            serde_json::Value::Null,
        )?;
        Ok(())
    }

    /// Handle one assessment through the gates.
    pub async fn handle(
        &self,
        assessment: &ThreatAssessment,
    ) -> Result<AutonomyOutcome, AutonomyError> {
        let now = Utc::now();

        // Gate 1: never-block.
        let protected = {
            let list = self.never_block.read().expect("never-block lock poisoned");
            list.covers_ip(assessment.subject)
        };
        if let Some(label) = protected {
            return self.suppress(assessment, "never-block-match", serde_json::json!({ "entry": label }));
        }

        // Gate 2: circuit breaker.
        if self.breaker_tripped() {
            return self.suppress(assessment, "breaker-open", serde_json::Value::Null);
        }
        let config = self.config.read().expect("config lock poisoned").clone();
        let window_start = now - chrono::Duration::seconds(config.breaker_window_secs);
        let recent = self.store.count_autonomous_deployments_since(window_start)?;
        if recent >= config.breaker_count {
            self.store.daemon_state_set(BREAKER_KEY, "true")?;
            self.store.append_audit(
                "daemon",
                AuditAction::BreakerTripped,
                None,
                None,
                serde_json::json!({ "deployments_in_window": recent, "window_secs": config.breaker_window_secs }),
            )?;
            return self.suppress(assessment, "breaker-tripped", serde_json::Value::Null);
        }

        // Gate 3: per-subject cooldown.
        {
            let cooldowns = self.cooldowns.lock().expect("cooldown lock poisoned");
            if cooldowns
                .get(&assessment.subject)
                .is_some_and(|until| *until > now)
            {
                return self.suppress(assessment, "cooldown", serde_json::Value::Null);
            }
        }

        let rule = template_rule(assessment, RuleOrigin::DaemonAuto)?;

        // Scope cap: never wider than the configured CIDR.
        if let Some(net) = rule.source_net() {
            if !scope_within(net, config.max_cidr_v4, config.max_cidr_v6) {
                return self.suppress(assessment, "subject-too-broad", serde_json::Value::Null);
            }
        }

        // Gate 4: never shadow or contradict an operator rule.
        let existing = self.active_rules()?;
        let report = analyze(&rule, &existing, self.deploy.capabilities().evaluation_order);
        if report.shadows_or_contradicts_origin(RuleOrigin::User) {
            return self.suppress(
                assessment,
                "conflicts-with-operator-rule",
                serde_json::json!({ "findings": report.findings.len() }),
            );
        }

        // Gate 5: management self-lockout.
        let management = self.management.read().expect("management lock poisoned").clone();
        let hits_management = [rule.source_net(), rule.destination_net()]
            .into_iter()
            .flatten()
            .any(|net| management.iter().any(|ip| net.contains(*ip)));
        if hits_management {
            return self.suppress(assessment, "management-self-block", serde_json::Value::Null);
        }

        // Gate 6: autonomy level.
        let level = self.effective_level();
        match level {
            AutonomyLevel::Monitor => {
                return self.propose_for_approval(assessment);
            }
            AutonomyLevel::Cautious => {
                if assessment.score < config.min_score
                    || assessment.distinct_sources < config.cautious_min_sources
                {
                    return self.suppress(
                        assessment,
                        "cautious-gate",
                        serde_json::json!({
                            "score": assessment.score,
                            "sources": assessment.distinct_sources
                        }),
                    );
                }
            }
            AutonomyLevel::Aggressive => {
                if assessment.score < config.min_score {
                    return self.suppress(assessment, "score-below-threshold", serde_json::Value::Null);
                }
            }
        }

        // Global creation rate limit, independent of the breaker.
        if !self.rate_allows(now, config.rate_per_min) {
            return self.suppress(assessment, "rate-limit", serde_json::Value::Null);
        }

        // All gates green: escalate and deploy.
        self.store.append_audit(
            "daemon",
            AuditAction::ThreatEscalated,
            Some(&assessment.id.to_string()),
            None,
            serde_json::json!({
                "kind": assessment.kind.as_str(),
                "subject": assessment.subject.to_string(),
                "score": assessment.score
            }),
        )?;

        let mut proposal = Proposal::new(rule);
        proposal
            .transition(ProposalState::Approved)
            .expect("draft approves");
        self.store.insert_proposal(&proposal, "daemon")?;

        let deployment = self.deploy.deploy(&proposal).await?;
        self.set_cooldown(assessment.subject, now, config.cooldown_secs);

        self.store.append_audit(
            "daemon",
            AuditAction::AutonomousApplied,
            Some(&deployment.id.to_string()),
            None,
            serde_json::json!({
                "assessment_id": assessment.id.to_string(),
                "proposal_id": proposal.id.to_string(),
                "subject": assessment.subject.to_string()
            }),
        )?;

        Ok(AutonomyOutcome::Deployed {
            proposal,
            deployment,
        })
    }

    fn propose_for_approval(
        &self,
        assessment: &ThreatAssessment,
    ) -> Result<AutonomyOutcome, AutonomyError> {
        let rule = template_rule(assessment, RuleOrigin::DaemonPropose)?;
        let mut proposal = Proposal::new(rule);
        proposal
            .transition(ProposalState::PendingApproval)
            .expect("draft pends");
        self.store.insert_proposal(&proposal, "daemon")?;
        self.store.append_audit(
            "daemon",
            AuditAction::ThreatEscalated,
            Some(&assessment.id.to_string()),
            None,
            serde_json::json!({
                "kind": assessment.kind.as_str(),
                "subject": assessment.subject.to_string(),
                "score": assessment.score,
                "disposition": "pending_approval"
            }),
        )?;
        let now = Utc::now();
        let cooldown = self.config.read().expect("config lock poisoned").cooldown_secs;
        self.set_cooldown(assessment.subject, now, cooldown);
        tracing::info!(
            subject = %assessment.subject,
            proposal = %proposal.id,
            "monitor level: block proposed for approval"
        );
        Ok(AutonomyOutcome::Proposed(proposal))
    }

    fn suppress(
        &self,
        assessment: &ThreatAssessment,
        reason: &'static str,
        mut detail: serde_json::Value,
    ) -> Result<AutonomyOutcome, AutonomyError> {
        if detail.is_null() {
            detail = serde_json::json!({});
        }
        if let Some(map) = detail.as_object_mut() {
            map.insert("reason".to_string(), serde_json::json!(reason));
            map.insert(
                "subject".to_string(),
                serde_json::json!(assessment.subject.to_string()),
            );
        }
        self.store.append_audit(
            "daemon",
            AuditAction::AutonomySuppressed,
            Some(&assessment.id.to_string()),
            None,
            detail,
        )?;
        tracing::info!(subject = %assessment.subject, reason, "autonomous response suppressed");
        Ok(AutonomyOutcome::Suppressed { reason })
    }

    fn rate_allows(&self, now: DateTime<Utc>, rate_per_min: u32) -> bool {
        let mut recent = self.recent_creations.lock().expect("rate lock poisoned");
        let minute_ago = now - chrono::Duration::seconds(60);
        while recent.front().is_some_and(|t| *t < minute_ago) {
            recent.pop_front();
        }
        if recent.len() >= rate_per_min as usize {
            return false;
        }
        recent.push_back(now);
        true
    }

    fn set_cooldown(&self, subject: IpAddr, now: DateTime<Utc>, cooldown_secs: i64) {
        self.cooldowns
            .lock()
            .expect("cooldown lock poisoned")
            .insert(subject, now + chrono::Duration::seconds(cooldown_secs));
    }

    fn flag_set(&self, key: &str) -> bool {
        self.store
            .daemon_state_get(key)
            .ok()
            .flatten()
            .is_some_and(|v| v == "true")
    }

    /// Rules currently live on the backend, as the analyzer's baseline:
    /// every committed deployment's rule.
    fn active_rules(&self) -> Result<Vec<PolicyRule>, AutonomyError> {
        let mut rules = Vec::new();
        for deployment in self.store.list_deployments(500)? {
            if deployment.state != DeploymentState::Committed {
                continue;
            }
            if let Ok(proposal) = self.store.get_proposal(deployment.proposal_id) {
                rules.push(proposal.rule);
            }
        }
        Ok(rules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_backend::{
        AdapterError, ApplyReceipt, BackendAdapter, BackupRef, Capabilities, DeltaOp,
        EvaluationOrder, Health, ImportReport, RenderedRule, RuleSetImage, Verdict,
    };
    use aegis_correlate::{Recommendation, ThreatKind};
    use aegis_deploy::{DeployConfig, FnProbe};
    use aegis_policy::{Action, NeverBlockEntry, PortSpec, Protocol};
    use std::time::Duration;
    use uuid::Uuid;

    /// Minimal always-succeeding adapter; autonomy tests exercise the
    /// gates, not the backend.
    #[derive(Debug)]
    struct OkAdapter {
        backup_dir: std::path::PathBuf,
    }

    impl BackendAdapter for OkAdapter {
        fn name(&self) -> &str {
            "mock"
        }

        fn kernel_subsystem(&self) -> &str {
            "mock"
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities {
                supports_deny: true,
                supports_stateful: true,
                supports_rate_limit: true,
                supports_ipv6: true,
                supports_priority: true,
                evaluation_order: EvaluationOrder::FirstMatch,
                supports_atomic_replace: true,
                supports_delta_ops: true,
            }
        }

        fn render(&self, rule: &PolicyRule) -> Result<RenderedRule, AdapterError> {
            Ok(RenderedRule {
                backend_name: "mock".to_string(),
                rule_id: Some(rule.id),
                placement: Some("input".to_string()),
                text: format!("{} {}", rule.action, rule.id),
            })
        }

        fn render_image(&self, rules: &[PolicyRule]) -> Result<RuleSetImage, AdapterError> {
            Ok(RuleSetImage {
                backend_name: "mock".to_string(),
                text: String::new(),
                rules: rules.iter().map(|r| self.render(r).unwrap()).collect(),
            })
        }

        fn validate(&self, _image: &RuleSetImage) -> Result<Verdict, AdapterError> {
            Ok(Verdict::ok())
        }

        fn snapshot(&self) -> Result<BackupRef, AdapterError> {
            let id = Uuid::new_v4();
            let path = self.backup_dir.join(format!("{}.nft", id));
            std::fs::write(&path, "").map_err(|e| AdapterError::System(e.to_string()))?;
            Ok(BackupRef {
                id,
                backend_name: "mock".to_string(),
                path,
                created_at: Utc::now(),
            })
        }

        fn apply_atomic(&self, image: &RuleSetImage) -> Result<ApplyReceipt, AdapterError> {
            Ok(ApplyReceipt {
                applied_at: Utc::now(),
                rule_count: image.rules.len(),
                delta: false,
            })
        }

        fn apply_delta(&self, _op: &DeltaOp) -> Result<ApplyReceipt, AdapterError> {
            Ok(ApplyReceipt {
                applied_at: Utc::now(),
                rule_count: 1,
                delta: true,
            })
        }

        fn restore(&self, _backup: &BackupRef) -> Result<bool, AdapterError> {
            Ok(true)
        }

        fn list_rules(&self) -> Result<Vec<RenderedRule>, AdapterError> {
            Ok(Vec::new())
        }

        fn import_rules(&self) -> Result<ImportReport, AdapterError> {
            Ok(ImportReport {
                rules: Vec::new(),
                warnings: Vec::new(),
            })
        }

        fn health(&self) -> Health {
            Health {
                reachable: true,
                writable: true,
            }
        }
    }

    struct Fixture {
        autonomy: Arc<AutonomyController>,
        store: Arc<Store>,
        never_block: Arc<RwLock<NeverBlockList>>,
        _dir: tempfile::TempDir,
    }

    fn fixture(config: AutonomyConfig) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open_in_memory().unwrap());
        let never_block = Arc::new(RwLock::new(NeverBlockList::new()));
        let adapter = Arc::new(OkAdapter {
            backup_dir: dir.path().to_path_buf(),
        });
        let deploy = DeploymentController::new(
            adapter,
            store.clone(),
            never_block.clone(),
            Arc::new(FnProbe(|| Ok(()))),
            DeployConfig {
                heartbeat_timeout: Duration::from_millis(30),
                heartbeat_interval: Duration::from_millis(10),
                lock_timeout: Duration::from_secs(5),
                adapter_timeout: Duration::from_secs(2),
                retry_attempts: 1,
                retry_backoff: Duration::from_millis(1),
                backup_retain_days: 7,
            },
        );
        let autonomy = AutonomyController::new(store.clone(), deploy, never_block.clone(), config);
        Fixture {
            autonomy,
            store,
            never_block,
            _dir: dir,
        }
    }

    fn assessment(subject: &str, kind: ThreatKind) -> ThreatAssessment {
        ThreatAssessment {
            id: Uuid::new_v4(),
            kind,
            subject: subject.parse().unwrap(),
            score: 0.9,
            recommendation: Recommendation::BlockSubject,
            evidence: vec![Uuid::new_v4()],
            distinct_targets: 1,
            targets: vec!["ssh:root".to_string()],
            distinct_sources: 2,
            expires_suggestion: Utc::now() + kind.default_ttl(),
            created_at: Utc::now(),
        }
    }

    fn cautious() -> AutonomyConfig {
        AutonomyConfig {
            level: AutonomyLevel::Cautious,
            ..AutonomyConfig::default()
        }
    }

    fn audited_actions(store: &Store) -> Vec<AuditAction> {
        store
            .audit_tail(100)
            .unwrap()
            .iter()
            .map(|r| r.action)
            .collect()
    }

    async fn wait_for_committed(store: &Store, id: Uuid) {
        for _ in 0..200 {
            if store.get_deployment(id).unwrap().state == DeploymentState::Committed {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("deployment never committed");
    }

    #[tokio::test]
    async fn brute_force_escalates_to_committed_block() {
        let fx = fixture(cautious());
        let assessment = assessment("203.0.113.7", ThreatKind::BruteForce);

        let outcome = fx.autonomy.handle(&assessment).await.unwrap();
        let AutonomyOutcome::Deployed {
            proposal,
            deployment,
        } = outcome
        else {
            panic!("expected deployment");
        };

        // The templated rule: drop, /32 subject, tcp/22, 24h expiry.
        assert_eq!(proposal.rule.action, Action::Drop);
        assert_eq!(
            proposal.rule.source_net().unwrap().to_string(),
            "203.0.113.7/32"
        );
        assert_eq!(proposal.rule.protocol, Protocol::Tcp);
        assert_eq!(proposal.rule.destination_port, Some(PortSpec::Single(22)));
        assert_eq!(proposal.rule.origin, RuleOrigin::DaemonAuto);

        wait_for_committed(&fx.store, deployment.id).await;

        let actions = audited_actions(&fx.store);
        assert!(actions.contains(&AuditAction::ThreatEscalated));
        assert!(actions.contains(&AuditAction::AutonomousApplied));

        // The autonomous-applied record carries the assessment id.
        let applied = fx
            .store
            .audit_tail(100)
            .unwrap()
            .into_iter()
            .find(|r| r.action == AuditAction::AutonomousApplied)
            .unwrap();
        assert_eq!(
            applied.detail["assessment_id"],
            serde_json::json!(assessment.id.to_string())
        );
    }

    #[tokio::test]
    async fn never_block_subject_is_suppressed() {
        let fx = fixture(cautious());
        fx.never_block
            .write()
            .unwrap()
            .add(NeverBlockEntry::parse("10.0.0.1/32"));

        let outcome = fx
            .autonomy
            .handle(&assessment("10.0.0.1", ThreatKind::FeedHit))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            AutonomyOutcome::Suppressed {
                reason: "never-block-match"
            }
        ));

        // No proposal was created.
        assert!(fx.store.list_proposals(None).unwrap().is_empty());
        let suppressed = fx
            .store
            .audit_tail(10)
            .unwrap()
            .into_iter()
            .find(|r| r.action == AuditAction::AutonomySuppressed)
            .unwrap();
        assert_eq!(suppressed.detail["reason"], serde_json::json!("never-block-match"));
    }

    #[tokio::test]
    async fn breaker_trips_after_window_count() {
        let mut config = cautious();
        config.breaker_count = 2;
        config.cooldown_secs = 0;
        let fx = fixture(config);

        // Two deployments pass.
        for ip in ["203.0.113.1", "203.0.113.2"] {
            let outcome = fx
                .autonomy
                .handle(&assessment(ip, ThreatKind::BruteForce))
                .await
                .unwrap();
            assert!(matches!(outcome, AutonomyOutcome::Deployed { .. }));
        }

        // The third attempt trips the breaker.
        let outcome = fx
            .autonomy
            .handle(&assessment("203.0.113.3", ThreatKind::BruteForce))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            AutonomyOutcome::Suppressed {
                reason: "breaker-tripped"
            }
        ));
        assert!(fx.autonomy.breaker_tripped());
        assert!(audited_actions(&fx.store).contains(&AuditAction::BreakerTripped));

        // Everything after that is alert-only until reset.
        let outcome = fx
            .autonomy
            .handle(&assessment("203.0.113.4", ThreatKind::BruteForce))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            AutonomyOutcome::Suppressed {
                reason: "breaker-open"
            }
        ));

        // Operator reset re-arms it.
        fx.autonomy.reset_breaker("operator").unwrap();
        assert!(!fx.autonomy.breaker_tripped());
    }

    #[tokio::test]
    async fn cooldown_suppresses_double_block() {
        let fx = fixture(cautious());
        let first = assessment("203.0.113.7", ThreatKind::BruteForce);
        let outcome = fx.autonomy.handle(&first).await.unwrap();
        assert!(matches!(outcome, AutonomyOutcome::Deployed { .. }));

        // A secondary assessment for the same subject inside the cooldown.
        let second = assessment("203.0.113.7", ThreatKind::PortScan);
        let outcome = fx.autonomy.handle(&second).await.unwrap();
        assert!(matches!(
            outcome,
            AutonomyOutcome::Suppressed { reason: "cooldown" }
        ));
    }

    #[tokio::test]
    async fn conflict_with_operator_rule_is_suppressed() {
        let fx = fixture(cautious());

        // A committed operator rule covering the subject's whole /8.
        let user_rule = PolicyRule::builder()
            .action(Action::Drop)
            .source("203.0.0.0/8")
            .unwrap()
            .origin(RuleOrigin::User)
            .build()
            .unwrap();
        let mut proposal = Proposal::new(user_rule);
        proposal.transition(ProposalState::Approved).unwrap();
        fx.store.insert_proposal(&proposal, "operator").unwrap();
        let mut deployment = Deployment::new(proposal.id, "mock");
        fx.store.insert_deployment(&deployment, "controller").unwrap();
        deployment.state = DeploymentState::Committed;
        fx.store
            .update_deployment(
                &deployment,
                AuditAction::DeploymentCommitted,
                "controller",
                None,
                serde_json::Value::Null,
            )
            .unwrap();

        let outcome = fx
            .autonomy
            .handle(&assessment("203.0.113.7", ThreatKind::FeedHit))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            AutonomyOutcome::Suppressed {
                reason: "conflicts-with-operator-rule"
            }
        ));
    }

    #[tokio::test]
    async fn management_subject_is_suppressed() {
        let fx = fixture(cautious());
        fx.autonomy
            .set_management(vec!["198.51.100.1".parse().unwrap()]);

        let outcome = fx
            .autonomy
            .handle(&assessment("198.51.100.1", ThreatKind::BruteForce))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            AutonomyOutcome::Suppressed {
                reason: "management-self-block"
            }
        ));
    }

    #[tokio::test]
    async fn monitor_level_proposes_instead_of_deploying() {
        let fx = fixture(AutonomyConfig::default()); // monitor

        let outcome = fx
            .autonomy
            .handle(&assessment("203.0.113.7", ThreatKind::BruteForce))
            .await
            .unwrap();
        let AutonomyOutcome::Proposed(proposal) = outcome else {
            panic!("expected proposal");
        };
        assert_eq!(proposal.state, ProposalState::PendingApproval);
        assert_eq!(proposal.rule.origin, RuleOrigin::DaemonPropose);

        // Nothing was deployed.
        assert!(fx.store.list_deployments(10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn cautious_requires_corroboration() {
        let fx = fixture(cautious());
        let mut single_source = assessment("203.0.113.7", ThreatKind::BruteForce);
        single_source.distinct_sources = 1;

        let outcome = fx.autonomy.handle(&single_source).await.unwrap();
        assert!(matches!(
            outcome,
            AutonomyOutcome::Suppressed {
                reason: "cautious-gate"
            }
        ));
    }

    #[tokio::test]
    async fn aggressive_accepts_single_source() {
        let mut config = cautious();
        config.level = AutonomyLevel::Aggressive;
        let fx = fixture(config);
        let mut single_source = assessment("203.0.113.7", ThreatKind::BruteForce);
        single_source.distinct_sources = 1;

        let outcome = fx.autonomy.handle(&single_source).await.unwrap();
        assert!(matches!(outcome, AutonomyOutcome::Deployed { .. }));
    }

    #[tokio::test]
    async fn global_rate_limit_is_independent_of_breaker() {
        let mut config = cautious();
        config.rate_per_min = 1;
        config.breaker_count = 100;
        config.cooldown_secs = 0;
        let fx = fixture(config);

        let outcome = fx
            .autonomy
            .handle(&assessment("203.0.113.1", ThreatKind::BruteForce))
            .await
            .unwrap();
        assert!(matches!(outcome, AutonomyOutcome::Deployed { .. }));

        let outcome = fx
            .autonomy
            .handle(&assessment("203.0.113.2", ThreatKind::BruteForce))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            AutonomyOutcome::Suppressed {
                reason: "rate-limit"
            }
        ));
        assert!(!fx.autonomy.breaker_tripped());
    }

    #[tokio::test]
    async fn forced_monitor_after_catastrophic_failure() {
        let fx = fixture(cautious());
        fx.store.daemon_state_set(FORCED_MONITOR_KEY, "true").unwrap();

        assert_eq!(fx.autonomy.effective_level(), AutonomyLevel::Monitor);
        // And the breaker gate holds everything.
        let outcome = fx
            .autonomy
            .handle(&assessment("203.0.113.7", ThreatKind::BruteForce))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            AutonomyOutcome::Suppressed {
                reason: "breaker-open"
            }
        ));
    }

    #[tokio::test]
    async fn level_changes_persist_and_audit() {
        let fx = fixture(AutonomyConfig::default());
        fx.autonomy
            .set_level(AutonomyLevel::Aggressive, "operator")
            .unwrap();
        assert_eq!(fx.autonomy.effective_level(), AutonomyLevel::Aggressive);
        assert_eq!(
            fx.store.daemon_state_get(LEVEL_KEY).unwrap().as_deref(),
            Some("aggressive")
        );
        assert!(audited_actions(&fx.store).contains(&AuditAction::AutonomyLevelChanged));
    }
}

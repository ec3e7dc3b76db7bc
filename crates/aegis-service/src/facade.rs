// facade.rs — The single API surface.
//
// Everything a consumer can do to Aegis goes through a Facade method:
// propose, approve, reject, commit, rollback, list, import, subscribe,
// status, autonomy level, never-block edits. The facade is the sole
// writer against the store and the adapter; the CLI and daemon both hold
// one and nothing bypasses it. Every call is traced, and every mutation
// lands in the audit trail through the store.

use std::collections::BTreeMap;
use std::net::{IpAddr, UdpSocket};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_stream::{Stream, StreamExt};
use uuid::Uuid;

use aegis_analyzer::analyze;
use aegis_autonomy::{AutonomyController, AutonomyLevel};
use aegis_backend::{
    AdapterError, AdapterRegistry, BackendAdapter, ImportReport, RenderedRule,
};
use aegis_deploy::DeploymentController;
use aegis_events::EventBus;
use aegis_nftables::NftAdapter;
use aegis_policy::{NeverBlockEntry, NeverBlockList, PolicyRule};
use aegis_store::{
    AuditAction, AuditRecord, Deployment, DeploymentState, Proposal, ProposalState, SecurityEvent,
    Store,
};

use crate::config::AegisConfig;
use crate::error::{ErrorKind, ServiceError};
use crate::translator::{DisabledTranslator, HttpTranslator, Translator};

const ADAPTER_CALL_TIMEOUT: Duration = Duration::from_secs(15);

/// Snapshot of daemon health for status output.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DaemonStatus {
    pub backend: String,
    pub backend_reachable: bool,
    pub backend_writable: bool,
    pub autonomy_level: String,
    pub breaker_tripped: bool,
    pub active_deployment: Option<Uuid>,
    pub queued_deployments: usize,
    pub pending_proposals: usize,
    pub never_block_entries: usize,
    pub causal_windows: usize,
}

/// The service facade.
pub struct Facade {
    config: RwLock<Arc<AegisConfig>>,
    store: Arc<Store>,
    adapter: Arc<dyn BackendAdapter>,
    registry: Mutex<AdapterRegistry>,
    deploy: Arc<DeploymentController>,
    autonomy: Arc<AutonomyController>,
    bus: Arc<EventBus>,
    never_block: Arc<RwLock<NeverBlockList>>,
    translator: Arc<dyn Translator>,
}

impl Facade {
    /// Build against the real nftables adapter.
    pub fn build(config: AegisConfig) -> Result<Arc<Self>, ServiceError> {
        let backup_dir = config.store.backup_dir();
        let adapter: Arc<dyn BackendAdapter> = Arc::new(NftAdapter::new(backup_dir)?);
        let translator: Arc<dyn Translator> = match &config.translator.endpoint {
            Some(endpoint) => Arc::new(HttpTranslator::new(
                endpoint.clone(),
                Duration::from_secs(config.translator.timeout_secs),
            )),
            None => Arc::new(DisabledTranslator),
        };
        Self::build_with(config, adapter, translator)
    }

    /// Build with explicit adapter and translator (tests, other backends).
    pub fn build_with(
        config: AegisConfig,
        adapter: Arc<dyn BackendAdapter>,
        translator: Arc<dyn Translator>,
    ) -> Result<Arc<Self>, ServiceError> {
        if let Some(parent) = config.store.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ServiceError::new(ErrorKind::Internal, format!("store dir: {}", e))
            })?;
        }
        let store = Arc::new(Store::open(&config.store.path)?);

        let mut registry = AdapterRegistry::new();
        registry.register(Arc::clone(&adapter))?;
        let adapter = registry.activate(&config.backend.name)?;

        // Never-block: configured entries plus persisted ones, hostnames
        // resolved now (an unresolvable entry is a startup error, not a
        // silent gap), management addresses discovered when enabled.
        let mut list = NeverBlockList::from_entries(&config.never_block.entries);
        for entry in store.never_block_load()? {
            list.add(entry);
        }
        list.resolve_hosts()?;
        let mut management = Vec::new();
        if config.never_block.management_discovery {
            management = discover_management_addrs();
            for addr in &management {
                list.add_discovered(*addr, "management");
            }
        }
        let never_block = Arc::new(RwLock::new(list));

        let probe = config.build_probe()?;
        let deploy = DeploymentController::new(
            Arc::clone(&adapter),
            Arc::clone(&store),
            Arc::clone(&never_block),
            probe,
            config.deploy_config(),
        );

        let bus = EventBus::new(1024);
        deploy.set_causal_sink(bus.clone());

        let autonomy = AutonomyController::new(
            Arc::clone(&store),
            Arc::clone(&deploy),
            Arc::clone(&never_block),
            config.autonomy_config()?,
        );
        autonomy.set_management(management);

        Ok(Arc::new(Self {
            config: RwLock::new(Arc::new(config)),
            store,
            adapter,
            registry: Mutex::new(registry),
            deploy,
            autonomy,
            bus,
            never_block,
            translator,
        }))
    }

    // ── Component access for the daemon ──────────────────────────

    pub fn store(&self) -> Arc<Store> {
        Arc::clone(&self.store)
    }

    pub fn bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.bus)
    }

    pub fn deploy_controller(&self) -> Arc<DeploymentController> {
        Arc::clone(&self.deploy)
    }

    pub fn autonomy(&self) -> Arc<AutonomyController> {
        Arc::clone(&self.autonomy)
    }

    pub fn config(&self) -> Arc<AegisConfig> {
        Arc::clone(&self.config.read().expect("config lock poisoned"))
    }

    // ── Proposals ────────────────────────────────────────────────

    /// Draft a rule from operator prose through the translator, then run
    /// it through the same validation as a structured proposal.
    pub async fn propose_text(&self, text: &str) -> Result<Proposal, ServiceError> {
        tracing::info!(chars = text.len(), "propose (natural language)");
        let draft = self.translator.draft(text).await?;
        let explanation = draft.explanation.clone();
        let rule = draft.into_rule()?;
        self.propose_inner(rule, Some(explanation)).await
    }

    /// Propose a structured rule.
    pub async fn propose_rule(&self, rule: PolicyRule) -> Result<Proposal, ServiceError> {
        tracing::info!(rule = %rule.id, "propose (structured)");
        self.propose_inner(rule, None).await
    }

    async fn propose_inner(
        &self,
        rule: PolicyRule,
        explanation: Option<String>,
    ) -> Result<Proposal, ServiceError> {
        rule.validate()?;

        let missing = self.adapter.capabilities().missing_for(&rule);
        if !missing.is_empty() {
            return Err(ServiceError::validation(format!(
                "backend '{}' does not support: {}",
                self.adapter.name(),
                missing.join(", ")
            )));
        }

        let rule_for_render = rule.clone();
        let (rendered, verdict) = self
            .adapter_blocking(move |a| {
                let rendered = a.render(&rule_for_render)?;
                let image = a.render_image(std::slice::from_ref(&rule_for_render))?;
                let verdict = a.validate(&image)?;
                Ok((rendered, verdict))
            })
            .await?;

        let existing = self.active_rules()?;
        let conflicts = analyze(&rule, &existing, self.adapter.capabilities().evaluation_order);

        let mut proposal = Proposal::new(rule);
        proposal.rendered = Some(rendered);
        proposal.verdict = Some(verdict);
        proposal.conflicts = Some(conflicts);
        proposal.explanation = explanation;
        proposal
            .transition(ProposalState::PendingApproval)
            .expect("draft pends");
        self.store.insert_proposal(&proposal, "operator")?;

        // A newer draft for the same match set replaces older pending ones.
        for mut old in self
            .store
            .list_proposals(Some(ProposalState::PendingApproval))?
        {
            if old.id != proposal.id && old.rule.same_match(&proposal.rule) {
                old.transition(ProposalState::Superseded)?;
                self.store.update_proposal(
                    &old,
                    AuditAction::ProposalSuperseded,
                    "operator",
                    serde_json::json!({ "superseded_by": proposal.id.to_string() }),
                )?;
            }
        }
        Ok(proposal)
    }

    /// Approve and deploy a pending proposal.
    pub async fn approve(&self, proposal_id: Uuid) -> Result<Deployment, ServiceError> {
        tracing::info!(proposal = %proposal_id, "approve");
        let mut proposal = self.store.get_proposal(proposal_id)?;

        if let Some(verdict) = &proposal.verdict {
            if !verdict.ok {
                return Err(ServiceError::validation(format!(
                    "proposal failed backend validation: {}",
                    verdict.messages.join("; ")
                ))
                .with_correlation(proposal_id));
            }
        }

        proposal.transition(ProposalState::Approved)?;
        self.store.update_proposal(
            &proposal,
            AuditAction::ProposalApproved,
            "operator",
            serde_json::Value::Null,
        )?;

        Ok(self.deploy.deploy(&proposal).await?)
    }

    /// Reject a pending proposal. The live ruleset is untouched.
    pub async fn reject(&self, proposal_id: Uuid) -> Result<Proposal, ServiceError> {
        tracing::info!(proposal = %proposal_id, "reject");
        let mut proposal = self.store.get_proposal(proposal_id)?;
        proposal.transition(ProposalState::Rejected)?;
        self.store.update_proposal(
            &proposal,
            AuditAction::ProposalRejected,
            "operator",
            serde_json::Value::Null,
        )?;
        Ok(proposal)
    }

    pub fn list_proposals(
        &self,
        state: Option<ProposalState>,
    ) -> Result<Vec<Proposal>, ServiceError> {
        Ok(self.store.list_proposals(state)?)
    }

    // ── Deployments ──────────────────────────────────────────────

    pub async fn commit(&self, deployment_id: Uuid) -> Result<Deployment, ServiceError> {
        tracing::info!(deployment = %deployment_id, "commit");
        Ok(self.deploy.commit(deployment_id).await?)
    }

    pub async fn rollback(&self, deployment_id: Uuid) -> Result<Deployment, ServiceError> {
        tracing::info!(deployment = %deployment_id, "rollback");
        Ok(self.deploy.rollback(deployment_id).await?)
    }

    pub async fn cancel(&self, deployment_id: Uuid) -> Result<Deployment, ServiceError> {
        tracing::info!(deployment = %deployment_id, "cancel");
        Ok(self.deploy.cancel(deployment_id).await?)
    }

    pub fn list_deployments(&self, limit: usize) -> Result<Vec<Deployment>, ServiceError> {
        Ok(self.store.list_deployments(limit)?)
    }

    // ── Ruleset ──────────────────────────────────────────────────

    pub async fn list_rules(&self) -> Result<Vec<RenderedRule>, ServiceError> {
        self.adapter_blocking(|a| a.list_rules()).await
    }

    pub async fn import_rules(&self) -> Result<ImportReport, ServiceError> {
        self.adapter_blocking(|a| a.import_rules()).await
    }

    // ── Events ───────────────────────────────────────────────────

    /// Subscribe to the event stream: optional replay from the store,
    /// then live delivery from the bus.
    pub fn subscribe_events(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> impl Stream<Item = SecurityEvent> {
        let replay = match since {
            Some(since) => self.store.events_since(since, 10_000).unwrap_or_default(),
            None => Vec::new(),
        };
        let live = self.bus.subscribe();
        async_stream::stream! {
            let mut replayed = std::collections::HashSet::new();
            for event in replay {
                replayed.insert(event.id);
                yield event;
            }
            let mut live = tokio_stream::wrappers::BroadcastStream::new(live);
            while let Some(item) = live.next().await {
                // Lagged subscribers skip what they missed; events already
                // replayed from the store are not delivered twice.
                if let Ok(event) = item {
                    if !replayed.remove(&event.id) {
                        yield event;
                    }
                }
            }
        }
    }

    // ── Status & autonomy ────────────────────────────────────────

    pub async fn daemon_status(&self) -> Result<DaemonStatus, ServiceError> {
        let health = self.adapter_blocking(|a| Ok(a.health())).await?;
        let active = self.store.active_deployment(self.adapter.name())?;
        let queued = self.store.queued_deployments(self.adapter.name())?;
        let pending = self
            .store
            .list_proposals(Some(ProposalState::PendingApproval))?;
        let never_block_entries = self
            .never_block
            .read()
            .expect("never-block lock poisoned")
            .len();
        Ok(DaemonStatus {
            backend: self.adapter.name().to_string(),
            backend_reachable: health.reachable,
            backend_writable: health.writable,
            autonomy_level: self.autonomy.effective_level().to_string(),
            breaker_tripped: self.autonomy.breaker_tripped(),
            active_deployment: active.map(|d| d.id),
            queued_deployments: queued.len(),
            pending_proposals: pending.len(),
            never_block_entries,
            causal_windows: self.bus.active_windows().len(),
        })
    }

    pub fn autonomy_set_level(&self, level: &str) -> Result<AutonomyLevel, ServiceError> {
        let level: AutonomyLevel = level
            .parse()
            .map_err(|e: String| ServiceError::validation(e))?;
        self.autonomy.set_level(level, "operator")?;
        Ok(level)
    }

    pub fn reset_breaker(&self) -> Result<(), ServiceError> {
        Ok(self.autonomy.reset_breaker("operator")?)
    }

    // ── Never-block ──────────────────────────────────────────────

    pub fn never_block_add(&self, text: &str) -> Result<String, ServiceError> {
        let mut entry = NeverBlockEntry::parse(text);
        // Resolve hostname entries immediately; adding an unresolvable
        // protection is refused rather than silently inert.
        if matches!(entry, NeverBlockEntry::Host { .. }) {
            let mut probe_list = NeverBlockList::new();
            probe_list.add(entry);
            probe_list.resolve_hosts()?;
            entry = probe_list.entries()[0].clone();
        }
        let label = entry.label();
        self.store.never_block_save(&entry, "operator")?;
        self.never_block
            .write()
            .expect("never-block lock poisoned")
            .add(entry);
        tracing::info!(%label, "never-block entry added");
        Ok(label)
    }

    pub fn never_block_remove(&self, label: &str) -> Result<usize, ServiceError> {
        let removed = self.store.never_block_remove(label, "operator")?;
        self.never_block
            .write()
            .expect("never-block lock poisoned")
            .remove(label);
        tracing::info!(%label, removed, "never-block entry removed");
        Ok(removed)
    }

    pub fn never_block_list(&self) -> Vec<String> {
        self.never_block
            .read()
            .expect("never-block lock poisoned")
            .entries()
            .iter()
            .map(NeverBlockEntry::label)
            .collect()
    }

    // ── Audit ────────────────────────────────────────────────────

    pub fn audit_tail(&self, limit: usize) -> Result<Vec<AuditRecord>, ServiceError> {
        Ok(self.store.audit_tail(limit)?)
    }

    pub fn verify_audit_chain(&self) -> Result<bool, ServiceError> {
        Ok(self.store.verify_audit_chain()?)
    }

    // ── Config reload ────────────────────────────────────────────

    /// Adopt a reloaded configuration. In-flight deployments are not
    /// disturbed; autonomy tuning and source/feed sets take effect for
    /// new work.
    pub fn reload(&self, new_config: AegisConfig) -> Result<(), ServiceError> {
        let autonomy_config = new_config.autonomy_config()?;
        self.autonomy.replace_config(autonomy_config);
        *self.config.write().expect("config lock poisoned") = Arc::new(new_config);
        self.store.append_audit(
            "daemon",
            AuditAction::ConfigReloaded,
            None,
            None,
            serde_json::Value::Null,
        )?;
        tracing::info!("configuration reloaded");
        Ok(())
    }

    // ── Internals ────────────────────────────────────────────────

    /// The analyzer's baseline: rules of committed deployments.
    fn active_rules(&self) -> Result<Vec<PolicyRule>, ServiceError> {
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

    /// Run an adapter call off the async scheduler with a timeout.
    async fn adapter_blocking<T>(
        &self,
        f: impl FnOnce(&dyn BackendAdapter) -> Result<T, AdapterError> + Send + 'static,
    ) -> Result<T, ServiceError>
    where
        T: Send + 'static,
    {
        let adapter = Arc::clone(&self.adapter);
        let task = tokio::task::spawn_blocking(move || f(adapter.as_ref()));
        let result = tokio::time::timeout(ADAPTER_CALL_TIMEOUT, task)
            .await
            .map_err(|_| {
                ServiceError::new(ErrorKind::Adapter, "transient: backend operation timed out")
            })?
            .map_err(|e| ServiceError::new(ErrorKind::Internal, format!("adapter task: {}", e)))?;
        result.map_err(Into::into)
    }

    /// Registered backend names plus the active one, for status output.
    pub fn backends(&self) -> (Vec<String>, String) {
        let registry = self.registry.lock().expect("registry lock poisoned");
        (registry.names(), self.adapter.name().to_string())
    }

    /// Source sections from the active config, for the daemon's source
    /// spawning.
    pub fn source_sections(&self) -> BTreeMap<String, crate::config::SourceSection> {
        self.config().sources.clone()
    }
}

/// Discover the host's outbound (management) addresses without sending a
/// packet: a connected UDP socket reveals the local address the kernel
/// would route through.
pub fn discover_management_addrs() -> Vec<IpAddr> {
    let mut out = Vec::new();
    for (bind, target) in [("0.0.0.0:0", "1.1.1.1:53"), ("[::]:0", "[2606:4700:4700::1111]:53")] {
        if let Ok(socket) = UdpSocket::bind(bind) {
            if socket.connect(target).is_ok() {
                if let Ok(addr) = socket.local_addr() {
                    if !addr.ip().is_unspecified() {
                        out.push(addr.ip());
                    }
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translator::RuleDraft;
    use aegis_backend::{
        ApplyReceipt, BackupRef, Capabilities, DeltaOp, EvaluationOrder, Health, RuleSetImage,
        Verdict,
    };
    use aegis_policy::{Action, PortSpec, Protocol, RuleOrigin};
    use aegis_store::{EventKind, Severity};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// In-memory adapter: the live ruleset is a Vec behind a mutex.
    #[derive(Debug)]
    struct MemAdapter {
        live: Mutex<Vec<RenderedRule>>,
        backup_dir: std::path::PathBuf,
        validate_ok: AtomicBool,
    }

    impl MemAdapter {
        fn new(backup_dir: std::path::PathBuf) -> Self {
            Self {
                live: Mutex::new(Vec::new()),
                backup_dir,
                validate_ok: AtomicBool::new(true),
            }
        }
    }

    impl BackendAdapter for MemAdapter {
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
                supports_rate_limit: false,
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
            let rendered: Result<Vec<_>, _> = rules.iter().map(|r| self.render(r)).collect();
            Ok(RuleSetImage {
                backend_name: "mock".to_string(),
                text: String::new(),
                rules: rendered?,
            })
        }

        fn validate(&self, _image: &RuleSetImage) -> Result<Verdict, AdapterError> {
            if self.validate_ok.load(Ordering::SeqCst) {
                Ok(Verdict::ok())
            } else {
                Ok(Verdict::failed("injected validation failure"))
            }
        }

        fn snapshot(&self) -> Result<BackupRef, AdapterError> {
            let id = Uuid::new_v4();
            let path = self.backup_dir.join(format!("{}.json", id));
            let doc = serde_json::to_string(&*self.live.lock().unwrap())
                .map_err(|e| AdapterError::System(e.to_string()))?;
            std::fs::write(&path, doc).map_err(|e| AdapterError::System(e.to_string()))?;
            Ok(BackupRef {
                id,
                backend_name: "mock".to_string(),
                path,
                created_at: Utc::now(),
            })
        }

        fn apply_atomic(&self, image: &RuleSetImage) -> Result<ApplyReceipt, AdapterError> {
            *self.live.lock().unwrap() = image.rules.clone();
            Ok(ApplyReceipt {
                applied_at: Utc::now(),
                rule_count: image.rules.len(),
                delta: false,
            })
        }

        fn apply_delta(&self, op: &DeltaOp) -> Result<ApplyReceipt, AdapterError> {
            let mut live = self.live.lock().unwrap();
            let count = match op {
                DeltaOp::Add(rule) => {
                    live.push(rule.clone());
                    1
                }
                DeltaOp::Remove(rule) => {
                    let before = live.len();
                    live.retain(|r| r.rule_id != rule.rule_id);
                    before - live.len()
                }
            };
            Ok(ApplyReceipt {
                applied_at: Utc::now(),
                rule_count: count,
                delta: true,
            })
        }

        fn restore(&self, backup: &BackupRef) -> Result<bool, AdapterError> {
            let doc = match std::fs::read_to_string(&backup.path) {
                Ok(doc) => doc,
                Err(_) => return Ok(false),
            };
            *self.live.lock().unwrap() =
                serde_json::from_str(&doc).map_err(|e| AdapterError::System(e.to_string()))?;
            Ok(true)
        }

        fn list_rules(&self) -> Result<Vec<RenderedRule>, AdapterError> {
            Ok(self.live.lock().unwrap().clone())
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

    struct FixedTranslator(RuleDraft);

    #[async_trait]
    impl Translator for FixedTranslator {
        async fn draft(&self, _text: &str) -> Result<RuleDraft, ServiceError> {
            Ok(self.0.clone())
        }
    }

    struct Fixture {
        facade: Arc<Facade>,
        adapter: Arc<MemAdapter>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        fixture_with_translator(Arc::new(DisabledTranslator))
    }

    fn fixture_with_translator(translator: Arc<dyn Translator>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = AegisConfig::from_toml(&format!(
            r#"
[backend]
name = "mock"

[deploy.heartbeat]
timeout_secs = 3600
interval_secs = 1
probe = "disabled"

[store]
path = "{}/state.db"
retain_days = 7

[never_block]
entries = []
management_discovery = false
"#,
            dir.path().display()
        ))
        .unwrap();

        let adapter = Arc::new(MemAdapter::new(dir.path().to_path_buf()));
        let facade = Facade::build_with(
            config,
            adapter.clone() as Arc<dyn BackendAdapter>,
            translator,
        )
        .unwrap();
        Fixture {
            facade,
            adapter,
            _dir: dir,
        }
    }

    fn drop_rule(src: &str) -> PolicyRule {
        PolicyRule::builder()
            .action(Action::Drop)
            .source(src)
            .unwrap()
            .protocol(Protocol::Tcp)
            .destination_port(22)
            .origin(RuleOrigin::User)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn propose_approve_commit_round_trip() {
        let fx = fixture();
        let proposal = fx.facade.propose_rule(drop_rule("203.0.113.7/32")).await.unwrap();
        assert_eq!(proposal.state, ProposalState::PendingApproval);
        assert!(proposal.rendered.is_some());
        assert!(proposal.verdict.as_ref().unwrap().ok);
        assert!(proposal.conflicts.as_ref().unwrap().is_clean());

        let deployment = fx.facade.approve(proposal.id).await.unwrap();
        assert_eq!(deployment.state, DeploymentState::Probation);
        assert_eq!(fx.facade.list_rules().await.unwrap().len(), 1);

        let committed = fx.facade.commit(deployment.id).await.unwrap();
        assert_eq!(committed.state, DeploymentState::Committed);
    }

    #[tokio::test]
    async fn reject_leaves_live_ruleset_unchanged() {
        let fx = fixture();
        let proposal = fx.facade.propose_rule(drop_rule("198.51.100.4/32")).await.unwrap();
        let rejected = fx.facade.reject(proposal.id).await.unwrap();
        assert_eq!(rejected.state, ProposalState::Rejected);
        assert!(fx.adapter.live.lock().unwrap().is_empty());

        // A rejected proposal cannot be approved afterwards.
        assert!(fx.facade.approve(proposal.id).await.is_err());
    }

    #[tokio::test]
    async fn propose_text_goes_through_translator_and_validation() {
        let draft = RuleDraft {
            direction: Some("input".to_string()),
            action: "drop".to_string(),
            source: Some("203.0.113.0/24".to_string()),
            destination: None,
            protocol: Some("tcp".to_string()),
            destination_port: Some(PortSpec::Single(443)),
            source_port: None,
            comment: Some("drafted".to_string()),
            explanation: "blocking the scanner subnet you described".to_string(),
        };
        let fx = fixture_with_translator(Arc::new(FixedTranslator(draft)));

        let proposal = fx.facade.propose_text("block those scanners").await.unwrap();
        assert_eq!(proposal.rule.origin, RuleOrigin::User);
        assert_eq!(
            proposal.explanation.as_deref(),
            Some("blocking the scanner subnet you described")
        );
        assert_eq!(proposal.state, ProposalState::PendingApproval);
    }

    #[tokio::test]
    async fn unsupported_capability_is_refused_before_rendering() {
        let fx = fixture();
        let rule = PolicyRule::builder()
            .action(Action::Drop)
            .source("203.0.113.7/32")
            .unwrap()
            .rate_limit(10, 60) // mock backend lacks rate_limit
            .origin(RuleOrigin::User)
            .build()
            .unwrap();

        let err = fx.facade.propose_rule(rule).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
        assert!(err.message.contains("rate_limit"));
    }

    #[tokio::test]
    async fn failed_backend_validation_blocks_approval() {
        let fx = fixture();
        fx.adapter.validate_ok.store(false, Ordering::SeqCst);
        let proposal = fx.facade.propose_rule(drop_rule("203.0.113.7/32")).await.unwrap();
        assert!(!proposal.verdict.as_ref().unwrap().ok);

        let err = fx.facade.approve(proposal.id).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
        assert_eq!(err.correlation_id, Some(proposal.id));
    }

    #[tokio::test]
    async fn never_block_add_list_remove() {
        let fx = fixture();
        let label = fx.facade.never_block_add("10.0.0.1/32").unwrap();
        assert_eq!(label, "10.0.0.1/32");
        assert_eq!(fx.facade.never_block_list(), vec!["10.0.0.1/32"]);

        // Persisted: a fresh load would see it via the store.
        assert_eq!(fx.facade.store().never_block_load().unwrap().len(), 1);

        assert_eq!(fx.facade.never_block_remove("10.0.0.1/32").unwrap(), 1);
        assert!(fx.facade.never_block_list().is_empty());
    }

    #[tokio::test]
    async fn daemon_status_reports_the_world() {
        let fx = fixture();
        let status = fx.facade.daemon_status().await.unwrap();
        assert_eq!(status.backend, "mock");
        assert!(status.backend_reachable);
        assert_eq!(status.autonomy_level, "monitor");
        assert!(!status.breaker_tripped);
        assert!(status.active_deployment.is_none());
        assert_eq!(status.pending_proposals, 0);
    }

    #[tokio::test]
    async fn subscribe_replays_store_events_then_goes_live() {
        let fx = fixture();
        let old = SecurityEvent::new("sshd", EventKind::AuthFail, Severity::Medium)
            .with_source_ip("203.0.113.7".parse().unwrap());
        fx.facade.store().insert_event(&old).unwrap();

        let since = Utc::now() - chrono::Duration::hours(1);
        let stream = fx.facade.subscribe_events(Some(since));
        tokio::pin!(stream);

        let replayed = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(replayed.id, old.id);
    }

    #[tokio::test]
    async fn set_level_and_reset_breaker() {
        let fx = fixture();
        let level = fx.facade.autonomy_set_level("aggressive").unwrap();
        assert_eq!(level, AutonomyLevel::Aggressive);
        assert!(fx.facade.autonomy_set_level("bogus").is_err());
        fx.facade.reset_breaker().unwrap();
    }

    #[tokio::test]
    async fn newer_draft_supersedes_matching_pending_proposal() {
        let fx = fixture();
        let first = fx
            .facade
            .propose_rule(drop_rule("203.0.113.7/32"))
            .await
            .unwrap();
        let second = fx
            .facade
            .propose_rule(drop_rule("203.0.113.7/32"))
            .await
            .unwrap();

        let old = fx.facade.store().get_proposal(first.id).unwrap();
        assert_eq!(old.state, ProposalState::Superseded);
        let new = fx.facade.store().get_proposal(second.id).unwrap();
        assert_eq!(new.state, ProposalState::PendingApproval);

        // Terminal: the superseded proposal cannot be approved.
        assert!(fx.facade.approve(first.id).await.is_err());
    }

    #[tokio::test]
    async fn reload_swaps_config_and_audits() {
        let fx = fixture();
        let mut new_config = (*fx.facade.config()).clone();
        new_config.autonomy.level = "cautious".to_string();
        fx.facade.reload(new_config).unwrap();
        assert_eq!(fx.facade.config().autonomy.level, "cautious");

        let actions: Vec<AuditAction> = fx
            .facade
            .audit_tail(10)
            .unwrap()
            .iter()
            .map(|r| r.action)
            .collect();
        assert!(actions.contains(&AuditAction::ConfigReloaded));
    }
}

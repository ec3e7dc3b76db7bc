// controller.rs — The deployment state machine.
//
// One controller per active backend. All ruleset mutations funnel through
// the controller's exclusive lock: the lock is held from apply through the
// end of probation, so at most one deployment is in applying|probation per
// backend and queued approvals drain FIFO behind it.
//
// The heartbeat task is owned by its deployment: spawned on entering
// probation, holding the backend lock, and gone once the deployment
// reaches a terminal state. There is no global timer registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::{watch, Mutex, OwnedMutexGuard};
use uuid::Uuid;

use aegis_backend::{AdapterError, BackendAdapter, DeltaOp, RenderedRule};
use aegis_policy::NeverBlockList;
use aegis_store::{
    AuditAction, Deployment, DeploymentState, EventKind, Proposal, ProposalState, Store,
};

use crate::causal::{CausalSink, CausalWindow};
use crate::error::DeployError;
use crate::probe::ReachabilityProbe;

/// Controller tuning, supplied from daemon configuration.
#[derive(Debug, Clone)]
pub struct DeployConfig {
    /// Probation length; all-green probes through this window commit.
    pub heartbeat_timeout: Duration,
    /// How often the probe runs during probation.
    pub heartbeat_interval: Duration,
    /// How long a deploy call waits for the backend lock.
    pub lock_timeout: Duration,
    /// Per-operation adapter timeout; overruns count as transient.
    pub adapter_timeout: Duration,
    /// Bounded retries for transient adapter failures.
    pub retry_attempts: u32,
    /// Base backoff between retries (doubles per attempt, plus jitter).
    pub retry_backoff: Duration,
    /// How long terminal deployments keep their backup files.
    pub backup_retain_days: u32,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(120),
            heartbeat_interval: Duration::from_secs(10),
            lock_timeout: Duration::from_secs(60),
            adapter_timeout: Duration::from_secs(15),
            retry_attempts: 3,
            retry_backoff: Duration::from_millis(250),
            backup_retain_days: 7,
        }
    }
}

/// Daemon-state key set when rollback itself fails; autonomy watches it.
pub const FORCED_MONITOR_KEY: &str = "autonomy.forced_monitor";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeartbeatCommand {
    Continue,
    /// Someone else finished the deployment; exit quietly.
    Stop,
}

/// The per-backend deployment controller.
pub struct DeploymentController {
    adapter: Arc<dyn BackendAdapter>,
    store: Arc<Store>,
    never_block: Arc<RwLock<NeverBlockList>>,
    probe: Arc<dyn ReachabilityProbe>,
    config: DeployConfig,
    backend_lock: Arc<Mutex<()>>,
    causal: StdMutex<Option<Arc<dyn CausalSink>>>,
    heartbeats: StdMutex<HashMap<Uuid, watch::Sender<HeartbeatCommand>>>,
}

impl DeploymentController {
    pub fn new(
        adapter: Arc<dyn BackendAdapter>,
        store: Arc<Store>,
        never_block: Arc<RwLock<NeverBlockList>>,
        probe: Arc<dyn ReachabilityProbe>,
        config: DeployConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            adapter,
            store,
            never_block,
            probe,
            config,
            backend_lock: Arc::new(Mutex::new(())),
            causal: StdMutex::new(None),
            heartbeats: StdMutex::new(HashMap::new()),
        })
    }

    /// Wire the causal-window sink (the event bus).
    pub fn set_causal_sink(&self, sink: Arc<dyn CausalSink>) {
        *self.causal.lock().expect("causal lock poisoned") = Some(sink);
    }

    pub fn backend_name(&self) -> &str {
        self.adapter.name()
    }

    /// Capability set of the backend this controller drives.
    pub fn capabilities(&self) -> aegis_backend::Capabilities {
        self.adapter.capabilities()
    }

    /// Apply an approved proposal. Returns once the deployment has entered
    /// probation (or failed); probation itself runs in a background task
    /// that keeps the backend lock until the deployment is terminal.
    pub async fn deploy(self: &Arc<Self>, proposal: &Proposal) -> Result<Deployment, DeployError> {
        if proposal.state != ProposalState::Approved {
            return Err(DeployError::InvalidState {
                id: proposal.id.to_string(),
                state: proposal.state.to_string(),
                operation: "deploy",
            });
        }

        let mut deployment = Deployment::new(proposal.id, self.adapter.name());
        self.store.insert_deployment(&deployment, "controller")?;

        let guard = tokio::time::timeout(
            self.config.lock_timeout,
            Arc::clone(&self.backend_lock).lock_owned(),
        )
        .await
        .map_err(|_| DeployError::LockTimeout)?;

        // A queued deployment can be cancelled while waiting for the lock.
        let current = self.store.get_deployment(deployment.id)?;
        if current.state != DeploymentState::Queued {
            return Err(DeployError::InvalidState {
                id: deployment.id.to_string(),
                state: current.state.to_string(),
                operation: "apply",
            });
        }

        match self.apply_flow(&mut deployment, proposal).await {
            Ok(()) => {
                self.spawn_heartbeat(deployment.clone(), guard);
                Ok(deployment)
            }
            Err(err) => Err(err),
        }
    }

    async fn apply_flow(
        &self,
        deployment: &mut Deployment,
        proposal: &Proposal,
    ) -> Result<(), DeployError> {
        deployment.transition(DeploymentState::Applying)?;
        self.store.update_deployment(
            deployment,
            AuditAction::DeploymentApplying,
            "controller",
            None,
            serde_json::Value::Null,
        )?;

        // Snapshot and persist the backup reference before anything touches
        // the live ruleset; rollback depends on it being durable.
        let backup = match self.adapter_call(Arc::new(|a: &dyn BackendAdapter| a.snapshot())).await {
            Ok(backup) => backup,
            Err(err) => return Err(self.fail_deployment(deployment, err.into())),
        };
        deployment.backup = Some(backup);
        self.store.heartbeat_deployment(deployment)?;

        // Last-line never-block check of what is about to be applied.
        let blocked = {
            let list = self.never_block.read().expect("never-block lock poisoned");
            list.blocks_rule(&proposal.rule)
        };
        if let Some(label) = blocked {
            let err = DeployError::PolicyViolation(format!(
                "rule matches never-block entry '{}'",
                label
            ));
            return Err(self.fail_deployment(deployment, err));
        }

        let rendered = match &proposal.rendered {
            Some(rendered) => rendered.clone(),
            None => match self.render(&proposal.rule).await {
                Ok(rendered) => rendered,
                Err(err) => return Err(self.fail_deployment(deployment, err.into())),
            },
        };

        // Delta preserves connection-tracking state; fall back to a full
        // image when the backend cannot do single-rule operations.
        let apply_result = if self.adapter.capabilities().supports_delta_ops {
            let op = DeltaOp::Add(rendered);
            self.adapter_call(Arc::new(move |a: &dyn BackendAdapter| a.apply_delta(&op))).await
        } else {
            let rule = proposal.rule.clone();
            self.adapter_call(Arc::new(move |a: &dyn BackendAdapter| {
                let mut report = a.import_rules()?;
                report.rules.push(rule.clone());
                let image = a.render_image(&report.rules)?;
                a.apply_atomic(&image)
            }))
            .await
        };
        let receipt = match apply_result {
            Ok(receipt) => receipt,
            Err(err) => return Err(self.fail_deployment(deployment, err.into())),
        };

        deployment.applied_at = Some(receipt.applied_at);
        deployment.heartbeat_deadline = Some(
            Utc::now()
                + chrono::Duration::from_std(self.config.heartbeat_timeout)
                    .unwrap_or_else(|_| chrono::Duration::seconds(120)),
        );
        deployment.transition(DeploymentState::Probation)?;
        self.store.update_deployment(
            deployment,
            AuditAction::DeploymentApplied,
            "controller",
            None,
            serde_json::json!({ "delta": receipt.delta, "rules": receipt.rule_count }),
        )?;

        self.publish_causal_window(deployment, proposal);
        tracing::info!(
            deployment = %deployment.id,
            backend = self.adapter.name(),
            "deployment applied; probation started"
        );
        Ok(())
    }

    fn publish_causal_window(&self, deployment: &Deployment, proposal: &Proposal) {
        let sink = self.causal.lock().expect("causal lock poisoned").clone();
        if let Some(sink) = sink {
            let valid_until = proposal
                .rule
                .expires_at
                .unwrap_or_else(|| Utc::now() + chrono::Duration::hours(24));
            sink.publish(CausalWindow {
                deployment_id: deployment.id,
                subject: proposal.rule.source_net().copied(),
                kinds: vec![EventKind::ConnDrop],
                valid_until,
            });
        }
    }

    /// Mark a deployment failed, auditing the error kind. Returns the error
    /// for propagation.
    fn fail_deployment(&self, deployment: &mut Deployment, err: DeployError) -> DeployError {
        deployment.failure_reason = Some(err.to_string());
        if deployment.transition(DeploymentState::Failed).is_ok() {
            let _ = self.store.update_deployment(
                deployment,
                AuditAction::DeploymentFailed,
                "controller",
                Some(err.kind()),
                serde_json::json!({ "reason": err.to_string() }),
            );
        }
        err
    }

    // ── Probation ────────────────────────────────────────────────

    fn spawn_heartbeat(self: &Arc<Self>, deployment: Deployment, guard: OwnedMutexGuard<()>) {
        let (tx, rx) = watch::channel(HeartbeatCommand::Continue);
        self.heartbeats
            .lock()
            .expect("heartbeat lock poisoned")
            .insert(deployment.id, tx);
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            // The backend lock lives exactly as long as probation.
            let _guard = guard;
            controller.run_probation(deployment, rx).await;
        });
    }

    async fn run_probation(
        self: Arc<Self>,
        mut deployment: Deployment,
        mut rx: watch::Receiver<HeartbeatCommand>,
    ) {
        loop {
            if *rx.borrow() == HeartbeatCommand::Stop {
                break;
            }

            let probe = Arc::clone(&self.probe);
            let verdict = tokio::task::spawn_blocking(move || probe.probe())
                .await
                .unwrap_or_else(|e| Err(format!("probe task failed: {}", e)));

            match verdict {
                Ok(()) => {
                    deployment.last_heartbeat_at = Some(Utc::now());
                    if let Err(e) = self.store.heartbeat_deployment(&deployment) {
                        tracing::warn!(error = %e, "could not persist heartbeat");
                    }
                    // The deadline itself is the commit point: a probation
                    // that elapses all green commits.
                    if deployment
                        .heartbeat_deadline
                        .is_some_and(|deadline| Utc::now() >= deadline)
                    {
                        self.finish_commit(&mut deployment, "controller").await;
                        break;
                    }
                }
                Err(reason) => {
                    let _ = self.store.append_audit(
                        "controller",
                        AuditAction::HeartbeatMiss,
                        Some(&deployment.id.to_string()),
                        Some("heartbeat_miss"),
                        serde_json::json!({ "reason": reason }),
                    );
                    self.finish_rollback(&mut deployment, &reason, "controller").await;
                    break;
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.heartbeat_interval) => {}
                _ = rx.changed() => {}
            }
        }
        self.heartbeats
            .lock()
            .expect("heartbeat lock poisoned")
            .remove(&deployment.id);
    }

    async fn finish_commit(&self, deployment: &mut Deployment, actor: &str) {
        // Someone may have finished this deployment already.
        match self.store.get_deployment(deployment.id) {
            Ok(current) if current.state == DeploymentState::Probation => {}
            _ => return,
        }
        if deployment.transition(DeploymentState::Committed).is_err() {
            return;
        }
        let _ = self.store.update_deployment(
            deployment,
            AuditAction::DeploymentCommitted,
            actor,
            None,
            serde_json::Value::Null,
        );
        self.remove_backup_file(deployment);
        tracing::info!(deployment = %deployment.id, "deployment committed");
    }

    async fn finish_rollback(&self, deployment: &mut Deployment, reason: &str, actor: &str) {
        match self.store.get_deployment(deployment.id) {
            Ok(current) if current.state == DeploymentState::Probation => {}
            _ => return,
        }

        let Some(backup) = deployment.backup.clone() else {
            self.catastrophic(deployment, "no backup reference at rollback time", actor);
            return;
        };

        let restore = self
            .adapter_call(Arc::new(move |a: &dyn BackendAdapter| a.restore(&backup)))
            .await;
        match restore {
            Ok(true) => {
                deployment.failure_reason = Some(reason.to_string());
                if deployment.transition(DeploymentState::RolledBack).is_ok() {
                    let _ = self.store.update_deployment(
                        deployment,
                        AuditAction::DeploymentRolledBack,
                        actor,
                        None,
                        serde_json::json!({ "reason": reason }),
                    );
                    let _ = self.store.append_audit(
                        actor,
                        AuditAction::RollbackOk,
                        Some(&deployment.id.to_string()),
                        None,
                        serde_json::Value::Null,
                    );
                    tracing::warn!(deployment = %deployment.id, reason, "deployment rolled back");
                }
            }
            Ok(false) => {
                self.catastrophic(deployment, "backup missing at rollback time", actor);
            }
            Err(err) => {
                self.catastrophic(deployment, &format!("restore failed: {}", err), actor);
            }
        }
    }

    /// Rollback failed: strand the deployment for an operator and disable
    /// autonomous action until reset.
    fn catastrophic(&self, deployment: &mut Deployment, reason: &str, actor: &str) {
        deployment.failure_reason = Some(reason.to_string());
        if deployment.transition(DeploymentState::Failed).is_ok() {
            let _ = self.store.update_deployment(
                deployment,
                AuditAction::Catastrophic,
                actor,
                Some("catastrophic"),
                serde_json::json!({ "reason": reason, "operator_action_required": true }),
            );
        }
        let _ = self.store.daemon_state_set(FORCED_MONITOR_KEY, "true");
        tracing::error!(
            deployment = %deployment.id,
            reason,
            "rollback failed; operator attention required"
        );
    }

    // ── Operator-driven transitions ──────────────────────────────

    /// Commit a deployment out of probation explicitly.
    pub async fn commit(&self, id: Uuid) -> Result<Deployment, DeployError> {
        let mut deployment = self.store.get_deployment(id)?;
        if deployment.state != DeploymentState::Probation {
            return Err(DeployError::InvalidState {
                id: id.to_string(),
                state: deployment.state.to_string(),
                operation: "commit",
            });
        }
        self.finish_commit(&mut deployment, "operator").await;
        self.signal(id, HeartbeatCommand::Stop);
        Ok(self.store.get_deployment(id)?)
    }

    /// Roll back a probation deployment immediately.
    pub async fn rollback(&self, id: Uuid) -> Result<Deployment, DeployError> {
        let mut deployment = self.store.get_deployment(id)?;
        if deployment.state != DeploymentState::Probation {
            return Err(DeployError::InvalidState {
                id: id.to_string(),
                state: deployment.state.to_string(),
                operation: "rollback",
            });
        }
        self.finish_rollback(&mut deployment, "operator requested", "operator")
            .await;
        self.signal(id, HeartbeatCommand::Stop);
        let deployment = self.store.get_deployment(id)?;
        if deployment.state == DeploymentState::Failed {
            return Err(DeployError::Catastrophic(
                deployment
                    .failure_reason
                    .clone()
                    .unwrap_or_else(|| "rollback failed".to_string()),
            ));
        }
        Ok(deployment)
    }

    /// Cancel a deployment. Queued: removed from the queue. Probation:
    /// equivalent to rollback.
    pub async fn cancel(&self, id: Uuid) -> Result<Deployment, DeployError> {
        let mut deployment = self.store.get_deployment(id)?;
        match deployment.state {
            DeploymentState::Queued => {
                deployment.transition(DeploymentState::Cancelled)?;
                self.store.update_deployment(
                    &deployment,
                    AuditAction::DeploymentCancelled,
                    "operator",
                    None,
                    serde_json::Value::Null,
                )?;
                Ok(deployment)
            }
            DeploymentState::Probation => self.rollback(id).await,
            other => Err(DeployError::InvalidState {
                id: id.to_string(),
                state: other.to_string(),
                operation: "cancel",
            }),
        }
    }

    fn signal(&self, id: Uuid, command: HeartbeatCommand) {
        if let Some(tx) = self.heartbeats.lock().expect("heartbeat lock poisoned").get(&id) {
            let _ = tx.send(command);
        }
    }

    // ── Sweeps ───────────────────────────────────────────────────

    /// Remove expired autonomous rules from the live ruleset. Removal is a
    /// delta so unrelated state is untouched; absent rules are a no-op.
    pub async fn sweep_expired(&self) -> Result<usize, DeployError> {
        let now = Utc::now();
        let mut removed = 0;
        for deployment in self.store.list_deployments(500)? {
            if deployment.state != DeploymentState::Committed {
                continue;
            }
            let Ok(proposal) = self.store.get_proposal(deployment.proposal_id) else {
                continue;
            };
            let Some(expires_at) = proposal.rule.expires_at else {
                continue;
            };
            if expires_at > now {
                continue;
            }
            let rendered = match &proposal.rendered {
                Some(rendered) => rendered.clone(),
                None => self.render(&proposal.rule).await?,
            };
            let op = DeltaOp::Remove(rendered);
            let receipt = self.adapter_call(Arc::new(move |a: &dyn BackendAdapter| a.apply_delta(&op))).await?;
            if receipt.rule_count > 0 {
                removed += 1;
                self.store.append_audit(
                    "controller",
                    AuditAction::RuleExpired,
                    Some(&deployment.id.to_string()),
                    None,
                    serde_json::json!({ "rule_id": proposal.rule.id.to_string() }),
                )?;
            }
        }
        Ok(removed)
    }

    /// Delete backup files past retention for terminal deployments.
    pub fn sweep_backups(&self) -> Result<usize, DeployError> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(self.config.backup_retain_days));
        let mut deleted = 0;
        for deployment in self.store.list_deployments(500)? {
            if !deployment.state.is_terminal() {
                continue;
            }
            if let Some(backup) = &deployment.backup {
                if backup.created_at < cutoff && backup.path.exists() {
                    if std::fs::remove_file(&backup.path).is_ok() {
                        deleted += 1;
                    }
                }
            }
        }
        Ok(deleted)
    }

    fn remove_backup_file(&self, deployment: &Deployment) {
        if let Some(backup) = &deployment.backup {
            let _ = std::fs::remove_file(&backup.path);
        }
    }

    // ── Adapter plumbing ─────────────────────────────────────────

    async fn render(&self, rule: &aegis_policy::PolicyRule) -> Result<RenderedRule, AdapterError> {
        let rule = rule.clone();
        self.adapter_call(Arc::new(move |a: &dyn BackendAdapter| a.render(&rule))).await
    }

    /// Run an adapter operation off the async scheduler with a timeout;
    /// transient failures (including timeouts) retry with bounded
    /// exponential backoff and jitter.
    async fn adapter_call<T>(
        &self,
        op: Arc<dyn Fn(&dyn BackendAdapter) -> Result<T, AdapterError> + Send + Sync>,
    ) -> Result<T, AdapterError>
    where
        T: Send + 'static,
    {
        let mut attempt: u32 = 0;
        loop {
            let adapter = Arc::clone(&self.adapter);
            let op_run = Arc::clone(&op);
            let task = tokio::task::spawn_blocking(move || op_run(adapter.as_ref()));
            let result = match tokio::time::timeout(self.config.adapter_timeout, task).await {
                Err(_) => Err(AdapterError::Transient(
                    "adapter operation timed out".to_string(),
                )),
                Ok(Err(join)) => Err(AdapterError::System(format!("adapter task: {}", join))),
                Ok(Ok(result)) => result,
            };
            match result {
                Err(err) if err.is_transient() && attempt < self.config.retry_attempts => {
                    attempt += 1;
                    let backoff = self.config.retry_backoff * 2u32.saturating_pow(attempt - 1);
                    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..50));
                    tracing::debug!(attempt, "transient adapter failure; retrying");
                    tokio::time::sleep(backoff + jitter).await;
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::FnProbe;
    use aegis_backend::{
        ApplyReceipt, BackupRef, Capabilities, EvaluationOrder, Health, ImportReport, RuleSetImage,
        Verdict,
    };
    use aegis_policy::{Action, PolicyRule, Protocol, RuleOrigin};
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    #[derive(Default, Debug)]
    struct MockState {
        live: Vec<RenderedRule>,
    }

    /// In-memory firewall: the "live ruleset" is a Vec, snapshots are JSON
    /// files in a temp dir, and failure injection drives the error paths.
    #[derive(Debug)]
    struct MockAdapter {
        state: StdMutex<MockState>,
        backup_dir: std::path::PathBuf,
        transient_failures: AtomicU32,
        fail_restore: AtomicBool,
    }

    impl MockAdapter {
        fn new(backup_dir: std::path::PathBuf) -> Self {
            Self {
                state: StdMutex::new(MockState::default()),
                backup_dir,
                transient_failures: AtomicU32::new(0),
                fail_restore: AtomicBool::new(false),
            }
        }

        fn live(&self) -> Vec<RenderedRule> {
            self.state.lock().unwrap().live.clone()
        }

        fn take_transient_failure(&self) -> bool {
            self.transient_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        }
    }

    impl BackendAdapter for MockAdapter {
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
            let rendered: Result<Vec<_>, _> = rules.iter().map(|r| self.render(r)).collect();
            let rendered = rendered?;
            let text = rendered
                .iter()
                .map(|r| r.text.clone())
                .collect::<Vec<_>>()
                .join("\n");
            Ok(RuleSetImage {
                backend_name: "mock".to_string(),
                text,
                rules: rendered,
            })
        }

        fn validate(&self, _image: &RuleSetImage) -> Result<Verdict, AdapterError> {
            Ok(Verdict::ok())
        }

        fn snapshot(&self) -> Result<BackupRef, AdapterError> {
            let id = Uuid::new_v4();
            let path = self.backup_dir.join(format!("{}.json", id));
            let live = self.live();
            let doc = serde_json::to_string(&live)
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
            self.state.lock().unwrap().live = image.rules.clone();
            Ok(ApplyReceipt {
                applied_at: Utc::now(),
                rule_count: image.rules.len(),
                delta: false,
            })
        }

        fn apply_delta(&self, op: &DeltaOp) -> Result<ApplyReceipt, AdapterError> {
            if self.take_transient_failure() {
                return Err(AdapterError::Transient("injected".to_string()));
            }
            let mut state = self.state.lock().unwrap();
            let count = match op {
                DeltaOp::Add(rule) => {
                    state.live.push(rule.clone());
                    1
                }
                DeltaOp::Remove(rule) => {
                    let before = state.live.len();
                    state.live.retain(|r| r.rule_id != rule.rule_id);
                    before - state.live.len()
                }
            };
            Ok(ApplyReceipt {
                applied_at: Utc::now(),
                rule_count: count,
                delta: true,
            })
        }

        fn restore(&self, backup: &BackupRef) -> Result<bool, AdapterError> {
            if self.fail_restore.load(Ordering::SeqCst) {
                return Err(AdapterError::System("injected restore failure".to_string()));
            }
            let doc = match std::fs::read_to_string(&backup.path) {
                Ok(doc) => doc,
                Err(_) => return Ok(false),
            };
            let live: Vec<RenderedRule> =
                serde_json::from_str(&doc).map_err(|e| AdapterError::System(e.to_string()))?;
            self.state.lock().unwrap().live = live;
            Ok(true)
        }

        fn list_rules(&self) -> Result<Vec<RenderedRule>, AdapterError> {
            Ok(self.live())
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
        controller: Arc<DeploymentController>,
        store: Arc<Store>,
        adapter: Arc<MockAdapter>,
        probe_ok: Arc<AtomicBool>,
        never_block: Arc<RwLock<NeverBlockList>>,
        _dir: tempfile::TempDir,
    }

    fn fixture(config: DeployConfig) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let adapter = Arc::new(MockAdapter::new(dir.path().to_path_buf()));
        let store = Arc::new(Store::open_in_memory().unwrap());
        let never_block = Arc::new(RwLock::new(NeverBlockList::new()));
        let probe_ok = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&probe_ok);
        let probe = Arc::new(FnProbe(move || {
            if flag.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err("probe failed".to_string())
            }
        }));
        let controller = DeploymentController::new(
            adapter.clone() as Arc<dyn BackendAdapter>,
            store.clone(),
            never_block.clone(),
            probe,
            config,
        );
        Fixture {
            controller,
            store,
            adapter,
            probe_ok,
            never_block,
            _dir: dir,
        }
    }

    fn quick_config() -> DeployConfig {
        DeployConfig {
            heartbeat_timeout: Duration::from_millis(80),
            heartbeat_interval: Duration::from_millis(10),
            lock_timeout: Duration::from_millis(100),
            adapter_timeout: Duration::from_secs(2),
            retry_attempts: 3,
            retry_backoff: Duration::from_millis(1),
            backup_retain_days: 7,
        }
    }

    fn approved_proposal(store: &Store, src: &str) -> Proposal {
        let rule = PolicyRule::builder()
            .action(Action::Drop)
            .source(src)
            .unwrap()
            .protocol(Protocol::Tcp)
            .destination_port(22)
            .origin(RuleOrigin::DaemonAuto)
            .build()
            .unwrap();
        let mut proposal = Proposal::new(rule);
        proposal.transition(ProposalState::Approved).unwrap();
        store.insert_proposal(&proposal, "test").unwrap();
        proposal
    }

    async fn wait_for_state(store: &Store, id: Uuid, state: DeploymentState) {
        for _ in 0..200 {
            if store.get_deployment(id).unwrap().state == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "deployment never reached {}; currently {}",
            state,
            store.get_deployment(id).unwrap().state
        );
    }

    #[tokio::test]
    async fn deploy_enters_probation_then_commits() {
        let fx = fixture(quick_config());
        let proposal = approved_proposal(&fx.store, "203.0.113.7/32");

        let deployment = fx.controller.deploy(&proposal).await.unwrap();
        assert_eq!(deployment.state, DeploymentState::Probation);
        assert!(deployment.backup.is_some());
        assert_eq!(fx.adapter.live().len(), 1);

        wait_for_state(&fx.store, deployment.id, DeploymentState::Committed).await;

        // Backup is deleted on commit.
        let backup = deployment.backup.unwrap();
        assert!(!backup.path.exists());
    }

    #[tokio::test]
    async fn heartbeat_miss_rolls_back_to_snapshot() {
        let fx = fixture(quick_config());
        fx.probe_ok.store(false, Ordering::SeqCst);
        let proposal = approved_proposal(&fx.store, "198.51.100.9/32");

        let deployment = fx.controller.deploy(&proposal).await.unwrap();
        wait_for_state(&fx.store, deployment.id, DeploymentState::RolledBack).await;

        // Live ruleset equals the pre-apply snapshot (empty).
        assert!(fx.adapter.live().is_empty());

        // heartbeat_miss followed by rollback_ok in the audit trail.
        let actions: Vec<AuditAction> = fx
            .store
            .audit_tail(50)
            .unwrap()
            .iter()
            .map(|r| r.action)
            .collect();
        let miss = actions
            .iter()
            .position(|a| *a == AuditAction::HeartbeatMiss)
            .expect("heartbeat_miss audited");
        let ok = actions
            .iter()
            .position(|a| *a == AuditAction::RollbackOk)
            .expect("rollback_ok audited");
        assert!(miss < ok);
    }

    #[tokio::test]
    async fn never_block_subject_is_refused() {
        let fx = fixture(quick_config());
        fx.never_block
            .write()
            .unwrap()
            .add(aegis_policy::NeverBlockEntry::parse("203.0.113.0/24"));
        let proposal = approved_proposal(&fx.store, "203.0.113.7/32");

        let err = fx.controller.deploy(&proposal).await.unwrap_err();
        assert!(matches!(err, DeployError::PolicyViolation(_)));

        // Nothing applied, deployment failed with the violation audited.
        assert!(fx.adapter.live().is_empty());
        let deployments = fx.store.list_deployments(10).unwrap();
        assert_eq!(deployments[0].state, DeploymentState::Failed);
    }

    #[tokio::test]
    async fn catastrophic_restore_failure_forces_monitor() {
        let fx = fixture(quick_config());
        fx.probe_ok.store(false, Ordering::SeqCst);
        fx.adapter.fail_restore.store(true, Ordering::SeqCst);
        let proposal = approved_proposal(&fx.store, "198.51.100.9/32");

        let deployment = fx.controller.deploy(&proposal).await.unwrap();
        wait_for_state(&fx.store, deployment.id, DeploymentState::Failed).await;

        assert_eq!(
            fx.store.daemon_state_get(FORCED_MONITOR_KEY).unwrap().as_deref(),
            Some("true")
        );
        let actions: Vec<AuditAction> = fx
            .store
            .audit_tail(50)
            .unwrap()
            .iter()
            .map(|r| r.action)
            .collect();
        assert!(actions.contains(&AuditAction::Catastrophic));
    }

    #[tokio::test]
    async fn second_deploy_waits_and_times_out_on_lock() {
        let mut config = quick_config();
        config.heartbeat_timeout = Duration::from_secs(30); // hold probation
        config.lock_timeout = Duration::from_millis(50);
        let fx = fixture(config);

        let first = approved_proposal(&fx.store, "203.0.113.1/32");
        fx.controller.deploy(&first).await.unwrap();

        let second = approved_proposal(&fx.store, "203.0.113.2/32");
        let err = fx.controller.deploy(&second).await.unwrap_err();
        assert!(matches!(err, DeployError::LockTimeout));

        // The first deployment is untouched and still in probation.
        let active = fx.store.active_deployment("mock").unwrap().unwrap();
        assert_eq!(active.state, DeploymentState::Probation);
    }

    #[tokio::test]
    async fn explicit_commit_ends_probation() {
        let mut config = quick_config();
        config.heartbeat_timeout = Duration::from_secs(30);
        let fx = fixture(config);
        let proposal = approved_proposal(&fx.store, "203.0.113.3/32");
        let deployment = fx.controller.deploy(&proposal).await.unwrap();

        let committed = fx.controller.commit(deployment.id).await.unwrap();
        assert_eq!(committed.state, DeploymentState::Committed);
    }

    #[tokio::test]
    async fn explicit_rollback_restores_snapshot() {
        let mut config = quick_config();
        config.heartbeat_timeout = Duration::from_secs(30);
        let fx = fixture(config);
        let proposal = approved_proposal(&fx.store, "203.0.113.4/32");
        let deployment = fx.controller.deploy(&proposal).await.unwrap();
        assert_eq!(fx.adapter.live().len(), 1);

        let rolled = fx.controller.rollback(deployment.id).await.unwrap();
        assert_eq!(rolled.state, DeploymentState::RolledBack);
        assert!(fx.adapter.live().is_empty());
    }

    #[tokio::test]
    async fn cancel_queued_deployment() {
        let fx = fixture(quick_config());
        let proposal = approved_proposal(&fx.store, "203.0.113.5/32");
        let deployment = Deployment::new(proposal.id, "mock");
        fx.store.insert_deployment(&deployment, "controller").unwrap();

        let cancelled = fx.controller.cancel(deployment.id).await.unwrap();
        assert_eq!(cancelled.state, DeploymentState::Cancelled);
    }

    #[tokio::test]
    async fn transient_apply_failures_are_retried() {
        let fx = fixture(quick_config());
        fx.adapter.transient_failures.store(2, Ordering::SeqCst);
        let proposal = approved_proposal(&fx.store, "203.0.113.6/32");

        let deployment = fx.controller.deploy(&proposal).await.unwrap();
        assert_eq!(deployment.state, DeploymentState::Probation);
        assert_eq!(fx.adapter.live().len(), 1);
    }

    #[tokio::test]
    async fn expired_rules_are_swept_with_delta_removal() {
        let fx = fixture(quick_config());

        // A rule that expired an hour ago.
        let rule = PolicyRule::builder()
            .action(Action::Drop)
            .source("203.0.113.9/32")
            .unwrap()
            .origin(RuleOrigin::DaemonAuto)
            .expires_at(Utc::now() - chrono::Duration::hours(1))
            .build()
            .unwrap();
        let mut proposal = Proposal::new(rule);
        proposal.transition(ProposalState::Approved).unwrap();
        fx.store.insert_proposal(&proposal, "test").unwrap();

        let deployment = fx.controller.deploy(&proposal).await.unwrap();
        wait_for_state(&fx.store, deployment.id, DeploymentState::Committed).await;
        assert_eq!(fx.adapter.live().len(), 1);

        let removed = fx.controller.sweep_expired().await.unwrap();
        assert_eq!(removed, 1);
        assert!(fx.adapter.live().is_empty());

        // Second sweep is a no-op.
        assert_eq!(fx.controller.sweep_expired().await.unwrap(), 0);
    }
}

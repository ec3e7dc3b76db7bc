// registry.rs — In-process adapter registry.
//
// Adapters are compiled in and registered by name; there is no plugin
// loading. One adapter is active per host. Activation enforces the
// coexistence rule: a second adapter whose kernel subsystem collides with
// the active one (e.g. a legacy translation layer over the same packet
// filter) is refused so the two never fight over the ruleset.

use std::collections::HashMap;
use std::sync::Arc;

use crate::adapter::BackendAdapter;
use crate::error::AdapterError;

/// Registry of known adapters, keyed by name.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn BackendAdapter>>,
    active: Option<String>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its own name. Re-registering a name
    /// replaces the previous adapter unless it is active.
    pub fn register(&mut self, adapter: Arc<dyn BackendAdapter>) -> Result<(), AdapterError> {
        let name = adapter.name().to_string();
        if self.active.as_deref() == Some(name.as_str()) {
            return Err(AdapterError::System(format!(
                "adapter '{}' is active and cannot be replaced",
                name
            )));
        }
        self.adapters.insert(name, adapter);
        Ok(())
    }

    /// Activate a registered adapter.
    ///
    /// Fails with `coexistence` when a different active adapter already
    /// drives the same kernel subsystem; the active adapter is unaffected.
    pub fn activate(&mut self, name: &str) -> Result<Arc<dyn BackendAdapter>, AdapterError> {
        let candidate = self
            .adapters
            .get(name)
            .cloned()
            .ok_or_else(|| AdapterError::Unavailable(format!("no adapter named '{}'", name)))?;

        if let Some(active) = self.active_adapter() {
            if active.name() != name && active.kernel_subsystem() == candidate.kernel_subsystem() {
                return Err(AdapterError::Coexistence(format!(
                    "adapter '{}' shares kernel subsystem '{}' with active adapter '{}'",
                    name,
                    candidate.kernel_subsystem(),
                    active.name()
                )));
            }
            if active.name() != name {
                return Err(AdapterError::System(format!(
                    "adapter '{}' is already active; deactivate it first",
                    active.name()
                )));
            }
        }

        self.active = Some(name.to_string());
        tracing::info!(adapter = name, "backend adapter activated");
        Ok(candidate)
    }

    /// Deactivate the active adapter, if any.
    pub fn deactivate(&mut self) {
        if let Some(name) = self.active.take() {
            tracing::info!(adapter = %name, "backend adapter deactivated");
        }
    }

    /// The active adapter, if one has been activated.
    pub fn active_adapter(&self) -> Option<Arc<dyn BackendAdapter>> {
        self.active
            .as_deref()
            .and_then(|name| self.adapters.get(name).cloned())
    }

    /// Names of all registered adapters.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adapters.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{
        ApplyReceipt, BackupRef, DeltaOp, Health, ImportReport, RenderedRule, RuleSetImage, Verdict,
    };
    use crate::capabilities::{Capabilities, EvaluationOrder};
    use aegis_policy::PolicyRule;
    use chrono::Utc;

    #[derive(Debug)]
    struct StubAdapter {
        name: &'static str,
        subsystem: &'static str,
    }

    impl BackendAdapter for StubAdapter {
        fn name(&self) -> &str {
            self.name
        }

        fn kernel_subsystem(&self) -> &str {
            self.subsystem
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
                backend_name: self.name.to_string(),
                rule_id: Some(rule.id),
                placement: None,
                text: String::new(),
            })
        }

        fn render_image(&self, _rules: &[PolicyRule]) -> Result<RuleSetImage, AdapterError> {
            Ok(RuleSetImage::empty(self.name, ""))
        }

        fn validate(&self, _image: &RuleSetImage) -> Result<Verdict, AdapterError> {
            Ok(Verdict::ok())
        }

        fn snapshot(&self) -> Result<BackupRef, AdapterError> {
            Ok(BackupRef {
                id: uuid::Uuid::new_v4(),
                backend_name: self.name.to_string(),
                path: std::path::PathBuf::new(),
                created_at: Utc::now(),
            })
        }

        fn apply_atomic(&self, _image: &RuleSetImage) -> Result<ApplyReceipt, AdapterError> {
            Ok(ApplyReceipt {
                applied_at: Utc::now(),
                rule_count: 0,
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

    #[test]
    fn activate_registered_adapter() {
        let mut registry = AdapterRegistry::new();
        registry
            .register(Arc::new(StubAdapter {
                name: "nftables",
                subsystem: "netfilter",
            }))
            .unwrap();
        let active = registry.activate("nftables").unwrap();
        assert_eq!(active.name(), "nftables");
        assert!(registry.active_adapter().is_some());
    }

    #[test]
    fn unknown_adapter_is_unavailable() {
        let mut registry = AdapterRegistry::new();
        assert!(matches!(
            registry.activate("missing"),
            Err(AdapterError::Unavailable(_))
        ));
    }

    #[test]
    fn colliding_subsystem_refused_with_coexistence() {
        let mut registry = AdapterRegistry::new();
        registry
            .register(Arc::new(StubAdapter {
                name: "nftables",
                subsystem: "netfilter",
            }))
            .unwrap();
        registry
            .register(Arc::new(StubAdapter {
                name: "iptables-legacy",
                subsystem: "netfilter",
            }))
            .unwrap();

        registry.activate("nftables").unwrap();
        let err = registry.activate("iptables-legacy").unwrap_err();
        assert!(matches!(err, AdapterError::Coexistence(_)));

        // Active adapter unaffected by the refusal.
        assert_eq!(registry.active_adapter().unwrap().name(), "nftables");
    }

    #[test]
    fn activating_same_adapter_twice_is_idempotent() {
        let mut registry = AdapterRegistry::new();
        registry
            .register(Arc::new(StubAdapter {
                name: "nftables",
                subsystem: "netfilter",
            }))
            .unwrap();
        registry.activate("nftables").unwrap();
        assert!(registry.activate("nftables").is_ok());
    }

    #[test]
    fn active_adapter_cannot_be_replaced() {
        let mut registry = AdapterRegistry::new();
        registry
            .register(Arc::new(StubAdapter {
                name: "nftables",
                subsystem: "netfilter",
            }))
            .unwrap();
        registry.activate("nftables").unwrap();
        let err = registry
            .register(Arc::new(StubAdapter {
                name: "nftables",
                subsystem: "netfilter",
            }))
            .unwrap_err();
        assert!(matches!(err, AdapterError::System(_)));
    }
}

// adapter.rs — BackendAdapter implementation over nft.
//
// The adapter owns the `inet aegis` table and nothing else. Snapshots are
// `nft list table` output written to the backup directory; restore loads
// `add table` + `flush table` + snapshot body as one transaction, so the
// ruleset is never half-replaced.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use aegis_backend::{
    AdapterError, ApplyReceipt, BackendAdapter, BackupRef, Capabilities, DeltaOp, EvaluationOrder,
    Health, ImportReport, RenderedRule, RuleSetImage, Verdict,
};
use aegis_policy::PolicyRule;

use crate::parse;
use crate::render;
use crate::runner::{classify_failure, NftRunner, SystemRunner};
use crate::TABLE_SPEC;

const BACKEND_NAME: &str = "nftables";

/// The nftables reference adapter.
pub struct NftAdapter {
    runner: Arc<dyn NftRunner>,
    backup_dir: PathBuf,
}

impl std::fmt::Debug for NftAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NftAdapter")
            .field("backup_dir", &self.backup_dir)
            .finish()
    }
}

impl NftAdapter {
    /// Production adapter using the system `nft` binary.
    pub fn new(backup_dir: impl Into<PathBuf>) -> Result<Self, AdapterError> {
        Self::with_runner(Arc::new(SystemRunner), backup_dir)
    }

    /// Adapter with a custom runner (tests use a scripted one).
    pub fn with_runner(
        runner: Arc<dyn NftRunner>,
        backup_dir: impl Into<PathBuf>,
    ) -> Result<Self, AdapterError> {
        let backup_dir = backup_dir.into();
        std::fs::create_dir_all(&backup_dir)
            .map_err(|e| AdapterError::System(format!("creating backup dir: {}", e)))?;
        Ok(Self { runner, backup_dir })
    }

    fn table_args() -> Vec<&'static str> {
        TABLE_SPEC.split(' ').collect()
    }

    fn list_table(&self, with_handles: bool) -> Result<String, AdapterError> {
        let mut args = if with_handles {
            vec!["-a", "list", "table"]
        } else {
            vec!["list", "table"]
        };
        args.extend(Self::table_args());
        let output = self.runner.run(&args, None)?;
        if output.status_ok {
            return Ok(output.stdout);
        }
        if table_missing(&output.stderr) {
            // The table does not exist yet; that is an empty ruleset,
            // not a failure.
            return Ok(String::new());
        }
        Err(classify_failure(&output.stderr))
    }

    fn load(&self, batch: &str) -> Result<(), AdapterError> {
        let output = self.runner.run(&["-f", "-"], Some(batch))?;
        if output.status_ok {
            Ok(())
        } else {
            Err(classify_failure(&output.stderr))
        }
    }
}

fn table_missing(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("no such file or directory") || lower.contains("does not exist")
}

impl BackendAdapter for NftAdapter {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    fn kernel_subsystem(&self) -> &str {
        "netfilter"
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
        let body = render::render_rule(rule)?;
        Ok(RenderedRule {
            backend_name: BACKEND_NAME.to_string(),
            rule_id: Some(rule.id),
            placement: Some(render::chain_for(rule.direction).to_string()),
            text: body,
        })
    }

    fn render_image(&self, rules: &[PolicyRule]) -> Result<RuleSetImage, AdapterError> {
        // Stable sort: priority first, insertion order breaks ties.
        let mut ordered: Vec<&PolicyRule> = rules.iter().collect();
        ordered.sort_by_key(|r| r.priority);

        let mut rendered = Vec::with_capacity(ordered.len());
        let mut bodies = Vec::with_capacity(ordered.len());
        for rule in ordered {
            let rr = self.render(rule)?;
            bodies.push((rule.direction, rr.text.clone()));
            rendered.push(rr);
        }

        Ok(RuleSetImage {
            backend_name: BACKEND_NAME.to_string(),
            text: render::build_image(TABLE_SPEC, &bodies),
            rules: rendered,
        })
    }

    fn validate(&self, image: &RuleSetImage) -> Result<Verdict, AdapterError> {
        let output = self.runner.run(&["--check", "-f", "-"], Some(&image.text))?;
        if output.status_ok {
            Ok(Verdict::ok())
        } else {
            Ok(Verdict::failed(output.stderr.trim().to_string()))
        }
    }

    fn snapshot(&self) -> Result<BackupRef, AdapterError> {
        let content = self.list_table(false)?;
        let id = Uuid::new_v4();
        let name = format!("{}-{}.nft", Utc::now().format("%Y%m%dT%H%M%SZ"), id);
        let path = self.backup_dir.join(name);
        std::fs::write(&path, &content)
            .map_err(|e| AdapterError::System(format!("writing snapshot: {}", e)))?;
        tracing::debug!(path = %path.display(), bytes = content.len(), "ruleset snapshot written");
        Ok(BackupRef {
            id,
            backend_name: BACKEND_NAME.to_string(),
            path,
            created_at: Utc::now(),
        })
    }

    fn apply_atomic(&self, image: &RuleSetImage) -> Result<ApplyReceipt, AdapterError> {
        self.load(&image.text)?;
        Ok(ApplyReceipt {
            applied_at: Utc::now(),
            rule_count: image.rules.len(),
            delta: false,
        })
    }

    fn apply_delta(&self, op: &DeltaOp) -> Result<ApplyReceipt, AdapterError> {
        match op {
            DeltaOp::Add(rule) => {
                let chain = rule.placement.as_deref().ok_or_else(|| {
                    AdapterError::System("rendered rule has no chain placement".to_string())
                })?;
                let batch = format!("add rule {} {} {}\n", TABLE_SPEC, chain, rule.text);
                self.load(&batch)?;
                Ok(ApplyReceipt {
                    applied_at: Utc::now(),
                    rule_count: 1,
                    delta: true,
                })
            }
            DeltaOp::Remove(rule) => {
                let rule_id = rule.rule_id.ok_or_else(|| {
                    AdapterError::System("cannot remove a rule without an id".to_string())
                })?;
                let listing = self.list_table(true)?;
                match parse::find_handle(&listing, rule_id) {
                    Some((chain, handle)) => {
                        let batch =
                            format!("delete rule {} {} handle {}\n", TABLE_SPEC, chain, handle);
                        self.load(&batch)?;
                        Ok(ApplyReceipt {
                            applied_at: Utc::now(),
                            rule_count: 1,
                            delta: true,
                        })
                    }
                    // Already gone; removal is idempotent.
                    None => Ok(ApplyReceipt {
                        applied_at: Utc::now(),
                        rule_count: 0,
                        delta: true,
                    }),
                }
            }
        }
    }

    fn restore(&self, backup: &BackupRef) -> Result<bool, AdapterError> {
        let content = match std::fs::read_to_string(&backup.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(AdapterError::System(format!("reading snapshot: {}", e))),
        };

        let batch = if content.trim().is_empty() {
            // Snapshot predates the table: restoring means removing it.
            format!("add table {spec}\ndelete table {spec}\n", spec = TABLE_SPEC)
        } else {
            format!(
                "add table {spec}\nflush table {spec}\n{body}",
                spec = TABLE_SPEC,
                body = content
            )
        };
        self.load(&batch)?;
        Ok(true)
    }

    fn list_rules(&self) -> Result<Vec<RenderedRule>, AdapterError> {
        let listing = self.list_table(false)?;
        Ok(parse::list_rendered(&listing, BACKEND_NAME))
    }

    fn import_rules(&self) -> Result<ImportReport, AdapterError> {
        let listing = self.list_table(false)?;
        let (rules, warnings) = parse::lift_rules(&listing);
        Ok(ImportReport { rules, warnings })
    }

    fn health(&self) -> Health {
        let reachable = self
            .runner
            .run(&["list", "tables"], None)
            .map(|o| o.status_ok)
            .unwrap_or(false);
        let writable = reachable
            && self
                .runner
                .run(
                    &["--check", "-f", "-"],
                    Some(&format!("add table {}\n", TABLE_SPEC)),
                )
                .map(|o| o.status_ok)
                .unwrap_or(false);
        Health {
            reachable,
            writable,
        }
    }
}

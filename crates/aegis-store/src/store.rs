// store.rs — SQLite-backed state and audit store.
//
// One file, WAL journal mode, so the daemon can write while the CLI reads.
// Entity rows carry their full JSON document plus the columns queries
// filter on; the document is the source of truth for the object shape.
//
// Transitions are transactional: the row update and its audit record
// commit together or not at all. The audit table refuses UPDATE and
// DELETE via triggers, so append-only holds even against bugs in this
// process.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Transaction};
use uuid::Uuid;

use aegis_policy::NeverBlockEntry;

use crate::audit::{chain_hash, AuditAction, AuditRecord};
use crate::error::StoreError;
use crate::event::SecurityEvent;
use crate::model::{Deployment, DeploymentState, Proposal, ProposalState};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS proposals (
    id          TEXT PRIMARY KEY,
    state       TEXT NOT NULL,
    origin      TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL,
    doc         TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS deployments (
    id          TEXT PRIMARY KEY,
    proposal_id TEXT NOT NULL UNIQUE REFERENCES proposals(id),
    backend     TEXT NOT NULL,
    state       TEXT NOT NULL,
    applied_at  TEXT,
    doc         TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS events (
    id          TEXT PRIMARY KEY,
    source_name TEXT NOT NULL,
    kind        TEXT NOT NULL,
    severity    TEXT NOT NULL,
    source_ip   TEXT,
    observed_at TEXT NOT NULL,
    causal_tag  TEXT,
    doc         TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS events_observed_at ON events(observed_at);
CREATE TABLE IF NOT EXISTS audit (
    seq         INTEGER PRIMARY KEY AUTOINCREMENT,
    at          TEXT NOT NULL,
    actor       TEXT NOT NULL,
    action      TEXT NOT NULL,
    subject_id  TEXT,
    error_kind  TEXT,
    detail      TEXT NOT NULL,
    prev_hash   TEXT,
    hash        TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS daemon_state (
    key         TEXT PRIMARY KEY,
    value       TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS never_block (
    label       TEXT PRIMARY KEY,
    doc         TEXT NOT NULL,
    added_at    TEXT NOT NULL
);
CREATE TRIGGER IF NOT EXISTS audit_append_only_update
    BEFORE UPDATE ON audit
    BEGIN SELECT RAISE(ABORT, 'audit log is append-only'); END;
CREATE TRIGGER IF NOT EXISTS audit_append_only_delete
    BEFORE DELETE ON audit
    BEGIN SELECT RAISE(ABORT, 'audit log is append-only'); END;
"#;

struct Inner {
    conn: Connection,
    last_hash: Option<String>,
}

/// The persistent store. Cheap to share behind an `Arc`.
pub struct Store {
    inner: Mutex<Inner>,
}

impl Store {
    /// Open (or create) the store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())?;
        Self::init(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    /// Read-only handle for dashboard consumers. No schema changes, no
    /// writes possible.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open_with_flags(
            path.as_ref(),
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        let last_hash = read_last_hash(&conn)?;
        Ok(Self {
            inner: Mutex::new(Inner { conn, last_hash }),
        })
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        // WAL survives unclean shutdown and lets readers run during writes;
        // NORMAL still fsyncs at every transaction commit in WAL mode.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        let last_hash = read_last_hash(&conn)?;
        Ok(Self {
            inner: Mutex::new(Inner { conn, last_hash }),
        })
    }

    fn with_tx<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>, &mut Option<String>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        let Inner { conn, last_hash } = &mut *inner;
        let tx = conn.transaction()?;
        // Work on a copy of the chain tip; only adopt it on commit.
        let mut hash = last_hash.clone();
        let out = f(&tx, &mut hash)?;
        tx.commit()?;
        *last_hash = hash;
        Ok(out)
    }

    // ── Proposals ────────────────────────────────────────────────

    pub fn insert_proposal(&self, proposal: &Proposal, actor: &str) -> Result<AuditRecord, StoreError> {
        let doc = serde_json::to_string(proposal)?;
        self.with_tx(|tx, last_hash| {
            tx.execute(
                "INSERT INTO proposals (id, state, origin, created_at, updated_at, doc)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    proposal.id.to_string(),
                    proposal.state.to_string(),
                    proposal.rule.origin.to_string(),
                    proposal.created_at.to_rfc3339(),
                    proposal.updated_at.to_rfc3339(),
                    doc,
                ],
            )?;
            append_audit_tx(
                tx,
                last_hash,
                actor,
                AuditAction::ProposalCreated,
                Some(&proposal.id.to_string()),
                None,
                serde_json::json!({ "origin": proposal.rule.origin.to_string() }),
            )
        })
    }

    /// Persist a proposal's current shape together with the audit record
    /// describing the transition that produced it.
    pub fn update_proposal(
        &self,
        proposal: &Proposal,
        action: AuditAction,
        actor: &str,
        detail: serde_json::Value,
    ) -> Result<AuditRecord, StoreError> {
        let doc = serde_json::to_string(proposal)?;
        self.with_tx(|tx, last_hash| {
            let changed = tx.execute(
                "UPDATE proposals SET state = ?2, updated_at = ?3, doc = ?4 WHERE id = ?1",
                params![
                    proposal.id.to_string(),
                    proposal.state.to_string(),
                    proposal.updated_at.to_rfc3339(),
                    doc,
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("proposal {}", proposal.id)));
            }
            append_audit_tx(
                tx,
                last_hash,
                actor,
                action,
                Some(&proposal.id.to_string()),
                None,
                detail,
            )
        })
    }

    pub fn get_proposal(&self, id: Uuid) -> Result<Proposal, StoreError> {
        let inner = self.inner.lock().expect("store lock poisoned");
        let doc: Option<String> = inner
            .conn
            .query_row(
                "SELECT doc FROM proposals WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        let doc = doc.ok_or_else(|| StoreError::NotFound(format!("proposal {}", id)))?;
        Ok(serde_json::from_str(&doc)?)
    }

    pub fn list_proposals(&self, state: Option<ProposalState>) -> Result<Vec<Proposal>, StoreError> {
        let inner = self.inner.lock().expect("store lock poisoned");
        let mut out = Vec::new();
        match state {
            Some(state) => {
                let mut stmt = inner.conn.prepare(
                    "SELECT doc FROM proposals WHERE state = ?1 ORDER BY created_at DESC",
                )?;
                let rows = stmt.query_map(params![state.to_string()], |row| row.get::<_, String>(0))?;
                for doc in rows {
                    out.push(serde_json::from_str(&doc?)?);
                }
            }
            None => {
                let mut stmt = inner
                    .conn
                    .prepare("SELECT doc FROM proposals ORDER BY created_at DESC")?;
                let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
                for doc in rows {
                    out.push(serde_json::from_str(&doc?)?);
                }
            }
        }
        Ok(out)
    }

    // ── Deployments ──────────────────────────────────────────────

    pub fn insert_deployment(
        &self,
        deployment: &Deployment,
        actor: &str,
    ) -> Result<AuditRecord, StoreError> {
        let doc = serde_json::to_string(deployment)?;
        self.with_tx(|tx, last_hash| {
            tx.execute(
                "INSERT INTO deployments (id, proposal_id, backend, state, applied_at, doc)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    deployment.id.to_string(),
                    deployment.proposal_id.to_string(),
                    deployment.backend,
                    deployment.state.to_string(),
                    deployment.applied_at.map(|t| t.to_rfc3339()),
                    doc,
                ],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(f, _)
                    if f.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    StoreError::Integrity(format!(
                        "proposal {} already has a deployment",
                        deployment.proposal_id
                    ))
                }
                other => StoreError::Database(other),
            })?;
            append_audit_tx(
                tx,
                last_hash,
                actor,
                AuditAction::DeploymentQueued,
                Some(&deployment.id.to_string()),
                None,
                serde_json::json!({ "proposal_id": deployment.proposal_id.to_string() }),
            )
        })
    }

    pub fn update_deployment(
        &self,
        deployment: &Deployment,
        action: AuditAction,
        actor: &str,
        error_kind: Option<&str>,
        detail: serde_json::Value,
    ) -> Result<AuditRecord, StoreError> {
        let doc = serde_json::to_string(deployment)?;
        self.with_tx(|tx, last_hash| {
            // The controller's lock serializes applies; this guard catches
            // violations of the one-in-flight invariant at the last line.
            if deployment.state == DeploymentState::Applying {
                let in_flight: i64 = tx.query_row(
                    "SELECT COUNT(*) FROM deployments
                     WHERE backend = ?1 AND id != ?2 AND state IN ('applying', 'probation')",
                    params![deployment.backend, deployment.id.to_string()],
                    |row| row.get(0),
                )?;
                if in_flight > 0 {
                    return Err(StoreError::Integrity(format!(
                        "backend '{}' already has an in-flight deployment",
                        deployment.backend
                    )));
                }
            }
            let changed = tx.execute(
                "UPDATE deployments SET state = ?2, applied_at = ?3, doc = ?4 WHERE id = ?1",
                params![
                    deployment.id.to_string(),
                    deployment.state.to_string(),
                    deployment.applied_at.map(|t| t.to_rfc3339()),
                    doc,
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("deployment {}", deployment.id)));
            }
            append_audit_tx(
                tx,
                last_hash,
                actor,
                action,
                Some(&deployment.id.to_string()),
                error_kind,
                detail,
            )
        })
    }

    /// Record a successful heartbeat probe. Not a state transition, so no
    /// audit record is written.
    pub fn heartbeat_deployment(&self, deployment: &Deployment) -> Result<(), StoreError> {
        let doc = serde_json::to_string(deployment)?;
        let inner = self.inner.lock().expect("store lock poisoned");
        let changed = inner.conn.execute(
            "UPDATE deployments SET doc = ?2 WHERE id = ?1",
            params![deployment.id.to_string(), doc],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("deployment {}", deployment.id)));
        }
        Ok(())
    }

    pub fn get_deployment(&self, id: Uuid) -> Result<Deployment, StoreError> {
        let inner = self.inner.lock().expect("store lock poisoned");
        let doc: Option<String> = inner
            .conn
            .query_row(
                "SELECT doc FROM deployments WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        let doc = doc.ok_or_else(|| StoreError::NotFound(format!("deployment {}", id)))?;
        Ok(serde_json::from_str(&doc)?)
    }

    /// The deployment currently occupying a backend, if any.
    pub fn active_deployment(&self, backend: &str) -> Result<Option<Deployment>, StoreError> {
        let inner = self.inner.lock().expect("store lock poisoned");
        let doc: Option<String> = inner
            .conn
            .query_row(
                "SELECT doc FROM deployments
                 WHERE backend = ?1 AND state IN ('applying', 'probation')
                 ORDER BY rowid DESC LIMIT 1",
                params![backend],
                |row| row.get(0),
            )
            .optional()?;
        Ok(match doc {
            Some(doc) => Some(serde_json::from_str(&doc)?),
            None => None,
        })
    }

    /// Queued deployments for a backend, oldest first (FIFO).
    pub fn queued_deployments(&self, backend: &str) -> Result<Vec<Deployment>, StoreError> {
        let inner = self.inner.lock().expect("store lock poisoned");
        let mut stmt = inner.conn.prepare(
            "SELECT doc FROM deployments WHERE backend = ?1 AND state = 'queued' ORDER BY rowid",
        )?;
        let rows = stmt.query_map(params![backend], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for doc in rows {
            out.push(serde_json::from_str(&doc?)?);
        }
        Ok(out)
    }

    pub fn list_deployments(&self, limit: usize) -> Result<Vec<Deployment>, StoreError> {
        let inner = self.inner.lock().expect("store lock poisoned");
        let mut stmt = inner
            .conn
            .prepare("SELECT doc FROM deployments ORDER BY rowid DESC LIMIT ?1")?;
        let rows = stmt.query_map(params![limit as i64], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for doc in rows {
            out.push(serde_json::from_str(&doc?)?);
        }
        Ok(out)
    }

    /// How many daemon-origin deployments were applied since `since`.
    /// The circuit breaker window query.
    pub fn count_autonomous_deployments_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        let inner = self.inner.lock().expect("store lock poisoned");
        let count: i64 = inner.conn.query_row(
            "SELECT COUNT(*) FROM deployments d
             JOIN proposals p ON p.id = d.proposal_id
             WHERE p.origin = 'daemon-auto'
               AND d.applied_at IS NOT NULL AND d.applied_at >= ?1",
            params![since.to_rfc3339()],
            |row| row.get(0),
        )?;
        Ok(count as u32)
    }

    // ── Events ───────────────────────────────────────────────────

    pub fn insert_event(&self, event: &SecurityEvent) -> Result<(), StoreError> {
        self.insert_events(std::slice::from_ref(event))
    }

    /// Insert a batch of events, each with its audit record, in one
    /// transaction.
    pub fn insert_events(&self, events: &[SecurityEvent]) -> Result<(), StoreError> {
        if events.is_empty() {
            return Ok(());
        }
        self.with_tx(|tx, last_hash| {
            for event in events {
                let doc = serde_json::to_string(event)?;
                tx.execute(
                    "INSERT INTO events
                     (id, source_name, kind, severity, source_ip, observed_at, causal_tag, doc)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        event.id.to_string(),
                        event.source_name,
                        event.kind.as_str(),
                        event.severity.as_str(),
                        event.source_ip.map(|ip| ip.to_string()),
                        event.observed_at.to_rfc3339(),
                        event.causal_tag.map(|t| t.to_string()),
                        doc,
                    ],
                )?;
                let action = match event.kind {
                    crate::event::EventKind::SourceDrop => AuditAction::EventsDropped,
                    _ => AuditAction::EventObserved,
                };
                append_audit_tx(
                    tx,
                    last_hash,
                    &event.source_name,
                    action,
                    Some(&event.id.to_string()),
                    None,
                    serde_json::json!({ "kind": event.kind.as_str() }),
                )?;
            }
            Ok(())
        })
    }

    /// Events observed at or after `since`, oldest first. The replay half
    /// of an event subscription.
    pub fn events_since(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SecurityEvent>, StoreError> {
        let inner = self.inner.lock().expect("store lock poisoned");
        let mut stmt = inner.conn.prepare(
            "SELECT doc FROM events WHERE observed_at >= ?1 ORDER BY observed_at LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![since.to_rfc3339(), limit as i64], |row| {
            row.get::<_, String>(0)
        })?;
        let mut out = Vec::new();
        for doc in rows {
            out.push(serde_json::from_str(&doc?)?);
        }
        Ok(out)
    }

    /// Delete events older than the retention window. The audit trail is
    /// never swept.
    pub fn sweep_events(&self, retain_days: u32) -> Result<usize, StoreError> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(retain_days));
        let inner = self.inner.lock().expect("store lock poisoned");
        let deleted = inner.conn.execute(
            "DELETE FROM events WHERE observed_at < ?1",
            params![cutoff.to_rfc3339()],
        )?;
        Ok(deleted)
    }

    // ── Audit ────────────────────────────────────────────────────

    /// Append a standalone audit record (gate trips, breaker events...).
    pub fn append_audit(
        &self,
        actor: &str,
        action: AuditAction,
        subject_id: Option<&str>,
        error_kind: Option<&str>,
        detail: serde_json::Value,
    ) -> Result<AuditRecord, StoreError> {
        self.with_tx(|tx, last_hash| {
            append_audit_tx(tx, last_hash, actor, action, subject_id, error_kind, detail)
        })
    }

    /// The newest `limit` audit records, oldest first.
    pub fn audit_tail(&self, limit: usize) -> Result<Vec<AuditRecord>, StoreError> {
        let inner = self.inner.lock().expect("store lock poisoned");
        let mut stmt = inner.conn.prepare(
            "SELECT seq, at, actor, action, subject_id, error_kind, detail, prev_hash, hash
             FROM audit ORDER BY seq DESC LIMIT ?1",
        )?;
        let mut records = stmt
            .query_map(params![limit as i64], row_to_audit)?
            .collect::<Result<Vec<_>, _>>()?;
        records.reverse();
        Ok(records)
    }

    /// Audit records with seq greater than the cursor, oldest first.
    pub fn audit_since(&self, seq: i64, limit: usize) -> Result<Vec<AuditRecord>, StoreError> {
        let inner = self.inner.lock().expect("store lock poisoned");
        let mut stmt = inner.conn.prepare(
            "SELECT seq, at, actor, action, subject_id, error_kind, detail, prev_hash, hash
             FROM audit WHERE seq > ?1 ORDER BY seq LIMIT ?2",
        )?;
        let records = stmt
            .query_map(params![seq, limit as i64], row_to_audit)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Walk the whole chain and verify hashes and sequence continuity.
    pub fn verify_audit_chain(&self) -> Result<bool, StoreError> {
        let inner = self.inner.lock().expect("store lock poisoned");
        let mut stmt = inner.conn.prepare(
            "SELECT seq, at, actor, action, subject_id, error_kind, detail, prev_hash, hash
             FROM audit ORDER BY seq",
        )?;
        let records = stmt
            .query_map([], row_to_audit)?
            .collect::<Result<Vec<_>, _>>()?;

        let mut prev_hash: Option<String> = None;
        let mut prev_seq: Option<i64> = None;
        for record in records {
            if let Some(prev) = prev_seq {
                if record.seq != prev + 1 {
                    return Err(StoreError::Integrity(format!(
                        "audit sequence gap between {} and {}",
                        prev, record.seq
                    )));
                }
            }
            if record.prev_hash != prev_hash {
                return Err(StoreError::Integrity(format!(
                    "audit chain broken at seq {}",
                    record.seq
                )));
            }
            let expect = chain_hash(
                &record.at,
                &record.actor,
                record.action,
                record.subject_id.as_deref(),
                record.error_kind.as_deref(),
                &record.detail,
                record.prev_hash.as_deref(),
            );
            if expect != record.hash {
                return Err(StoreError::Integrity(format!(
                    "audit record {} hash mismatch",
                    record.seq
                )));
            }
            prev_hash = Some(record.hash.clone());
            prev_seq = Some(record.seq);
        }
        Ok(true)
    }

    // ── Daemon state ─────────────────────────────────────────────

    pub fn daemon_state_get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let inner = self.inner.lock().expect("store lock poisoned");
        Ok(inner
            .conn
            .query_row(
                "SELECT value FROM daemon_state WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn daemon_state_set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let inner = self.inner.lock().expect("store lock poisoned");
        inner.conn.execute(
            "INSERT INTO daemon_state (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = ?3",
            params![key, value, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    // ── Never-block ──────────────────────────────────────────────

    pub fn never_block_load(&self) -> Result<Vec<NeverBlockEntry>, StoreError> {
        let inner = self.inner.lock().expect("store lock poisoned");
        let mut stmt = inner
            .conn
            .prepare("SELECT doc FROM never_block ORDER BY added_at")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for doc in rows {
            out.push(serde_json::from_str(&doc?)?);
        }
        Ok(out)
    }

    pub fn never_block_save(&self, entry: &NeverBlockEntry, actor: &str) -> Result<(), StoreError> {
        let label = entry.label();
        let doc = serde_json::to_string(entry)?;
        self.with_tx(|tx, last_hash| {
            tx.execute(
                "INSERT INTO never_block (label, doc, added_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(label) DO UPDATE SET doc = ?2",
                params![label, doc, Utc::now().to_rfc3339()],
            )?;
            append_audit_tx(
                tx,
                last_hash,
                actor,
                AuditAction::NeverBlockAdded,
                Some(&label),
                None,
                serde_json::Value::Null,
            )?;
            Ok(())
        })
    }

    pub fn never_block_remove(&self, label: &str, actor: &str) -> Result<usize, StoreError> {
        self.with_tx(|tx, last_hash| {
            let removed = tx.execute("DELETE FROM never_block WHERE label = ?1", params![label])?;
            if removed > 0 {
                append_audit_tx(
                    tx,
                    last_hash,
                    actor,
                    AuditAction::NeverBlockRemoved,
                    Some(label),
                    None,
                    serde_json::Value::Null,
                )?;
            }
            Ok(removed)
        })
    }
}

fn read_last_hash(conn: &Connection) -> Result<Option<String>, StoreError> {
    Ok(conn
        .query_row(
            "SELECT hash FROM audit ORDER BY seq DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()?)
}

fn append_audit_tx(
    tx: &Transaction<'_>,
    last_hash: &mut Option<String>,
    actor: &str,
    action: AuditAction,
    subject_id: Option<&str>,
    error_kind: Option<&str>,
    detail: serde_json::Value,
) -> Result<AuditRecord, StoreError> {
    let at = Utc::now();
    let hash = chain_hash(
        &at,
        actor,
        action,
        subject_id,
        error_kind,
        &detail,
        last_hash.as_deref(),
    );
    tx.execute(
        "INSERT INTO audit (at, actor, action, subject_id, error_kind, detail, prev_hash, hash)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            at.to_rfc3339(),
            actor,
            action.as_str(),
            subject_id,
            error_kind,
            detail.to_string(),
            last_hash.as_deref(),
            hash,
        ],
    )?;
    let seq = tx.last_insert_rowid();
    let record = AuditRecord {
        seq,
        at,
        actor: actor.to_string(),
        action,
        subject_id: subject_id.map(str::to_string),
        error_kind: error_kind.map(str::to_string),
        detail,
        prev_hash: last_hash.clone(),
        hash: hash.clone(),
    };
    *last_hash = Some(hash);
    Ok(record)
}

fn row_to_audit(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditRecord> {
    let at: String = row.get(1)?;
    let action: String = row.get(3)?;
    let detail: String = row.get(6)?;
    Ok(AuditRecord {
        seq: row.get(0)?,
        at: at
            .parse::<DateTime<Utc>>()
            .unwrap_or_else(|_| Utc::now()),
        actor: row.get(2)?,
        action: serde_json::from_value(serde_json::Value::String(action))
            .unwrap_or(AuditAction::EventObserved),
        subject_id: row.get(4)?,
        error_kind: row.get(5)?,
        detail: serde_json::from_str(&detail).unwrap_or(serde_json::Value::Null),
        prev_hash: row.get(7)?,
        hash: row.get(8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventKind, Severity};
    use aegis_policy::{Action, PolicyRule, RuleOrigin};

    fn rule() -> PolicyRule {
        PolicyRule::builder()
            .action(Action::Drop)
            .source("203.0.113.7/32")
            .unwrap()
            .origin(RuleOrigin::DaemonAuto)
            .build()
            .unwrap()
    }

    fn store() -> Store {
        Store::open_in_memory().unwrap()
    }

    #[test]
    fn proposal_round_trip() {
        let store = store();
        let proposal = Proposal::new(rule());
        store.insert_proposal(&proposal, "operator").unwrap();

        let loaded = store.get_proposal(proposal.id).unwrap();
        assert_eq!(loaded.id, proposal.id);
        assert_eq!(loaded.state, ProposalState::Draft);
        assert_eq!(loaded.rule.id, proposal.rule.id);
    }

    #[test]
    fn transition_writes_row_and_audit_together() {
        let store = store();
        let mut proposal = Proposal::new(rule());
        store.insert_proposal(&proposal, "operator").unwrap();

        proposal.transition(ProposalState::Approved).unwrap();
        store
            .update_proposal(
                &proposal,
                AuditAction::ProposalApproved,
                "operator",
                serde_json::Value::Null,
            )
            .unwrap();

        let loaded = store.get_proposal(proposal.id).unwrap();
        assert_eq!(loaded.state, ProposalState::Approved);

        let tail = store.audit_tail(10).unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].action, AuditAction::ProposalCreated);
        assert_eq!(tail[1].action, AuditAction::ProposalApproved);
    }

    #[test]
    fn one_deployment_per_proposal() {
        let store = store();
        let proposal = Proposal::new(rule());
        store.insert_proposal(&proposal, "operator").unwrap();

        let d1 = Deployment::new(proposal.id, "nftables");
        store.insert_deployment(&d1, "controller").unwrap();

        let d2 = Deployment::new(proposal.id, "nftables");
        let err = store.insert_deployment(&d2, "controller").unwrap_err();
        assert!(matches!(err, StoreError::Integrity(_)));
    }

    #[test]
    fn one_in_flight_deployment_per_backend() {
        let store = store();
        let p1 = Proposal::new(rule());
        let p2 = Proposal::new(rule());
        store.insert_proposal(&p1, "operator").unwrap();
        store.insert_proposal(&p2, "operator").unwrap();

        let mut d1 = Deployment::new(p1.id, "nftables");
        store.insert_deployment(&d1, "controller").unwrap();
        d1.transition(DeploymentState::Applying).unwrap();
        store
            .update_deployment(
                &d1,
                AuditAction::DeploymentApplying,
                "controller",
                None,
                serde_json::Value::Null,
            )
            .unwrap();

        let mut d2 = Deployment::new(p2.id, "nftables");
        store.insert_deployment(&d2, "controller").unwrap();
        d2.transition(DeploymentState::Applying).unwrap();
        let err = store
            .update_deployment(
                &d2,
                AuditAction::DeploymentApplying,
                "controller",
                None,
                serde_json::Value::Null,
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::Integrity(_)));

        assert_eq!(
            store.active_deployment("nftables").unwrap().unwrap().id,
            d1.id
        );
    }

    #[test]
    fn queued_deployments_fifo() {
        let store = store();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let p = Proposal::new(rule());
            store.insert_proposal(&p, "operator").unwrap();
            let d = Deployment::new(p.id, "nftables");
            store.insert_deployment(&d, "controller").unwrap();
            ids.push(d.id);
        }
        let queued = store.queued_deployments("nftables").unwrap();
        assert_eq!(queued.iter().map(|d| d.id).collect::<Vec<_>>(), ids);
    }

    #[test]
    fn audit_chain_verifies_and_is_gapless() {
        let store = store();
        for i in 0..5 {
            store
                .append_audit(
                    "daemon",
                    AuditAction::ThreatEscalated,
                    Some(&format!("subject-{}", i)),
                    None,
                    serde_json::json!({ "i": i }),
                )
                .unwrap();
        }
        assert!(store.verify_audit_chain().unwrap());
        let tail = store.audit_tail(10).unwrap();
        assert_eq!(tail.len(), 5);
        let seqs: Vec<i64> = tail.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
        assert!(tail[0].prev_hash.is_none());
        assert_eq!(tail[1].prev_hash.as_deref(), Some(tail[0].hash.as_str()));
    }

    #[test]
    fn audit_rows_refuse_update_and_delete() {
        let store = store();
        store
            .append_audit("daemon", AuditAction::BreakerTripped, None, None, serde_json::Value::Null)
            .unwrap();

        let inner = store.inner.lock().unwrap();
        let update = inner
            .conn
            .execute("UPDATE audit SET actor = 'intruder'", []);
        assert!(update.is_err());
        let delete = inner.conn.execute("DELETE FROM audit", []);
        assert!(delete.is_err());
    }

    #[test]
    fn events_insert_with_audit_and_sweep() {
        let store = store();
        let event = SecurityEvent::new("sshd", EventKind::AuthFail, Severity::Medium)
            .with_source_ip("203.0.113.7".parse().unwrap());
        store.insert_event(&event).unwrap();

        let tail = store.audit_tail(10).unwrap();
        assert_eq!(tail.last().unwrap().action, AuditAction::EventObserved);

        // Nothing old enough to sweep.
        assert_eq!(store.sweep_events(1).unwrap(), 0);
    }

    #[test]
    fn drop_counter_events_audit_as_events_dropped() {
        let store = store();
        let event = SecurityEvent::new("sshd", EventKind::SourceDrop, Severity::Low)
            .with_raw("dropped=17");
        store.insert_event(&event).unwrap();
        let tail = store.audit_tail(1).unwrap();
        assert_eq!(tail[0].action, AuditAction::EventsDropped);
    }

    #[test]
    fn autonomous_deployment_count_window() {
        let store = store();
        let p = Proposal::new(rule()); // origin daemon-auto
        store.insert_proposal(&p, "daemon").unwrap();
        let mut d = Deployment::new(p.id, "nftables");
        store.insert_deployment(&d, "controller").unwrap();
        d.transition(DeploymentState::Applying).unwrap();
        d.applied_at = Some(Utc::now());
        store
            .update_deployment(&d, AuditAction::DeploymentApplying, "controller", None, serde_json::Value::Null)
            .unwrap();

        let hour_ago = Utc::now() - chrono::Duration::hours(1);
        assert_eq!(store.count_autonomous_deployments_since(hour_ago).unwrap(), 1);
        let future = Utc::now() + chrono::Duration::minutes(1);
        assert_eq!(store.count_autonomous_deployments_since(future).unwrap(), 0);
    }

    #[test]
    fn daemon_state_round_trip() {
        let store = store();
        assert!(store.daemon_state_get("autonomy.level").unwrap().is_none());
        store.daemon_state_set("autonomy.level", "cautious").unwrap();
        store.daemon_state_set("autonomy.level", "monitor").unwrap();
        assert_eq!(
            store.daemon_state_get("autonomy.level").unwrap().as_deref(),
            Some("monitor")
        );
    }

    #[test]
    fn never_block_round_trip() {
        let store = store();
        let entry = NeverBlockEntry::parse("10.0.0.1/32");
        store.never_block_save(&entry, "operator").unwrap();
        let loaded = store.never_block_load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].label(), "10.0.0.1/32");

        assert_eq!(store.never_block_remove("10.0.0.1/32", "operator").unwrap(), 1);
        assert!(store.never_block_load().unwrap().is_empty());
    }

    #[test]
    fn store_survives_reopen_with_chain_intact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aegis.db");
        {
            let store = Store::open(&path).unwrap();
            store
                .append_audit("daemon", AuditAction::ConfigReloaded, None, None, serde_json::Value::Null)
                .unwrap();
        }
        {
            let store = Store::open(&path).unwrap();
            store
                .append_audit("daemon", AuditAction::BreakerReset, None, None, serde_json::Value::Null)
                .unwrap();
            assert!(store.verify_audit_chain().unwrap());
            assert_eq!(store.audit_tail(10).unwrap().len(), 2);
        }
    }
}

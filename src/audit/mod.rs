//! Dual-written audit trail.
//!
//! Every action is appended to the local per-institution log first and to the
//! remote table second. The local log is the durable record: a failed remote
//! append is only logged, and [`AuditLogger::reconcile`] pushes whatever the
//! remote side is missing later on. The [`GlobalSummary`] is updated together
//! with each local append and can always be rebuilt from the logs.

mod store;
mod summary;

pub use store::AuditStore;
pub use summary::{ActionSummary, CityActivity, GlobalSummary};

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::cache::{quarantine, read_document, write_document};
use crate::crypto::Envelope;
use crate::error::Result;
use crate::gateway::{self, Backend};
use crate::types::{
    AuditAction, AuditLogEntry, FieldChange, PermissionChangeEntry, PermissionSet, Principal,
};

const SUMMARY_FILE: &str = "summary.json";
const RECONCILE_BATCH: usize = 100;

/// What happened, to whom and where. The principal and timestamp are filled
/// in by [`AuditLogger::record`].
#[derive(Debug, Clone)]
pub struct ActionRecord {
    action: AuditAction,
    city: Option<String>,
    institution: Option<String>,
    entity_name: Option<String>,
    entity_id: Option<String>,
    detail: String,
    changes: BTreeMap<String, FieldChange>,
}

impl ActionRecord {
    #[must_use]
    pub fn new(action: AuditAction) -> Self {
        Self {
            action,
            city: None,
            institution: None,
            entity_name: None,
            entity_id: None,
            detail: String::new(),
            changes: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn city(mut self, city: impl Into<String>) -> Self {
        self.city = Some(city.into());
        self
    }

    #[must_use]
    pub fn institution(mut self, city: impl Into<String>, institution: impl Into<String>) -> Self {
        self.city = Some(city.into());
        self.institution = Some(institution.into());
        self
    }

    #[must_use]
    pub fn entity(mut self, name: impl Into<String>, id: impl Into<String>) -> Self {
        self.entity_name = Some(name.into());
        self.entity_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }

    #[must_use]
    pub fn change(mut self, field: impl Into<String>, before: Option<Value>, after: Option<Value>) -> Self {
        self.changes.insert(field.into(), FieldChange { before, after });
        self
    }

    fn into_entry(self, principal: &Principal) -> AuditLogEntry {
        AuditLogEntry {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            principal_id: principal.id.clone(),
            principal_name: principal.display_name.clone(),
            action: self.action,
            city: self.city,
            institution: self.institution,
            entity_name: self.entity_name,
            entity_id: self.entity_id,
            detail: self.detail,
            changes: self.changes,
        }
    }
}

/// Outcome of a recorded action. The local write always happened when a
/// receipt is returned; `remote_written` tells whether the remote did too.
#[derive(Debug, Clone, Serialize)]
pub struct AuditReceipt {
    pub entry: AuditLogEntry,
    pub remote_written: bool,
}

#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub city: Option<String>,
    pub institution: Option<String>,
    pub principal_id: Option<String>,
    pub action: Option<AuditAction>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl AuditQuery {
    fn matches(&self, entry: &AuditLogEntry) -> bool {
        fn eq(want: &Option<String>, have: &Option<String>) -> bool {
            want.as_ref().is_none_or(|w| have.as_ref() == Some(w))
        }

        eq(&self.city, &entry.city)
            && eq(&self.institution, &entry.institution)
            && self
                .principal_id
                .as_ref()
                .is_none_or(|p| *p == entry.principal_id)
            && self.action.is_none_or(|a| a == entry.action)
            && self.since.is_none_or(|t| entry.timestamp >= t)
    }
}

struct State {
    summary: GlobalSummary,
    /// Ids present in the local logs, loaded on first merge.
    known_ids: Option<HashSet<Uuid>>,
}

pub struct AuditLogger {
    store: AuditStore,
    summary_path: PathBuf,
    envelope: Envelope,
    backend: Arc<dyn Backend>,
    recent_limit: usize,
    state: Mutex<State>,
}

impl AuditLogger {
    /// Opens the logs under `dir`. A missing or unreadable summary is rebuilt
    /// from the logs.
    pub fn open(
        dir: impl Into<PathBuf>,
        envelope: Envelope,
        backend: Arc<dyn Backend>,
        recent_limit: usize,
    ) -> Result<Self> {
        let dir = dir.into();
        let summary_path = dir.join(SUMMARY_FILE);
        let store = AuditStore::new(&dir, envelope.clone());

        let summary = match read_document::<GlobalSummary>(&summary_path, &envelope) {
            Ok(Some(summary)) => summary,
            Ok(None) => GlobalSummary::rebuild(store.read_all()?, recent_limit),
            Err(e) => {
                tracing::warn!("Audit summary unreadable ({e}); rebuilding from logs");
                let summary = GlobalSummary::rebuild(store.read_all()?, recent_limit);
                write_document(&summary_path, &envelope, &summary)?;
                summary
            }
        };

        Ok(Self {
            store,
            summary_path,
            envelope,
            backend,
            recent_limit,
            state: Mutex::new(State {
                summary,
                known_ids: None,
            }),
        })
    }

    /// Like [`open`](Self::open), but logs that can no longer be decrypted
    /// are moved aside and a fresh trail is started. Returns `true` when that
    /// happened.
    pub fn open_or_reset(
        dir: impl Into<PathBuf>,
        envelope: Envelope,
        backend: Arc<dyn Backend>,
        recent_limit: usize,
    ) -> Result<(Self, bool)> {
        let dir = dir.into();
        match Self::open(&dir, envelope.clone(), backend.clone(), recent_limit) {
            Ok(logger) => Ok((logger, false)),
            Err(e) if e.requires_rebuild() => {
                tracing::error!("Audit logs unreadable ({e}); starting a new trail");
                let corrupt = dir.with_extension("corrupt");
                if corrupt.exists() {
                    std::fs::remove_dir_all(&corrupt)?;
                }
                quarantine(&dir)?;
                Ok((Self::open(&dir, envelope, backend, recent_limit)?, true))
            }
            Err(e) => Err(e),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        self.store.dir()
    }

    #[must_use]
    pub fn store(&self) -> &AuditStore {
        &self.store
    }

    #[must_use]
    pub fn summary(&self) -> GlobalSummary {
        self.lock().summary.clone()
    }

    fn persist_summary(&self, summary: &GlobalSummary) {
        if let Err(e) = write_document(&self.summary_path, &self.envelope, summary) {
            tracing::warn!("Failed to persist audit summary: {e}");
        }
    }

    /// Appends locally and folds the entry into the summary, under one lock so
    /// the two never diverge.
    fn write_local(&self, entry: &AuditLogEntry) -> Result<()> {
        let mut state = self.lock();
        self.store.append(entry)?;
        state.summary.record(entry, self.recent_limit);
        if let Some(ids) = state.known_ids.as_mut() {
            ids.insert(entry.id);
        }
        self.persist_summary(&state.summary);
        Ok(())
    }

    /// Records one action. Errors only when the local write fails.
    pub async fn record(&self, principal: &Principal, action: ActionRecord) -> Result<AuditReceipt> {
        let entry = action.into_entry(principal);
        self.write_local(&entry)?;

        let remote =
            gateway::append_audit(self.backend.as_ref(), std::slice::from_ref(&entry)).await;
        let remote_written = match remote {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(entry = %entry.id, action = %entry.action, "Remote audit append failed; kept locally: {e}");
                false
            }
        };

        Ok(AuditReceipt {
            entry,
            remote_written,
        })
    }

    /// Records a permission change in the general log and, with the full
    /// capability diff, in the dedicated permission-change log.
    pub async fn record_permission_change(
        &self,
        actor: &Principal,
        target: &Principal,
        before: &PermissionSet,
        after: &PermissionSet,
    ) -> Result<AuditReceipt> {
        let diff = before.diff(after);

        let dedicated = PermissionChangeEntry {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            actor_id: actor.id.clone(),
            actor_name: actor.display_name.clone(),
            target_principal_id: target.id.clone(),
            target_principal_name: target.display_name.clone(),
            changes: diff.clone(),
        };
        self.store.append_permission_change(&dedicated)?;

        let mut action = ActionRecord::new(AuditAction::PermissionChange)
            .entity(&target.display_name, &target.id)
            .detail(format!("{} capabilities changed", diff.len()));
        for change in &diff {
            let field = match (&change.city, &change.institution) {
                (Some(c), Some(i)) => format!("{c}/{i}.{}", change.action),
                (Some(c), None) => format!("{c}.{}", change.action),
                _ => change.action.to_string(),
            };
            action = action.change(field, change.before.map(Value::Bool), change.after.map(Value::Bool));
        }

        let mut receipt = self.record(actor, action).await?;
        if let Err(e) = gateway::append_permission_change(self.backend.as_ref(), &dedicated).await {
            tracing::warn!(target = %target.id, "Remote permission audit append failed: {e}");
            receipt.remote_written = false;
        }
        Ok(receipt)
    }

    /// Adds entries fetched from the remote table that the local logs lack.
    /// Returns how many were new.
    pub fn merge_remote(&self, entries: Vec<AuditLogEntry>) -> Result<usize> {
        let mut state = self.lock();
        if state.known_ids.is_none() {
            let ids = self.store.read_all()?.into_iter().map(|e| e.id).collect();
            state.known_ids = Some(ids);
        }

        let mut added = 0;
        for entry in entries {
            let is_new = state
                .known_ids
                .as_ref()
                .is_some_and(|ids| !ids.contains(&entry.id));
            if !is_new {
                continue;
            }
            self.store.append(&entry)?;
            state.summary.record(&entry, self.recent_limit);
            if let Some(ids) = state.known_ids.as_mut() {
                ids.insert(entry.id);
            }
            added += 1;
        }

        if added > 0 {
            tracing::debug!(added, "Merged remote audit entries");
            self.persist_summary(&state.summary);
        }
        Ok(added)
    }

    /// Pushes local entries missing from the remote table. Returns how many
    /// were pushed.
    pub async fn reconcile(&self) -> Result<usize> {
        let remote: HashSet<String> = gateway::fetch_audit_ids(self.backend.as_ref())
            .await?
            .into_iter()
            .collect();
        let mut missing: Vec<AuditLogEntry> = self
            .store
            .read_all()?
            .into_iter()
            .filter(|e| !remote.contains(&e.id.to_string()))
            .collect();
        missing.sort_by_key(|e| e.timestamp);

        for batch in missing.chunks(RECONCILE_BATCH) {
            gateway::append_audit(self.backend.as_ref(), batch).await?;
        }
        if !missing.is_empty() {
            tracing::info!(pushed = missing.len(), "Reconciled audit log with remote");
        }
        Ok(missing.len())
    }

    /// Local entries matching `query`, newest first.
    pub fn query(&self, query: &AuditQuery) -> Result<Vec<AuditLogEntry>> {
        let candidates = match (&query.city, &query.institution) {
            (Some(city), Some(institution)) => self.store.read_scope(Some(city), Some(institution))?,
            _ => self.store.read_all()?,
        };

        let mut entries: Vec<AuditLogEntry> = candidates
            .into_iter()
            .filter(|e| query.matches(e))
            .collect();
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        if let Some(limit) = query.limit {
            entries.truncate(limit);
        }
        Ok(entries)
    }

    pub fn rebuild_summary(&self) -> Result<GlobalSummary> {
        let mut state = self.lock();
        let entries = self.store.read_all()?;
        state.known_ids = Some(entries.iter().map(|e| e.id).collect());
        let summary = GlobalSummary::rebuild(entries, self.recent_limit);
        write_document(&self.summary_path, &self.envelope, &summary)?;
        state.summary = summary.clone();
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use crate::crypto::CacheKey;
    use crate::gateway::Table;
    use crate::gateway::memory::{MemoryBackend, Op};
    use crate::types::Action;

    fn logger(temp: &TempDir, backend: Arc<MemoryBackend>) -> AuditLogger {
        AuditLogger::open(
            temp.path().join("audit"),
            Envelope::encrypted(CacheKey::from_bytes([9; 32])),
            backend,
            10,
        )
        .unwrap()
    }

    fn edit(name: &str) -> ActionRecord {
        ActionRecord::new(AuditAction::Edit)
            .institution("CityA", "DeptX")
            .entity(name, format!("id-{name}"))
            .change("score", Some(json!(1)), Some(json!(2)))
    }

    #[tokio::test]
    async fn test_record_writes_local_and_remote() {
        let temp = TempDir::new().unwrap();
        let backend = Arc::new(MemoryBackend::new());
        let audit = logger(&temp, backend.clone());

        let receipt = audit
            .record(&Principal::new("p1", "Ana"), edit("Bo"))
            .await
            .unwrap();

        assert!(receipt.remote_written);
        assert_eq!(backend.rows(Table::AuditLog).len(), 1);
        assert_eq!(
            audit.store().read_scope(Some("CityA"), Some("DeptX")).unwrap(),
            vec![receipt.entry]
        );
    }

    #[tokio::test]
    async fn test_remote_failure_keeps_local_entry_and_counts_once() {
        let temp = TempDir::new().unwrap();
        let backend = Arc::new(MemoryBackend::new());
        backend.fail(Table::AuditLog, Op::Insert);
        let audit = logger(&temp, backend.clone());

        let receipt = audit
            .record(&Principal::new("p1", "Ana"), edit("Bo"))
            .await
            .unwrap();

        assert!(!receipt.remote_written);
        assert!(backend.rows(Table::AuditLog).is_empty());
        assert_eq!(audit.store().read_scope(Some("CityA"), Some("DeptX")).unwrap().len(), 1);
        assert_eq!(audit.summary().total_actions, 1);

        let reopened = logger(&temp, backend);
        assert_eq!(reopened.summary().total_actions, 1);
    }

    #[tokio::test]
    async fn test_reconcile_pushes_missing_entries() {
        let temp = TempDir::new().unwrap();
        let backend = Arc::new(MemoryBackend::new());
        let audit = logger(&temp, backend.clone());
        let ana = Principal::new("p1", "Ana");

        audit.record(&ana, edit("online")).await.unwrap();
        backend.set_offline(true);
        audit.record(&ana, edit("offline-1")).await.unwrap();
        audit.record(&ana, edit("offline-2")).await.unwrap();
        backend.set_offline(false);

        assert_eq!(audit.reconcile().await.unwrap(), 2);
        assert_eq!(backend.rows(Table::AuditLog).len(), 3);
        assert_eq!(audit.reconcile().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_merge_remote_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let backend = Arc::new(MemoryBackend::new());
        let audit = logger(&temp, backend.clone());

        let local = audit
            .record(&Principal::new("p1", "Ana"), edit("mine"))
            .await
            .unwrap()
            .entry;
        let mut remote = local.clone();
        remote.id = Uuid::new_v4();
        remote.principal_id = "p2".into();

        assert_eq!(audit.merge_remote(vec![local.clone(), remote.clone()]).unwrap(), 1);
        assert_eq!(audit.merge_remote(vec![local, remote]).unwrap(), 0);
        assert_eq!(audit.summary().total_actions, 2);
        assert_eq!(audit.summary().users_connected.len(), 2);
    }

    #[tokio::test]
    async fn test_permission_change_is_written_to_both_logs() {
        let temp = TempDir::new().unwrap();
        let backend = Arc::new(MemoryBackend::new());
        let audit = logger(&temp, backend.clone());

        let before = PermissionSet::new();
        let mut after = PermissionSet::new();
        after.set_institution("CityA", "DeptX", Action::CanView, true);
        after.set_global(Action::ManageUsers, true);

        let receipt = audit
            .record_permission_change(
                &Principal::new("admin", "Root"),
                &Principal::new("p1", "Ana"),
                &before,
                &after,
            )
            .await
            .unwrap();

        assert!(receipt.remote_written);
        assert_eq!(receipt.entry.action, AuditAction::PermissionChange);
        assert_eq!(receipt.entry.changes.len(), 2);
        assert!(receipt.entry.changes.contains_key("CityA/DeptX.can_view"));

        let dedicated = audit.store().read_permission_changes().unwrap();
        assert_eq!(dedicated.len(), 1);
        assert_eq!(dedicated[0].target_principal_id, "p1");
        assert_eq!(backend.rows(Table::PermissionAudit).len(), 1);
    }

    #[tokio::test]
    async fn test_query_filters_and_orders() {
        let temp = TempDir::new().unwrap();
        let audit = logger(&temp, Arc::new(MemoryBackend::new()));
        let ana = Principal::new("p1", "Ana");
        let bo = Principal::new("p2", "Bo");

        audit.record(&ana, edit("first")).await.unwrap();
        audit.record(&bo, edit("second")).await.unwrap();
        audit
            .record(&ana, ActionRecord::new(AuditAction::Login))
            .await
            .unwrap();

        let all = audit.query(&AuditQuery::default()).unwrap();
        assert_eq!(all.len(), 3);
        assert!(all[0].timestamp >= all[2].timestamp);

        let by_ana = audit
            .query(&AuditQuery {
                principal_id: Some("p1".into()),
                action: Some(AuditAction::Edit),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_ana.len(), 1);
        assert_eq!(by_ana[0].entity_name.as_deref(), Some("first"));

        let scoped = audit
            .query(&AuditQuery {
                city: Some("CityA".into()),
                institution: Some("DeptX".into()),
                limit: Some(1),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(scoped.len(), 1);
    }

    #[tokio::test]
    async fn test_lost_summary_is_rebuilt_from_logs() {
        let temp = TempDir::new().unwrap();
        let backend = Arc::new(MemoryBackend::new());
        {
            let audit = logger(&temp, backend.clone());
            let ana = Principal::new("p1", "Ana");
            audit.record(&ana, edit("a")).await.unwrap();
            audit.record(&ana, edit("b")).await.unwrap();
        }
        std::fs::remove_file(temp.path().join("audit").join(SUMMARY_FILE)).unwrap();

        let audit = logger(&temp, backend);
        assert_eq!(audit.summary().total_actions, 2);
        assert_eq!(audit.rebuild_summary().unwrap().total_actions, 2);
    }
}

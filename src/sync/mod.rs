//! Keeps the local caches consistent with the remote dataset.
//!
//! Three paths:
//!
//! - **poll**: compares the remote [`SyncMetadata`] with the local checkpoint
//!   and flags `sync_pending` on any difference. It never downloads anything
//!   itself.
//! - **full download**: pulls every synchronizable table and replaces both
//!   caches. At most one runs at a time; concurrent callers share its result.
//! - **upload**: authorizes, resolves conflicts by `updated_at`, pushes the
//!   change and a new version/hash pair, then applies it locally.
//!
//! [`SyncOrchestrator::run`] drives polling and remediation until cancelled.

mod checkpoint;
mod handler;

pub use checkpoint::{Checkpoint, CheckpointStore};
pub use handler::SyncChangeHandler;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tokio::sync::{Notify, broadcast, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::audit::AuditLogger;
use crate::cache::{PermissionCache, RosterCache};
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::gateway::{self, Backend, PermissionDocuments, Table};
use crate::permission::PermissionEvaluator;
use crate::types::{Action, AuditLogEntry, PermissionSet, RosterRecord, Subject, SyncMetadata};

#[derive(Debug, Clone, Copy)]
pub struct SyncOptions {
    pub poll_interval: Duration,
    pub full_resync_interval: Duration,
    pub download_timeout: Duration,
    /// How far back the full download pulls audit entries.
    pub audit_window: chrono::Duration,
}

impl SyncOptions {
    #[must_use]
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            full_resync_interval: config.full_resync_interval(),
            download_timeout: config.download_timeout(),
            audit_window: chrono::Duration::days(config.recent_audit_window_days),
        }
    }
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            full_resync_interval: Duration::from_secs(300),
            download_timeout: Duration::from_secs(120),
            audit_window: chrono::Duration::days(30),
        }
    }
}

/// Everything the orchestrator reads from and writes to.
#[derive(Clone)]
pub struct SyncComponents {
    pub backend: Arc<dyn Backend>,
    pub permissions: Arc<PermissionCache>,
    pub roster: Arc<RosterCache>,
    pub audit: Arc<AuditLogger>,
    pub evaluator: PermissionEvaluator,
}

/// Where a pending change was noticed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeSource {
    Poll,
    Realtime(Table),
    Manual,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadReport {
    pub version: i64,
    pub data_hash: String,
    pub principals_cached: usize,
    pub records_cached: usize,
    /// Records dropped because the requester may not view them.
    pub records_filtered: usize,
    pub backfilled: usize,
    pub audit_merged: usize,
}

#[derive(Debug, Clone)]
pub enum SyncEvent {
    ChangeDetected(ChangeSource),
    Downloaded(DownloadReport),
    DownloadFailed(Error),
    Uploaded { record_id: String, version: Option<i64> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum RosterChange {
    Upsert(RosterRecord),
    Delete {
        id: String,
        city: String,
        institution: String,
    },
}

impl RosterChange {
    fn record_id(&self) -> &str {
        match self {
            RosterChange::Upsert(record) => &record.id,
            RosterChange::Delete { id, .. } => id,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UploadOutcome {
    /// Pushed. `version` is the new remote version, if metadata was bumped.
    Applied { version: Option<i64> },
    /// The remote copy is newer; it was kept and cached locally instead.
    Superseded { current: RosterRecord },
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub principal_id: String,
    pub local_version: i64,
    pub local_hash: String,
    pub sync_pending: bool,
    pub last_poll: Option<DateTime<Utc>>,
    pub last_download: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Seconds since the permission cache was last written.
    pub staleness_secs: Option<i64>,
}

#[derive(Debug, Default)]
struct SyncState {
    checkpoint: Checkpoint,
    sync_pending: bool,
    last_poll: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

type InFlight = watch::Receiver<Option<Result<DownloadReport>>>;

/// Clears the in-flight slot when the leading download finishes or is dropped.
struct InFlightGuard<'a>(&'a Mutex<Option<InFlight>>);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        *lock(self.0) = None;
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Digest of the previous hash chained with one change. Stands in for a
/// digest of the whole dataset without downloading it.
fn chain_hash(previous: &str, change: &Value) -> Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(previous.as_bytes());
    hasher.update(serde_json::to_vec(change)?);
    Ok(hex::encode(hasher.finalize()))
}

pub struct SyncOrchestrator {
    principal_id: String,
    backend: Arc<dyn Backend>,
    permissions: Arc<PermissionCache>,
    roster: Arc<RosterCache>,
    audit: Arc<AuditLogger>,
    evaluator: PermissionEvaluator,
    options: SyncOptions,
    checkpoints: CheckpointStore,
    state: Mutex<SyncState>,
    in_flight: Mutex<Option<InFlight>>,
    events: broadcast::Sender<SyncEvent>,
    wake: Notify,
}

impl SyncOrchestrator {
    pub fn new(
        principal_id: impl Into<String>,
        components: SyncComponents,
        options: SyncOptions,
        checkpoints: CheckpointStore,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        let state = SyncState {
            checkpoint: checkpoints.load(),
            ..SyncState::default()
        };
        Self {
            principal_id: principal_id.into(),
            backend: components.backend,
            permissions: components.permissions,
            roster: components.roster,
            audit: components.audit,
            evaluator: components.evaluator,
            options,
            checkpoints,
            state: Mutex::new(state),
            in_flight: Mutex::new(None),
            events,
            wake: Notify::new(),
        }
    }

    #[must_use]
    pub fn principal_id(&self) -> &str {
        &self.principal_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SyncEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        lock(&self.state).sync_pending
    }

    #[must_use]
    pub fn status(&self) -> SyncStatus {
        let state = lock(&self.state);
        SyncStatus {
            principal_id: self.principal_id.clone(),
            local_version: state.checkpoint.version,
            local_hash: state.checkpoint.data_hash.clone(),
            sync_pending: state.sync_pending,
            last_poll: state.last_poll,
            last_download: state.checkpoint.last_download,
            last_error: state.last_error.clone(),
            staleness_secs: self.permissions.staleness().map(|d| d.num_seconds()),
        }
    }

    /// Flags that local data is behind and wakes the run loop. Returns
    /// immediately.
    pub fn mark_pending(&self, source: ChangeSource) {
        let newly = {
            let mut state = lock(&self.state);
            !std::mem::replace(&mut state.sync_pending, true)
        };
        if newly {
            tracing::debug!(?source, "Sync pending");
            self.emit(SyncEvent::ChangeDetected(source));
        }
        self.wake.notify_one();
    }

    /// Cheap change detection. Returns whether the remote version or hash
    /// differs from the local checkpoint.
    pub async fn poll(&self) -> Result<bool> {
        let remote = match gateway::fetch_sync_metadata(self.backend.as_ref()).await {
            Ok(remote) => remote,
            Err(e) => {
                lock(&self.state).last_error = Some(e.to_string());
                return Err(e);
            }
        };

        let changed = {
            let mut state = lock(&self.state);
            state.last_poll = Some(Utc::now());
            remote.version != state.checkpoint.version
                || remote.data_hash != state.checkpoint.data_hash
        };
        if changed {
            tracing::trace!(remote = remote.version, "Remote dataset changed");
            self.mark_pending(ChangeSource::Poll);
        }
        Ok(changed)
    }

    /// Pulls and replaces all cached data. If a download is already running,
    /// waits for it and returns its result instead of starting another.
    pub async fn full_download(&self) -> Result<DownloadReport> {
        let (mut rx, leader) = {
            let mut slot = lock(&self.in_flight);
            match slot.as_ref() {
                Some(rx) => (rx.clone(), None),
                None => {
                    let (tx, rx) = watch::channel(None);
                    *slot = Some(rx.clone());
                    (rx, Some(tx))
                }
            }
        };

        let Some(tx) = leader else {
            tracing::debug!("Joining in-flight download");
            let result = match rx.wait_for(Option::is_some).await {
                Ok(done) => done.clone().unwrap_or(Err(Error::InFlightAborted)),
                Err(_) => Err(Error::InFlightAborted),
            };
            return result;
        };

        let _guard = InFlightGuard(&self.in_flight);
        let result = match tokio::time::timeout(self.options.download_timeout, self.download()).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout),
        };

        match &result {
            Ok(report) => {
                tracing::info!(
                    version = report.version,
                    records = report.records_cached,
                    filtered = report.records_filtered,
                    backfilled = report.backfilled,
                    "Full download complete"
                );
                self.emit(SyncEvent::Downloaded(report.clone()));
            }
            Err(e) => {
                tracing::warn!("Full download failed; keeping previous cache: {e}");
                lock(&self.state).last_error = Some(e.to_string());
                self.emit(SyncEvent::DownloadFailed(e.clone()));
            }
        }
        tx.send_replace(Some(result.clone()));
        result
    }

    async fn download(&self) -> Result<DownloadReport> {
        let backend = self.backend.as_ref();
        let metadata = gateway::fetch_sync_metadata(backend).await?;
        let principals = gateway::fetch_principals(backend).await?;
        let PermissionDocuments {
            valid: mut permissions,
            skipped,
        } = gateway::fetch_all_permissions(backend).await?;
        let records = gateway::fetch_roster(backend).await?;
        let audit = gateway::fetch_audit_since(backend, Utc::now() - self.options.audit_window).await?;

        let Some(me) = principals.iter().find(|p| p.id == self.principal_id).cloned() else {
            return Err(Error::PermissionDenied(format!(
                "principal {} is not registered",
                self.principal_id
            )));
        };

        let known: BTreeSet<(String, String)> = records
            .iter()
            .map(|r| (r.city.clone(), r.institution.clone()))
            .chain(permissions.values().flat_map(PermissionSet::known_institutions))
            .collect();

        // An undecodable document keeps its last cached set and is never
        // backfilled or pushed.
        let mut backfilled = 0;
        let mut backfilled_ids = Vec::new();
        for principal in &principals {
            if skipped.contains(&principal.id) {
                if let Some(cached) = self.permissions.read(&principal.id) {
                    permissions.insert(principal.id.clone(), cached.permissions);
                }
                continue;
            }
            let set = permissions.entry(principal.id.clone()).or_default();
            let added = set.backfill(&known);
            if added > 0 {
                backfilled += added;
                backfilled_ids.push(principal.id.clone());
            }
        }

        let requester = Subject {
            principal: me,
            permissions: permissions.get(&self.principal_id).cloned().unwrap_or_default(),
        };
        let privileged = requester.principal.sees_everything();

        let subjects: BTreeMap<String, Subject> = if privileged {
            principals
                .into_iter()
                .filter_map(|principal| {
                    let set = permissions.get(&principal.id).cloned()?;
                    let subject = Subject {
                        principal,
                        permissions: set,
                    };
                    Some((subject.principal.id.clone(), subject))
                })
                .collect()
        } else {
            BTreeMap::from([(self.principal_id.clone(), requester.clone())])
        };

        let total = records.len();
        let visible = self.evaluator.visible_records(&requester, records);
        let records_cached = visible.len();
        let audit = self.visible_audit(&requester, audit);

        if privileged && !backfilled_ids.is_empty() {
            self.push_backfill(&permissions, &backfilled_ids).await;
        }

        // No awaits past this point. Both caches change together or not at all.
        let previous = self.permissions.snapshot();
        let principals_cached = subjects.len();
        self.permissions.replace_all(subjects)?;
        if let Err(e) = self.roster.replace_all(visible) {
            if let Err(restore) = self.permissions.restore(previous) {
                tracing::error!("Failed to restore permission cache: {restore}");
            }
            return Err(e);
        }

        let audit_merged = match self.audit.merge_remote(audit) {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!("Failed to merge remote audit entries: {e}");
                0
            }
        };

        let checkpoint = Checkpoint {
            version: metadata.version,
            data_hash: metadata.data_hash.clone(),
            last_download: Some(Utc::now()),
        };
        self.checkpoints.save(&checkpoint)?;
        {
            let mut state = lock(&self.state);
            state.checkpoint = checkpoint;
            state.sync_pending = false;
            state.last_error = None;
        }

        Ok(DownloadReport {
            version: metadata.version,
            data_hash: metadata.data_hash,
            principals_cached,
            records_cached,
            records_filtered: total - records_cached,
            backfilled,
            audit_merged,
        })
    }

    fn visible_audit(&self, requester: &Subject, entries: Vec<AuditLogEntry>) -> Vec<AuditLogEntry> {
        if requester.principal.sees_everything() {
            return entries;
        }
        entries
            .into_iter()
            .filter(|e| match (&e.city, &e.institution) {
                (Some(city), Some(institution)) => self.evaluator.can_perform(
                    Some(requester),
                    Action::CanView,
                    Some(city),
                    Some(institution),
                ),
                _ => e.principal_id == requester.principal.id,
            })
            .collect()
    }

    async fn push_backfill(&self, permissions: &BTreeMap<String, PermissionSet>, ids: &[String]) {
        for id in ids {
            let Some(set) = permissions.get(id) else {
                continue;
            };
            if let Err(e) = gateway::push_permissions(self.backend.as_ref(), id, set).await {
                tracing::warn!(principal = %id, "Failed to push backfilled permissions: {e}");
            }
        }
        tracing::debug!(principals = ids.len(), "Pushed backfilled permission documents");
    }

    async fn subject(&self) -> Result<Option<Subject>> {
        self.permissions
            .read_through(self.backend.as_ref(), &self.principal_id)
            .await
    }

    /// Pushes one roster change. A denied change is rejected with
    /// [`Error::PermissionDenied`] before any network traffic.
    pub async fn upload(&self, change: RosterChange) -> Result<UploadOutcome> {
        let subject = self.subject().await?;
        let subject = subject.as_ref();
        let auth = |action: Action, city: &str, institution: &str| {
            self.evaluator
                .authorize(subject, action, Some(city), Some(institution))
        };

        match &change {
            RosterChange::Upsert(record) => {
                let action = match self.roster.get(&record.id) {
                    Some(_) => Action::CanEditEmployee,
                    None => Action::CanAddEmployee,
                };
                auth(action, &record.city, &record.institution)?;
            }
            RosterChange::Delete { city, institution, .. } => {
                auth(Action::CanDeleteEmployee, city, institution)?;
            }
        }

        let backend = self.backend.as_ref();
        let remote = gateway::fetch_record(backend, change.record_id()).await?;

        if let RosterChange::Delete { id, city, institution } = &change {
            let Some(current) = &remote else {
                return Err(Error::NotFound);
            };
            auth(Action::CanDeleteEmployee, &current.city, &current.institution)?;
            if (&current.city, &current.institution) != (city, institution) {
                tracing::warn!(
                    record = %id,
                    city = %current.city,
                    institution = %current.institution,
                    "Delete names the wrong location"
                );
                return Err(Error::PermissionDenied(format!(
                    "record {id} is not in {city}/{institution}"
                )));
            }
        }

        let payload = match &change {
            RosterChange::Upsert(record) => {
                if let Some(current) = &remote {
                    auth(Action::CanEditEmployee, &record.city, &record.institution)?;
                    if (&current.city, &current.institution) != (&record.city, &record.institution) {
                        auth(Action::CanEditEmployee, &current.city, &current.institution)?;
                    }
                    if current.updated_at > record.updated_at {
                        tracing::info!(record = %record.id, "Remote copy is newer; upload superseded");
                        self.apply_remote(current.clone())?;
                        return Ok(UploadOutcome::Superseded {
                            current: current.clone(),
                        });
                    }
                }

                let mut record = record.clone();
                record.updated_by = Some(self.principal_id.clone());
                gateway::upsert_record(backend, &record).await?;
                let payload = json!({"op": "upsert", "record": &record});
                self.roster.apply(record)?;
                payload
            }
            RosterChange::Delete { id, city, institution } => {
                // Location checked against the remote copy above.
                gateway::delete_record(backend, id).await?;
                self.roster.remove(city, institution, id)?;
                json!({"op": "delete", "id": id})
            }
        };

        let version = self.bump_metadata(&payload).await;
        self.emit(SyncEvent::Uploaded {
            record_id: change.record_id().to_string(),
            version,
        });
        Ok(UploadOutcome::Applied { version })
    }

    /// Publishes a new version/hash pair after a successful push. A failure
    /// here leaves the change in place remotely; peers then only learn of it
    /// through the realtime feed or the periodic resync.
    async fn bump_metadata(&self, change: &Value) -> Option<i64> {
        let backend = self.backend.as_ref();
        let result: Result<SyncMetadata> = async {
            let current = gateway::fetch_sync_metadata(backend).await?;
            let next = current.next(chain_hash(&current.data_hash, change)?);
            gateway::push_sync_metadata(backend, &next).await?;

            let mut state = lock(&self.state);
            // Only our own change separates us from the remote: stay in sync.
            if state.checkpoint.version == current.version
                && state.checkpoint.data_hash == current.data_hash
            {
                state.checkpoint.version = next.version;
                state.checkpoint.data_hash = next.data_hash.clone();
                if let Err(e) = self.checkpoints.save(&state.checkpoint) {
                    tracing::warn!("Failed to save sync checkpoint: {e}");
                }
            }
            Ok(next)
        }
        .await;

        match result {
            Ok(next) => Some(next.version),
            Err(e) => {
                tracing::warn!("Change pushed but sync metadata not updated: {e}");
                None
            }
        }
    }

    fn apply_remote(&self, record: RosterRecord) -> Result<()> {
        let visible = self.permissions.read(&self.principal_id).is_some_and(|s| {
            s.principal.sees_everything()
                || self.evaluator.can_perform(
                    Some(&s),
                    Action::CanView,
                    Some(&record.city),
                    Some(&record.institution),
                )
        });
        if visible {
            self.roster.apply(record)?;
        } else if let Some(cached) = self.roster.get(&record.id) {
            tracing::debug!(record = %record.id, "Record moved out of view; dropping cached copy");
            self.roster.remove(&cached.city, &cached.institution, &record.id)?;
        }
        Ok(())
    }

    /// Re-pulls one roster record after a change notification. A record that
    /// no longer exists remotely is dropped from the cache.
    pub async fn refresh_record(&self, id: &str) -> Result<()> {
        match gateway::fetch_record(self.backend.as_ref(), id).await? {
            Some(record) => self.apply_remote(record),
            None => {
                if let Some(cached) = self.roster.get(id) {
                    self.roster.remove(&cached.city, &cached.institution, id)?;
                }
                Ok(())
            }
        }
    }

    /// Polls on every tick and downloads whenever something is pending, plus
    /// a full resync on the longer interval. Failures are logged and retried
    /// on the next tick.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut poll = tokio::time::interval(self.options.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut resync = tokio::time::interval(self.options.full_resync_interval);
        resync.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick of an interval fires immediately.
        resync.tick().await;

        tracing::info!(principal = %self.principal_id, "Sync loop started");
        loop {
            let force = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = poll.tick() => {
                    if let Err(e) = self.poll().await {
                        tracing::warn!("Poll failed: {e}");
                    }
                    false
                }
                _ = self.wake.notified() => false,
                _ = resync.tick() => true,
            };

            // Download failures are logged by full_download.
            if force || self.is_pending() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = self.full_download() => {}
                }
            }
        }
        tracing::info!("Sync loop stopped");
    }
}

//! The service object an application holds for the lifetime of a session.
//!
//! Every component is constructed here and handed to the others explicitly;
//! there is no process-wide state. [`RosterClient::start`] spawns the poll
//! loop and the realtime channel, [`RosterClient::shutdown`] stops both.

use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::audit::{ActionRecord, AuditLogger};
use crate::cache::{PermissionCache, RosterCache, quarantine};
use crate::config::ClientConfig;
use crate::crypto::{CacheKey, Envelope};
use crate::error::{Error, Result};
use crate::gateway::{self, Backend, RestGateway};
use crate::permission::PermissionEvaluator;
use crate::realtime::{ChannelOptions, ChannelState, RealtimeChannel, RealtimeTransport, WebSocketTransport};
use crate::sync::{
    ChangeSource, CheckpointStore, RosterChange, SyncChangeHandler, SyncComponents, SyncOptions,
    SyncOrchestrator, SyncStatus, UploadOutcome,
};
use crate::types::{Action, AuditAction, PermissionSet, Principal, RosterRecord, Subject};

const PERMISSIONS_FILE: &str = "permissions.json";
const ROSTER_DIR: &str = "roster";
const CHECKPOINT_FILE: &str = "sync.json";

#[derive(Debug, Clone, Serialize)]
pub struct ClientStatus {
    #[serde(flatten)]
    pub sync: SyncStatus,
    pub realtime: ChannelState,
    pub cached_principals: usize,
    pub cached_records: usize,
    /// Local state was unreadable on open and must be downloaded again.
    pub needs_rebuild: bool,
}

/// Loads the installation key, replacing a damaged one. Everything encrypted
/// with the old key becomes unreadable and is rebuilt.
pub fn open_envelope(config: &ClientConfig) -> Result<Envelope> {
    if !config.encrypt_cache {
        return Ok(Envelope::plaintext());
    }

    let path = config.key_path();
    let key = match CacheKey::load_or_create(&path) {
        Ok(key) => key,
        Err(e) if e.requires_rebuild() => {
            tracing::error!("Cache key unusable ({e}); generating a new one");
            quarantine(&path)?;
            CacheKey::load_or_create(&path)?
        }
        Err(e) => return Err(e),
    };
    Ok(Envelope::encrypted(key))
}

struct Background {
    cancel: CancellationToken,
    sync: JoinHandle<()>,
}

pub struct RosterClient {
    principal_id: String,
    backend: Arc<dyn Backend>,
    permissions: Arc<PermissionCache>,
    roster: Arc<RosterCache>,
    audit: Arc<AuditLogger>,
    evaluator: PermissionEvaluator,
    sync: Arc<SyncOrchestrator>,
    realtime: RealtimeChannel,
    needs_rebuild: Mutex<bool>,
    background: Mutex<Option<Background>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl RosterClient {
    /// Wires the HTTPS gateway and websocket transport described by `config`.
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        config.validate()?;
        let backend = Arc::new(RestGateway::new(
            &config.base_url,
            &config.api_key,
            config.request_timeout(),
        )?);
        let transport = Arc::new(WebSocketTransport::new(
            config.realtime_url(),
            config.api_key.clone(),
        ));
        Self::with_parts(config, backend, transport)
    }

    /// Builds the client around the given backend and realtime transport.
    pub fn with_parts(
        config: &ClientConfig,
        backend: Arc<dyn Backend>,
        transport: Arc<dyn RealtimeTransport>,
    ) -> Result<Self> {
        let principal_id = config
            .principal_id
            .clone()
            .ok_or_else(|| Error::Config("principal_id is not set".to_string()))?;

        let envelope = open_envelope(config)?;
        let cache_dir = config.cache_dir();
        let (permissions, permissions_reset) =
            PermissionCache::open_or_reset(cache_dir.join(PERMISSIONS_FILE), envelope.clone())?;
        let (roster, roster_reset) =
            RosterCache::open_or_reset(cache_dir.join(ROSTER_DIR), envelope.clone())?;
        let (audit, audit_reset) = AuditLogger::open_or_reset(
            config.audit_dir(),
            envelope.clone(),
            backend.clone(),
            config.summary_recent_limit,
        )?;

        let permissions = Arc::new(permissions);
        let roster = Arc::new(roster);
        let audit = Arc::new(audit);
        let evaluator = PermissionEvaluator::default();

        let sync = Arc::new(SyncOrchestrator::new(
            principal_id.clone(),
            SyncComponents {
                backend: backend.clone(),
                permissions: permissions.clone(),
                roster: roster.clone(),
                audit: audit.clone(),
                evaluator,
            },
            SyncOptions::from_config(config),
            CheckpointStore::new(cache_dir.join(CHECKPOINT_FILE), envelope),
        ));

        let realtime = RealtimeChannel::new(transport, ChannelOptions::from_config(config));
        realtime.subscribe(config.realtime_tables.iter().copied());
        realtime.on_event(Arc::new(SyncChangeHandler::new(sync.clone())));

        Ok(Self {
            principal_id,
            backend,
            permissions,
            roster,
            audit,
            evaluator,
            sync,
            realtime,
            needs_rebuild: Mutex::new(permissions_reset || roster_reset || audit_reset),
            background: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn principal_id(&self) -> &str {
        &self.principal_id
    }

    #[must_use]
    pub fn permissions(&self) -> &PermissionCache {
        &self.permissions
    }

    #[must_use]
    pub fn roster(&self) -> &RosterCache {
        &self.roster
    }

    #[must_use]
    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    #[must_use]
    pub fn sync(&self) -> &Arc<SyncOrchestrator> {
        &self.sync
    }

    #[must_use]
    pub fn realtime(&self) -> &RealtimeChannel {
        &self.realtime
    }

    #[must_use]
    pub fn needs_rebuild(&self) -> bool {
        *lock(&self.needs_rebuild)
    }

    fn subject(&self) -> Option<Subject> {
        self.permissions.read(&self.principal_id)
    }

    /// The acting principal for audit entries. Falls back to a bare id when
    /// the cache has not been filled yet.
    fn actor(&self) -> Principal {
        self.subject()
            .map(|s| s.principal)
            .unwrap_or_else(|| Principal::new(&self.principal_id, &self.principal_id))
    }

    /// Records a completed login: registers or refreshes the principal
    /// remotely and seeds the permission cache for it.
    pub async fn login(&self, display_name: &str, email: Option<String>) -> Result<Subject> {
        let mut principal = Principal::new(&self.principal_id, display_name);
        principal.email = email;

        let principal = gateway::upsert_principal(self.backend.as_ref(), &principal).await?;
        let permissions = gateway::fetch_permissions(self.backend.as_ref(), &principal.id)
            .await?
            .unwrap_or_default();
        let subject = Subject {
            principal,
            permissions,
        };
        self.permissions.write(subject.clone())?;

        self.audit
            .record(&subject.principal, ActionRecord::new(AuditAction::Login).detail("login"))
            .await?;
        tracing::info!(principal = %self.principal_id, "Logged in");
        Ok(subject)
    }

    /// Cache-only permission check; never touches the network.
    #[must_use]
    pub fn can_perform(&self, action: Action, city: Option<&str>, institution: Option<&str>) -> bool {
        self.evaluator
            .can_perform(self.subject().as_ref(), action, city, institution)
    }

    pub fn can_perform_named(
        &self,
        action: &str,
        city: Option<&str>,
        institution: Option<&str>,
    ) -> Result<bool> {
        self.evaluator
            .can_perform_named(self.subject().as_ref(), action, city, institution)
    }

    /// Cached records of one institution. The cache only ever holds records
    /// the principal may view.
    #[must_use]
    pub fn records(&self, city: &str, institution: &str) -> Vec<RosterRecord> {
        self.roster.records(city, institution)
    }

    /// Uploads an added or edited record and audits it once applied.
    pub async fn save_record(&self, record: RosterRecord) -> Result<UploadOutcome> {
        let previous = self.roster.get(&record.id);
        let outcome = self.sync.upload(RosterChange::Upsert(record.clone())).await?;
        if !matches!(outcome, UploadOutcome::Applied { .. }) {
            return Ok(outcome);
        }

        let mut action = ActionRecord::new(if previous.is_some() {
            AuditAction::Edit
        } else {
            AuditAction::Add
        })
        .institution(&record.city, &record.institution)
        .entity(&record.name, &record.id);

        let before = previous.as_ref();
        if before.map(|p| &p.name) != Some(&record.name) {
            action = action.change("name", before.map(|p| json!(p.name)), Some(json!(record.name)));
        }
        if before.map(|p| &p.position) != Some(&record.position) {
            action = action.change(
                "position",
                before.map(|p| json!(p.position)),
                Some(json!(record.position)),
            );
        }
        if before.map(|p| p.score) != Some(record.score) {
            action = action.change("score", before.map(|p| json!(p.score)), Some(json!(record.score)));
        }

        self.audit.record(&self.actor(), action).await?;
        Ok(outcome)
    }

    /// Deletes a cached record remotely and locally, then audits it.
    pub async fn delete_record(&self, id: &str) -> Result<UploadOutcome> {
        let record = self.roster.get(id).ok_or(Error::NotFound)?;
        let outcome = self
            .sync
            .upload(RosterChange::Delete {
                id: record.id.clone(),
                city: record.city.clone(),
                institution: record.institution.clone(),
            })
            .await?;

        let action = ActionRecord::new(AuditAction::Delete)
            .institution(&record.city, &record.institution)
            .entity(&record.name, &record.id);
        self.audit.record(&self.actor(), action).await?;
        Ok(outcome)
    }

    /// Replaces another principal's permission set. Requires
    /// `manage_permissions` and records the diff in the audit trail.
    pub async fn update_permissions(&self, target_id: &str, after: PermissionSet) -> Result<()> {
        self.evaluator
            .authorize(self.subject().as_ref(), Action::ManagePermissions, None, None)?;
        after.validate()?;

        let backend = self.backend.as_ref();
        let target = gateway::fetch_principal(backend, target_id)
            .await?
            .ok_or(Error::NotFound)?;
        let before = gateway::fetch_permissions(backend, target_id)
            .await?
            .unwrap_or_default();

        gateway::push_permissions(backend, target_id, &after).await?;
        self.audit
            .record_permission_change(&self.actor(), &target, &before, &after)
            .await?;

        if self.permissions.read(target_id).is_some() {
            self.permissions.write(Subject {
                principal: target,
                permissions: after,
            })?;
        }
        self.sync.mark_pending(ChangeSource::Manual);
        Ok(())
    }

    /// Repopulates caches that were reset on open, then spawns the poll loop
    /// and the realtime channel. Calling it again while running does nothing.
    pub async fn start(&self) -> Result<()> {
        if lock(&self.background).is_some() {
            return Ok(());
        }

        if self.needs_rebuild() {
            match self.sync.full_download().await {
                Ok(_) => *lock(&self.needs_rebuild) = false,
                Err(e) => tracing::warn!("Cache rebuild deferred to the sync loop: {e}"),
            }
        }
        self.permissions.ensure_exists()?;

        let cancel = CancellationToken::new();
        let sync = self.sync.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move { sync.run(token).await });
        self.realtime.start();

        *lock(&self.background) = Some(Background {
            cancel,
            sync: handle,
        });
        Ok(())
    }

    pub async fn shutdown(&self) {
        let background = lock(&self.background).take();
        if let Some(background) = background {
            background.cancel.cancel();
            if let Err(e) = background.sync.await {
                tracing::warn!("Sync loop ended abnormally: {e}");
            }
        }
        self.realtime.stop().await;
    }

    #[must_use]
    pub fn status(&self) -> ClientStatus {
        ClientStatus {
            sync: self.sync.status(),
            realtime: self.realtime.state(),
            cached_principals: self.permissions.principal_ids().len(),
            cached_records: self.roster.all_records().len(),
            needs_rebuild: self.needs_rebuild(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::Value;
    use tempfile::TempDir;

    use super::*;
    use crate::gateway::Table;
    use crate::gateway::memory::MemoryBackend;
    use crate::realtime::memory::MemoryTransport;
    use crate::types::{RawPermissionDocument, Scope};

    fn config(temp: &TempDir) -> ClientConfig {
        ClientConfig {
            data_dir: temp.path().to_path_buf(),
            principal_id: Some("p1".into()),
            realtime_max_attempts: 2,
            ..ClientConfig::default()
        }
    }

    fn client(config: &ClientConfig, backend: &Arc<MemoryBackend>) -> RosterClient {
        RosterClient::with_parts(config, backend.clone(), Arc::new(MemoryTransport::new())).unwrap()
    }

    fn grant_dept_x(backend: &MemoryBackend) {
        let mut set = PermissionSet::new();
        for action in Action::in_scope(Scope::Institution) {
            set.set_institution("CityA", "DeptX", action, true);
        }
        backend.seed(
            Table::Permissions,
            vec![json!({"user_id": "p1", "permissions": RawPermissionDocument::from(&set)})],
        );
    }

    #[tokio::test]
    async fn test_login_registers_and_seeds_cache() {
        let temp = TempDir::new().unwrap();
        let backend = Arc::new(MemoryBackend::new());
        grant_dept_x(&backend);
        let client = client(&config(&temp), &backend);

        assert!(!client.can_perform(Action::CanView, Some("CityA"), Some("DeptX")));
        client.login("Ana", Some("ana@example.test".into())).await.unwrap();

        assert_eq!(backend.rows(Table::Principals).len(), 1);
        assert!(client.can_perform(Action::CanView, Some("CityA"), Some("DeptX")));
        assert!(!client.can_perform(Action::CanView, Some("CityA"), Some("DeptY")));

        // Second login updates instead of inserting.
        client.login("Ana B.", None).await.unwrap();
        let rows: Vec<Value> = backend.rows(Table::Principals);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["display_name"], "Ana B.");

        let logins = client
            .audit()
            .query(&crate::audit::AuditQuery {
                action: Some(AuditAction::Login),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(logins.len(), 2);
    }

    #[tokio::test]
    async fn test_permission_checks_work_offline() {
        let temp = TempDir::new().unwrap();
        let backend = Arc::new(MemoryBackend::new());
        grant_dept_x(&backend);
        let client = client(&config(&temp), &backend);
        client.login("Ana", None).await.unwrap();

        backend.set_offline(true);
        assert!(client.can_perform(Action::CanEditEmployee, Some("CityA"), Some("DeptX")));
        assert!(client.can_perform_named("can-view", Some("CityA"), Some("DeptX")).unwrap());
    }

    #[tokio::test]
    async fn test_save_and_delete_are_audited() {
        let temp = TempDir::new().unwrap();
        let backend = Arc::new(MemoryBackend::new());
        grant_dept_x(&backend);
        let client = client(&config(&temp), &backend);
        client.login("Ana", None).await.unwrap();

        let record = RosterRecord::new("r1", "CityA", "DeptX", "Bo");
        client.save_record(record.clone()).await.unwrap();
        let mut edited = record.clone();
        edited.score = 7;
        edited.updated_at = record.updated_at + chrono::Duration::seconds(1);
        client.save_record(edited).await.unwrap();
        client.delete_record("r1").await.unwrap();

        let entries = client
            .audit()
            .query(&crate::audit::AuditQuery {
                city: Some("CityA".into()),
                institution: Some("DeptX".into()),
                ..Default::default()
            })
            .unwrap();
        let actions: Vec<AuditAction> = entries.iter().map(|e| e.action).collect();
        assert_eq!(actions, vec![AuditAction::Delete, AuditAction::Edit, AuditAction::Add]);
        assert!(entries[1].changes.contains_key("score"));
        assert!(!entries[1].changes.contains_key("name"));
        assert_eq!(backend.rows(Table::AuditLog).len(), 4);
    }

    #[tokio::test]
    async fn test_update_permissions_requires_manage_permissions() {
        let temp = TempDir::new().unwrap();
        let backend = Arc::new(MemoryBackend::new());
        let mut admin = Principal::new("admin", "Admin");
        admin.is_superuser = true;
        backend.seed(
            Table::Principals,
            vec![
                serde_json::to_value(&admin).unwrap(),
                serde_json::to_value(Principal::new("p2", "Bea")).unwrap(),
            ],
        );

        let mut after = PermissionSet::new();
        after.set_institution("CityA", "DeptX", Action::CanView, true);

        let p1 = client(&config(&temp), &backend);
        p1.login("Ana", None).await.unwrap();
        let err = p1.update_permissions("p2", after.clone()).await.unwrap_err();
        assert!(err.is_permission_denied());
        assert!(backend.rows(Table::Permissions).is_empty());

        let admin_temp = TempDir::new().unwrap();
        let admin_config = ClientConfig {
            principal_id: Some("admin".into()),
            ..config(&admin_temp)
        };
        let admin = client(&admin_config, &backend);
        admin.login("Admin", None).await.unwrap();
        admin.update_permissions("p2", after).await.unwrap();

        assert_eq!(backend.rows(Table::Permissions).len(), 1);
        assert_eq!(backend.rows(Table::PermissionAudit).len(), 1);
        let changes = admin.audit().store().read_permission_changes().unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].target_principal_id, "p2");
        assert!(admin.sync().is_pending());
    }

    #[tokio::test]
    async fn test_lost_key_forces_rebuild_on_start() {
        let temp = TempDir::new().unwrap();
        let backend = Arc::new(MemoryBackend::new());
        grant_dept_x(&backend);
        backend.seed(
            Table::Roster,
            vec![serde_json::to_value(RosterRecord::new("r1", "CityA", "DeptX", "Bo")).unwrap()],
        );
        let config = config(&temp);

        {
            let client = client(&config, &backend);
            client.login("Ana", None).await.unwrap();
            client.sync().full_download().await.unwrap();
        }
        std::fs::remove_file(config.key_path()).unwrap();

        let client = client(&config, &backend);
        assert!(client.needs_rebuild());
        assert!(client.roster().all_records().is_empty());

        client.start().await.unwrap();
        assert!(!client.needs_rebuild());
        assert_eq!(client.roster().all_records().len(), 1);
        assert!(client.can_perform(Action::CanView, Some("CityA"), Some("DeptX")));
        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_unreadable_audit_trail_is_refilled_on_start() {
        let temp = TempDir::new().unwrap();
        let backend = Arc::new(MemoryBackend::new());
        grant_dept_x(&backend);
        let config = config(&temp);

        {
            let client = client(&config, &backend);
            client.login("Ana", None).await.unwrap();
            client
                .save_record(RosterRecord::new("r1", "CityA", "DeptX", "Bo"))
                .await
                .unwrap();
            let log = client.audit().store().scope_path(Some("CityA"), Some("DeptX"));
            std::fs::write(&log, "RSENC1:AAAA\n").unwrap();
            std::fs::remove_file(client.audit().dir().join("summary.json")).unwrap();
        }

        let client = client(&config, &backend);
        assert!(client.needs_rebuild());

        client.start().await.unwrap();
        assert!(!client.needs_rebuild());
        let adds = client
            .audit()
            .query(&crate::audit::AuditQuery {
                action: Some(AuditAction::Add),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(adds.len(), 1);
        client.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_shutdown() {
        let temp = TempDir::new().unwrap();
        let backend = Arc::new(MemoryBackend::new());
        let client = client(&config(&temp), &backend);
        client.login("Ana", None).await.unwrap();

        client.start().await.unwrap();
        client.start().await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(client.status().sync.last_poll.is_some());

        client.shutdown().await;
        assert_eq!(client.status().realtime, ChannelState::Disconnected);
    }
}

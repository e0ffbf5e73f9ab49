use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{quarantine, read_document, write_document};
use crate::crypto::Envelope;
use crate::error::{Error, Result};
use crate::gateway::{self, Backend};
use crate::types::{PERMISSION_SCHEMA_VERSION, Principal, RawPermissionDocument, Subject};

/// The single permission document shared by every cached principal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionsDocument {
    pub schema_version: u32,
    #[serde(default)]
    pub last_sync: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_checked: Option<DateTime<Utc>>,
    #[serde(default)]
    pub principals: BTreeMap<String, Subject>,
}

impl Default for PermissionsDocument {
    fn default() -> Self {
        Self {
            schema_version: PERMISSION_SCHEMA_VERSION,
            last_sync: None,
            last_checked: None,
            principals: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct StoredSubject {
    principal: Principal,
    #[serde(default)]
    permissions: RawPermissionDocument,
}

/// The on-disk shape before migration: permission sets may still be legacy.
#[derive(Debug, Deserialize)]
struct StoredDocument {
    #[serde(default)]
    schema_version: Option<u32>,
    #[serde(default)]
    last_sync: Option<DateTime<Utc>>,
    #[serde(default)]
    last_checked: Option<DateTime<Utc>>,
    #[serde(default)]
    principals: BTreeMap<String, StoredSubject>,
}

impl StoredDocument {
    fn migrate(self) -> Result<(PermissionsDocument, bool)> {
        let outdated = self.schema_version.unwrap_or(1) < PERMISSION_SCHEMA_VERSION;
        let mut principals = BTreeMap::new();
        for (id, stored) in self.principals {
            let (permissions, _) = stored.permissions.migrate().map_err(|e| {
                Error::Integrity(format!("cached permissions for {id} are invalid: {e}"))
            })?;
            principals.insert(
                id,
                Subject {
                    principal: stored.principal,
                    permissions,
                },
            );
        }

        Ok((
            PermissionsDocument {
                schema_version: PERMISSION_SCHEMA_VERSION,
                last_sync: self.last_sync,
                last_checked: self.last_checked,
                principals,
            },
            outdated,
        ))
    }
}

/// Encrypted cache of principals and their permission sets.
///
/// Reads never touch the network. All mutations go through the write lock and
/// are persisted before the in-memory copy changes, so a failed write leaves
/// both untouched.
pub struct PermissionCache {
    path: PathBuf,
    envelope: Envelope,
    doc: RwLock<PermissionsDocument>,
}

impl PermissionCache {
    /// Opens the cache at `path`, migrating an older schema in place.
    pub fn open(path: impl Into<PathBuf>, envelope: Envelope) -> Result<Self> {
        let path = path.into();
        let doc = match read_document::<StoredDocument>(&path, &envelope)? {
            Some(stored) => {
                let (doc, outdated) = stored.migrate()?;
                if outdated {
                    write_document(&path, &envelope, &doc)?;
                    tracing::info!("Migrated permission cache to schema v{PERMISSION_SCHEMA_VERSION}");
                }
                doc
            }
            None => PermissionsDocument::default(),
        };

        Ok(Self {
            path,
            envelope,
            doc: RwLock::new(doc),
        })
    }

    /// Like [`open`](Self::open), but an unreadable cache is moved aside and
    /// replaced with an empty one. Returns `true` when that happened, meaning
    /// the caller must repopulate from the backend.
    pub fn open_or_reset(path: impl Into<PathBuf>, envelope: Envelope) -> Result<(Self, bool)> {
        let path = path.into();
        match Self::open(&path, envelope.clone()) {
            Ok(cache) => Ok((cache, false)),
            Err(e) if e.requires_rebuild() => {
                tracing::error!("Permission cache unreadable ({e}); it will be rebuilt");
                quarantine(&path)?;
                Ok((Self::open(&path, envelope)?, true))
            }
            Err(e) => Err(e),
        }
    }

    fn read_guard(&self) -> RwLockReadGuard<'_, PermissionsDocument> {
        self.doc.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_guard(&self) -> RwLockWriteGuard<'_, PermissionsDocument> {
        self.doc.write().unwrap_or_else(|e| e.into_inner())
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Creates the document if missing; otherwise only refreshes `last_checked`.
    pub fn ensure_exists(&self) -> Result<()> {
        let mut guard = self.write_guard();
        let mut next = guard.clone();
        next.last_checked = Some(Utc::now());
        write_document(&self.path, &self.envelope, &next)?;
        *guard = next;
        Ok(())
    }

    #[must_use]
    pub fn read(&self, principal_id: &str) -> Option<Subject> {
        self.read_guard().principals.get(principal_id).cloned()
    }

    /// Stores one principal. `last_sync` advances even if nothing changed.
    pub fn write(&self, subject: Subject) -> Result<()> {
        let mut guard = self.write_guard();
        let mut next = guard.clone();
        next.principals.insert(subject.principal.id.clone(), subject);
        next.last_sync = Some(Utc::now());
        write_document(&self.path, &self.envelope, &next)?;
        *guard = next;
        Ok(())
    }

    /// Atomically replaces every cached principal.
    pub fn replace_all(&self, principals: BTreeMap<String, Subject>) -> Result<()> {
        let mut guard = self.write_guard();
        let next = PermissionsDocument {
            schema_version: PERMISSION_SCHEMA_VERSION,
            last_sync: Some(Utc::now()),
            last_checked: guard.last_checked,
            principals,
        };
        write_document(&self.path, &self.envelope, &next)?;
        *guard = next;
        Ok(())
    }

    /// Puts back a document taken with [`snapshot`](Self::snapshot),
    /// timestamps included.
    pub fn restore(&self, document: PermissionsDocument) -> Result<()> {
        let mut guard = self.write_guard();
        write_document(&self.path, &self.envelope, &document)?;
        *guard = document;
        Ok(())
    }

    /// Cache hit returns immediately; a miss asks the backend and populates
    /// the cache with whatever it returns.
    pub async fn read_through(
        &self,
        backend: &dyn Backend,
        principal_id: &str,
    ) -> Result<Option<Subject>> {
        if let Some(subject) = self.read(principal_id) {
            return Ok(Some(subject));
        }

        tracing::debug!(principal = %principal_id, "Permission cache miss");
        let Some(principal) = gateway::fetch_principal(backend, principal_id).await? else {
            return Ok(None);
        };
        let permissions = gateway::fetch_permissions(backend, principal_id)
            .await?
            .unwrap_or_default();

        let subject = Subject {
            principal,
            permissions,
        };
        if let Err(e) = self.write(subject.clone()) {
            tracing::warn!(principal = %principal_id, "Failed to populate permission cache: {e}");
        }
        Ok(Some(subject))
    }

    #[must_use]
    pub fn principal_ids(&self) -> Vec<String> {
        self.read_guard().principals.keys().cloned().collect()
    }

    #[must_use]
    pub fn snapshot(&self) -> PermissionsDocument {
        self.read_guard().clone()
    }

    #[must_use]
    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        self.read_guard().last_sync
    }

    /// Age of the cached data, for freshness indicators.
    #[must_use]
    pub fn staleness(&self) -> Option<chrono::Duration> {
        self.last_sync().map(|t| Utc::now() - t)
    }
}

//! The only component that talks to the remote service over REST.
//!
//! [`Backend`] is the request/response seam; [`RestGateway`] is the HTTPS
//! implementation. The free functions in this module layer typed table access
//! on top of any backend and apply the schema-mismatch policy: a row that does
//! not decode is logged and skipped, the rest of the batch is kept.

#[cfg(any(test, feature = "test-utils"))]
pub mod memory;
mod rest;

pub use rest::RestGateway;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{Error, Result};
use crate::types::{
    AuditLogEntry, PermissionChangeEntry, PermissionSet, Principal, RawPermissionDocument,
    RosterRecord, SyncMetadata,
};

/// Remote tables consumed by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Principals,
    Permissions,
    Roster,
    AuditLog,
    PermissionAudit,
    SyncMetadata,
}

impl Table {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Table::Principals => "principals",
            Table::Permissions => "permissions",
            Table::Roster => "roster",
            Table::AuditLog => "audit_log",
            Table::PermissionAudit => "permission_audit",
            Table::SyncMetadata => "sync_metadata",
        }
    }

    /// Unique column used for PATCH and DELETE.
    #[must_use]
    pub const fn key_column(self) -> &'static str {
        match self {
            Table::Permissions => "user_id",
            _ => "id",
        }
    }

    pub fn parse(s: &str) -> Option<Table> {
        [
            Table::Principals,
            Table::Permissions,
            Table::Roster,
            Table::AuditLog,
            Table::PermissionAudit,
            Table::SyncMetadata,
        ]
        .into_iter()
        .find(|t| t.name() == s)
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    Eq(String, String),
    Gte(String, String),
}

/// Row filter for [`Backend::select`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    pub conditions: Vec<Condition>,
    pub columns: Option<String>,
    pub order_desc: Option<String>,
}

impl Filter {
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn eq(mut self, column: &str, value: impl Into<String>) -> Self {
        self.conditions
            .push(Condition::Eq(column.to_string(), value.into()));
        self
    }

    #[must_use]
    pub fn gte(mut self, column: &str, value: impl Into<String>) -> Self {
        self.conditions
            .push(Condition::Gte(column.to_string(), value.into()));
        self
    }

    #[must_use]
    pub fn columns(mut self, columns: &str) -> Self {
        self.columns = Some(columns.to_string());
        self
    }

    #[must_use]
    pub fn newest_first(mut self, column: &str) -> Self {
        self.order_desc = Some(column.to_string());
        self
    }

    /// Query-string pairs in the REST endpoint's filter syntax.
    #[must_use]
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<(String, String)> = self
            .conditions
            .iter()
            .map(|c| match c {
                Condition::Eq(col, v) => (col.clone(), format!("eq.{v}")),
                Condition::Gte(col, v) => (col.clone(), format!("gte.{v}")),
            })
            .collect();

        pairs.push((
            "select".to_string(),
            self.columns.clone().unwrap_or_else(|| "*".to_string()),
        ));
        if let Some(col) = &self.order_desc {
            pairs.push(("order".to_string(), format!("{col}.desc")));
        }
        pairs
    }
}

/// Stateless request/response access to the remote tables.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn select(&self, table: Table, filter: &Filter) -> Result<Vec<Value>>;

    async fn insert(&self, table: Table, rows: Vec<Value>) -> Result<()>;

    /// Partial update of the row whose `key` column equals `value`.
    /// Returns [`Error::NotFound`] when no row matched.
    async fn update(&self, table: Table, key: &str, value: &str, patch: Value) -> Result<()>;

    async fn delete(&self, table: Table, key: &str, value: &str) -> Result<()>;
}

/// Decodes rows, skipping (and logging) any that do not match `T`.
pub fn decode_rows<T: DeserializeOwned>(table: Table, rows: Vec<Value>) -> Vec<T> {
    rows.into_iter()
        .filter_map(|row| match serde_json::from_value::<T>(row.clone()) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!(%table, error = %e, row = %row, "Skipping malformed row");
                None
            }
        })
        .collect()
}

fn to_row<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(Error::from)
}

pub async fn fetch_sync_metadata(backend: &dyn Backend) -> Result<SyncMetadata> {
    let rows = backend
        .select(
            Table::SyncMetadata,
            &Filter::all().eq("id", SyncMetadata::ROW_ID.to_string()),
        )
        .await?;

    match rows.into_iter().next() {
        Some(row) => serde_json::from_value(row).map_err(|e| Error::Schema(e.to_string())),
        None => Ok(SyncMetadata::default()),
    }
}

pub async fn push_sync_metadata(backend: &dyn Backend, metadata: &SyncMetadata) -> Result<()> {
    let row = to_row(metadata)?;
    match backend
        .update(
            Table::SyncMetadata,
            "id",
            &SyncMetadata::ROW_ID.to_string(),
            row.clone(),
        )
        .await
    {
        Err(Error::NotFound) => backend.insert(Table::SyncMetadata, vec![row]).await,
        other => other,
    }
}

pub async fn fetch_principal(backend: &dyn Backend, id: &str) -> Result<Option<Principal>> {
    let rows = backend
        .select(Table::Principals, &Filter::all().eq("id", id))
        .await?;
    Ok(decode_rows(Table::Principals, rows).into_iter().next())
}

pub async fn fetch_principals(backend: &dyn Backend) -> Result<Vec<Principal>> {
    let rows = backend.select(Table::Principals, &Filter::all()).await?;
    Ok(decode_rows(Table::Principals, rows))
}

/// Records a successful login: updates the profile fields of an existing
/// principal, or inserts a new one. Role flags are never overwritten here.
pub async fn upsert_principal(backend: &dyn Backend, principal: &Principal) -> Result<Principal> {
    match fetch_principal(backend, &principal.id).await? {
        Some(mut existing) => {
            existing.display_name = principal.display_name.clone();
            existing.email = principal.email.clone();
            existing.updated_at = Utc::now();
            backend
                .update(
                    Table::Principals,
                    "id",
                    &existing.id,
                    json!({
                        "display_name": existing.display_name,
                        "email": existing.email,
                        "updated_at": existing.updated_at,
                    }),
                )
                .await?;
            Ok(existing)
        }
        None => {
            backend
                .insert(Table::Principals, vec![to_row(principal)?])
                .await?;
            tracing::info!(principal = %principal.id, "Registered new principal");
            Ok(principal.clone())
        }
    }
}

#[derive(Debug, Deserialize)]
struct PermissionRow {
    user_id: String,
    permissions: Value,
}

fn decode_permission_row(row: PermissionRow) -> Option<(String, PermissionSet)> {
    match RawPermissionDocument::parse(row.permissions) {
        Ok((set, migration)) => {
            if migration.legacy_entries_merged > 0 || migration.collisions > 0 {
                tracing::debug!(
                    principal = %row.user_id,
                    merged = migration.legacy_entries_merged,
                    collisions = migration.collisions,
                    "Migrated legacy permission document"
                );
            }
            Some((row.user_id, set))
        }
        Err(e) => {
            tracing::warn!(principal = %row.user_id, error = %e, "Skipping invalid permission document");
            None
        }
    }
}

pub async fn fetch_permissions(
    backend: &dyn Backend,
    principal_id: &str,
) -> Result<Option<PermissionSet>> {
    let rows = backend
        .select(Table::Permissions, &Filter::all().eq("user_id", principal_id))
        .await?;
    Ok(decode_rows::<PermissionRow>(Table::Permissions, rows)
        .into_iter()
        .find_map(decode_permission_row)
        .map(|(_, set)| set))
}

/// Every decodable permission document, plus the ids of principals whose
/// documents exist remotely but could not be decoded.
#[derive(Debug, Default)]
pub struct PermissionDocuments {
    pub valid: BTreeMap<String, PermissionSet>,
    pub skipped: BTreeSet<String>,
}

pub async fn fetch_all_permissions(backend: &dyn Backend) -> Result<PermissionDocuments> {
    let rows = backend.select(Table::Permissions, &Filter::all()).await?;
    let mut documents = PermissionDocuments::default();
    for row in decode_rows::<PermissionRow>(Table::Permissions, rows) {
        let user_id = row.user_id.clone();
        match decode_permission_row(row) {
            Some((id, set)) => {
                documents.valid.insert(id, set);
            }
            None => {
                documents.skipped.insert(user_id);
            }
        }
    }
    Ok(documents)
}

pub async fn push_permissions(
    backend: &dyn Backend,
    principal_id: &str,
    permissions: &PermissionSet,
) -> Result<()> {
    let document = to_row(&RawPermissionDocument::from(permissions))?;
    let now = Utc::now();
    match backend
        .update(
            Table::Permissions,
            "user_id",
            principal_id,
            json!({"permissions": document, "updated_at": now}),
        )
        .await
    {
        Err(Error::NotFound) => {
            backend
                .insert(
                    Table::Permissions,
                    vec![json!({
                        "user_id": principal_id,
                        "permissions": document,
                        "updated_at": now,
                    })],
                )
                .await
        }
        other => other,
    }
}

pub async fn fetch_roster(backend: &dyn Backend) -> Result<Vec<RosterRecord>> {
    let rows = backend.select(Table::Roster, &Filter::all()).await?;
    Ok(decode_rows(Table::Roster, rows))
}

pub async fn fetch_record(backend: &dyn Backend, id: &str) -> Result<Option<RosterRecord>> {
    let rows = backend
        .select(Table::Roster, &Filter::all().eq("id", id))
        .await?;
    Ok(decode_rows(Table::Roster, rows).into_iter().next())
}

pub async fn upsert_record(backend: &dyn Backend, record: &RosterRecord) -> Result<()> {
    let row = to_row(record)?;
    match backend
        .update(Table::Roster, "id", &record.id, row.clone())
        .await
    {
        Err(Error::NotFound) => backend.insert(Table::Roster, vec![row]).await,
        other => other,
    }
}

pub async fn delete_record(backend: &dyn Backend, id: &str) -> Result<()> {
    backend.delete(Table::Roster, "id", id).await
}

pub async fn fetch_audit_since(
    backend: &dyn Backend,
    since: DateTime<Utc>,
) -> Result<Vec<AuditLogEntry>> {
    let rows = backend
        .select(
            Table::AuditLog,
            &Filter::all()
                .gte("timestamp", since.to_rfc3339())
                .newest_first("timestamp"),
        )
        .await?;
    Ok(decode_rows(Table::AuditLog, rows))
}

pub async fn fetch_audit_ids(backend: &dyn Backend) -> Result<Vec<String>> {
    #[derive(Deserialize)]
    struct IdRow {
        id: String,
    }

    let rows = backend
        .select(Table::AuditLog, &Filter::all().columns("id"))
        .await?;
    Ok(decode_rows::<IdRow>(Table::AuditLog, rows)
        .into_iter()
        .map(|r| r.id)
        .collect())
}

pub async fn append_audit(backend: &dyn Backend, entries: &[AuditLogEntry]) -> Result<()> {
    if entries.is_empty() {
        return Ok(());
    }
    let rows = entries.iter().map(to_row).collect::<Result<Vec<_>>>()?;
    backend.insert(Table::AuditLog, rows).await
}

pub async fn append_permission_change(
    backend: &dyn Backend,
    entry: &PermissionChangeEntry,
) -> Result<()> {
    backend
        .insert(Table::PermissionAudit, vec![to_row(entry)?])
        .await
}

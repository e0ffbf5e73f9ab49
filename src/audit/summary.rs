use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{AuditAction, AuditLogEntry};

/// Compact form of an action kept in the per-institution recent list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSummary {
    pub timestamp: DateTime<Utc>,
    pub principal_id: String,
    pub principal_name: String,
    pub action: AuditAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_name: Option<String>,
    pub detail: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CityActivity {
    pub added: BTreeSet<String>,
    pub edited: BTreeSet<String>,
    pub deleted: BTreeSet<String>,
}

/// Rolling aggregate over every audit entry written on this installation.
/// Cached state only: [`GlobalSummary::rebuild`] regenerates it from the logs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalSummary {
    pub total_actions: u64,
    pub users_connected: BTreeSet<String>,
    pub cities: BTreeMap<String, CityActivity>,
    pub institutions_modified: BTreeMap<String, Vec<ActionSummary>>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

impl GlobalSummary {
    /// Folds one entry in. `recent_limit` caps each per-institution list,
    /// dropping the oldest actions first.
    pub fn record(&mut self, entry: &AuditLogEntry, recent_limit: usize) {
        self.total_actions += 1;
        self.users_connected.insert(entry.principal_id.clone());

        if let (Some(city), Some(name)) = (&entry.city, &entry.entity_name) {
            let activity = self.cities.entry(city.clone()).or_default();
            let bucket = match entry.action {
                AuditAction::Add => Some(&mut activity.added),
                AuditAction::Edit
                | AuditAction::AddScore
                | AuditAction::DeductScores
                | AuditAction::ResetScores => Some(&mut activity.edited),
                AuditAction::Delete => Some(&mut activity.deleted),
                AuditAction::PermissionChange | AuditAction::Login => None,
            };
            if let Some(bucket) = bucket {
                bucket.insert(name.clone());
            }
        }

        let recent = self
            .institutions_modified
            .entry(entry.scope_key())
            .or_default();
        recent.push(ActionSummary {
            timestamp: entry.timestamp,
            principal_id: entry.principal_id.clone(),
            principal_name: entry.principal_name.clone(),
            action: entry.action,
            entity_name: entry.entity_name.clone(),
            detail: entry.detail.clone(),
        });
        if recent.len() > recent_limit {
            let excess = recent.len() - recent_limit;
            recent.drain(..excess);
        }

        self.last_updated = Some(Utc::now());
    }

    /// Replays entries in timestamp order.
    #[must_use]
    pub fn rebuild(mut entries: Vec<AuditLogEntry>, recent_limit: usize) -> Self {
        entries.sort_by_key(|e| e.timestamp);
        let mut summary = Self::default();
        for entry in &entries {
            summary.record(entry, recent_limit);
        }
        summary
    }
}

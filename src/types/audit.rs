use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::CapabilityChange;

/// Scope key used for actions that target no particular institution.
pub const GLOBAL_SCOPE_KEY: &str = "_global";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Add,
    Edit,
    Delete,
    PermissionChange,
    AddScore,
    ResetScores,
    DeductScores,
    Login,
}

impl AuditAction {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            AuditAction::Add => "add",
            AuditAction::Edit => "edit",
            AuditAction::Delete => "delete",
            AuditAction::PermissionChange => "permission_change",
            AuditAction::AddScore => "add_score",
            AuditAction::ResetScores => "reset_scores",
            AuditAction::DeductScores => "deduct_scores",
            AuditAction::Login => "login",
        }
    }

    pub fn parse(s: &str) -> Option<AuditAction> {
        match s.trim().replace('-', "_").as_str() {
            "add" => Some(AuditAction::Add),
            "edit" => Some(AuditAction::Edit),
            "delete" => Some(AuditAction::Delete),
            "permission_change" => Some(AuditAction::PermissionChange),
            "add_score" => Some(AuditAction::AddScore),
            "reset_scores" => Some(AuditAction::ResetScores),
            "deduct_scores" => Some(AuditAction::DeductScores),
            "login" => Some(AuditAction::Login),
            _ => None,
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub before: Option<Value>,
    pub after: Option<Value>,
}

/// An immutable record of one mutating action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub principal_id: String,
    pub principal_name: String,
    pub action: AuditAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub institution: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub detail: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub changes: BTreeMap<String, FieldChange>,
}

impl AuditLogEntry {
    /// `city/institution`, or a shared key for entries without one.
    #[must_use]
    pub fn scope_key(&self) -> String {
        match (&self.city, &self.institution) {
            (Some(city), Some(institution)) => format!("{city}/{institution}"),
            (Some(city), None) => format!("{city}/{GLOBAL_SCOPE_KEY}"),
            _ => GLOBAL_SCOPE_KEY.to_string(),
        }
    }
}

/// Dedicated record for capability changes made to a principal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionChangeEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub actor_id: String,
    pub actor_name: String,
    pub target_principal_id: String,
    pub target_principal_name: String,
    pub changes: Vec<CapabilityChange>,
}

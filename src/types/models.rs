use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::PermissionSet;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default)]
    pub is_superuser: bool,
    #[serde(default)]
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Principal {
    #[must_use]
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            display_name: display_name.into(),
            email: None,
            is_superuser: false,
            is_admin: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Superusers and admins see the unfiltered dataset.
    #[must_use]
    pub fn sees_everything(&self) -> bool {
        self.is_superuser || self.is_admin
    }
}

/// A principal together with its loaded permission set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subject {
    pub principal: Principal,
    #[serde(default)]
    pub permissions: PermissionSet,
}

/// One employee row of the roster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RosterRecord {
    pub id: String,
    pub city: String,
    pub institution: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<String>,
    #[serde(default)]
    pub score: i64,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RosterRecord {
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        city: impl Into<String>,
        institution: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            city: city.into(),
            institution: institution.into(),
            name: name.into(),
            position: None,
            score: 0,
            updated_at: Utc::now(),
            updated_by: None,
            extra: Map::new(),
        }
    }

    #[must_use]
    pub fn scope_key(&self) -> String {
        format!("{}/{}", self.city, self.institution)
    }
}

/// Single-row version/hash record used for cheap change detection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMetadata {
    #[serde(default = "SyncMetadata::row_id")]
    pub id: i64,
    pub version: i64,
    #[serde(alias = "dataHash")]
    pub data_hash: String,
    #[serde(alias = "lastModifiedAt")]
    pub last_modified_at: DateTime<Utc>,
}

impl SyncMetadata {
    pub const ROW_ID: i64 = 1;

    fn row_id() -> i64 {
        Self::ROW_ID
    }

    #[must_use]
    pub fn next(&self, data_hash: String) -> Self {
        Self {
            id: Self::ROW_ID,
            version: self.version + 1,
            data_hash,
            last_modified_at: Utc::now(),
        }
    }
}

impl Default for SyncMetadata {
    fn default() -> Self {
        Self {
            id: Self::ROW_ID,
            version: 0,
            data_hash: String::new(),
            last_modified_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }
}

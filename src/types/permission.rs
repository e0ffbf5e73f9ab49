use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Current persisted shape of a permission document.
pub const PERMISSION_SCHEMA_VERSION: u32 = 2;

/// The layer an action is primarily defined on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Global,
    City,
    Institution,
}

/// A named capability that can be granted to a principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    ManageUsers,
    ManagePermissions,
    AddCity,
    EditCity,
    DeleteCity,
    ViewAuditLog,
    AddInstitution,
    EditInstitution,
    DeleteInstitution,
    CanView,
    CanEdit,
    CanDelete,
    CanAddEmployee,
    CanEditEmployee,
    CanDeleteEmployee,
    CanAddScore,
    CanResetScores,
    CanDeductScores,
}

impl Action {
    pub const ALL: [Action; 18] = [
        Action::ManageUsers,
        Action::ManagePermissions,
        Action::AddCity,
        Action::EditCity,
        Action::DeleteCity,
        Action::ViewAuditLog,
        Action::AddInstitution,
        Action::EditInstitution,
        Action::DeleteInstitution,
        Action::CanView,
        Action::CanEdit,
        Action::CanDelete,
        Action::CanAddEmployee,
        Action::CanEditEmployee,
        Action::CanDeleteEmployee,
        Action::CanAddScore,
        Action::CanResetScores,
        Action::CanDeductScores,
    ];

    #[must_use]
    pub const fn scope(self) -> Scope {
        match self {
            Action::ManageUsers
            | Action::ManagePermissions
            | Action::AddCity
            | Action::EditCity
            | Action::DeleteCity
            | Action::ViewAuditLog => Scope::Global,
            Action::AddInstitution | Action::EditInstitution | Action::DeleteInstitution => {
                Scope::City
            }
            _ => Scope::Institution,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Action::ManageUsers => "manage_users",
            Action::ManagePermissions => "manage_permissions",
            Action::AddCity => "add_city",
            Action::EditCity => "edit_city",
            Action::DeleteCity => "delete_city",
            Action::ViewAuditLog => "view_audit_log",
            Action::AddInstitution => "add_institution",
            Action::EditInstitution => "edit_institution",
            Action::DeleteInstitution => "delete_institution",
            Action::CanView => "can_view",
            Action::CanEdit => "can_edit",
            Action::CanDelete => "can_delete",
            Action::CanAddEmployee => "can_add_employee",
            Action::CanEditEmployee => "can_edit_employee",
            Action::CanDeleteEmployee => "can_delete_employee",
            Action::CanAddScore => "can_add_score",
            Action::CanResetScores => "can_reset_scores",
            Action::CanDeductScores => "can_deduct_scores",
        }
    }

    /// Parses an action name. Accepts both `snake_case` and `kebab-case`.
    pub fn parse(s: &str) -> Option<Action> {
        let normalized = s.trim().replace('-', "_");
        Self::ALL.into_iter().find(|a| a.as_str() == normalized)
    }

    /// Actions that live on the given layer.
    pub fn in_scope(scope: Scope) -> impl Iterator<Item = Action> {
        Self::ALL.into_iter().filter(move |a| a.scope() == scope)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Boolean grants for one permission layer, keyed by action.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capabilities(BTreeMap<Action, bool>);

impl Capabilities {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// An entry where every action of `scope` is explicitly denied.
    #[must_use]
    pub fn deny_all(scope: Scope) -> Self {
        Self(Action::in_scope(scope).map(|a| (a, false)).collect())
    }

    #[must_use]
    pub fn with(mut self, action: Action, allowed: bool) -> Self {
        self.set(action, allowed);
        self
    }

    pub fn set(&mut self, action: Action, allowed: bool) {
        self.0.insert(action, allowed);
    }

    #[must_use]
    pub fn get(&self, action: Action) -> Option<bool> {
        self.0.get(&action).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Action, bool)> + '_ {
        self.0.iter().map(|(a, v)| (*a, *v))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn validate_layer(&self, layer: &str, allowed: &[Scope]) -> Result<()> {
        for action in self.0.keys() {
            if !allowed.contains(&action.scope()) {
                return Err(Error::Schema(format!(
                    "action '{action}' is not valid on the {layer} layer"
                )));
            }
        }
        Ok(())
    }
}

impl FromIterator<(Action, bool)> for Capabilities {
    fn from_iter<I: IntoIterator<Item = (Action, bool)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// One capability that differs between two permission sets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityChange {
    pub layer: Scope,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub institution: Option<String>,
    pub action: Action,
    pub before: Option<bool>,
    pub after: Option<bool>,
}

pub type InstitutionMap = BTreeMap<String, BTreeMap<String, Capabilities>>;

/// The full global/city/institution capability document of one principal.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PermissionSet {
    #[serde(default)]
    pub global: Capabilities,
    #[serde(default)]
    pub cities: BTreeMap<String, Capabilities>,
    #[serde(default)]
    pub institutions: InstitutionMap,
}

impl PermissionSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_global(&mut self, action: Action, allowed: bool) {
        self.global.set(action, allowed);
    }

    pub fn set_city(&mut self, city: &str, action: Action, allowed: bool) {
        self.cities
            .entry(city.to_string())
            .or_default()
            .set(action, allowed);
    }

    pub fn set_institution(&mut self, city: &str, institution: &str, action: Action, allowed: bool) {
        self.institutions
            .entry(city.to_string())
            .or_default()
            .entry(institution.to_string())
            .or_default()
            .set(action, allowed);
    }

    #[must_use]
    pub fn institution(&self, city: &str, institution: &str) -> Option<&Capabilities> {
        self.institutions.get(city)?.get(institution)
    }

    /// Layered lookup: institution entry, then city entry, then global.
    /// Returns `None` when no layer mentions the action.
    #[must_use]
    pub fn lookup(&self, action: Action, city: Option<&str>, institution: Option<&str>) -> Option<bool> {
        if let (Some(city), Some(institution)) = (city, institution) {
            if let Some(value) = self
                .institution(city, institution)
                .and_then(|caps| caps.get(action))
            {
                return Some(value);
            }
        }

        if let Some(city) = city {
            if let Some(value) = self.cities.get(city).and_then(|caps| caps.get(action)) {
                return Some(value);
            }
        }

        self.global.get(action)
    }

    /// Rejects actions placed on a layer that cannot hold them.
    pub fn validate(&self) -> Result<()> {
        self.global
            .validate_layer("global", &[Scope::Global, Scope::City, Scope::Institution])?;
        for caps in self.cities.values() {
            caps.validate_layer("city", &[Scope::City, Scope::Institution])?;
        }
        for caps in self.institutions.values().flat_map(BTreeMap::values) {
            caps.validate_layer("institution", &[Scope::Institution])?;
        }
        Ok(())
    }

    /// Adds legacy nested institution entries. Existing entries always win, so
    /// merging the same legacy data twice is a no-op. Returns the number of
    /// entries taken from `legacy`.
    pub fn merge_legacy(&mut self, legacy: InstitutionMap) -> usize {
        let mut merged = 0;
        for (city, institutions) in legacy {
            let target = self.institutions.entry(city).or_default();
            for (institution, caps) in institutions {
                if !target.contains_key(&institution) {
                    target.insert(institution, caps);
                    merged += 1;
                }
            }
        }
        self.institutions.retain(|_, v| !v.is_empty());
        merged
    }

    /// Inserts a deny-all entry for every known `(city, institution)` pair that
    /// has none. Returns the number of entries added.
    pub fn backfill<'a, I>(&mut self, known: I) -> usize
    where
        I: IntoIterator<Item = &'a (String, String)>,
    {
        let mut added = 0;
        for (city, institution) in known {
            let entries = self.institutions.entry(city.clone()).or_default();
            if !entries.contains_key(institution) {
                entries.insert(institution.clone(), Capabilities::deny_all(Scope::Institution));
                added += 1;
            }
        }
        added
    }

    /// Every `(city, institution)` pair this set has an entry for.
    #[must_use]
    pub fn known_institutions(&self) -> BTreeSet<(String, String)> {
        self.institutions
            .iter()
            .flat_map(|(city, insts)| insts.keys().map(move |i| (city.clone(), i.clone())))
            .collect()
    }

    /// Capability-level difference from `self` to `after`.
    #[must_use]
    pub fn diff(&self, after: &PermissionSet) -> Vec<CapabilityChange> {
        let mut changes = Vec::new();

        diff_layer(&mut changes, Scope::Global, None, None, Some(&self.global), Some(&after.global));

        let cities: BTreeSet<&String> = self.cities.keys().chain(after.cities.keys()).collect();
        for city in cities {
            diff_layer(
                &mut changes,
                Scope::City,
                Some(city),
                None,
                self.cities.get(city),
                after.cities.get(city),
            );
        }

        let pairs: BTreeSet<(String, String)> = self
            .known_institutions()
            .into_iter()
            .chain(after.known_institutions())
            .collect();
        for (city, institution) in &pairs {
            diff_layer(
                &mut changes,
                Scope::Institution,
                Some(city),
                Some(institution),
                self.institution(city, institution),
                after.institution(city, institution),
            );
        }

        changes
    }
}

fn diff_layer(
    out: &mut Vec<CapabilityChange>,
    layer: Scope,
    city: Option<&String>,
    institution: Option<&String>,
    before: Option<&Capabilities>,
    after: Option<&Capabilities>,
) {
    let actions: BTreeSet<Action> = before
        .into_iter()
        .chain(after)
        .flat_map(|caps| caps.iter().map(|(a, _)| a))
        .collect();

    for action in actions {
        let old = before.and_then(|c| c.get(action));
        let new = after.and_then(|c| c.get(action));
        if old != new {
            out.push(CapabilityChange {
                layer,
                city: city.cloned(),
                institution: institution.cloned(),
                action,
                before: old,
                after: new,
            });
        }
    }
}

/// City entry as persisted by schema v1, which may carry nested institutions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawCityEntry {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub institutions: BTreeMap<String, Capabilities>,
    #[serde(flatten)]
    pub capabilities: Capabilities,
}

/// A permission document as found on the wire or on disk, in either schema.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawPermissionDocument {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub global: Capabilities,
    #[serde(default)]
    pub cities: BTreeMap<String, RawCityEntry>,
    #[serde(default)]
    pub institutions: InstitutionMap,
}

/// Outcome of migrating a raw document to the current schema.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Migration {
    pub from_version: u32,
    pub legacy_entries_merged: usize,
    pub collisions: usize,
}

impl RawPermissionDocument {
    /// Folds legacy nested institutions into the top-level map, keeping the
    /// top-level entry on collision, and validates the result.
    pub fn migrate(self) -> Result<(PermissionSet, Migration)> {
        let from_version = self.schema_version.unwrap_or(1);
        let mut set = PermissionSet {
            global: self.global,
            cities: BTreeMap::new(),
            institutions: self.institutions,
        };

        let mut legacy = InstitutionMap::new();
        let mut legacy_total = 0;
        for (city, entry) in self.cities {
            if !entry.institutions.is_empty() {
                legacy_total += entry.institutions.len();
                legacy.insert(city.clone(), entry.institutions);
            }
            set.cities.insert(city, entry.capabilities);
        }

        let merged = set.merge_legacy(legacy);
        set.validate()?;

        Ok((
            set,
            Migration {
                from_version,
                legacy_entries_merged: merged,
                collisions: legacy_total - merged,
            },
        ))
    }

    /// Parses and migrates a JSON permission document.
    pub fn parse(value: serde_json::Value) -> Result<(PermissionSet, Migration)> {
        let raw: RawPermissionDocument =
            serde_json::from_value(value).map_err(|e| Error::Schema(e.to_string()))?;
        raw.migrate()
    }
}

impl From<&PermissionSet> for RawPermissionDocument {
    fn from(set: &PermissionSet) -> Self {
        Self {
            schema_version: Some(PERMISSION_SCHEMA_VERSION),
            global: set.global.clone(),
            cities: set
                .cities
                .iter()
                .map(|(city, caps)| {
                    (
                        city.clone(),
                        RawCityEntry {
                            institutions: BTreeMap::new(),
                            capabilities: caps.clone(),
                        },
                    )
                })
                .collect(),
            institutions: set.institutions.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_action_parse() {
        assert_eq!(Action::parse("can_view"), Some(Action::CanView));
        assert_eq!(Action::parse("manage-users"), Some(Action::ManageUsers));
        assert_eq!(Action::parse("can_fly"), None);
    }

    #[test]
    fn test_action_serde_names_match_as_str() {
        for action in Action::ALL {
            let encoded = serde_json::to_value(action).unwrap();
            assert_eq!(encoded, json!(action.as_str()));
        }
    }

    #[test]
    fn test_lookup_falls_through_layers() {
        let mut set = PermissionSet::new();
        set.set_global(Action::CanView, true);
        set.set_city("CityA", Action::CanView, false);
        set.set_institution("CityA", "DeptX", Action::CanView, true);

        assert_eq!(set.lookup(Action::CanView, Some("CityA"), Some("DeptX")), Some(true));
        assert_eq!(set.lookup(Action::CanView, Some("CityA"), Some("DeptY")), Some(false));
        assert_eq!(set.lookup(Action::CanView, Some("CityB"), Some("DeptZ")), Some(true));
        assert_eq!(set.lookup(Action::CanEdit, Some("CityA"), Some("DeptX")), None);
    }

    #[test]
    fn test_migrate_prefers_top_level_entry() {
        let doc = json!({
            "global": {"manage_users": false},
            "cities": {
                "CityA": {
                    "add_institution": true,
                    "institutions": {
                        "DeptX": {"can_view": false, "can_edit": true},
                        "DeptOld": {"can_view": true}
                    }
                }
            },
            "institutions": {
                "CityA": {"DeptX": {"can_view": true}}
            }
        });

        let (set, migration) = RawPermissionDocument::parse(doc).unwrap();
        assert_eq!(migration.from_version, 1);
        assert_eq!(migration.legacy_entries_merged, 1);
        assert_eq!(migration.collisions, 1);

        let dept_x = set.institution("CityA", "DeptX").unwrap();
        assert_eq!(dept_x, &Capabilities::new().with(Action::CanView, true));
        assert_eq!(
            set.institution("CityA", "DeptOld").unwrap().get(Action::CanView),
            Some(true)
        );
        assert_eq!(set.cities["CityA"].get(Action::AddInstitution), Some(true));
    }

    #[test]
    fn test_merge_legacy_is_idempotent() {
        let mut set = PermissionSet::new();
        set.set_institution("CityA", "DeptX", Action::CanView, true);

        let mut legacy = InstitutionMap::new();
        legacy.entry("CityA".into()).or_default().insert(
            "DeptX".into(),
            Capabilities::new().with(Action::CanView, false),
        );
        legacy
            .entry("CityB".into())
            .or_default()
            .insert("DeptY".into(), Capabilities::new().with(Action::CanEdit, true));

        set.merge_legacy(legacy.clone());
        let once = set.clone();
        assert_eq!(set.merge_legacy(legacy), 0);
        assert_eq!(set, once);
        assert_eq!(set.lookup(Action::CanView, Some("CityA"), Some("DeptX")), Some(true));
    }

    #[test]
    fn test_migrated_document_round_trips_as_current_schema() {
        let mut set = PermissionSet::new();
        set.set_city("CityA", Action::EditInstitution, true);
        set.set_institution("CityA", "DeptX", Action::CanAddScore, true);

        let raw = RawPermissionDocument::from(&set);
        let value = serde_json::to_value(&raw).unwrap();
        assert_eq!(value["schema_version"], json!(PERMISSION_SCHEMA_VERSION));

        let (parsed, migration) = RawPermissionDocument::parse(value).unwrap();
        assert_eq!(parsed, set);
        assert_eq!(migration.legacy_entries_merged, 0);
    }

    #[test]
    fn test_validate_rejects_misplaced_action() {
        let doc = json!({
            "institutions": {"CityA": {"DeptX": {"manage_users": true}}}
        });
        assert!(matches!(RawPermissionDocument::parse(doc), Err(Error::Schema(_))));
    }

    #[test]
    fn test_unknown_key_is_schema_error() {
        let doc = json!({"global": {"can_teleport": true}});
        assert!(matches!(RawPermissionDocument::parse(doc), Err(Error::Schema(_))));
    }

    #[test]
    fn test_backfill_adds_deny_all_entries() {
        let mut set = PermissionSet::new();
        set.set_institution("CityA", "DeptX", Action::CanView, true);

        let known = vec![
            ("CityA".to_string(), "DeptX".to_string()),
            ("CityA".to_string(), "DeptY".to_string()),
            ("CityB".to_string(), "DeptZ".to_string()),
        ];
        assert_eq!(set.backfill(&known), 2);
        assert_eq!(set.backfill(&known), 0);

        let dept_y = set.institution("CityA", "DeptY").unwrap();
        assert!(Action::in_scope(Scope::Institution).all(|a| dept_y.get(a) == Some(false)));
        assert_eq!(set.lookup(Action::CanView, Some("CityA"), Some("DeptX")), Some(true));
    }

    #[test]
    fn test_diff_reports_changed_capabilities() {
        let mut before = PermissionSet::new();
        before.set_institution("CityA", "DeptX", Action::CanView, false);
        let mut after = before.clone();
        after.set_institution("CityA", "DeptX", Action::CanView, true);
        after.set_global(Action::ManageUsers, true);

        let changes = before.diff(&after);
        assert_eq!(changes.len(), 2);
        assert!(changes.iter().any(|c| c.action == Action::ManageUsers
            && c.layer == Scope::Global
            && c.before.is_none()
            && c.after == Some(true)));
        assert!(changes.iter().any(|c| c.action == Action::CanView
            && c.institution.as_deref() == Some("DeptX")
            && c.before == Some(false)));
    }
}

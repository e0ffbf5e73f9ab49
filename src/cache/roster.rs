use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::path::scoped_file;
use super::{quarantine, read_document, write_document};
use crate::crypto::Envelope;
use crate::error::Result;
use crate::types::RosterRecord;

type ScopeKey = (String, String);

/// Cached roster of one city/institution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RosterDocument {
    pub city: String,
    pub institution: String,
    pub last_sync: DateTime<Utc>,
    pub records: BTreeMap<String, RosterRecord>,
}

impl RosterDocument {
    fn new(city: &str, institution: &str) -> Self {
        Self {
            city: city.to_string(),
            institution: institution.to_string(),
            last_sync: Utc::now(),
            records: BTreeMap::new(),
        }
    }
}

/// Per-institution roster documents under one directory.
pub struct RosterCache {
    dir: PathBuf,
    envelope: Envelope,
    docs: RwLock<BTreeMap<ScopeKey, RosterDocument>>,
}

fn load_dir(dir: &Path, envelope: &Envelope) -> Result<BTreeMap<ScopeKey, RosterDocument>> {
    let mut docs = BTreeMap::new();
    let cities = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(docs),
        Err(e) => return Err(e.into()),
    };

    for city in cities {
        let city = city?;
        if !city.file_type()?.is_dir() {
            continue;
        }
        for file in fs::read_dir(city.path())? {
            let path = file?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(doc) = read_document::<RosterDocument>(&path, envelope)? {
                docs.insert((doc.city.clone(), doc.institution.clone()), doc);
            }
        }
    }
    Ok(docs)
}

impl RosterCache {
    pub fn open(dir: impl Into<PathBuf>, envelope: Envelope) -> Result<Self> {
        let dir = dir.into();
        let docs = load_dir(&dir, &envelope)?;
        Ok(Self {
            dir,
            envelope,
            docs: RwLock::new(docs),
        })
    }

    /// Opens the cache, discarding the whole directory if any document is
    /// unreadable. Returns `true` when the caller must repopulate it.
    pub fn open_or_reset(dir: impl Into<PathBuf>, envelope: Envelope) -> Result<(Self, bool)> {
        let dir = dir.into();
        match Self::open(&dir, envelope.clone()) {
            Ok(cache) => Ok((cache, false)),
            Err(e) if e.requires_rebuild() => {
                tracing::error!("Roster cache unreadable ({e}); it will be rebuilt");
                let corrupt = dir.with_extension("corrupt");
                if corrupt.exists() {
                    fs::remove_dir_all(&corrupt)?;
                }
                quarantine(&dir)?;
                Ok((Self::open(&dir, envelope)?, true))
            }
            Err(e) => Err(e),
        }
    }

    fn read_guard(&self) -> RwLockReadGuard<'_, BTreeMap<ScopeKey, RosterDocument>> {
        self.docs.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_guard(&self) -> RwLockWriteGuard<'_, BTreeMap<ScopeKey, RosterDocument>> {
        self.docs.write().unwrap_or_else(|e| e.into_inner())
    }

    fn doc_path(&self, root: &Path, city: &str, institution: &str) -> PathBuf {
        scoped_file(root, city, institution, "json")
    }

    #[must_use]
    pub fn records(&self, city: &str, institution: &str) -> Vec<RosterRecord> {
        self.read_guard()
            .get(&(city.to_string(), institution.to_string()))
            .map(|d| d.records.values().cloned().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn all_records(&self) -> Vec<RosterRecord> {
        self.read_guard()
            .values()
            .flat_map(|d| d.records.values().cloned())
            .collect()
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<RosterRecord> {
        self.read_guard()
            .values()
            .find_map(|d| d.records.get(id).cloned())
    }

    #[must_use]
    pub fn last_sync(&self, city: &str, institution: &str) -> Option<DateTime<Utc>> {
        self.read_guard()
            .get(&(city.to_string(), institution.to_string()))
            .map(|d| d.last_sync)
    }

    /// Last-writer-wins upsert: the record is stored unless the cached copy
    /// has a later `updated_at`. Returns whether it was stored.
    pub fn apply(&self, record: RosterRecord) -> Result<bool> {
        let mut guard = self.write_guard();
        let key = (record.city.clone(), record.institution.clone());

        if let Some(existing) = guard.get(&key).and_then(|d| d.records.get(&record.id)) {
            if existing.updated_at > record.updated_at {
                tracing::debug!(record = %record.id, "Ignoring older roster record");
                return Ok(false);
            }
        }

        // A record moved between institutions leaves its old document.
        let moved_from: Vec<ScopeKey> = guard
            .iter()
            .filter(|(k, d)| **k != key && d.records.contains_key(&record.id))
            .map(|(k, _)| k.clone())
            .collect();
        for old in moved_from {
            self.remove_locked(&mut guard, &old, &record.id)?;
        }

        let mut doc = guard
            .get(&key)
            .cloned()
            .unwrap_or_else(|| RosterDocument::new(&key.0, &key.1));
        doc.records.insert(record.id.clone(), record);
        doc.last_sync = Utc::now();
        write_document(&self.doc_path(&self.dir, &key.0, &key.1), &self.envelope, &doc)?;
        guard.insert(key, doc);
        Ok(true)
    }

    pub fn remove(&self, city: &str, institution: &str, id: &str) -> Result<bool> {
        let mut guard = self.write_guard();
        self.remove_locked(&mut guard, &(city.to_string(), institution.to_string()), id)
    }

    fn remove_locked(
        &self,
        guard: &mut BTreeMap<ScopeKey, RosterDocument>,
        key: &ScopeKey,
        id: &str,
    ) -> Result<bool> {
        let Some(mut doc) = guard.get(key).cloned() else {
            return Ok(false);
        };
        if doc.records.remove(id).is_none() {
            return Ok(false);
        }
        doc.last_sync = Utc::now();
        write_document(&self.doc_path(&self.dir, &key.0, &key.1), &self.envelope, &doc)?;
        guard.insert(key.clone(), doc);
        Ok(true)
    }

    /// Replaces the whole roster. Documents are written to a staging directory
    /// that is swapped in only once every write succeeded; on failure the
    /// previous contents remain.
    pub fn replace_all(&self, records: Vec<RosterRecord>) -> Result<()> {
        let mut guard = self.write_guard();
        let now = Utc::now();

        let mut next: BTreeMap<ScopeKey, RosterDocument> = BTreeMap::new();
        for record in records {
            let key = (record.city.clone(), record.institution.clone());
            let doc = next
                .entry(key.clone())
                .or_insert_with(|| RosterDocument::new(&key.0, &key.1));
            doc.last_sync = now;
            doc.records.insert(record.id.clone(), record);
        }

        let staging = self.dir.with_extension("staging");
        let previous = self.dir.with_extension("previous");
        let _ = fs::remove_dir_all(&staging);

        let staged = (|| -> Result<()> {
            fs::create_dir_all(&staging)?;
            for ((city, institution), doc) in &next {
                write_document(&self.doc_path(&staging, city, institution), &self.envelope, doc)?;
            }
            Ok(())
        })();
        if let Err(e) = staged {
            let _ = fs::remove_dir_all(&staging);
            return Err(e);
        }

        let _ = fs::remove_dir_all(&previous);
        if self.dir.exists() {
            fs::rename(&self.dir, &previous)?;
        }
        if let Err(e) = fs::rename(&staging, &self.dir) {
            let _ = fs::rename(&previous, &self.dir);
            return Err(e.into());
        }
        let _ = fs::remove_dir_all(&previous);

        *guard = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use tempfile::TempDir;

    use super::*;
    use crate::crypto::CacheKey;

    fn cache(temp: &TempDir) -> RosterCache {
        RosterCache::open(
            temp.path().join("roster"),
            Envelope::encrypted(CacheKey::from_bytes([3; 32])),
        )
        .unwrap()
    }

    #[test]
    fn test_apply_and_reload() {
        let temp = TempDir::new().unwrap();
        let roster = cache(&temp);

        roster
            .apply(RosterRecord::new("r1", "CityA", "DeptX", "Ana"))
            .unwrap();
        roster
            .apply(RosterRecord::new("r2", "CityA", "DeptY", "Bo"))
            .unwrap();

        let reopened = cache(&temp);
        assert_eq!(reopened.records("CityA", "DeptX").len(), 1);
        assert_eq!(reopened.get("r2").unwrap().name, "Bo");
        assert_eq!(reopened.records("CityA", "DeptY").len(), 1);
    }

    #[test]
    fn test_apply_keeps_newer_record() {
        let temp = TempDir::new().unwrap();
        let roster = cache(&temp);

        let mut newer = RosterRecord::new("r1", "CityA", "DeptX", "Newer");
        newer.updated_at = Utc::now();
        let mut older = RosterRecord::new("r1", "CityA", "DeptX", "Older");
        older.updated_at = newer.updated_at - Duration::seconds(30);

        assert!(roster.apply(newer).unwrap());
        assert!(!roster.apply(older).unwrap());
        assert_eq!(roster.get("r1").unwrap().name, "Newer");
    }

    #[test]
    fn test_apply_moves_record_between_institutions() {
        let temp = TempDir::new().unwrap();
        let roster = cache(&temp);

        roster
            .apply(RosterRecord::new("r1", "CityA", "DeptX", "Ana"))
            .unwrap();
        roster
            .apply(RosterRecord::new("r1", "CityA", "DeptY", "Ana"))
            .unwrap();

        assert!(roster.records("CityA", "DeptX").is_empty());
        assert_eq!(roster.records("CityA", "DeptY").len(), 1);
    }

    #[test]
    fn test_replace_all_swaps_contents() {
        let temp = TempDir::new().unwrap();
        let roster = cache(&temp);
        roster
            .apply(RosterRecord::new("old", "CityZ", "DeptZ", "Gone"))
            .unwrap();

        roster
            .replace_all(vec![
                RosterRecord::new("r1", "CityA", "DeptX", "Ana"),
                RosterRecord::new("r2", "CityA", "DeptX", "Bo"),
            ])
            .unwrap();

        assert!(roster.get("old").is_none());
        assert_eq!(roster.records("CityA", "DeptX").len(), 2);

        let reopened = cache(&temp);
        assert!(reopened.get("old").is_none());
        assert_eq!(reopened.all_records().len(), 2);
        assert!(!temp.path().join("roster.staging").exists());
    }

    #[test]
    fn test_remove() {
        let temp = TempDir::new().unwrap();
        let roster = cache(&temp);
        roster
            .apply(RosterRecord::new("r1", "CityA", "DeptX", "Ana"))
            .unwrap();

        assert!(roster.remove("CityA", "DeptX", "r1").unwrap());
        assert!(!roster.remove("CityA", "DeptX", "r1").unwrap());
        assert!(cache(&temp).get("r1").is_none());
    }
}

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::cache::path::scoped_file;
use crate::crypto::Envelope;
use crate::error::{Error, Result};
use crate::types::{AuditLogEntry, GLOBAL_SCOPE_KEY, PermissionChangeEntry};

const LOG_EXT: &str = "log";
const PERMISSION_LOG: &str = "permission_changes.log";

/// Append-only, line-per-entry log files: one per city/institution plus a
/// dedicated file for permission changes. Each line is its own envelope.
pub struct AuditStore {
    dir: PathBuf,
    envelope: Envelope,
}

impl AuditStore {
    pub fn new(dir: impl Into<PathBuf>, envelope: Envelope) -> Self {
        Self {
            dir: dir.into(),
            envelope,
        }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn scope_path(&self, city: Option<&str>, institution: Option<&str>) -> PathBuf {
        let city = city.unwrap_or(GLOBAL_SCOPE_KEY);
        let institution = institution.unwrap_or(GLOBAL_SCOPE_KEY);
        scoped_file(&self.dir, city, institution, LOG_EXT)
    }

    fn permission_log_path(&self) -> PathBuf {
        self.dir.join(PERMISSION_LOG)
    }

    fn append_line<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let line = self.envelope.seal(&serde_json::to_vec(value)?)?;

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;
        if ends_torn(&mut file)? {
            tracing::warn!("Terminating torn last line of {}", path.display());
            file.write_all(b"\n")?;
        }
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_data()?;
        Ok(())
    }

    /// Reads every decodable line. A line that cannot be opened or parsed is
    /// logged and skipped. A file where no line opens at all was written
    /// under another key and is reported as [`Error::Integrity`].
    fn read_lines<T: DeserializeOwned>(&self, path: &Path) -> Result<Vec<T>> {
        let content = match fs::read_to_string(path) {
            Ok(s) => s,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
        let last = lines.len().saturating_sub(1);
        let torn_tail = !content.ends_with('\n');

        let mut out = Vec::with_capacity(lines.len());
        let mut opened = 0;
        let mut first_error = None;
        for (n, line) in lines.into_iter().enumerate() {
            let plaintext = match self.envelope.open(line) {
                Ok(p) => p,
                Err(e) if n == last && torn_tail => {
                    tracing::warn!("Skipping torn last line of {}: {e}", path.display());
                    continue;
                }
                Err(e) => {
                    tracing::warn!("Skipping undecodable line {} of {}: {e}", n + 1, path.display());
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                    continue;
                }
            };
            opened += 1;
            match serde_json::from_slice(&plaintext) {
                Ok(v) => out.push(v),
                Err(e) => tracing::warn!("Skipping unreadable line {} of {}: {e}", n + 1, path.display()),
            }
        }

        match first_error {
            Some(e) if opened == 0 => Err(Error::Integrity(format!(
                "no line of {} could be opened: {e}",
                path.display()
            ))),
            _ => Ok(out),
        }
    }

    pub fn append(&self, entry: &AuditLogEntry) -> Result<()> {
        let path = self.scope_path(entry.city.as_deref(), entry.institution.as_deref());
        self.append_line(&path, entry)
    }

    pub fn append_permission_change(&self, entry: &PermissionChangeEntry) -> Result<()> {
        self.append_line(&self.permission_log_path(), entry)
    }

    pub fn read_scope(&self, city: Option<&str>, institution: Option<&str>) -> Result<Vec<AuditLogEntry>> {
        self.read_lines(&self.scope_path(city, institution))
    }

    pub fn read_permission_changes(&self) -> Result<Vec<PermissionChangeEntry>> {
        self.read_lines(&self.permission_log_path())
    }

    /// Every entry across all per-institution logs, in no particular order.
    pub fn read_all(&self) -> Result<Vec<AuditLogEntry>> {
        let mut entries = Vec::new();
        let cities = match fs::read_dir(&self.dir) {
            Ok(it) => it,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(e.into()),
        };

        for city in cities {
            let city = city?;
            if !city.file_type()?.is_dir() {
                continue;
            }
            for file in fs::read_dir(city.path())? {
                let path = file?.path();
                if path.extension().and_then(|e| e.to_str()) == Some(LOG_EXT) {
                    entries.extend(self.read_lines::<AuditLogEntry>(&path)?);
                }
            }
        }
        Ok(entries)
    }
}

/// Whether the file is non-empty and its last byte is not a newline.
fn ends_torn(file: &mut fs::File) -> Result<bool> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(false);
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use tempfile::TempDir;
    use uuid::Uuid;

    use super::*;
    use crate::crypto::CacheKey;
    use crate::types::AuditAction;

    fn entry(city: Option<&str>, institution: Option<&str>) -> AuditLogEntry {
        AuditLogEntry {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            principal_id: "p1".into(),
            principal_name: "Ana".into(),
            action: AuditAction::Add,
            city: city.map(Into::into),
            institution: institution.map(Into::into),
            entity_name: Some("Employee".into()),
            entity_id: Some("r1".into()),
            detail: "added".into(),
            changes: Default::default(),
        }
    }

    #[test]
    fn test_append_and_read_by_scope() {
        let temp = TempDir::new().unwrap();
        let store = AuditStore::new(
            temp.path(),
            Envelope::encrypted(CacheKey::from_bytes([5; 32])),
        );

        store.append(&entry(Some("CityA"), Some("DeptX"))).unwrap();
        store.append(&entry(Some("CityA"), Some("DeptX"))).unwrap();
        store.append(&entry(Some("CityA"), Some("DeptY"))).unwrap();
        store.append(&entry(None, None)).unwrap();

        assert_eq!(store.read_scope(Some("CityA"), Some("DeptX")).unwrap().len(), 2);
        assert_eq!(store.read_scope(None, None).unwrap().len(), 1);
        assert_eq!(store.read_all().unwrap().len(), 4);

        let raw = fs::read_to_string(store.scope_path(Some("CityA"), Some("DeptX"))).unwrap();
        assert!(raw.lines().all(Envelope::is_encrypted));
    }

    #[test]
    fn test_torn_line_is_skipped() {
        let temp = TempDir::new().unwrap();
        let store = AuditStore::new(temp.path(), Envelope::plaintext());
        store.append(&entry(Some("CityA"), Some("DeptX"))).unwrap();

        let path = store.scope_path(Some("CityA"), Some("DeptX"));
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"id\": \"trunc").unwrap();

        assert_eq!(store.read_scope(Some("CityA"), Some("DeptX")).unwrap().len(), 1);
    }

    #[test]
    fn test_append_after_torn_line_keeps_history() {
        let temp = TempDir::new().unwrap();
        let store = AuditStore::new(
            temp.path(),
            Envelope::encrypted(CacheKey::from_bytes([5; 32])),
        );
        store.append(&entry(Some("CityA"), Some("DeptX"))).unwrap();

        let path = store.scope_path(Some("CityA"), Some("DeptX"));
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"RSENC1:AAAAAAAA").unwrap();
        drop(file);

        store.append(&entry(Some("CityA"), Some("DeptX"))).unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        assert_eq!(raw.lines().count(), 3);
        assert_eq!(store.read_scope(Some("CityA"), Some("DeptX")).unwrap().len(), 2);
    }

    #[test]
    fn test_garbage_line_in_the_middle_is_skipped() {
        let temp = TempDir::new().unwrap();
        let store = AuditStore::new(
            temp.path(),
            Envelope::encrypted(CacheKey::from_bytes([5; 32])),
        );
        store.append(&entry(Some("CityA"), Some("DeptX"))).unwrap();

        let path = store.scope_path(Some("CityA"), Some("DeptX"));
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"RSENC1:AAAA\n").unwrap();
        drop(file);
        store.append(&entry(Some("CityA"), Some("DeptX"))).unwrap();

        assert_eq!(store.read_scope(Some("CityA"), Some("DeptX")).unwrap().len(), 2);
    }

    #[test]
    fn test_log_under_another_key_is_an_integrity_error() {
        let temp = TempDir::new().unwrap();
        let writer = AuditStore::new(
            temp.path(),
            Envelope::encrypted(CacheKey::from_bytes([5; 32])),
        );
        writer.append(&entry(Some("CityA"), Some("DeptX"))).unwrap();
        writer.append(&entry(Some("CityA"), Some("DeptX"))).unwrap();

        let reader = AuditStore::new(
            temp.path(),
            Envelope::encrypted(CacheKey::from_bytes([6; 32])),
        );
        let err = reader.read_all().unwrap_err();
        assert!(err.requires_rebuild());
    }
}

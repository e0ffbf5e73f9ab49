//! Encrypted on-disk caches: one permission document holding every cached
//! principal, and one roster document per city/institution.

pub mod path;
mod permissions;
mod roster;

pub use permissions::{PermissionCache, PermissionsDocument};
pub use roster::{RosterCache, RosterDocument};

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::Path;

use uuid::Uuid;

use crate::crypto::Envelope;
use crate::error::{Error, Result};

/// Writes `contents` to a temp file next to `path` and renames it into place.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| Error::Config(format!("{} has no parent directory", path.display())))?;
    fs::create_dir_all(parent)?;

    let temp = parent.join(format!(".{}.tmp", Uuid::new_v4()));
    let result = (|| -> Result<()> {
        let mut file = fs::File::create(&temp)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
        fs::rename(&temp, path)?;
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&temp);
    }
    result
}

/// Reads and opens an enveloped JSON document. `Ok(None)` when absent.
pub(crate) fn read_document<T: serde::de::DeserializeOwned>(
    path: &Path,
    envelope: &Envelope,
) -> Result<Option<T>> {
    let payload = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let plaintext = envelope.open(&payload)?;
    serde_json::from_slice(&plaintext)
        .map(Some)
        .map_err(|e| Error::Integrity(format!("{} is not a valid document: {e}", path.display())))
}

pub(crate) fn write_document<T: serde::Serialize>(
    path: &Path,
    envelope: &Envelope,
    document: &T,
) -> Result<()> {
    let json = serde_json::to_vec(document)?;
    write_atomic(path, &envelope.seal(&json)?)
}

/// Moves an unreadable file aside so a rebuild can start from scratch.
pub(crate) fn quarantine(path: &Path) -> Result<()> {
    let target = path.with_extension("corrupt");
    match fs::rename(path, &target) {
        Ok(()) => {
            tracing::error!(
                "Moved unreadable cache {} to {}",
                path.display(),
                target.display()
            );
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

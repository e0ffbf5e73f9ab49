use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::{read_document, write_document};
use crate::crypto::Envelope;
use crate::error::Result;

/// Version and hash of the remote dataset the caches were last filled from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: i64,
    pub data_hash: String,
    #[serde(default)]
    pub last_download: Option<DateTime<Utc>>,
}

pub struct CheckpointStore {
    path: PathBuf,
    envelope: Envelope,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>, envelope: Envelope) -> Self {
        Self {
            path: path.into(),
            envelope,
        }
    }

    /// An unreadable checkpoint counts as none, which forces a download.
    #[must_use]
    pub fn load(&self) -> Checkpoint {
        match read_document(&self.path, &self.envelope) {
            Ok(Some(checkpoint)) => checkpoint,
            Ok(None) => Checkpoint::default(),
            Err(e) => {
                tracing::warn!("Ignoring unreadable sync checkpoint: {e}");
                Checkpoint::default()
            }
        }
    }

    pub fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        write_document(&self.path, &self.envelope, checkpoint)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_missing_or_corrupt_checkpoint_is_default() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("sync.json");
        let store = CheckpointStore::new(&path, Envelope::plaintext());
        assert_eq!(store.load(), Checkpoint::default());

        std::fs::write(&path, "{broken").unwrap();
        assert_eq!(store.load(), Checkpoint::default());

        let checkpoint = Checkpoint {
            version: 4,
            data_hash: "abc".into(),
            last_download: Some(Utc::now()),
        };
        store.save(&checkpoint).unwrap();
        assert_eq!(store.load(), checkpoint);
    }
}

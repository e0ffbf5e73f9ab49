use std::sync::Arc;

use async_trait::async_trait;

use super::{ChangeSource, SyncOrchestrator};
use crate::error::Result;
use crate::gateway::Table;
use crate::realtime::{ChangeEvent, ChangeHandler};

/// Bridges realtime notifications into the orchestrator: every event marks
/// the dataset pending, and roster events additionally re-pull the single
/// record so the cache catches up before the next full download.
pub struct SyncChangeHandler {
    sync: Arc<SyncOrchestrator>,
}

impl SyncChangeHandler {
    pub fn new(sync: Arc<SyncOrchestrator>) -> Self {
        Self { sync }
    }
}

#[async_trait]
impl ChangeHandler for SyncChangeHandler {
    async fn on_event(&self, event: &ChangeEvent) -> Result<()> {
        self.sync.mark_pending(ChangeSource::Realtime(event.table));

        if event.table != Table::Roster {
            return Ok(());
        }
        let Some(id) = event.record.get("id").and_then(|v| v.as_str()) else {
            tracing::debug!(operation = ?event.operation, "Roster event without id");
            return Ok(());
        };

        tracing::trace!(record = id, operation = ?event.operation, "Refreshing roster record");
        self.sync.refresh_record(id).await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use crate::audit::AuditLogger;
    use crate::cache::{PermissionCache, RosterCache};
    use crate::crypto::Envelope;
    use crate::gateway::memory::MemoryBackend;
    use crate::permission::PermissionEvaluator;
    use crate::realtime::Operation;
    use crate::sync::{CheckpointStore, SyncComponents, SyncEvent, SyncOptions};
    use crate::types::{Principal, RosterRecord};

    #[tokio::test]
    async fn test_events_mark_pending_and_refresh_roster() {
        let temp = TempDir::new().unwrap();
        let backend = Arc::new(MemoryBackend::new());
        let mut root = Principal::new("root", "Root");
        root.is_superuser = true;
        backend.seed(Table::Principals, vec![serde_json::to_value(&root).unwrap()]);

        let envelope = Envelope::plaintext();
        let permissions =
            Arc::new(PermissionCache::open(temp.path().join("p.json"), envelope.clone()).unwrap());
        let roster = Arc::new(RosterCache::open(temp.path().join("roster"), envelope.clone()).unwrap());
        let audit =
            Arc::new(AuditLogger::open(temp.path().join("audit"), envelope.clone(), backend.clone(), 5).unwrap());
        let sync = Arc::new(SyncOrchestrator::new(
            "root",
            SyncComponents {
                backend: backend.clone(),
                permissions,
                roster: roster.clone(),
                audit,
                evaluator: PermissionEvaluator::new(true),
            },
            SyncOptions::default(),
            CheckpointStore::new(temp.path().join("sync.json"), envelope),
        ));
        sync.full_download().await.unwrap();
        let mut events = sync.subscribe();

        let record = RosterRecord::new("r1", "CityA", "DeptX", "Ana");
        backend.seed(Table::Roster, vec![serde_json::to_value(&record).unwrap()]);

        let handler = SyncChangeHandler::new(sync.clone());
        handler
            .on_event(&ChangeEvent::new(Table::Roster, Operation::Insert, json!({"id": "r1"})))
            .await
            .unwrap();

        assert!(sync.is_pending());
        assert!(roster.get("r1").is_some());
        assert!(matches!(
            events.recv().await.unwrap(),
            SyncEvent::ChangeDetected(ChangeSource::Realtime(Table::Roster))
        ));

        handler
            .on_event(&ChangeEvent::new(Table::Permissions, Operation::Update, json!({})))
            .await
            .unwrap();
        assert!(sync.is_pending());
    }
}

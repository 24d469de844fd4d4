use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::db::{Checkpoint, CheckpointKey, CheckpointStore, DatabaseError};
use crate::snowflake::Snowflake;
use crate::utils::SyncError;

/// Persists sync progress per community and per channel.
#[derive(Clone)]
pub struct CheckpointTracker {
    store: Arc<dyn CheckpointStore>,
}

impl CheckpointTracker {
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self { store }
    }

    pub async fn get(&self, key: &CheckpointKey) -> Result<Option<Checkpoint>, SyncError> {
        Ok(self.store.get_checkpoint(key).await?)
    }

    pub async fn get_or_create(&self, key: CheckpointKey) -> Result<Checkpoint, SyncError> {
        if let Some(checkpoint) = self.store.get_checkpoint(&key).await? {
            return Ok(checkpoint);
        }
        let checkpoint = Checkpoint::new(key);
        match self.store.insert_checkpoint(&checkpoint).await {
            Ok(()) => Ok(checkpoint),
            Err(DatabaseError::Duplicate(_)) => self
                .store
                .get_checkpoint(&key)
                .await?
                .ok_or_else(|| SyncError::not_found("checkpoint", key)),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn start_sync(&self, key: CheckpointKey) -> Result<Checkpoint, SyncError> {
        self.modify(key, |checkpoint| {
            checkpoint.start();
            Ok(())
        })
        .await
    }

    /// Marks the sync done. The cursor only ever advances.
    pub async fn complete_sync(
        &self,
        key: CheckpointKey,
        cursor: Option<Snowflake>,
    ) -> Result<Checkpoint, SyncError> {
        let checkpoint = self
            .modify(key, |checkpoint| {
                checkpoint.complete(cursor);
                Ok(())
            })
            .await?;
        debug!("completed {} at cursor {:?}", key, checkpoint.cursor);
        Ok(checkpoint)
    }

    pub async fn fail_sync(&self, key: CheckpointKey, error: &str) -> Result<Checkpoint, SyncError> {
        warn!("sync of {} failed: {}", key, error);
        self.modify(key, |checkpoint| {
            checkpoint.fail(error.to_string());
            Ok(())
        })
        .await
    }

    pub async fn pause(&self, key: CheckpointKey) -> Result<Checkpoint, SyncError> {
        info!("pausing sync of {}", key);
        self.modify(key, |checkpoint| {
            checkpoint.pause();
            Ok(())
        })
        .await
    }

    pub async fn resume(&self, key: CheckpointKey) -> Result<Checkpoint, SyncError> {
        info!("resuming sync of {}", key);
        self.modify(key, Checkpoint::resume).await
    }

    pub async fn list(&self) -> Result<Vec<Checkpoint>, SyncError> {
        Ok(self.store.list_checkpoints().await?)
    }

    async fn modify<F>(&self, key: CheckpointKey, change: F) -> Result<Checkpoint, SyncError>
    where
        F: FnOnce(&mut Checkpoint) -> Result<(), SyncError>,
    {
        let mut checkpoint = self.get_or_create(key).await?;
        change(&mut checkpoint)?;
        self.store.update_checkpoint(&checkpoint).await?;
        Ok(checkpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::CheckpointStatus;
    use crate::test_support::{TestDb, sf};

    #[tokio::test]
    async fn cursor_survives_restart_and_never_regresses() {
        let db = TestDb::new().await;
        let key = CheckpointKey::channel(sf(10));
        {
            let tracker = CheckpointTracker::new(db.manager.checkpoint_store());
            tracker.start_sync(key).await.unwrap();
            tracker.complete_sync(key, Some(sf(500))).await.unwrap();
        }

        let tracker = CheckpointTracker::new(db.manager.checkpoint_store());
        let restored = tracker.get(&key).await.unwrap().unwrap();
        assert_eq!(restored.cursor, Some(sf(500)));
        assert_eq!(restored.status, CheckpointStatus::Completed);

        let after = tracker.complete_sync(key, Some(sf(300))).await.unwrap();
        assert_eq!(after.cursor, Some(sf(500)));
        let after = tracker.complete_sync(key, None).await.unwrap();
        assert_eq!(after.cursor, Some(sf(500)));
    }

    #[tokio::test]
    async fn failure_keeps_cursor_and_records_error() {
        let db = TestDb::new().await;
        let tracker = CheckpointTracker::new(db.manager.checkpoint_store());
        let key = CheckpointKey::channel(sf(10));
        tracker.complete_sync(key, Some(sf(42))).await.unwrap();
        tracker.start_sync(key).await.unwrap();
        let failed = tracker.fail_sync(key, "access denied").await.unwrap();
        assert_eq!(failed.status, CheckpointStatus::Failed);
        assert_eq!(failed.cursor, Some(sf(42)));
        assert_eq!(failed.error.as_deref(), Some("access denied"));
    }

    #[tokio::test]
    async fn resume_requires_pause() {
        let db = TestDb::new().await;
        let tracker = CheckpointTracker::new(db.manager.checkpoint_store());
        let key = CheckpointKey::community(sf(1));
        assert!(matches!(tracker.resume(key).await, Err(SyncError::Validation(_))));
        tracker.pause(key).await.unwrap();
        let resumed = tracker.resume(key).await.unwrap();
        assert_eq!(resumed.status, CheckpointStatus::InProgress);
        assert_eq!(tracker.list().await.unwrap().len(), 1);
    }
}

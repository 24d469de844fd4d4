use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use super::create_or_replace;
use crate::db::{Attachment, AttachmentStatus, AttachmentStore};
use crate::snowflake::Snowflake;
use crate::upstream::AttachmentDto;
use crate::utils::SyncError;

pub struct AttachmentService {
    store: Arc<dyn AttachmentStore>,
}

impl AttachmentService {
    pub fn new(store: Arc<dyn AttachmentStore>) -> Self {
        Self { store }
    }

    /// Makes the stored attachment set of a message equal to `incoming`.
    ///
    /// Upstream metadata is overwritten; download tracking of surviving
    /// attachments is left alone. Records that vanished upstream are deleted,
    /// their files become orphans for the reconciler.
    pub async fn replace_for_message(
        &self,
        message_id: Snowflake,
        incoming: &[AttachmentDto],
    ) -> Result<Vec<Attachment>, SyncError> {
        let existing = self.store.list_attachments_by_message(message_id).await?;
        let keep: HashSet<Snowflake> = incoming.iter().map(|dto| dto.id).collect();

        for stale in existing.iter().filter(|a| !keep.contains(&a.id)) {
            self.store.delete_attachment(stale.id).await?;
            info!(
                "removed attachment {} no longer present on message {}",
                stale.id, message_id
            );
        }

        let mut current = Vec::with_capacity(incoming.len());
        for dto in incoming {
            match existing.iter().find(|a| a.id == dto.id) {
                Some(found) => {
                    let mut attachment = found.clone();
                    apply(&mut attachment, dto);
                    attachment.message_id = message_id;
                    self.store.update_attachment_metadata(&attachment).await?;
                    current.push(attachment);
                }
                None => {
                    let mut attachment =
                        Attachment::new(dto.id, message_id, dto.filename.clone(), dto.url.clone());
                    apply(&mut attachment, dto);
                    create_or_replace(self.store.insert_attachment(&attachment), || {
                        self.store.update_attachment_metadata(&attachment)
                    })
                    .await?;
                    debug!("tracking attachment {} ({})", attachment.id, attachment.filename);
                    current.push(attachment);
                }
            }
        }
        Ok(current)
    }

    pub async fn get(&self, id: Snowflake) -> Result<Option<Attachment>, SyncError> {
        Ok(self.store.get_attachment(id).await?)
    }

    pub async fn list(&self, message_id: Snowflake) -> Result<Vec<Attachment>, SyncError> {
        Ok(self.store.list_attachments_by_message(message_id).await?)
    }

    pub async fn status_counts(&self) -> Result<Vec<(AttachmentStatus, i64)>, SyncError> {
        Ok(self.store.count_by_status().await?)
    }

    /// Failed and skipped attachments, oldest first.
    pub async fn problems(&self, limit: i64) -> Result<Vec<Attachment>, SyncError> {
        Ok(self
            .store
            .list_by_status(&[AttachmentStatus::Failed, AttachmentStatus::Skipped], limit)
            .await?)
    }
}

fn apply(attachment: &mut Attachment, dto: &AttachmentDto) {
    attachment.filename = dto.filename.clone();
    attachment.url = dto.url.clone();
    attachment.proxy_url = dto.proxy_url.clone();
    attachment.size = dto.size;
    attachment.width = dto.width;
    attachment.height = dto.height;
    attachment.content_type = dto.content_type.clone();
    attachment.updated_at = Utc::now();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{ReferenceMode, Services};
    use crate::test_support::{TestDb, attachment_dto, message_dto, seed_channel, sf};

    #[tokio::test]
    async fn replacing_keeps_tracking_and_drops_missing() {
        let db = TestDb::new().await;
        seed_channel(&db, 1, 10).await;
        let services = Services::new(&db.manager);
        let mut dto = message_dto(100, 10, 5);
        dto.attachments = vec![attachment_dto(7, 10), attachment_dto(8, 20)];
        services.messages.upsert(&dto, ReferenceMode::Deferred).await.unwrap();

        let mut cached = services.attachments.get(sf(7)).await.unwrap().unwrap();
        cached.mark_cached("1/10/100/file-7.png".to_string(), "ab".to_string());
        db.manager.attachment_store().update_attachment_tracking(&cached).await.unwrap();

        let mut renamed = attachment_dto(7, 10);
        renamed.filename = "renamed.png".to_string();
        let current = services
            .attachments
            .replace_for_message(sf(100), &[renamed])
            .await
            .unwrap();

        assert_eq!(current.len(), 1);
        let stored = services.attachments.get(sf(7)).await.unwrap().unwrap();
        assert_eq!(stored.filename, "renamed.png");
        assert_eq!(stored.status, AttachmentStatus::Completed);
        assert!(stored.cached);
        assert!(services.attachments.get(sf(8)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn metadata_write_from_older_copy_keeps_finished_download() {
        let db = TestDb::new().await;
        seed_channel(&db, 1, 10).await;
        let services = Services::new(&db.manager);
        let mut dto = message_dto(100, 10, 5);
        dto.attachments = vec![attachment_dto(7, 10)];
        services.messages.upsert(&dto, ReferenceMode::Deferred).await.unwrap();

        let store = db.manager.attachment_store();
        let mut older = store.get_attachment(sf(7)).await.unwrap().unwrap();
        let mut finished = older.clone();
        finished.mark_cached("1/10/100/file-7.png".to_string(), "ab".to_string());
        store.update_attachment_tracking(&finished).await.unwrap();

        older.filename = "renamed.png".to_string();
        store.update_attachment_metadata(&older).await.unwrap();

        let stored = store.get_attachment(sf(7)).await.unwrap().unwrap();
        assert_eq!(stored.filename, "renamed.png");
        assert_eq!(stored.status, AttachmentStatus::Completed);
        assert_eq!(stored.local_path.as_deref(), Some("1/10/100/file-7.png"));
        assert_eq!(stored.content_hash.as_deref(), Some("ab"));
    }

    #[tokio::test]
    async fn problems_lists_failed_and_skipped_only() {
        let db = TestDb::new().await;
        seed_channel(&db, 1, 10).await;
        let services = Services::new(&db.manager);
        let mut dto = message_dto(100, 10, 5);
        dto.attachments = vec![attachment_dto(7, 10), attachment_dto(8, 10), attachment_dto(9, 10)];
        services.messages.upsert(&dto, ReferenceMode::Deferred).await.unwrap();

        let store = db.manager.attachment_store();
        let mut failed = store.get_attachment(sf(7)).await.unwrap().unwrap();
        failed.mark_failed("status 404".to_string(), false);
        store.update_attachment_tracking(&failed).await.unwrap();
        let mut skipped = store.get_attachment(sf(8)).await.unwrap().unwrap();
        skipped.mark_skipped("too large".to_string());
        store.update_attachment_tracking(&skipped).await.unwrap();

        let mut ids: Vec<Snowflake> = services
            .attachments
            .problems(10)
            .await
            .unwrap()
            .iter()
            .map(|a| a.id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec![sf(7), sf(8)]);
        assert_eq!(services.attachments.problems(1).await.unwrap().len(), 1);
    }
}

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use super::create_or_replace;
use crate::db::{Community, CommunityStore};
use crate::snowflake::Snowflake;
use crate::upstream::CommunityDto;
use crate::utils::SyncError;

pub struct CommunityService {
    store: Arc<dyn CommunityStore>,
}

impl CommunityService {
    pub fn new(store: Arc<dyn CommunityStore>) -> Self {
        Self { store }
    }

    pub async fn upsert(&self, dto: &CommunityDto) -> Result<Community, SyncError> {
        if let Some(mut community) = self.store.get_community(dto.id).await? {
            apply(&mut community, dto);
            self.store.update_community(&community).await?;
            debug!("updated community {} ({})", community.id, community.name);
            return Ok(community);
        }

        let mut community = Community {
            id: dto.id,
            name: String::new(),
            owner_id: None,
            icon: None,
            description: None,
            created_at: dto.id.created_at(),
            last_synced_at: None,
        };
        apply(&mut community, dto);
        create_or_replace(self.store.insert_community(&community), || {
            self.store.update_community(&community)
        })
        .await?;
        info!("created community {} ({})", community.id, community.name);
        Ok(community)
    }

    pub async fn get(&self, id: Snowflake) -> Result<Option<Community>, SyncError> {
        Ok(self.store.get_community(id).await?)
    }

    pub async fn mark_synced(&self, id: Snowflake) -> Result<(), SyncError> {
        let mut community = self
            .store
            .get_community(id)
            .await?
            .ok_or_else(|| SyncError::not_found("community", id))?;
        community.last_synced_at = Some(Utc::now());
        self.store.update_community(&community).await?;
        Ok(())
    }
}

// Full replacement: every upstream-observed attribute is overwritten.
fn apply(community: &mut Community, dto: &CommunityDto) {
    community.name = dto.name.clone();
    community.owner_id = dto.owner_id;
    community.icon = dto.icon.clone();
    community.description = dto.description.clone();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{TestDb, community_dto};

    #[tokio::test]
    async fn upsert_creates_then_replaces_fields() {
        let db = TestDb::new().await;
        let service = CommunityService::new(db.manager.community_store());

        let mut dto = community_dto(1);
        dto.description = Some("first".to_string());
        let created = service.upsert(&dto).await.unwrap();
        assert_eq!(created.description.as_deref(), Some("first"));

        dto.name = "renamed".to_string();
        dto.description = None;
        service.upsert(&dto).await.unwrap();

        let stored = service.get(Snowflake::new(1)).await.unwrap().unwrap();
        assert_eq!(stored.name, "renamed");
        assert_eq!(stored.description, None);
        assert_eq!(stored.created_at, created.created_at);
    }

    #[tokio::test]
    async fn mark_synced_requires_existing_community() {
        let db = TestDb::new().await;
        let service = CommunityService::new(db.manager.community_store());
        assert!(matches!(
            service.mark_synced(Snowflake::new(9)).await,
            Err(SyncError::NotFound { .. })
        ));
        service.upsert(&community_dto(9)).await.unwrap();
        service.mark_synced(Snowflake::new(9)).await.unwrap();
        let stored = service.get(Snowflake::new(9)).await.unwrap().unwrap();
        assert!(stored.last_synced_at.is_some());
    }
}

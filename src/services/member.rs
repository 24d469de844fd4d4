use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use super::create_or_replace;
use crate::db::{CommunityStore, Member, MemberKey, MemberStore, User, UserStore};
use crate::snowflake::Snowflake;
use crate::upstream::{MemberDto, UserDto};
use crate::utils::SyncError;

pub struct UserService {
    store: Arc<dyn UserStore>,
}

impl UserService {
    pub fn new(store: Arc<dyn UserStore>) -> Self {
        Self { store }
    }

    /// Users are created on first sight and refreshed on every later one.
    pub async fn upsert(&self, dto: &UserDto) -> Result<User, SyncError> {
        let created_at = match self.store.get_user(dto.id).await? {
            Some(existing) => Some(existing.created_at),
            None => None,
        };
        let user = User {
            id: dto.id,
            username: dto.username.clone(),
            display_name: dto.global_name.clone(),
            avatar: dto.avatar.clone(),
            bot: dto.bot,
            created_at: created_at.unwrap_or_else(|| dto.id.created_at()),
            last_seen_at: Some(Utc::now()),
        };

        if created_at.is_some() {
            self.store.update_user(&user).await?;
        } else {
            create_or_replace(self.store.insert_user(&user), || {
                self.store.update_user(&user)
            })
            .await?;
            debug!("created user {} ({})", user.id, user.username);
        }
        Ok(user)
    }

    pub async fn get(&self, id: Snowflake) -> Result<Option<User>, SyncError> {
        Ok(self.store.get_user(id).await?)
    }
}

pub struct MemberService {
    members: Arc<dyn MemberStore>,
    communities: Arc<dyn CommunityStore>,
    users: Arc<UserService>,
}

impl MemberService {
    pub fn new(
        members: Arc<dyn MemberStore>,
        communities: Arc<dyn CommunityStore>,
        users: Arc<UserService>,
    ) -> Self {
        Self {
            members,
            communities,
            users,
        }
    }

    pub async fn upsert(
        &self,
        community_id: Snowflake,
        dto: &MemberDto,
    ) -> Result<Member, SyncError> {
        if self.communities.get_community(community_id).await?.is_none() {
            return Err(SyncError::not_found("community", community_id));
        }
        self.users.upsert(&dto.user).await?;

        let member = Member {
            user_id: dto.user.id,
            community_id,
            nickname: dto.nick.clone(),
            joined_at: dto.joined_at,
            role_ids: dto.roles.clone(),
            pending: dto.pending,
            last_synced_at: Utc::now(),
        };

        if self.members.get_member(&member.key()).await?.is_some() {
            self.members.update_member(&member).await?;
        } else {
            create_or_replace(self.members.insert_member(&member), || {
                self.members.update_member(&member)
            })
            .await?;
        }
        Ok(member)
    }

    pub async fn get(&self, key: &MemberKey) -> Result<Option<Member>, SyncError> {
        Ok(self.members.get_member(key).await?)
    }

    pub async fn list(&self, community_id: Snowflake) -> Result<Vec<Member>, SyncError> {
        Ok(self.members.list_members_by_community(community_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::Services;
    use crate::test_support::{TestDb, community_dto, member_dto, sf, user_dto};

    #[tokio::test]
    async fn user_upsert_refreshes_and_keeps_creation_time() {
        let db = TestDb::new().await;
        let users = UserService::new(db.manager.user_store());

        let mut dto = user_dto(7);
        dto.global_name = Some("Seven".to_string());
        let first = users.upsert(&dto).await.unwrap();
        dto.global_name = None;
        let second = users.upsert(&dto).await.unwrap();

        assert_eq!(first.created_at, second.created_at);
        let stored = users.get(sf(7)).await.unwrap().unwrap();
        assert_eq!(stored.display_name, None);
        assert!(stored.last_seen_at.is_some());
    }

    #[tokio::test]
    async fn member_upsert_creates_user_and_replaces_roles() {
        let db = TestDb::new().await;
        let services = Services::new(&db.manager);
        services.communities.upsert(&community_dto(1)).await.unwrap();

        let mut dto = member_dto(7);
        dto.roles = vec![sf(100), sf(101)];
        dto.nick = Some("nick".to_string());
        services.members.upsert(sf(1), &dto).await.unwrap();
        dto.roles = vec![sf(101)];
        dto.nick = None;
        services.members.upsert(sf(1), &dto).await.unwrap();

        assert!(services.users.get(sf(7)).await.unwrap().is_some());
        let key = MemberKey {
            user_id: sf(7),
            community_id: sf(1),
        };
        let stored = services.members.get(&key).await.unwrap().unwrap();
        assert_eq!(stored.role_ids, vec![sf(101)]);
        assert_eq!(stored.nickname, None);
        assert_eq!(services.members.list(sf(1)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn member_of_unknown_community_is_rejected_before_user_write() {
        let db = TestDb::new().await;
        let services = Services::new(&db.manager);
        let err = services.members.upsert(sf(1), &member_dto(7)).await.unwrap_err();
        assert!(matches!(err, SyncError::NotFound { .. }));
        assert!(services.users.get(sf(7)).await.unwrap().is_none());
    }
}

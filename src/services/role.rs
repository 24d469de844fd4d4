use std::sync::Arc;

use tracing::debug;

use super::create_or_replace;
use crate::db::{CommunityStore, Role, RoleStore};
use crate::snowflake::Snowflake;
use crate::upstream::RoleDto;
use crate::utils::SyncError;

pub struct RoleService {
    roles: Arc<dyn RoleStore>,
    communities: Arc<dyn CommunityStore>,
}

impl RoleService {
    pub fn new(roles: Arc<dyn RoleStore>, communities: Arc<dyn CommunityStore>) -> Self {
        Self { roles, communities }
    }

    pub async fn upsert(&self, community_id: Snowflake, dto: &RoleDto) -> Result<Role, SyncError> {
        let permissions = normalize_permissions(&dto.permissions)?;
        if self.communities.get_community(community_id).await?.is_none() {
            return Err(SyncError::not_found("community", community_id));
        }

        let role = Role {
            id: dto.id,
            community_id,
            name: dto.name.clone(),
            color: dto.color,
            position: dto.position,
            permissions,
            hoisted: dto.hoist,
            mentionable: dto.mentionable,
            managed: dto.managed,
        };

        if self.roles.get_role(dto.id).await?.is_some() {
            self.roles.update_role(&role).await?;
        } else {
            create_or_replace(self.roles.insert_role(&role), || {
                self.roles.update_role(&role)
            })
            .await?;
        }
        debug!("stored role {} ({}) for community {}", role.id, role.name, community_id);
        Ok(role)
    }

    pub async fn list(&self, community_id: Snowflake) -> Result<Vec<Role>, SyncError> {
        Ok(self.roles.list_roles_by_community(community_id).await?)
    }
}

/// The bitset exceeds 64 bits, so it stays a decimal string. Empty means none.
fn normalize_permissions(raw: &str) -> Result<String, SyncError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok("0".to_string());
    }
    if !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return Err(SyncError::Validation(format!(
            "permissions must be a decimal string, got {raw:?}"
        )));
    }
    Ok(trimmed.to_string())
}

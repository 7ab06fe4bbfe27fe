// db/userdb.rs
use async_trait::async_trait;
use uuid::Uuid;

use super::db::DBClient;
use super::StoreError;
use crate::models::usermodel::UserProfile;
use crate::models::TenantScope;

/// Identity collaborator: user records by id, for self-referral checks and
/// notification targeting.
#[async_trait]
pub trait UserDirectoryExt {
    async fn get_user_profile(
        &self,
        scope: TenantScope,
        user_id: Uuid,
    ) -> Result<Option<UserProfile>, StoreError>;
}

#[async_trait]
impl UserDirectoryExt for DBClient {
    async fn get_user_profile(
        &self,
        scope: TenantScope,
        user_id: Uuid,
    ) -> Result<Option<UserProfile>, StoreError> {
        let profile = sqlx::query_as::<_, UserProfile>(
            r#"
            SELECT id, name, email, phone
            FROM users
            WHERE tenant_id = $1 AND location_id = $2 AND id = $3
            "#,
        )
        .bind(scope.tenant_id)
        .bind(scope.location_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(profile)
    }
}

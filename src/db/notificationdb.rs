// db/notificationdb.rs
use async_trait::async_trait;
use uuid::Uuid;

use super::db::DBClient;
use super::StoreError;
use crate::models::TenantScope;

#[async_trait]
pub trait NotificationExt {
    async fn store_notification(
        &self,
        scope: TenantScope,
        user_id: Uuid,
        kind: &str,
        reference_id: Option<Uuid>,
        message: &str,
    ) -> Result<(), StoreError>;
}

#[async_trait]
impl NotificationExt for DBClient {
    async fn store_notification(
        &self,
        scope: TenantScope,
        user_id: Uuid,
        kind: &str,
        reference_id: Option<Uuid>,
        message: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO notifications (tenant_id, location_id, user_id, kind, reference_id, message)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(scope.tenant_id)
        .bind(scope.location_id)
        .bind(user_id)
        .bind(kind)
        .bind(reference_id)
        .bind(message)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

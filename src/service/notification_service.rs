// service/notification_service.rs
use std::sync::Arc;

use uuid::Uuid;

use super::error::ServiceError;
use crate::db::ReferralStore;
use crate::models::TenantScope;

/// Fire-and-forget messaging to reward recipients. Delivery itself (email,
/// push) belongs to the surrounding platform; this records the notification
/// and logs it. Callers never let a notification failure roll back a reward.
#[derive(Debug)]
pub struct NotificationService<S> {
    store: Arc<S>,
}

impl<S> Clone for NotificationService<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: ReferralStore> NotificationService<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub async fn notify_reward_unlocked(
        &self,
        scope: TenantScope,
        user_id: Uuid,
        attribution_id: Uuid,
        message: &str,
    ) -> Result<(), ServiceError> {
        tracing::info!(
            user = %user_id,
            attribution = %attribution_id,
            "reward unlocked notification: {}",
            message
        );

        self.store
            .store_notification(scope, user_id, "referral_reward", Some(attribution_id), message)
            .await
            .map_err(|err| ServiceError::Notification(err.to_string()))
    }
}

// service/code_registry.rs
use std::sync::Arc;

use rand::{distr::Alphanumeric, Rng};
use uuid::Uuid;

use super::error::ServiceError;
use crate::db::{ReferralStore, StoreError};
use crate::models::referralmodel::ReferralCode;
use crate::models::usermodel::UserProfile;
use crate::models::TenantScope;

const CODE_LENGTH: usize = 8;
const MAX_GENERATION_ATTEMPTS: usize = 5;

pub fn generate_referral_code() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(CODE_LENGTH)
        .map(char::from)
        .collect::<String>()
        .to_uppercase()
}

pub fn generate_referral_link(base_url: &str, code: &str) -> String {
    format!("{}/book?ref={}", base_url, code)
}

/// Normalization applied to both issued and incoming code strings.
pub fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

#[derive(Debug)]
pub struct CodeRegistry<S> {
    store: Arc<S>,
    base_url: String,
}

// Manual impl: the derive would demand S: Clone, but the store is shared.
impl<S> Clone for CodeRegistry<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            base_url: self.base_url.clone(),
        }
    }
}

impl<S: ReferralStore> CodeRegistry<S> {
    pub fn new(store: Arc<S>, base_url: String) -> Self {
        Self { store, base_url }
    }

    /// Returns the referrer's code, creating it on first use. Generation
    /// retries a handful of times on token collision; running out of retries
    /// is an internal fault worth alerting on, not a user problem.
    pub async fn get_or_create(
        &self,
        scope: TenantScope,
        referrer_user_id: Uuid,
    ) -> Result<ReferralCode, ServiceError> {
        if let Some(existing) = self.store.get_code_for_owner(scope, referrer_user_id).await? {
            return Ok(existing);
        }

        for _ in 0..MAX_GENERATION_ATTEMPTS {
            let token = generate_referral_code();
            match self.store.insert_code(scope, referrer_user_id, &token).await {
                Ok(code) => return Ok(code),
                Err(StoreError::Conflict(_)) => {
                    tracing::warn!(
                        referrer = %referrer_user_id,
                        "referral code collision, regenerating"
                    );
                    continue;
                }
                Err(err) => return Err(err.into()),
            }
        }

        tracing::error!(
            referrer = %referrer_user_id,
            "exhausted referral code generation attempts"
        );
        Err(ServiceError::ExhaustedRetries)
    }

    /// Resolves a shared code to its row and the referrer's profile. Inactive
    /// and unknown codes are indistinguishable to the caller.
    pub async fn resolve(
        &self,
        scope: TenantScope,
        code: &str,
    ) -> Result<(ReferralCode, UserProfile), ServiceError> {
        let token = normalize_code(code);
        let code = self
            .store
            .get_code_by_token(scope, &token)
            .await?
            .filter(|c| c.is_active)
            .ok_or_else(|| ServiceError::NotFound(format!("referral code {}", token)))?;

        let referrer = self
            .store
            .get_user_profile(scope, code.owner_user_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound("referrer".to_string()))?;

        Ok((code, referrer))
    }

    pub fn referral_link(&self, code: &ReferralCode) -> String {
        generate_referral_link(&self.base_url, &code.code)
    }
}

// service/error.rs
use thiserror::Error;
use uuid::Uuid;

use crate::db::StoreError;

/// User-facing and internal failures of the referral services. Policy
/// terminations at completion time (service not allowed, monthly cap,
/// not a new customer) are NOT here: those are normal VOIDED transitions
/// reported through `CompletionOutcome`.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("The referral program is not enabled for this location")]
    ProgramDisabled,

    #[error("You cannot refer yourself")]
    SelfReferral,

    #[error("An open referral already exists for this contact")]
    DuplicateReferral,

    #[error("Not eligible: {0}")]
    NotEligible(String),

    #[error("This referral has expired")]
    Expired,

    #[error("{0} not found")]
    NotFound(String),

    #[error("Coupon {0} is no longer active")]
    CouponInactive(Uuid),

    #[error("Coupon {0} belongs to another customer")]
    CouponNotOwned(Uuid),

    #[error("Coupon {0} is not valid yet")]
    CouponNotStarted(Uuid),

    #[error("Coupon {0} has expired")]
    CouponExpired(Uuid),

    #[error("Coupon {0} has no remaining uses")]
    CouponExhausted(Uuid),

    #[error("Coupon {0} does not apply to this service")]
    CouponServiceMismatch(Uuid),

    #[error("A free-service reward requires a service id")]
    MissingService,

    #[error("Exhausted referral code generation retries")]
    ExhaustedRetries,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Notification error: {0}")]
    Notification(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ServiceError {
    /// Whether the failure should be surfaced to the end user as their own
    /// mistake (vs. alerting/5xx).
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            ServiceError::ProgramDisabled
                | ServiceError::SelfReferral
                | ServiceError::DuplicateReferral
                | ServiceError::NotEligible(_)
                | ServiceError::Expired
                | ServiceError::NotFound(_)
                | ServiceError::CouponInactive(_)
                | ServiceError::CouponNotOwned(_)
                | ServiceError::CouponNotStarted(_)
                | ServiceError::CouponExpired(_)
                | ServiceError::CouponExhausted(_)
                | ServiceError::CouponServiceMismatch(_)
                | ServiceError::Validation(_)
        )
    }
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(errors: validator::ValidationErrors) -> Self {
        ServiceError::Validation(errors.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_failures_are_user_errors_and_store_failures_are_not() {
        assert!(ServiceError::SelfReferral.is_user_error());
        assert!(ServiceError::Expired.is_user_error());
        assert!(ServiceError::NotEligible("already a customer".to_string()).is_user_error());

        assert!(!ServiceError::ExhaustedRetries.is_user_error());
        assert!(!ServiceError::Store(StoreError::NotFound("wallet")).is_user_error());
    }
}

// service/reward_ledger.rs
use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::error::ServiceError;
use crate::db::{ReferralStore, StoreError};
use crate::models::rewardmodels::*;
use crate::models::TenantScope;

/// A reward the ledger actually issued; `None` from `issue_reward` means the
/// configured value made it a no-op.
#[derive(Debug, Clone)]
pub enum IssuedReward {
    Credit(RewardTransaction),
    Coupon(Coupon, RewardTransaction),
}

/// Owns every wallet-balance and coupon `used_count` mutation. Other
/// components go through this service; nothing else touches those columns.
#[derive(Debug)]
pub struct RewardLedger<S> {
    store: Arc<S>,
}

impl<S> Clone for RewardLedger<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: ReferralStore> RewardLedger<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub async fn ensure_wallet(
        &self,
        scope: TenantScope,
        user_id: Uuid,
    ) -> Result<Wallet, ServiceError> {
        Ok(self.store.ensure_wallet(scope, user_id).await?)
    }

    /// Reserves wallet funds for an appointment with a PENDING HOLD row.
    /// Balance does not move until the hold is confirmed. Non-positive
    /// amounts are a no-op.
    pub async fn reserve_hold(
        &self,
        scope: TenantScope,
        user_id: Uuid,
        appointment_id: Uuid,
        amount: i64,
        description: &str,
    ) -> Result<Option<RewardTransaction>, ServiceError> {
        if amount <= 0 {
            return Ok(None);
        }
        self.store.ensure_wallet(scope, user_id).await?;
        let hold = self
            .store
            .insert_hold(scope, user_id, appointment_id, amount, description)
            .await?;
        Ok(Some(hold))
    }

    /// Settles every pending hold for the appointment: the wallet is debited
    /// and a DEBIT row written per hold. Safe to retry; a second run finds no
    /// pending holds. Returns the total debited.
    pub async fn confirm_hold(
        &self,
        scope: TenantScope,
        appointment_id: Uuid,
    ) -> Result<i64, ServiceError> {
        Ok(self.store.confirm_holds(scope, appointment_id).await?)
    }

    /// Cancels every pending hold for the appointment without touching the
    /// balance. Returns the number of holds released.
    pub async fn release_hold(
        &self,
        scope: TenantScope,
        appointment_id: Uuid,
    ) -> Result<i64, ServiceError> {
        Ok(self.store.release_holds(scope, appointment_id).await?)
    }

    /// Lowers a `RewardKind` to its ledger shape. Coupons are single-use and
    /// owned by the recipient.
    pub fn prepare_reward(
        kind: &RewardKind,
        owner_user_id: Option<Uuid>,
    ) -> Result<PreparedReward, ServiceError> {
        match kind {
            RewardKind::WalletCredit { amount } => Ok(PreparedReward::Credit { amount: *amount }),
            RewardKind::PercentDiscount { percent } => Ok(PreparedReward::Coupon(NewCoupon {
                owner_user_id,
                discount_type: DiscountType::Percent,
                discount_value: Some(*percent),
                service_id: None,
                max_uses: 1,
                valid_from: None,
                valid_to: None,
            })),
            RewardKind::FixedDiscount { amount } => Ok(PreparedReward::Coupon(NewCoupon {
                owner_user_id,
                discount_type: DiscountType::Fixed,
                discount_value: Some(*amount),
                service_id: None,
                max_uses: 1,
                valid_from: None,
                valid_to: None,
            })),
            RewardKind::FreeService { service_id } => Ok(PreparedReward::Coupon(NewCoupon {
                owner_user_id,
                discount_type: DiscountType::FreeService,
                discount_value: None,
                service_id: Some(*service_id),
                max_uses: 1,
                valid_from: None,
                valid_to: None,
            })),
        }
    }

    /// Issues one reward outside the completion path (admin adjustments,
    /// campaigns). The completion path batches its issuance atomically via
    /// `apply_completion_rewards` instead.
    pub async fn issue_reward(
        &self,
        scope: TenantScope,
        user_id: Uuid,
        attribution_id: Option<Uuid>,
        kind: &RewardKind,
        description: &str,
    ) -> Result<Option<IssuedReward>, ServiceError> {
        match Self::prepare_reward(kind, Some(user_id))? {
            PreparedReward::Credit { amount } => {
                if amount <= 0 {
                    return Ok(None);
                }
                let txn = self
                    .store
                    .credit_wallet(scope, user_id, amount, attribution_id, description)
                    .await?;
                Ok(Some(IssuedReward::Credit(txn)))
            }
            PreparedReward::Coupon(new) => {
                let (coupon, txn) = self
                    .store
                    .issue_coupon(scope, user_id, new, attribution_id, description)
                    .await?;
                Ok(Some(IssuedReward::Coupon(coupon, txn)))
            }
        }
    }

    /// Reverses every confirmed reward tied to the attribution. Credits come
    /// back out of the wallet as negative ADJUSTMENT rows; issued coupons are
    /// deactivated. The original rows are never touched.
    pub async fn void_referral_rewards(
        &self,
        scope: TenantScope,
        attribution_id: Uuid,
        reason: &str,
    ) -> Result<VoidSummary, ServiceError> {
        let (_, summary) = self
            .store
            .void_attribution_rewards(scope, attribution_id, reason)
            .await?;
        tracing::info!(
            attribution = %attribution_id,
            reversed = summary.reversed_amount,
            coupons = summary.coupons_deactivated,
            "voided referral rewards ({})",
            reason
        );
        Ok(summary)
    }

    /// Checks a coupon against a user, service and reference date, failing
    /// with a distinct reason for each violation.
    pub async fn validate_coupon(
        &self,
        scope: TenantScope,
        user_id: Uuid,
        coupon_id: Uuid,
        service_id: Option<Uuid>,
        reference: DateTime<Utc>,
    ) -> Result<Coupon, ServiceError> {
        let coupon = self
            .store
            .get_coupon(scope, coupon_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("coupon {}", coupon_id)))?;

        if !coupon.is_active {
            return Err(ServiceError::CouponInactive(coupon_id));
        }
        if let Some(owner) = coupon.owner_user_id {
            if owner != user_id {
                return Err(ServiceError::CouponNotOwned(coupon_id));
            }
        }
        if let Some(valid_from) = coupon.valid_from {
            if reference < valid_from {
                return Err(ServiceError::CouponNotStarted(coupon_id));
            }
        }
        if let Some(valid_to) = coupon.valid_to {
            if reference > valid_to {
                return Err(ServiceError::CouponExpired(coupon_id));
            }
        }
        if coupon.remaining_uses() == 0 {
            return Err(ServiceError::CouponExhausted(coupon_id));
        }
        if let Some(restricted_to) = coupon.service_id {
            if service_id != Some(restricted_to) {
                return Err(ServiceError::CouponServiceMismatch(coupon_id));
            }
        }

        Ok(coupon)
    }

    /// Pure discount math. Percent and fixed discounts are clamped so the
    /// result never exceeds the base price or drops below zero.
    pub fn calculate_discount(
        discount_type: DiscountType,
        discount_value: Option<i64>,
        base_price: i64,
    ) -> i64 {
        let base = base_price.max(0);
        match discount_type {
            DiscountType::Percent => {
                let percent = discount_value.unwrap_or(0).clamp(0, 100);
                base * percent / 100
            }
            DiscountType::Fixed => discount_value.unwrap_or(0).clamp(0, base),
            DiscountType::FreeService => base,
        }
    }

    /// Validates and reserves one use of a coupon at booking time: the use
    /// count moves speculatively and a PENDING COUPON_USED row records it.
    pub async fn reserve_coupon_usage(
        &self,
        scope: TenantScope,
        user_id: Uuid,
        coupon_id: Uuid,
        appointment_id: Uuid,
        service_id: Option<Uuid>,
    ) -> Result<RewardTransaction, ServiceError> {
        self.validate_coupon(scope, user_id, coupon_id, service_id, Utc::now())
            .await?;

        match self
            .store
            .reserve_coupon_usage(scope, user_id, coupon_id, appointment_id)
            .await
        {
            Ok(txn) => Ok(txn),
            // Lost a race between validation and reservation.
            Err(StoreError::Conflict(_)) => Err(ServiceError::CouponExhausted(coupon_id)),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn confirm_coupon_usage(
        &self,
        scope: TenantScope,
        appointment_id: Uuid,
    ) -> Result<i64, ServiceError> {
        Ok(self.store.confirm_coupon_usage(scope, appointment_id).await?)
    }

    pub async fn cancel_coupon_usage(
        &self,
        scope: TenantScope,
        appointment_id: Uuid,
    ) -> Result<i64, ServiceError> {
        Ok(self.store.cancel_coupon_usage(scope, appointment_id).await?)
    }

    /// Balance, spendable balance (balance minus pending holds), recent
    /// ledger rows and active coupons for one user.
    pub async fn wallet_summary(
        &self,
        scope: TenantScope,
        user_id: Uuid,
    ) -> Result<WalletSummary, ServiceError> {
        let wallet = self.store.ensure_wallet(scope, user_id).await?;
        let pending_hold_total = self.store.pending_hold_total(scope, user_id).await?;
        let recent_transactions = self.store.transactions_for_user(scope, user_id, 20).await?;
        let active_coupons = self.store.active_coupons_for_user(scope, user_id).await?;

        Ok(WalletSummary {
            balance: wallet.balance,
            available_balance: wallet.balance - pending_hold_total,
            pending_hold_total,
            recent_transactions,
            active_coupons,
        })
    }
}

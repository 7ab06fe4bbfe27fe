// models/rewardmodels.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::referralmodel::Attribution;
use super::TenantScope;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "reward_transaction_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RewardTransactionType {
    Hold,
    Debit,
    Release,
    Credit,
    CouponIssued,
    CouponUsed,
    Adjustment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "reward_transaction_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RewardTransactionStatus {
    Pending,
    Confirmed,
    Cancelled,
}

/// One row per (tenant, location, user). Balance only moves as a side effect
/// of confirmed CREDIT/DEBIT/ADJUSTMENT ledger rows; the ledger owns it.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Wallet {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub location_id: Uuid,
    pub user_id: Uuid,
    pub balance: i64, // minor units
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Wallet {
    pub fn scope(&self) -> TenantScope {
        TenantScope::new(self.tenant_id, self.location_id)
    }
}

/// Append-only ledger row. Rows are never edited after creation except for
/// status flips on HOLD/COUPON_USED rows; corrections are new ADJUSTMENT rows.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RewardTransaction {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub location_id: Uuid,
    pub user_id: Uuid,
    pub txn_type: RewardTransactionType,
    pub status: RewardTransactionStatus,
    pub amount: Option<i64>,
    pub appointment_id: Option<Uuid>,
    pub coupon_id: Option<Uuid>,
    pub referral_attribution_id: Option<Uuid>,
    pub description: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "discount_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DiscountType {
    Percent,
    Fixed,
    FreeService,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Coupon {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub location_id: Uuid,
    pub owner_user_id: Option<Uuid>,
    pub discount_type: DiscountType,
    pub discount_value: Option<i64>,
    pub service_id: Option<Uuid>,
    pub is_active: bool,
    pub max_uses: i32,
    pub used_count: i32,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_to: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
}

impl Coupon {
    pub fn remaining_uses(&self) -> i32 {
        (self.max_uses - self.used_count).max(0)
    }
}

#[derive(Debug, Clone)]
pub struct NewCoupon {
    pub owner_user_id: Option<Uuid>,
    pub discount_type: DiscountType,
    pub discount_value: Option<i64>,
    pub service_id: Option<Uuid>,
    pub max_uses: i32,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_to: Option<DateTime<Utc>>,
}

/// Polymorphic reward, discriminated explicitly instead of branching on
/// loose type strings at every call site. Each variant validates its own
/// required fields when resolved from a `RewardSpec`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RewardKind {
    WalletCredit { amount: i64 },
    PercentDiscount { percent: i64 },
    FixedDiscount { amount: i64 },
    FreeService { service_id: Uuid },
}

/// A reward that has been validated and lowered to its ledger shape.
#[derive(Debug, Clone)]
pub enum PreparedReward {
    Credit { amount: i64 },
    Coupon(NewCoupon),
}

/// Everything `apply_completion_rewards` needs to run atomically: ledger
/// writes plus the BOOKED -> COMPLETED -> REWARDED status flip.
#[derive(Debug, Clone)]
pub struct CompletionRewards {
    pub attribution_id: Uuid,
    pub referrer_user_id: Uuid,
    pub referrer_reward: Option<PreparedReward>,
    pub referred_user_id: Option<Uuid>,
    pub referred_reward: Option<PreparedReward>,
    /// Merged into the attribution's metadata on success.
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct IssuedRewards {
    pub attribution: Attribution,
    pub referrer_txn: Option<RewardTransaction>,
    pub referrer_coupon: Option<Coupon>,
    pub referred_txn: Option<RewardTransaction>,
    pub referred_coupon: Option<Coupon>,
}

/// Outcome of reversing an attribution's confirmed rewards. The original
/// CREDIT/COUPON_ISSUED rows stay untouched; reversals are new rows.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VoidSummary {
    pub reversed_amount: i64,
    pub coupons_deactivated: i64,
    pub adjustments_written: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WalletSummary {
    pub balance: i64,
    pub available_balance: i64,
    pub pending_hold_total: i64,
    pub recent_transactions: Vec<RewardTransaction>,
    pub active_coupons: Vec<Coupon>,
}

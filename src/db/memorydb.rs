// db/memorydb.rs
//
// In-memory implementation of the storage seam. Backs the test suites and
// local development; every trait method takes the single mutex once, which
// gives it the same all-or-nothing behavior the Postgres client gets from a
// transaction.
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::notificationdb::NotificationExt;
use super::referraldb::ReferralExt;
use super::rewarddb::RewardLedgerExt;
use super::userdb::UserDirectoryExt;
use super::StoreError;
use crate::models::referralmodel::*;
use crate::models::rewardmodels::*;
use crate::models::usermodel::UserProfile;
use crate::models::TenantScope;

#[derive(Debug, Clone)]
pub struct StoredNotification {
    pub scope: TenantScope,
    pub user_id: Uuid,
    pub kind: String,
    pub reference_id: Option<Uuid>,
    pub message: String,
}

#[derive(Default)]
struct MemInner {
    codes: Vec<ReferralCode>,
    attributions: HashMap<Uuid, Attribution>,
    wallets: HashMap<(TenantScope, Uuid), Wallet>,
    transactions: Vec<RewardTransaction>,
    coupons: HashMap<Uuid, Coupon>,
    users: HashMap<(TenantScope, Uuid), UserProfile>,
    notifications: Vec<StoredNotification>,
    prior_customers: Vec<(TenantScope, ReferredIdentity)>,
}

#[derive(Default)]
pub struct MemStore {
    inner: Mutex<MemInner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_user(&self, scope: TenantScope, profile: UserProfile) {
        let mut inner = self.inner.lock().await;
        inner.users.insert((scope, profile.id), profile);
    }

    /// Seed the "already completed an appointment" registry that backs the
    /// new-customer-only policy.
    pub async fn mark_prior_customer(&self, scope: TenantScope, identity: ReferredIdentity) {
        let mut inner = self.inner.lock().await;
        inner.prior_customers.push((scope, identity));
    }

    pub async fn notifications(&self) -> Vec<StoredNotification> {
        self.inner.lock().await.notifications.clone()
    }

    pub async fn transactions(&self) -> Vec<RewardTransaction> {
        self.inner.lock().await.transactions.clone()
    }
}

fn identity_matches_attribution(identity: &ReferredIdentity, attribution: &Attribution) -> bool {
    if let (Some(a), Some(b)) = (identity.user_id, attribution.referred_user_id) {
        if a == b {
            return true;
        }
    }
    if let (Some(a), Some(b)) = (identity.email.as_deref(), attribution.referred_email.as_deref()) {
        if a == b {
            return true;
        }
    }
    if let (Some(a), Some(b)) = (identity.phone.as_deref(), attribution.referred_phone.as_deref()) {
        if a == b {
            return true;
        }
    }
    false
}

fn identities_overlap(a: &ReferredIdentity, b: &ReferredIdentity) -> bool {
    (a.user_id.is_some() && a.user_id == b.user_id)
        || (a.email.is_some() && a.email == b.email)
        || (a.phone.is_some() && a.phone == b.phone)
}

fn merge_metadata(existing: &mut Option<serde_json::Value>, patch: &serde_json::Value) {
    let base = existing.get_or_insert_with(|| serde_json::json!({}));
    if let (Some(base_map), Some(patch_map)) = (base.as_object_mut(), patch.as_object()) {
        for (key, value) in patch_map {
            base_map.insert(key.clone(), value.clone());
        }
    }
}

fn now() -> DateTime<Utc> {
    Utc::now()
}

impl MemInner {
    fn wallet_mut(&mut self, scope: TenantScope, user_id: Uuid) -> &mut Wallet {
        self.wallets.entry((scope, user_id)).or_insert_with(|| Wallet {
            id: Uuid::new_v4(),
            tenant_id: scope.tenant_id,
            location_id: scope.location_id,
            user_id,
            balance: 0,
            created_at: Some(now()),
            updated_at: Some(now()),
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn push_txn(
        &mut self,
        scope: TenantScope,
        user_id: Uuid,
        txn_type: RewardTransactionType,
        status: RewardTransactionStatus,
        amount: Option<i64>,
        appointment_id: Option<Uuid>,
        coupon_id: Option<Uuid>,
        attribution_id: Option<Uuid>,
        description: String,
    ) -> RewardTransaction {
        let txn = RewardTransaction {
            id: Uuid::new_v4(),
            tenant_id: scope.tenant_id,
            location_id: scope.location_id,
            user_id,
            txn_type,
            status,
            amount,
            appointment_id,
            coupon_id,
            referral_attribution_id: attribution_id,
            description,
            created_at: Some(now()),
            updated_at: Some(now()),
        };
        self.transactions.push(txn.clone());
        txn
    }

    fn apply_prepared_reward(
        &mut self,
        scope: TenantScope,
        user_id: Uuid,
        reward: &PreparedReward,
        attribution_id: Uuid,
        description: &str,
    ) -> (RewardTransaction, Option<Coupon>) {
        match reward {
            PreparedReward::Credit { amount } => {
                self.wallet_mut(scope, user_id).balance += amount;
                let txn = self.push_txn(
                    scope,
                    user_id,
                    RewardTransactionType::Credit,
                    RewardTransactionStatus::Confirmed,
                    Some(*amount),
                    None,
                    None,
                    Some(attribution_id),
                    description.to_string(),
                );
                (txn, None)
            }
            PreparedReward::Coupon(new) => {
                let coupon = Coupon {
                    id: Uuid::new_v4(),
                    tenant_id: scope.tenant_id,
                    location_id: scope.location_id,
                    owner_user_id: new.owner_user_id,
                    discount_type: new.discount_type,
                    discount_value: new.discount_value,
                    service_id: new.service_id,
                    is_active: true,
                    max_uses: new.max_uses,
                    used_count: 0,
                    valid_from: new.valid_from,
                    valid_to: new.valid_to,
                    created_at: Some(now()),
                };
                self.coupons.insert(coupon.id, coupon.clone());
                let txn = self.push_txn(
                    scope,
                    user_id,
                    RewardTransactionType::CouponIssued,
                    RewardTransactionStatus::Confirmed,
                    None,
                    None,
                    Some(coupon.id),
                    Some(attribution_id),
                    description.to_string(),
                );
                (txn, Some(coupon))
            }
        }
    }
}

#[async_trait]
impl ReferralExt for MemStore {
    async fn get_code_for_owner(
        &self,
        scope: TenantScope,
        owner_user_id: Uuid,
    ) -> Result<Option<ReferralCode>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .codes
            .iter()
            .find(|c| c.scope() == scope && c.owner_user_id == owner_user_id)
            .cloned())
    }

    async fn insert_code(
        &self,
        scope: TenantScope,
        owner_user_id: Uuid,
        code: &str,
    ) -> Result<ReferralCode, StoreError> {
        let mut inner = self.inner.lock().await;
        if inner
            .codes
            .iter()
            .any(|c| c.tenant_id == scope.tenant_id && c.code == code)
        {
            return Err(StoreError::Conflict(format!(
                "referral code {} already exists",
                code
            )));
        }
        let row = ReferralCode {
            id: Uuid::new_v4(),
            tenant_id: scope.tenant_id,
            location_id: scope.location_id,
            owner_user_id,
            code: code.to_string(),
            is_active: true,
            created_at: Some(now()),
        };
        inner.codes.push(row.clone());
        Ok(row)
    }

    async fn get_code_by_token(
        &self,
        scope: TenantScope,
        code: &str,
    ) -> Result<Option<ReferralCode>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .codes
            .iter()
            .find(|c| c.scope() == scope && c.code == code)
            .cloned())
    }

    async fn insert_attribution(&self, new: NewAttribution) -> Result<Attribution, StoreError> {
        let mut inner = self.inner.lock().await;
        let attribution = Attribution {
            id: Uuid::new_v4(),
            tenant_id: new.scope.tenant_id,
            location_id: new.scope.location_id,
            code_id: new.code_id,
            referrer_user_id: new.referrer_user_id,
            referred_user_id: new.referred_user_id,
            referred_email: new.referred_email,
            referred_phone: new.referred_phone,
            status: AttributionStatus::Attributed,
            attributed_at: new.attributed_at,
            expires_at: new.expires_at,
            first_appointment_id: None,
            metadata: new.metadata,
            created_at: Some(now()),
            updated_at: Some(now()),
        };
        inner.attributions.insert(attribution.id, attribution.clone());
        Ok(attribution)
    }

    async fn get_attribution(
        &self,
        scope: TenantScope,
        id: Uuid,
    ) -> Result<Option<Attribution>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .attributions
            .get(&id)
            .filter(|a| a.scope() == scope)
            .cloned())
    }

    async fn find_open_attributions(
        &self,
        scope: TenantScope,
        identity: &ReferredIdentity,
    ) -> Result<Vec<Attribution>, StoreError> {
        if identity.is_empty() {
            return Ok(Vec::new());
        }
        let inner = self.inner.lock().await;
        let mut matches: Vec<Attribution> = inner
            .attributions
            .values()
            .filter(|a| {
                a.scope() == scope
                    && a.status.is_open()
                    && identity_matches_attribution(identity, a)
            })
            .cloned()
            .collect();
        matches.sort_by_key(|a| a.attributed_at);
        Ok(matches)
    }

    async fn find_booked_by_appointment(
        &self,
        scope: TenantScope,
        appointment_id: Uuid,
    ) -> Result<Option<Attribution>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .attributions
            .values()
            .find(|a| {
                a.scope() == scope
                    && a.status == AttributionStatus::Booked
                    && a.first_appointment_id == Some(appointment_id)
            })
            .cloned())
    }

    async fn update_attribution_status(
        &self,
        scope: TenantScope,
        id: Uuid,
        status: AttributionStatus,
        metadata: Option<serde_json::Value>,
    ) -> Result<Attribution, StoreError> {
        let mut inner = self.inner.lock().await;
        let attribution = inner
            .attributions
            .get_mut(&id)
            .filter(|a| a.scope() == scope)
            .ok_or(StoreError::NotFound("attribution"))?;
        attribution.status = status;
        if let Some(patch) = metadata {
            merge_metadata(&mut attribution.metadata, &patch);
        }
        attribution.updated_at = Some(now());
        Ok(attribution.clone())
    }

    async fn set_attribution_booked(
        &self,
        scope: TenantScope,
        id: Uuid,
        appointment_id: Uuid,
        referred_user_id: Option<Uuid>,
    ) -> Result<Attribution, StoreError> {
        let mut inner = self.inner.lock().await;
        let attribution = inner
            .attributions
            .get_mut(&id)
            .filter(|a| a.scope() == scope)
            .ok_or(StoreError::NotFound("attribution"))?;
        attribution.status = AttributionStatus::Booked;
        attribution.first_appointment_id = Some(appointment_id);
        if attribution.referred_user_id.is_none() {
            attribution.referred_user_id = referred_user_id;
        }
        attribution.updated_at = Some(now());
        Ok(attribution.clone())
    }

    async fn clear_attribution_booking(
        &self,
        scope: TenantScope,
        id: Uuid,
        status: AttributionStatus,
    ) -> Result<Attribution, StoreError> {
        let mut inner = self.inner.lock().await;
        let attribution = inner
            .attributions
            .get_mut(&id)
            .filter(|a| a.scope() == scope)
            .ok_or(StoreError::NotFound("attribution"))?;
        attribution.status = status;
        attribution.first_appointment_id = None;
        attribution.updated_at = Some(now());
        Ok(attribution.clone())
    }

    async fn count_rewarded_since(
        &self,
        scope: TenantScope,
        referrer_user_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .attributions
            .values()
            .filter(|a| {
                a.scope() == scope
                    && a.referrer_user_id == referrer_user_id
                    && a.status == AttributionStatus::Rewarded
                    && a.updated_at.map(|t| t >= since).unwrap_or(false)
            })
            .count() as i64)
    }

    async fn list_attributions_for_referrer(
        &self,
        scope: TenantScope,
        referrer_user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Attribution>, StoreError> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<Attribution> = inner
            .attributions
            .values()
            .filter(|a| a.scope() == scope && a.referrer_user_id == referrer_user_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.attributed_at.cmp(&a.attributed_at));
        Ok(rows
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn referral_overview(&self, scope: TenantScope) -> Result<ReferralOverview, StoreError> {
        let inner = self.inner.lock().await;
        let mut overview = ReferralOverview::default();
        let mut rewarded_by_referrer: HashMap<Uuid, i64> = HashMap::new();

        for attribution in inner.attributions.values().filter(|a| a.scope() == scope) {
            overview.total += 1;
            match attribution.status {
                AttributionStatus::Attributed => overview.attributed += 1,
                AttributionStatus::Booked => overview.booked += 1,
                AttributionStatus::Completed => overview.completed += 1,
                AttributionStatus::Rewarded => {
                    overview.rewarded += 1;
                    *rewarded_by_referrer
                        .entry(attribution.referrer_user_id)
                        .or_insert(0) += 1;
                    if let Some(amount) = attribution
                        .metadata
                        .as_ref()
                        .and_then(|m| m.get("booking_amount"))
                        .and_then(|v| v.as_i64())
                    {
                        overview.attributed_revenue += amount;
                    }
                }
                AttributionStatus::Voided => overview.voided += 1,
                AttributionStatus::Expired => overview.expired += 1,
            }
        }

        overview.total_rewards_paid = inner
            .transactions
            .iter()
            .filter(|t| {
                t.tenant_id == scope.tenant_id
                    && t.location_id == scope.location_id
                    && t.txn_type == RewardTransactionType::Credit
                    && t.status == RewardTransactionStatus::Confirmed
                    && t.referral_attribution_id.is_some()
            })
            .filter_map(|t| t.amount)
            .sum();

        let mut top: Vec<TopReferrer> = rewarded_by_referrer
            .into_iter()
            .map(|(user_id, rewarded_count)| TopReferrer {
                user_id,
                rewarded_count,
            })
            .collect();
        top.sort_by(|a, b| b.rewarded_count.cmp(&a.rewarded_count));
        top.truncate(5);
        overview.top_referrers = top;

        Ok(overview)
    }

    async fn has_prior_completed_appointment(
        &self,
        scope: TenantScope,
        identity: &ReferredIdentity,
        _exclude_appointment: Option<Uuid>,
    ) -> Result<bool, StoreError> {
        if identity.is_empty() {
            return Ok(false);
        }
        let inner = self.inner.lock().await;
        Ok(inner
            .prior_customers
            .iter()
            .any(|(s, known)| *s == scope && identities_overlap(identity, known)))
    }
}

#[async_trait]
impl RewardLedgerExt for MemStore {
    async fn ensure_wallet(
        &self,
        scope: TenantScope,
        user_id: Uuid,
    ) -> Result<Wallet, StoreError> {
        let mut inner = self.inner.lock().await;
        Ok(inner.wallet_mut(scope, user_id).clone())
    }

    async fn get_wallet(
        &self,
        scope: TenantScope,
        user_id: Uuid,
    ) -> Result<Option<Wallet>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.wallets.get(&(scope, user_id)).cloned())
    }

    async fn insert_hold(
        &self,
        scope: TenantScope,
        user_id: Uuid,
        appointment_id: Uuid,
        amount: i64,
        description: &str,
    ) -> Result<RewardTransaction, StoreError> {
        let mut inner = self.inner.lock().await;
        Ok(inner.push_txn(
            scope,
            user_id,
            RewardTransactionType::Hold,
            RewardTransactionStatus::Pending,
            Some(amount),
            Some(appointment_id),
            None,
            None,
            description.to_string(),
        ))
    }

    async fn confirm_holds(
        &self,
        scope: TenantScope,
        appointment_id: Uuid,
    ) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().await;
        let pending: Vec<(Uuid, Uuid, i64)> = inner
            .transactions
            .iter()
            .filter(|t| {
                t.tenant_id == scope.tenant_id
                    && t.location_id == scope.location_id
                    && t.appointment_id == Some(appointment_id)
                    && t.txn_type == RewardTransactionType::Hold
                    && t.status == RewardTransactionStatus::Pending
            })
            .map(|t| (t.id, t.user_id, t.amount.unwrap_or(0)))
            .collect();

        let mut total = 0i64;
        for (hold_id, user_id, amount) in pending {
            if let Some(hold) = inner.transactions.iter_mut().find(|t| t.id == hold_id) {
                hold.status = RewardTransactionStatus::Confirmed;
                hold.updated_at = Some(now());
            }
            inner.push_txn(
                scope,
                user_id,
                RewardTransactionType::Debit,
                RewardTransactionStatus::Confirmed,
                Some(amount),
                Some(appointment_id),
                None,
                None,
                format!("debit for confirmed hold {}", hold_id),
            );
            inner.wallet_mut(scope, user_id).balance -= amount;
            total += amount;
        }
        Ok(total)
    }

    async fn release_holds(
        &self,
        scope: TenantScope,
        appointment_id: Uuid,
    ) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().await;
        let pending: Vec<(Uuid, Uuid, i64)> = inner
            .transactions
            .iter()
            .filter(|t| {
                t.tenant_id == scope.tenant_id
                    && t.location_id == scope.location_id
                    && t.appointment_id == Some(appointment_id)
                    && t.txn_type == RewardTransactionType::Hold
                    && t.status == RewardTransactionStatus::Pending
            })
            .map(|t| (t.id, t.user_id, t.amount.unwrap_or(0)))
            .collect();

        let mut released = 0i64;
        for (hold_id, user_id, amount) in pending {
            if let Some(hold) = inner.transactions.iter_mut().find(|t| t.id == hold_id) {
                hold.status = RewardTransactionStatus::Cancelled;
                hold.updated_at = Some(now());
            }
            if amount > 0 {
                inner.push_txn(
                    scope,
                    user_id,
                    RewardTransactionType::Release,
                    RewardTransactionStatus::Confirmed,
                    Some(amount),
                    Some(appointment_id),
                    None,
                    None,
                    format!("release of hold {}", hold_id),
                );
            }
            released += 1;
        }
        Ok(released)
    }

    async fn pending_hold_total(
        &self,
        scope: TenantScope,
        user_id: Uuid,
    ) -> Result<i64, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .transactions
            .iter()
            .filter(|t| {
                t.tenant_id == scope.tenant_id
                    && t.location_id == scope.location_id
                    && t.user_id == user_id
                    && t.txn_type == RewardTransactionType::Hold
                    && t.status == RewardTransactionStatus::Pending
            })
            .filter_map(|t| t.amount)
            .sum())
    }

    async fn credit_wallet(
        &self,
        scope: TenantScope,
        user_id: Uuid,
        amount: i64,
        attribution_id: Option<Uuid>,
        description: &str,
    ) -> Result<RewardTransaction, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.wallet_mut(scope, user_id).balance += amount;
        Ok(inner.push_txn(
            scope,
            user_id,
            RewardTransactionType::Credit,
            RewardTransactionStatus::Confirmed,
            Some(amount),
            None,
            None,
            attribution_id,
            description.to_string(),
        ))
    }

    async fn issue_coupon(
        &self,
        scope: TenantScope,
        user_id: Uuid,
        new: NewCoupon,
        attribution_id: Option<Uuid>,
        description: &str,
    ) -> Result<(Coupon, RewardTransaction), StoreError> {
        let mut inner = self.inner.lock().await;
        let coupon = Coupon {
            id: Uuid::new_v4(),
            tenant_id: scope.tenant_id,
            location_id: scope.location_id,
            owner_user_id: new.owner_user_id,
            discount_type: new.discount_type,
            discount_value: new.discount_value,
            service_id: new.service_id,
            is_active: true,
            max_uses: new.max_uses,
            used_count: 0,
            valid_from: new.valid_from,
            valid_to: new.valid_to,
            created_at: Some(now()),
        };
        inner.coupons.insert(coupon.id, coupon.clone());
        let txn = inner.push_txn(
            scope,
            user_id,
            RewardTransactionType::CouponIssued,
            RewardTransactionStatus::Confirmed,
            None,
            None,
            Some(coupon.id),
            attribution_id,
            description.to_string(),
        );
        Ok((coupon, txn))
    }

    async fn apply_completion_rewards(
        &self,
        scope: TenantScope,
        rewards: CompletionRewards,
    ) -> Result<Option<IssuedRewards>, StoreError> {
        let mut inner = self.inner.lock().await;

        match inner.attributions.get(&rewards.attribution_id) {
            Some(a) if a.scope() == scope && a.status == AttributionStatus::Booked => {}
            _ => return Ok(None),
        }

        let mut referrer_txn = None;
        let mut referrer_coupon = None;
        if let Some(reward) = &rewards.referrer_reward {
            let (txn, coupon) = inner.apply_prepared_reward(
                scope,
                rewards.referrer_user_id,
                reward,
                rewards.attribution_id,
                "referral reward (referrer)",
            );
            referrer_txn = Some(txn);
            referrer_coupon = coupon;
        }

        let mut referred_txn = None;
        let mut referred_coupon = None;
        if let (Some(referred_user), Some(reward)) =
            (rewards.referred_user_id, &rewards.referred_reward)
        {
            let (txn, coupon) = inner.apply_prepared_reward(
                scope,
                referred_user,
                reward,
                rewards.attribution_id,
                "referral reward (referred)",
            );
            referred_txn = Some(txn);
            referred_coupon = coupon;
        }

        let attribution = inner
            .attributions
            .get_mut(&rewards.attribution_id)
            .expect("checked above");
        attribution.status = AttributionStatus::Rewarded;
        merge_metadata(&mut attribution.metadata, &rewards.metadata);
        attribution.updated_at = Some(now());
        let attribution = attribution.clone();

        Ok(Some(IssuedRewards {
            attribution,
            referrer_txn,
            referrer_coupon,
            referred_txn,
            referred_coupon,
        }))
    }

    async fn void_attribution_rewards(
        &self,
        scope: TenantScope,
        attribution_id: Uuid,
        reason: &str,
    ) -> Result<(Attribution, VoidSummary), StoreError> {
        let mut inner = self.inner.lock().await;

        if !inner
            .attributions
            .get(&attribution_id)
            .map(|a| a.scope() == scope)
            .unwrap_or(false)
        {
            return Err(StoreError::NotFound("attribution"));
        }

        let confirmed: Vec<RewardTransaction> = inner
            .transactions
            .iter()
            .filter(|t| {
                t.tenant_id == scope.tenant_id
                    && t.location_id == scope.location_id
                    && t.referral_attribution_id == Some(attribution_id)
                    && t.status == RewardTransactionStatus::Confirmed
                    && matches!(
                        t.txn_type,
                        RewardTransactionType::Credit | RewardTransactionType::CouponIssued
                    )
            })
            .cloned()
            .collect();

        let mut summary = VoidSummary::default();
        for original in &confirmed {
            match original.txn_type {
                RewardTransactionType::Credit => {
                    let amount = original.amount.unwrap_or(0);
                    inner.wallet_mut(scope, original.user_id).balance -= amount;
                    inner.push_txn(
                        scope,
                        original.user_id,
                        RewardTransactionType::Adjustment,
                        RewardTransactionStatus::Confirmed,
                        Some(-amount),
                        None,
                        None,
                        Some(attribution_id),
                        format!("reversal ({}) of credit {}", reason, original.id),
                    );
                    summary.reversed_amount += amount;
                    summary.adjustments_written += 1;
                }
                RewardTransactionType::CouponIssued => {
                    if let Some(coupon_id) = original.coupon_id {
                        if let Some(coupon) = inner.coupons.get_mut(&coupon_id) {
                            coupon.is_active = false;
                        }
                    }
                    inner.push_txn(
                        scope,
                        original.user_id,
                        RewardTransactionType::Adjustment,
                        RewardTransactionStatus::Confirmed,
                        Some(0),
                        None,
                        original.coupon_id,
                        Some(attribution_id),
                        format!("reversal ({}) of coupon {}", reason, original.id),
                    );
                    summary.coupons_deactivated += 1;
                    summary.adjustments_written += 1;
                }
                _ => {}
            }
        }

        let attribution = inner
            .attributions
            .get_mut(&attribution_id)
            .expect("checked above");
        attribution.status = AttributionStatus::Voided;
        merge_metadata(
            &mut attribution.metadata,
            &serde_json::json!({ "void_reason": reason }),
        );
        attribution.updated_at = Some(now());
        let attribution = attribution.clone();

        Ok((attribution, summary))
    }

    async fn get_coupon(
        &self,
        scope: TenantScope,
        coupon_id: Uuid,
    ) -> Result<Option<Coupon>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .coupons
            .get(&coupon_id)
            .filter(|c| c.tenant_id == scope.tenant_id && c.location_id == scope.location_id)
            .cloned())
    }

    async fn reserve_coupon_usage(
        &self,
        scope: TenantScope,
        user_id: Uuid,
        coupon_id: Uuid,
        appointment_id: Uuid,
    ) -> Result<RewardTransaction, StoreError> {
        let mut inner = self.inner.lock().await;
        let coupon = inner
            .coupons
            .get_mut(&coupon_id)
            .filter(|c| c.tenant_id == scope.tenant_id && c.location_id == scope.location_id)
            .ok_or(StoreError::NotFound("coupon"))?;

        if !coupon.is_active || coupon.used_count >= coupon.max_uses {
            return Err(StoreError::Conflict(format!(
                "coupon {} is inactive or exhausted",
                coupon_id
            )));
        }
        coupon.used_count += 1;

        Ok(inner.push_txn(
            scope,
            user_id,
            RewardTransactionType::CouponUsed,
            RewardTransactionStatus::Pending,
            None,
            Some(appointment_id),
            Some(coupon_id),
            None,
            format!("coupon {} reserved for appointment {}", coupon_id, appointment_id),
        ))
    }

    async fn confirm_coupon_usage(
        &self,
        scope: TenantScope,
        appointment_id: Uuid,
    ) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().await;
        let mut confirmed = 0i64;
        for txn in inner.transactions.iter_mut() {
            if txn.tenant_id == scope.tenant_id
                && txn.location_id == scope.location_id
                && txn.appointment_id == Some(appointment_id)
                && txn.txn_type == RewardTransactionType::CouponUsed
                && txn.status == RewardTransactionStatus::Pending
            {
                txn.status = RewardTransactionStatus::Confirmed;
                txn.updated_at = Some(now());
                confirmed += 1;
            }
        }
        Ok(confirmed)
    }

    async fn cancel_coupon_usage(
        &self,
        scope: TenantScope,
        appointment_id: Uuid,
    ) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().await;
        let pending: Vec<(Uuid, Option<Uuid>)> = inner
            .transactions
            .iter()
            .filter(|t| {
                t.tenant_id == scope.tenant_id
                    && t.location_id == scope.location_id
                    && t.appointment_id == Some(appointment_id)
                    && t.txn_type == RewardTransactionType::CouponUsed
                    && t.status == RewardTransactionStatus::Pending
            })
            .map(|t| (t.id, t.coupon_id))
            .collect();

        let mut cancelled = 0i64;
        for (txn_id, coupon_id) in pending {
            if let Some(txn) = inner.transactions.iter_mut().find(|t| t.id == txn_id) {
                txn.status = RewardTransactionStatus::Cancelled;
                txn.updated_at = Some(now());
            }
            if let Some(coupon_id) = coupon_id {
                if let Some(coupon) = inner.coupons.get_mut(&coupon_id) {
                    coupon.used_count = (coupon.used_count - 1).max(0);
                }
            }
            cancelled += 1;
        }
        Ok(cancelled)
    }

    async fn transactions_for_user(
        &self,
        scope: TenantScope,
        user_id: Uuid,
        limit: i64,
    ) -> Result<Vec<RewardTransaction>, StoreError> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<RewardTransaction> = inner
            .transactions
            .iter()
            .filter(|t| {
                t.tenant_id == scope.tenant_id
                    && t.location_id == scope.location_id
                    && t.user_id == user_id
            })
            .cloned()
            .collect();
        rows.reverse();
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn active_coupons_for_user(
        &self,
        scope: TenantScope,
        user_id: Uuid,
    ) -> Result<Vec<Coupon>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .coupons
            .values()
            .filter(|c| {
                c.tenant_id == scope.tenant_id
                    && c.location_id == scope.location_id
                    && c.owner_user_id == Some(user_id)
                    && c.is_active
            })
            .cloned()
            .collect())
    }
}

#[async_trait]
impl UserDirectoryExt for MemStore {
    async fn get_user_profile(
        &self,
        scope: TenantScope,
        user_id: Uuid,
    ) -> Result<Option<UserProfile>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.users.get(&(scope, user_id)).cloned())
    }
}

#[async_trait]
impl NotificationExt for MemStore {
    async fn store_notification(
        &self,
        scope: TenantScope,
        user_id: Uuid,
        kind: &str,
        reference_id: Option<Uuid>,
        message: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.notifications.push(StoredNotification {
            scope,
            user_id,
            kind: kind.to_string(),
            reference_id,
            message: message.to_string(),
        });
        Ok(())
    }
}

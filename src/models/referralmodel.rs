// models/referralmodel.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::TenantScope;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ReferralCode {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub location_id: Uuid,
    pub owner_user_id: Uuid,
    pub code: String,
    pub is_active: bool,
    pub created_at: Option<DateTime<Utc>>,
}

impl ReferralCode {
    pub fn scope(&self) -> TenantScope {
        TenantScope::new(self.tenant_id, self.location_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "attribution_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AttributionStatus {
    Attributed,
    Booked,
    Completed,
    Rewarded,
    Voided,
    Expired,
}

impl AttributionStatus {
    /// Open states are the only ones eligible for matching against a new
    /// booking or contact.
    pub fn is_open(&self) -> bool {
        matches!(self, AttributionStatus::Attributed | AttributionStatus::Booked)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AttributionStatus::Rewarded | AttributionStatus::Voided | AttributionStatus::Expired
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Attribution {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub location_id: Uuid,
    pub code_id: Uuid,
    pub referrer_user_id: Uuid,
    pub referred_user_id: Option<Uuid>,
    pub referred_email: Option<String>,
    pub referred_phone: Option<String>,
    pub status: AttributionStatus,
    pub attributed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub first_appointment_id: Option<Uuid>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Attribution {
    pub fn scope(&self) -> TenantScope {
        TenantScope::new(self.tenant_id, self.location_id)
    }

    /// Expiry is evaluated lazily; `expires_at` is fixed at creation and a
    /// stale open row simply becomes ineligible once read past it.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn void_reason(&self) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("void_reason"))
            .and_then(|v| v.as_str())
    }
}

/// Insert payload for a fresh attribution. Identity tokens arrive already
/// normalized (lowercased email, digits-only phone).
#[derive(Debug, Clone)]
pub struct NewAttribution {
    pub scope: TenantScope,
    pub code_id: Uuid,
    pub referrer_user_id: Uuid,
    pub referred_user_id: Option<Uuid>,
    pub referred_email: Option<String>,
    pub referred_phone: Option<String>,
    pub attributed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub metadata: Option<serde_json::Value>,
}

/// Identity tokens a referred person can be matched by. At least one token
/// must be present for an attribution to exist.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReferredIdentity {
    pub user_id: Option<Uuid>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

impl ReferredIdentity {
    pub fn is_empty(&self) -> bool {
        self.user_id.is_none() && self.email.is_none() && self.phone.is_none()
    }

    /// Merge tokens from another identity, keeping existing ones.
    pub fn merged_with(mut self, other: &ReferredIdentity) -> Self {
        if self.user_id.is_none() {
            self.user_id = other.user_id;
        }
        if self.email.is_none() {
            self.email = other.email.clone();
        }
        if self.phone.is_none() {
            self.phone = other.phone.clone();
        }
        self
    }
}

/// Machine-readable reason codes for policy terminations at completion time.
/// These are normal terminal transitions, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoidReason {
    ServiceNotAllowed,
    NotNewCustomer,
    MonthlyLimit,
    Manual,
}

impl VoidReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoidReason::ServiceNotAllowed => "service_not_allowed",
            VoidReason::NotNewCustomer => "not_new_customer",
            VoidReason::MonthlyLimit => "monthly_limit",
            VoidReason::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopReferrer {
    pub user_id: Uuid,
    pub rewarded_count: i64,
}

/// Aggregate dashboard numbers for a tenant's referral program.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReferralOverview {
    pub total: i64,
    pub attributed: i64,
    pub booked: i64,
    pub completed: i64,
    pub rewarded: i64,
    pub voided: i64,
    pub expired: i64,
    /// Sum of booking amounts across rewarded attributions.
    pub attributed_revenue: i64,
    /// Sum of confirmed wallet credits issued for attributions.
    pub total_rewards_paid: i64,
    pub top_referrers: Vec<TopReferrer>,
}

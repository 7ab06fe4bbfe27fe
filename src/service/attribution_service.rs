// service/attribution_service.rs
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, Utc};
use serde_json::json;
use uuid::Uuid;
use validator::Validate;

use super::anti_fraud::{self, parse_contact, AntiFraudSettings};
use super::code_registry::CodeRegistry;
use super::error::ServiceError;
use super::notification_service::NotificationService;
use super::program::{ProgramConfigSource, ReferralProgramConfig};
use super::reward_ledger::RewardLedger;
use crate::db::ReferralStore;
use crate::dtos::referraldtos::{
    AttachBookingDto, AttributeReferralDto, AttributionResponseDto, BookingCompletionDto,
};
use crate::models::referralmodel::*;
use crate::models::rewardmodels::{CompletionRewards, IssuedRewards, VoidSummary};
use crate::models::TenantScope;

/// What happened when a completed booking was run through the referral
/// program. Policy terminations are outcomes here, not errors; callers on the
/// event path treat every variant as success.
#[derive(Debug)]
pub enum CompletionOutcome {
    /// No referral was in play for this appointment (or a concurrent replay
    /// already claimed it).
    NoAttribution,
    /// The attribution's window had passed; it was flipped to EXPIRED.
    Expired,
    /// A program policy terminated the attribution as VOIDED.
    Voided { reason: VoidReason },
    /// Rewards were issued and the attribution is REWARDED.
    Rewarded { issued: IssuedRewards },
}

/// The referral state machine. Owns every attribution status transition;
/// ledger writes go through `RewardLedger` and the coarse atomic store steps.
pub struct AttributionEngine<S> {
    store: Arc<S>,
    config: Arc<dyn ProgramConfigSource>,
    registry: CodeRegistry<S>,
    ledger: RewardLedger<S>,
    notifications: NotificationService<S>,
}

impl<S> Clone for AttributionEngine<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            config: self.config.clone(),
            registry: self.registry.clone(),
            ledger: self.ledger.clone(),
            notifications: self.notifications.clone(),
        }
    }
}

impl<S: ReferralStore> AttributionEngine<S> {
    pub fn new(
        store: Arc<S>,
        config: Arc<dyn ProgramConfigSource>,
        registry: CodeRegistry<S>,
        ledger: RewardLedger<S>,
        notifications: NotificationService<S>,
    ) -> Self {
        Self {
            store,
            config,
            registry,
            ledger,
            notifications,
        }
    }

    /// Records that a referred person arrived through a code. The attribution
    /// opens in ATTRIBUTED with its expiry fixed now; nothing is owed until a
    /// booking completes.
    pub async fn attribute(
        &self,
        scope: TenantScope,
        dto: AttributeReferralDto,
    ) -> Result<Attribution, ServiceError> {
        let config = self.config.get_config(scope).await?;
        if !config.enabled {
            return Err(ServiceError::ProgramDisabled);
        }

        dto.validate()?;

        let (code, referrer) = self.registry.resolve(scope, &dto.code).await?;

        let identity = Self::identity_from_attribute(&dto);
        if identity.is_empty() {
            return Err(ServiceError::Validation(
                "at least one contact detail is required".to_string(),
            ));
        }

        if anti_fraud::is_self_referral(&config.anti_fraud, &referrer, &identity) {
            return Err(ServiceError::SelfReferral);
        }

        let now = Utc::now();

        // Best-effort duplicate check; a concurrent insert can still slip
        // through, and reward idempotence at completion is the backstop.
        if config.anti_fraud.block_duplicate_contact {
            let open = self.store.find_open_attributions(scope, &identity).await?;
            if open.iter().any(|a| !a.is_expired(now)) {
                return Err(ServiceError::DuplicateReferral);
            }
        }

        if config.new_customer_only
            && self
                .store
                .has_prior_completed_appointment(scope, &identity, None)
                .await?
        {
            return Err(ServiceError::NotEligible(
                "this contact is already a customer".to_string(),
            ));
        }

        let attribution = self
            .store
            .insert_attribution(NewAttribution {
                scope,
                code_id: code.id,
                referrer_user_id: code.owner_user_id,
                referred_user_id: identity.user_id,
                referred_email: identity.email,
                referred_phone: identity.phone,
                attributed_at: now,
                expires_at: now + Duration::days(config.attribution_expiry_days),
                metadata: dto.metadata,
            })
            .await?;

        tracing::info!(
            attribution = %attribution.id,
            referrer = %attribution.referrer_user_id,
            "referral attributed via code {}",
            code.code
        );

        Ok(attribution)
    }

    /// Ties an attribution to an appointment at booking time. `Ok(None)`
    /// means no referral is in play for this booking. Matching prefers the
    /// explicit attribution id; otherwise the customer's identity tokens are
    /// matched against open attributions, oldest first.
    pub async fn attach_to_booking(
        &self,
        scope: TenantScope,
        dto: AttachBookingDto,
    ) -> Result<Option<Attribution>, ServiceError> {
        dto.validate()?;

        let config = self.config.get_config(scope).await?;
        let identity = Self::identity_from_booking(&dto);

        if let Some(id) = dto.attribution_id {
            let attribution = self
                .store
                .get_attribution(scope, id)
                .await?
                .ok_or_else(|| ServiceError::NotFound(format!("attribution {}", id)))?;
            return self
                .attach_explicit(scope, &config, attribution, &dto, &identity)
                .await
                .map(Some);
        }

        if identity.is_empty() {
            return Ok(None);
        }

        let now = Utc::now();
        let mut candidates = self.store.find_open_attributions(scope, &identity).await?;

        // Lazy expiry: stale open rows found here get flipped before matching.
        for stale in candidates.iter().filter(|a| a.is_expired(now)) {
            self.store
                .update_attribution_status(scope, stale.id, AttributionStatus::Expired, None)
                .await?;
        }
        candidates.retain(|a| !a.is_expired(now));

        // A row already booked for this appointment is an idempotent success.
        if let Some(existing) = candidates
            .iter()
            .find(|a| a.first_appointment_id == Some(dto.appointment_id))
        {
            return Ok(Some(existing.clone()));
        }

        let Some(open) = candidates
            .into_iter()
            .find(|a| a.status == AttributionStatus::Attributed)
        else {
            return Ok(None);
        };

        // A referrer booking for themselves never consumes their own referral.
        self.guard_booking_identity(scope, &config.anti_fraud, open.referrer_user_id, &identity)
            .await?;

        let attribution = self
            .store
            .set_attribution_booked(scope, open.id, dto.appointment_id, dto.customer_user_id)
            .await?;

        tracing::info!(
            attribution = %attribution.id,
            appointment = %dto.appointment_id,
            "referral attached to booking"
        );

        Ok(Some(attribution))
    }

    async fn attach_explicit(
        &self,
        scope: TenantScope,
        config: &ReferralProgramConfig,
        attribution: Attribution,
        dto: &AttachBookingDto,
        identity: &ReferredIdentity,
    ) -> Result<Attribution, ServiceError> {
        let now = Utc::now();

        if attribution.status.is_open() && attribution.is_expired(now) {
            self.store
                .update_attribution_status(scope, attribution.id, AttributionStatus::Expired, None)
                .await?;
            return Err(ServiceError::Expired);
        }

        self.guard_booking_identity(
            scope,
            &config.anti_fraud,
            attribution.referrer_user_id,
            identity,
        )
        .await?;

        match attribution.status {
            AttributionStatus::Attributed => Ok(self
                .store
                .set_attribution_booked(
                    scope,
                    attribution.id,
                    dto.appointment_id,
                    dto.customer_user_id,
                )
                .await?),
            AttributionStatus::Booked
                if attribution.first_appointment_id == Some(dto.appointment_id) =>
            {
                Ok(attribution)
            }
            AttributionStatus::Booked => Err(ServiceError::NotEligible(
                "referral is already attached to another booking".to_string(),
            )),
            _ => Err(ServiceError::NotEligible(format!(
                "referral is {:?} and cannot be attached",
                attribution.status
            ))),
        }
    }

    /// Booking cancelled or no-showed before completion: the attribution goes
    /// back to ATTRIBUTED so a later booking can pick it up, unless its window
    /// already passed, in which case it expires here.
    pub async fn on_booking_cancelled(
        &self,
        scope: TenantScope,
        appointment_id: Uuid,
    ) -> Result<Option<Attribution>, ServiceError> {
        let Some(attribution) = self
            .store
            .find_booked_by_appointment(scope, appointment_id)
            .await?
        else {
            return Ok(None);
        };

        let status = if attribution.is_expired(Utc::now()) {
            AttributionStatus::Expired
        } else {
            AttributionStatus::Attributed
        };

        let attribution = self
            .store
            .clear_attribution_booking(scope, attribution.id, status)
            .await?;

        tracing::info!(
            attribution = %attribution.id,
            appointment = %appointment_id,
            "booking cancelled, attribution now {:?}",
            attribution.status
        );

        Ok(Some(attribution))
    }

    /// The moment rewards become owed. Policy checks run first and terminate
    /// the attribution as VOIDED when they fail; on success the status flips
    /// and every ledger write lands in one atomic store step, so a concurrent
    /// replay sees no BOOKED row and does nothing.
    pub async fn on_booking_completed(
        &self,
        scope: TenantScope,
        dto: BookingCompletionDto,
    ) -> Result<CompletionOutcome, ServiceError> {
        let config = self.config.get_config(scope).await?;
        if !config.enabled {
            // Event-driven path: a disabled program swallows the event.
            return Ok(CompletionOutcome::NoAttribution);
        }

        dto.validate()?;

        let Some(attribution) = self
            .store
            .find_booked_by_appointment(scope, dto.appointment_id)
            .await?
        else {
            return Ok(CompletionOutcome::NoAttribution);
        };

        let now = Utc::now();
        if attribution.is_expired(now) {
            self.store
                .update_attribution_status(scope, attribution.id, AttributionStatus::Expired, None)
                .await?;
            return Ok(CompletionOutcome::Expired);
        }

        if let Some(reason) = self.policy_violation(scope, &config, &attribution, &dto).await? {
            self.store
                .update_attribution_status(
                    scope,
                    attribution.id,
                    AttributionStatus::Voided,
                    Some(json!({ "void_reason": reason.as_str() })),
                )
                .await?;
            tracing::info!(
                attribution = %attribution.id,
                "attribution voided at completion: {}",
                reason.as_str()
            );
            return Ok(CompletionOutcome::Voided { reason });
        }

        let referrer_reward = match &config.reward_referrer {
            Some(spec) => spec
                .resolve()?
                .map(|kind| RewardLedger::<S>::prepare_reward(&kind, Some(attribution.referrer_user_id)))
                .transpose()?,
            None => None,
        };
        // A referred reward needs a wallet or coupon owner; contact-only
        // referrals that never resolved to a user get nothing.
        let referred_reward = match (&config.reward_referred, attribution.referred_user_id) {
            (Some(spec), Some(referred)) => spec
                .resolve()?
                .map(|kind| RewardLedger::<S>::prepare_reward(&kind, Some(referred)))
                .transpose()?,
            _ => None,
        };

        let Some(issued) = self
            .store
            .apply_completion_rewards(
                scope,
                CompletionRewards {
                    attribution_id: attribution.id,
                    referrer_user_id: attribution.referrer_user_id,
                    referrer_reward,
                    referred_user_id: attribution.referred_user_id,
                    referred_reward,
                    metadata: json!({
                        "booking_amount": dto.amount,
                        "completed_appointment_id": dto.appointment_id,
                    }),
                },
            )
            .await?
        else {
            // Another worker got here first.
            return Ok(CompletionOutcome::NoAttribution);
        };

        tracing::info!(
            attribution = %issued.attribution.id,
            referrer = %issued.attribution.referrer_user_id,
            "referral rewarded"
        );

        self.send_reward_notifications(scope, &issued).await;

        Ok(CompletionOutcome::Rewarded { issued })
    }

    /// Admin reversal. VOIDED rows are an idempotent success; EXPIRED rows
    /// never held value and cannot be voided.
    pub async fn void_attribution(
        &self,
        scope: TenantScope,
        attribution_id: Uuid,
        reason: VoidReason,
    ) -> Result<(Attribution, VoidSummary), ServiceError> {
        let attribution = self
            .store
            .get_attribution(scope, attribution_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("attribution {}", attribution_id)))?;

        match attribution.status {
            AttributionStatus::Voided => Ok((attribution, VoidSummary::default())),
            AttributionStatus::Expired => Err(ServiceError::NotEligible(
                "an expired referral cannot be voided".to_string(),
            )),
            _ => {
                let (attribution, summary) = self
                    .store
                    .void_attribution_rewards(scope, attribution_id, reason.as_str())
                    .await?;
                tracing::info!(
                    attribution = %attribution.id,
                    reversed = summary.reversed_amount,
                    coupons = summary.coupons_deactivated,
                    "attribution voided: {}",
                    reason.as_str()
                );
                Ok((attribution, summary))
            }
        }
    }

    /// Referrer-facing listing, newest first, in the response shape.
    pub async fn list_referrals(
        &self,
        scope: TenantScope,
        referrer_user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<AttributionResponseDto>, ServiceError> {
        let rows = self
            .store
            .list_attributions_for_referrer(scope, referrer_user_id, limit, offset)
            .await?;
        Ok(rows.iter().map(AttributionResponseDto::from).collect())
    }

    pub async fn get_overview(&self, scope: TenantScope) -> Result<ReferralOverview, ServiceError> {
        Ok(self.store.referral_overview(scope).await?)
    }

    /// The booking's customer must not be the referrer, by user id or by the
    /// contact tokens the booking arrived with.
    async fn guard_booking_identity(
        &self,
        scope: TenantScope,
        settings: &AntiFraudSettings,
        referrer_user_id: Uuid,
        identity: &ReferredIdentity,
    ) -> Result<(), ServiceError> {
        if identity.is_empty() {
            return Ok(());
        }
        match self.store.get_user_profile(scope, referrer_user_id).await? {
            Some(referrer) => {
                if anti_fraud::is_self_referral(settings, &referrer, identity) {
                    return Err(ServiceError::SelfReferral);
                }
            }
            // No profile to compare contacts against; the user-id rule still
            // applies.
            None => {
                if settings.block_self_by_user && identity.user_id == Some(referrer_user_id) {
                    return Err(ServiceError::SelfReferral);
                }
            }
        }
        Ok(())
    }

    async fn policy_violation(
        &self,
        scope: TenantScope,
        config: &ReferralProgramConfig,
        attribution: &Attribution,
        dto: &BookingCompletionDto,
    ) -> Result<Option<VoidReason>, ServiceError> {
        if !config.service_allowed(dto.service_id) {
            return Ok(Some(VoidReason::ServiceNotAllowed));
        }

        if config.new_customer_only {
            let identity = ReferredIdentity {
                user_id: attribution.referred_user_id,
                email: attribution.referred_email.clone(),
                phone: attribution.referred_phone.clone(),
            };
            if self
                .store
                .has_prior_completed_appointment(scope, &identity, Some(dto.appointment_id))
                .await?
            {
                return Ok(Some(VoidReason::NotNewCustomer));
            }
        }

        if config.monthly_max_rewards_per_referrer > 0 {
            let rewarded = self
                .store
                .count_rewarded_since(
                    scope,
                    attribution.referrer_user_id,
                    start_of_month(Utc::now()),
                )
                .await?;
            if rewarded >= config.monthly_max_rewards_per_referrer {
                return Ok(Some(VoidReason::MonthlyLimit));
            }
        }

        Ok(None)
    }

    async fn send_reward_notifications(&self, scope: TenantScope, issued: &IssuedRewards) {
        let attribution = &issued.attribution;

        if issued.referrer_txn.is_some() || issued.referrer_coupon.is_some() {
            if let Err(err) = self
                .notifications
                .notify_reward_unlocked(
                    scope,
                    attribution.referrer_user_id,
                    attribution.id,
                    "Your referral completed their first visit. Your reward is in your wallet.",
                )
                .await
            {
                tracing::warn!("failed to notify referrer: {}", err);
            }
        }

        if issued.referred_txn.is_some() || issued.referred_coupon.is_some() {
            if let Some(referred) = attribution.referred_user_id {
                if let Err(err) = self
                    .notifications
                    .notify_reward_unlocked(
                        scope,
                        referred,
                        attribution.id,
                        "Welcome! Your referral reward has been applied to your account.",
                    )
                    .await
                {
                    tracing::warn!("failed to notify referred customer: {}", err);
                }
            }
        }
    }

    fn identity_from_attribute(dto: &AttributeReferralDto) -> ReferredIdentity {
        let explicit = ReferredIdentity {
            user_id: dto.referred_user_id,
            email: dto
                .referred_email
                .as_deref()
                .and_then(anti_fraud::normalize_email),
            phone: dto
                .referred_phone
                .as_deref()
                .and_then(anti_fraud::normalize_phone),
        };
        match dto.contact.as_deref() {
            Some(contact) => explicit.merged_with(&parse_contact(contact)),
            None => explicit,
        }
    }

    fn identity_from_booking(dto: &AttachBookingDto) -> ReferredIdentity {
        ReferredIdentity {
            user_id: dto.customer_user_id,
            email: dto
                .customer_email
                .as_deref()
                .and_then(anti_fraud::normalize_email),
            phone: dto
                .customer_phone
                .as_deref()
                .and_then(anti_fraud::normalize_phone),
        }
    }
}

fn start_of_month(now: DateTime<Utc>) -> DateTime<Utc> {
    let first = now.date_naive().with_day(1).unwrap_or(now.date_naive());
    match first.and_hms_opt(0, 0, 0) {
        Some(naive) => DateTime::from_naive_utc_and_offset(naive, Utc),
        None => now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn start_of_month_truncates_to_the_first() {
        let now = Utc.with_ymd_and_hms(2025, 3, 17, 14, 30, 5).unwrap();
        let start = start_of_month(now);
        assert_eq!(start, Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn identity_merges_explicit_and_contact_tokens() {
        let dto = AttributeReferralDto {
            code: "ABC123X9".to_string(),
            referred_email: Some("Explicit@Example.com".to_string()),
            contact: Some("Jane <jane@example.com> +1 555 010 0300".to_string()),
            ..Default::default()
        };
        let identity = AttributionEngine::<crate::db::MemStore>::identity_from_attribute(&dto);
        // Explicit tokens win; the contact string only fills gaps.
        assert_eq!(identity.email.as_deref(), Some("explicit@example.com"));
        assert_eq!(identity.phone.as_deref(), Some("15550100300"));
    }
}

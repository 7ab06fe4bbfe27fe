// db/referraldb.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use super::db::DBClient;
use super::StoreError;
use crate::models::referralmodel::*;
use crate::models::TenantScope;

#[async_trait]
pub trait ReferralExt {
    // Referral codes
    async fn get_code_for_owner(
        &self,
        scope: TenantScope,
        owner_user_id: Uuid,
    ) -> Result<Option<ReferralCode>, StoreError>;

    /// Fails with `StoreError::Conflict` when the token already exists within
    /// the tenant, so the registry can retry with a fresh token.
    async fn insert_code(
        &self,
        scope: TenantScope,
        owner_user_id: Uuid,
        code: &str,
    ) -> Result<ReferralCode, StoreError>;

    async fn get_code_by_token(
        &self,
        scope: TenantScope,
        code: &str,
    ) -> Result<Option<ReferralCode>, StoreError>;

    // Attributions
    async fn insert_attribution(&self, new: NewAttribution) -> Result<Attribution, StoreError>;

    async fn get_attribution(
        &self,
        scope: TenantScope,
        id: Uuid,
    ) -> Result<Option<Attribution>, StoreError>;

    /// All attributions in an open state (ATTRIBUTED/BOOKED) matching any of
    /// the supplied identity tokens. Expiry is the caller's concern.
    async fn find_open_attributions(
        &self,
        scope: TenantScope,
        identity: &ReferredIdentity,
    ) -> Result<Vec<Attribution>, StoreError>;

    async fn find_booked_by_appointment(
        &self,
        scope: TenantScope,
        appointment_id: Uuid,
    ) -> Result<Option<Attribution>, StoreError>;

    async fn update_attribution_status(
        &self,
        scope: TenantScope,
        id: Uuid,
        status: AttributionStatus,
        metadata: Option<serde_json::Value>,
    ) -> Result<Attribution, StoreError>;

    async fn set_attribution_booked(
        &self,
        scope: TenantScope,
        id: Uuid,
        appointment_id: Uuid,
        referred_user_id: Option<Uuid>,
    ) -> Result<Attribution, StoreError>;

    async fn clear_attribution_booking(
        &self,
        scope: TenantScope,
        id: Uuid,
        status: AttributionStatus,
    ) -> Result<Attribution, StoreError>;

    async fn count_rewarded_since(
        &self,
        scope: TenantScope,
        referrer_user_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<i64, StoreError>;

    async fn list_attributions_for_referrer(
        &self,
        scope: TenantScope,
        referrer_user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Attribution>, StoreError>;

    async fn referral_overview(&self, scope: TenantScope) -> Result<ReferralOverview, StoreError>;

    /// Whether the identity already completed an appointment in this scope,
    /// ignoring the appointment currently being processed. Backs the
    /// new-customer-only policy.
    async fn has_prior_completed_appointment(
        &self,
        scope: TenantScope,
        identity: &ReferredIdentity,
        exclude_appointment: Option<Uuid>,
    ) -> Result<bool, StoreError>;
}

#[async_trait]
impl ReferralExt for DBClient {
    async fn get_code_for_owner(
        &self,
        scope: TenantScope,
        owner_user_id: Uuid,
    ) -> Result<Option<ReferralCode>, StoreError> {
        let code = sqlx::query_as::<_, ReferralCode>(
            r#"
            SELECT id, tenant_id, location_id, owner_user_id, code, is_active, created_at
            FROM referral_codes
            WHERE tenant_id = $1 AND location_id = $2 AND owner_user_id = $3
            "#,
        )
        .bind(scope.tenant_id)
        .bind(scope.location_id)
        .bind(owner_user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(code)
    }

    async fn insert_code(
        &self,
        scope: TenantScope,
        owner_user_id: Uuid,
        code: &str,
    ) -> Result<ReferralCode, StoreError> {
        let result = sqlx::query_as::<_, ReferralCode>(
            r#"
            INSERT INTO referral_codes (tenant_id, location_id, owner_user_id, code)
            VALUES ($1, $2, $3, $4)
            RETURNING id, tenant_id, location_id, owner_user_id, code, is_active, created_at
            "#,
        )
        .bind(scope.tenant_id)
        .bind(scope.location_id)
        .bind(owner_user_id)
        .bind(code)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(row) => Ok(row),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(StoreError::Conflict(format!("referral code {} already exists", code)))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn get_code_by_token(
        &self,
        scope: TenantScope,
        code: &str,
    ) -> Result<Option<ReferralCode>, StoreError> {
        let code = sqlx::query_as::<_, ReferralCode>(
            r#"
            SELECT id, tenant_id, location_id, owner_user_id, code, is_active, created_at
            FROM referral_codes
            WHERE tenant_id = $1 AND location_id = $2 AND code = $3
            "#,
        )
        .bind(scope.tenant_id)
        .bind(scope.location_id)
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;

        Ok(code)
    }

    async fn insert_attribution(&self, new: NewAttribution) -> Result<Attribution, StoreError> {
        let attribution = sqlx::query_as::<_, Attribution>(
            r#"
            INSERT INTO referral_attributions
                (tenant_id, location_id, code_id, referrer_user_id, referred_user_id,
                 referred_email, referred_phone, status, attributed_at, expires_at, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'attributed'::attribution_status, $8, $9, $10)
            RETURNING
                id, tenant_id, location_id, code_id, referrer_user_id, referred_user_id,
                referred_email, referred_phone, status, attributed_at, expires_at,
                first_appointment_id, metadata, created_at, updated_at
            "#,
        )
        .bind(new.scope.tenant_id)
        .bind(new.scope.location_id)
        .bind(new.code_id)
        .bind(new.referrer_user_id)
        .bind(new.referred_user_id)
        .bind(new.referred_email)
        .bind(new.referred_phone)
        .bind(new.attributed_at)
        .bind(new.expires_at)
        .bind(new.metadata)
        .fetch_one(&self.pool)
        .await?;

        Ok(attribution)
    }

    async fn get_attribution(
        &self,
        scope: TenantScope,
        id: Uuid,
    ) -> Result<Option<Attribution>, StoreError> {
        let attribution = sqlx::query_as::<_, Attribution>(
            r#"
            SELECT
                id, tenant_id, location_id, code_id, referrer_user_id, referred_user_id,
                referred_email, referred_phone, status, attributed_at, expires_at,
                first_appointment_id, metadata, created_at, updated_at
            FROM referral_attributions
            WHERE tenant_id = $1 AND location_id = $2 AND id = $3
            "#,
        )
        .bind(scope.tenant_id)
        .bind(scope.location_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(attribution)
    }

    async fn find_open_attributions(
        &self,
        scope: TenantScope,
        identity: &ReferredIdentity,
    ) -> Result<Vec<Attribution>, StoreError> {
        if identity.is_empty() {
            return Ok(Vec::new());
        }

        let attributions = sqlx::query_as::<_, Attribution>(
            r#"
            SELECT
                id, tenant_id, location_id, code_id, referrer_user_id, referred_user_id,
                referred_email, referred_phone, status, attributed_at, expires_at,
                first_appointment_id, metadata, created_at, updated_at
            FROM referral_attributions
            WHERE tenant_id = $1 AND location_id = $2
              AND status IN ('attributed'::attribution_status, 'booked'::attribution_status)
              AND (
                    ($3::uuid IS NOT NULL AND referred_user_id = $3)
                 OR ($4::text IS NOT NULL AND referred_email = $4)
                 OR ($5::text IS NOT NULL AND referred_phone = $5)
              )
            ORDER BY attributed_at ASC
            "#,
        )
        .bind(scope.tenant_id)
        .bind(scope.location_id)
        .bind(identity.user_id)
        .bind(identity.email.as_deref())
        .bind(identity.phone.as_deref())
        .fetch_all(&self.pool)
        .await?;

        Ok(attributions)
    }

    async fn find_booked_by_appointment(
        &self,
        scope: TenantScope,
        appointment_id: Uuid,
    ) -> Result<Option<Attribution>, StoreError> {
        let attribution = sqlx::query_as::<_, Attribution>(
            r#"
            SELECT
                id, tenant_id, location_id, code_id, referrer_user_id, referred_user_id,
                referred_email, referred_phone, status, attributed_at, expires_at,
                first_appointment_id, metadata, created_at, updated_at
            FROM referral_attributions
            WHERE tenant_id = $1 AND location_id = $2
              AND status = 'booked'::attribution_status
              AND first_appointment_id = $3
            "#,
        )
        .bind(scope.tenant_id)
        .bind(scope.location_id)
        .bind(appointment_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(attribution)
    }

    async fn update_attribution_status(
        &self,
        scope: TenantScope,
        id: Uuid,
        status: AttributionStatus,
        metadata: Option<serde_json::Value>,
    ) -> Result<Attribution, StoreError> {
        let attribution = sqlx::query_as::<_, Attribution>(
            r#"
            UPDATE referral_attributions
            SET status = $4,
                metadata = COALESCE(metadata, '{}'::jsonb) || COALESCE($5, '{}'::jsonb),
                updated_at = NOW()
            WHERE tenant_id = $1 AND location_id = $2 AND id = $3
            RETURNING
                id, tenant_id, location_id, code_id, referrer_user_id, referred_user_id,
                referred_email, referred_phone, status, attributed_at, expires_at,
                first_appointment_id, metadata, created_at, updated_at
            "#,
        )
        .bind(scope.tenant_id)
        .bind(scope.location_id)
        .bind(id)
        .bind(status)
        .bind(metadata)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound("attribution"))?;

        Ok(attribution)
    }

    async fn set_attribution_booked(
        &self,
        scope: TenantScope,
        id: Uuid,
        appointment_id: Uuid,
        referred_user_id: Option<Uuid>,
    ) -> Result<Attribution, StoreError> {
        let attribution = sqlx::query_as::<_, Attribution>(
            r#"
            UPDATE referral_attributions
            SET status = 'booked'::attribution_status,
                first_appointment_id = $4,
                referred_user_id = COALESCE(referred_user_id, $5),
                updated_at = NOW()
            WHERE tenant_id = $1 AND location_id = $2 AND id = $3
            RETURNING
                id, tenant_id, location_id, code_id, referrer_user_id, referred_user_id,
                referred_email, referred_phone, status, attributed_at, expires_at,
                first_appointment_id, metadata, created_at, updated_at
            "#,
        )
        .bind(scope.tenant_id)
        .bind(scope.location_id)
        .bind(id)
        .bind(appointment_id)
        .bind(referred_user_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound("attribution"))?;

        Ok(attribution)
    }

    async fn clear_attribution_booking(
        &self,
        scope: TenantScope,
        id: Uuid,
        status: AttributionStatus,
    ) -> Result<Attribution, StoreError> {
        let attribution = sqlx::query_as::<_, Attribution>(
            r#"
            UPDATE referral_attributions
            SET status = $4,
                first_appointment_id = NULL,
                updated_at = NOW()
            WHERE tenant_id = $1 AND location_id = $2 AND id = $3
            RETURNING
                id, tenant_id, location_id, code_id, referrer_user_id, referred_user_id,
                referred_email, referred_phone, status, attributed_at, expires_at,
                first_appointment_id, metadata, created_at, updated_at
            "#,
        )
        .bind(scope.tenant_id)
        .bind(scope.location_id)
        .bind(id)
        .bind(status)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound("attribution"))?;

        Ok(attribution)
    }

    async fn count_rewarded_since(
        &self,
        scope: TenantScope,
        referrer_user_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS count
            FROM referral_attributions
            WHERE tenant_id = $1 AND location_id = $2
              AND referrer_user_id = $3
              AND status = 'rewarded'::attribution_status
              AND updated_at >= $4
            "#,
        )
        .bind(scope.tenant_id)
        .bind(scope.location_id)
        .bind(referrer_user_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get::<i64, _>("count"))
    }

    async fn list_attributions_for_referrer(
        &self,
        scope: TenantScope,
        referrer_user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Attribution>, StoreError> {
        let attributions = sqlx::query_as::<_, Attribution>(
            r#"
            SELECT
                id, tenant_id, location_id, code_id, referrer_user_id, referred_user_id,
                referred_email, referred_phone, status, attributed_at, expires_at,
                first_appointment_id, metadata, created_at, updated_at
            FROM referral_attributions
            WHERE tenant_id = $1 AND location_id = $2 AND referrer_user_id = $3
            ORDER BY attributed_at DESC
            LIMIT $4 OFFSET $5
            "#,
        )
        .bind(scope.tenant_id)
        .bind(scope.location_id)
        .bind(referrer_user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(attributions)
    }

    async fn referral_overview(&self, scope: TenantScope) -> Result<ReferralOverview, StoreError> {
        let mut overview = ReferralOverview::default();

        let status_rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS count
            FROM referral_attributions
            WHERE tenant_id = $1 AND location_id = $2
            GROUP BY status
            "#,
        )
        .bind(scope.tenant_id)
        .bind(scope.location_id)
        .fetch_all(&self.pool)
        .await?;

        for row in status_rows {
            let status = row.get::<AttributionStatus, _>("status");
            let count = row.get::<i64, _>("count");
            overview.total += count;
            match status {
                AttributionStatus::Attributed => overview.attributed = count,
                AttributionStatus::Booked => overview.booked = count,
                AttributionStatus::Completed => overview.completed = count,
                AttributionStatus::Rewarded => overview.rewarded = count,
                AttributionStatus::Voided => overview.voided = count,
                AttributionStatus::Expired => overview.expired = count,
            }
        }

        let revenue_row = sqlx::query(
            r#"
            SELECT COALESCE(SUM((metadata->>'booking_amount')::bigint), 0) AS revenue
            FROM referral_attributions
            WHERE tenant_id = $1 AND location_id = $2
              AND status = 'rewarded'::attribution_status
              AND metadata ? 'booking_amount'
            "#,
        )
        .bind(scope.tenant_id)
        .bind(scope.location_id)
        .fetch_one(&self.pool)
        .await?;
        overview.attributed_revenue = revenue_row.get::<i64, _>("revenue");

        let rewards_row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(amount), 0) AS total
            FROM reward_transactions
            WHERE tenant_id = $1 AND location_id = $2
              AND txn_type = 'credit'::reward_transaction_type
              AND status = 'confirmed'::reward_transaction_status
              AND referral_attribution_id IS NOT NULL
            "#,
        )
        .bind(scope.tenant_id)
        .bind(scope.location_id)
        .fetch_one(&self.pool)
        .await?;
        overview.total_rewards_paid = rewards_row.get::<i64, _>("total");

        let top_rows = sqlx::query(
            r#"
            SELECT referrer_user_id, COUNT(*) AS rewarded_count
            FROM referral_attributions
            WHERE tenant_id = $1 AND location_id = $2
              AND status = 'rewarded'::attribution_status
            GROUP BY referrer_user_id
            ORDER BY rewarded_count DESC
            LIMIT 5
            "#,
        )
        .bind(scope.tenant_id)
        .bind(scope.location_id)
        .fetch_all(&self.pool)
        .await?;

        overview.top_referrers = top_rows
            .into_iter()
            .map(|row| TopReferrer {
                user_id: row.get::<Uuid, _>("referrer_user_id"),
                rewarded_count: row.get::<i64, _>("rewarded_count"),
            })
            .collect();

        Ok(overview)
    }

    async fn has_prior_completed_appointment(
        &self,
        scope: TenantScope,
        identity: &ReferredIdentity,
        exclude_appointment: Option<Uuid>,
    ) -> Result<bool, StoreError> {
        if identity.is_empty() {
            return Ok(false);
        }

        let row = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1
                FROM appointments
                WHERE tenant_id = $1 AND location_id = $2
                  AND status = 'completed'
                  AND ($3::uuid IS NULL OR id <> $3)
                  AND (
                        ($4::uuid IS NOT NULL AND customer_user_id = $4)
                     OR ($5::text IS NOT NULL AND LOWER(customer_email) = $5)
                     OR ($6::text IS NOT NULL AND customer_phone = $6)
                  )
            ) AS found
            "#,
        )
        .bind(scope.tenant_id)
        .bind(scope.location_id)
        .bind(exclude_appointment)
        .bind(identity.user_id)
        .bind(identity.email.as_deref())
        .bind(identity.phone.as_deref())
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get::<bool, _>("found"))
    }
}

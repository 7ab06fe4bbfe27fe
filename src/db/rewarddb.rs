// db/rewarddb.rs
use async_trait::async_trait;
use sqlx::{Postgres, Row, Transaction};
use uuid::Uuid;

use super::db::DBClient;
use super::StoreError;
use crate::models::referralmodel::Attribution;
use crate::models::rewardmodels::*;
use crate::models::TenantScope;

#[async_trait]
pub trait RewardLedgerExt {
    // Wallets
    async fn ensure_wallet(&self, scope: TenantScope, user_id: Uuid)
        -> Result<Wallet, StoreError>;
    async fn get_wallet(
        &self,
        scope: TenantScope,
        user_id: Uuid,
    ) -> Result<Option<Wallet>, StoreError>;

    // Hold protocol
    async fn insert_hold(
        &self,
        scope: TenantScope,
        user_id: Uuid,
        appointment_id: Uuid,
        amount: i64,
        description: &str,
    ) -> Result<RewardTransaction, StoreError>;

    /// Flips every PENDING HOLD for the appointment to CONFIRMED, writes a
    /// CONFIRMED DEBIT of the same amount and decrements the wallet, all in
    /// one transaction. Returns the total debited; re-running finds no
    /// pending holds and debits nothing.
    async fn confirm_holds(
        &self,
        scope: TenantScope,
        appointment_id: Uuid,
    ) -> Result<i64, StoreError>;

    /// Flips every PENDING HOLD for the appointment to CANCELLED and writes a
    /// CONFIRMED RELEASE row. No balance change. Returns the release count.
    async fn release_holds(
        &self,
        scope: TenantScope,
        appointment_id: Uuid,
    ) -> Result<i64, StoreError>;

    async fn pending_hold_total(
        &self,
        scope: TenantScope,
        user_id: Uuid,
    ) -> Result<i64, StoreError>;

    // Reward issuance
    async fn credit_wallet(
        &self,
        scope: TenantScope,
        user_id: Uuid,
        amount: i64,
        attribution_id: Option<Uuid>,
        description: &str,
    ) -> Result<RewardTransaction, StoreError>;

    async fn issue_coupon(
        &self,
        scope: TenantScope,
        user_id: Uuid,
        new: NewCoupon,
        attribution_id: Option<Uuid>,
        description: &str,
    ) -> Result<(Coupon, RewardTransaction), StoreError>;

    /// The completion path's single atomic step: BOOKED -> COMPLETED ->
    /// REWARDED plus every ledger write. Returns `None` when the attribution
    /// is no longer BOOKED, which makes replays a no-op.
    async fn apply_completion_rewards(
        &self,
        scope: TenantScope,
        rewards: CompletionRewards,
    ) -> Result<Option<IssuedRewards>, StoreError>;

    /// Reverses every confirmed reward tied to the attribution with
    /// compensating ADJUSTMENT rows, deactivates issued coupons and flips the
    /// attribution to VOIDED, all in one transaction. Original rows survive.
    async fn void_attribution_rewards(
        &self,
        scope: TenantScope,
        attribution_id: Uuid,
        reason: &str,
    ) -> Result<(Attribution, VoidSummary), StoreError>;

    // Coupons
    async fn get_coupon(
        &self,
        scope: TenantScope,
        coupon_id: Uuid,
    ) -> Result<Option<Coupon>, StoreError>;

    /// Speculatively increments `used_count` and writes a PENDING COUPON_USED
    /// row. Fails with `Conflict` when the coupon is inactive or exhausted.
    async fn reserve_coupon_usage(
        &self,
        scope: TenantScope,
        user_id: Uuid,
        coupon_id: Uuid,
        appointment_id: Uuid,
    ) -> Result<RewardTransaction, StoreError>;

    async fn confirm_coupon_usage(
        &self,
        scope: TenantScope,
        appointment_id: Uuid,
    ) -> Result<i64, StoreError>;

    /// Flips PENDING COUPON_USED rows to CANCELLED and gives the uses back.
    async fn cancel_coupon_usage(
        &self,
        scope: TenantScope,
        appointment_id: Uuid,
    ) -> Result<i64, StoreError>;

    // Summaries
    async fn transactions_for_user(
        &self,
        scope: TenantScope,
        user_id: Uuid,
        limit: i64,
    ) -> Result<Vec<RewardTransaction>, StoreError>;

    async fn active_coupons_for_user(
        &self,
        scope: TenantScope,
        user_id: Uuid,
    ) -> Result<Vec<Coupon>, StoreError>;
}

const TXN_COLUMNS: &str = r#"
    id, tenant_id, location_id, user_id, txn_type, status, amount,
    appointment_id, coupon_id, referral_attribution_id, description,
    created_at, updated_at
"#;

const COUPON_COLUMNS: &str = r#"
    id, tenant_id, location_id, owner_user_id, discount_type, discount_value,
    service_id, is_active, max_uses, used_count, valid_from, valid_to, created_at
"#;

#[allow(clippy::too_many_arguments)]
async fn insert_txn_row(
    tx: &mut Transaction<'_, Postgres>,
    scope: TenantScope,
    user_id: Uuid,
    txn_type: RewardTransactionType,
    status: RewardTransactionStatus,
    amount: Option<i64>,
    appointment_id: Option<Uuid>,
    coupon_id: Option<Uuid>,
    attribution_id: Option<Uuid>,
    description: &str,
) -> Result<RewardTransaction, sqlx::Error> {
    sqlx::query_as::<_, RewardTransaction>(&format!(
        r#"
        INSERT INTO reward_transactions
            (tenant_id, location_id, user_id, txn_type, status, amount,
             appointment_id, coupon_id, referral_attribution_id, description)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        RETURNING {TXN_COLUMNS}
        "#
    ))
    .bind(scope.tenant_id)
    .bind(scope.location_id)
    .bind(user_id)
    .bind(txn_type)
    .bind(status)
    .bind(amount)
    .bind(appointment_id)
    .bind(coupon_id)
    .bind(attribution_id)
    .bind(description)
    .fetch_one(&mut **tx)
    .await
}

/// Get-or-create the wallet row inside the surrounding transaction, then move
/// its balance by `delta`.
async fn move_wallet_balance(
    tx: &mut Transaction<'_, Postgres>,
    scope: TenantScope,
    user_id: Uuid,
    delta: i64,
) -> Result<Wallet, sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO reward_wallets (tenant_id, location_id, user_id)
        VALUES ($1, $2, $3)
        ON CONFLICT (tenant_id, location_id, user_id) DO NOTHING
        "#,
    )
    .bind(scope.tenant_id)
    .bind(scope.location_id)
    .bind(user_id)
    .execute(&mut **tx)
    .await?;

    sqlx::query_as::<_, Wallet>(
        r#"
        UPDATE reward_wallets
        SET balance = balance + $4, updated_at = NOW()
        WHERE tenant_id = $1 AND location_id = $2 AND user_id = $3
        RETURNING id, tenant_id, location_id, user_id, balance, created_at, updated_at
        "#,
    )
    .bind(scope.tenant_id)
    .bind(scope.location_id)
    .bind(user_id)
    .bind(delta)
    .fetch_one(&mut **tx)
    .await
}

async fn insert_coupon_row(
    tx: &mut Transaction<'_, Postgres>,
    scope: TenantScope,
    new: &NewCoupon,
) -> Result<Coupon, sqlx::Error> {
    sqlx::query_as::<_, Coupon>(&format!(
        r#"
        INSERT INTO coupons
            (tenant_id, location_id, owner_user_id, discount_type, discount_value,
             service_id, max_uses, valid_from, valid_to)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        RETURNING {COUPON_COLUMNS}
        "#
    ))
    .bind(scope.tenant_id)
    .bind(scope.location_id)
    .bind(new.owner_user_id)
    .bind(new.discount_type)
    .bind(new.discount_value)
    .bind(new.service_id)
    .bind(new.max_uses)
    .bind(new.valid_from)
    .bind(new.valid_to)
    .fetch_one(&mut **tx)
    .await
}

/// Applies one prepared reward for one user inside the transaction. Returns
/// the ledger row plus the coupon when one was created.
async fn apply_prepared_reward(
    tx: &mut Transaction<'_, Postgres>,
    scope: TenantScope,
    user_id: Uuid,
    reward: &PreparedReward,
    attribution_id: Uuid,
    description: &str,
) -> Result<(RewardTransaction, Option<Coupon>), sqlx::Error> {
    match reward {
        PreparedReward::Credit { amount } => {
            move_wallet_balance(tx, scope, user_id, *amount).await?;
            let txn = insert_txn_row(
                tx,
                scope,
                user_id,
                RewardTransactionType::Credit,
                RewardTransactionStatus::Confirmed,
                Some(*amount),
                None,
                None,
                Some(attribution_id),
                description,
            )
            .await?;
            Ok((txn, None))
        }
        PreparedReward::Coupon(new) => {
            let coupon = insert_coupon_row(tx, scope, new).await?;
            let txn = insert_txn_row(
                tx,
                scope,
                user_id,
                RewardTransactionType::CouponIssued,
                RewardTransactionStatus::Confirmed,
                None,
                None,
                Some(coupon.id),
                Some(attribution_id),
                description,
            )
            .await?;
            Ok((txn, Some(coupon)))
        }
    }
}

#[async_trait]
impl RewardLedgerExt for DBClient {
    async fn ensure_wallet(
        &self,
        scope: TenantScope,
        user_id: Uuid,
    ) -> Result<Wallet, StoreError> {
        sqlx::query(
            r#"
            INSERT INTO reward_wallets (tenant_id, location_id, user_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (tenant_id, location_id, user_id) DO NOTHING
            "#,
        )
        .bind(scope.tenant_id)
        .bind(scope.location_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        let wallet = sqlx::query_as::<_, Wallet>(
            r#"
            SELECT id, tenant_id, location_id, user_id, balance, created_at, updated_at
            FROM reward_wallets
            WHERE tenant_id = $1 AND location_id = $2 AND user_id = $3
            "#,
        )
        .bind(scope.tenant_id)
        .bind(scope.location_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(wallet)
    }

    async fn get_wallet(
        &self,
        scope: TenantScope,
        user_id: Uuid,
    ) -> Result<Option<Wallet>, StoreError> {
        let wallet = sqlx::query_as::<_, Wallet>(
            r#"
            SELECT id, tenant_id, location_id, user_id, balance, created_at, updated_at
            FROM reward_wallets
            WHERE tenant_id = $1 AND location_id = $2 AND user_id = $3
            "#,
        )
        .bind(scope.tenant_id)
        .bind(scope.location_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(wallet)
    }

    async fn insert_hold(
        &self,
        scope: TenantScope,
        user_id: Uuid,
        appointment_id: Uuid,
        amount: i64,
        description: &str,
    ) -> Result<RewardTransaction, StoreError> {
        let mut tx = self.pool.begin().await?;
        let hold = insert_txn_row(
            &mut tx,
            scope,
            user_id,
            RewardTransactionType::Hold,
            RewardTransactionStatus::Pending,
            Some(amount),
            Some(appointment_id),
            None,
            None,
            description,
        )
        .await?;
        tx.commit().await?;
        Ok(hold)
    }

    async fn confirm_holds(
        &self,
        scope: TenantScope,
        appointment_id: Uuid,
    ) -> Result<i64, StoreError> {
        let mut tx = self.pool.begin().await?;

        let holds = sqlx::query_as::<_, RewardTransaction>(&format!(
            r#"
            SELECT {TXN_COLUMNS}
            FROM reward_transactions
            WHERE tenant_id = $1 AND location_id = $2
              AND appointment_id = $3
              AND txn_type = 'hold'::reward_transaction_type
              AND status = 'pending'::reward_transaction_status
            FOR UPDATE
            "#
        ))
        .bind(scope.tenant_id)
        .bind(scope.location_id)
        .bind(appointment_id)
        .fetch_all(&mut *tx)
        .await?;

        let mut total = 0i64;
        for hold in &holds {
            let amount = hold.amount.unwrap_or(0);

            sqlx::query(
                r#"
                UPDATE reward_transactions
                SET status = 'confirmed'::reward_transaction_status, updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(hold.id)
            .execute(&mut *tx)
            .await?;

            insert_txn_row(
                &mut tx,
                scope,
                hold.user_id,
                RewardTransactionType::Debit,
                RewardTransactionStatus::Confirmed,
                Some(amount),
                Some(appointment_id),
                None,
                None,
                &format!("debit for confirmed hold {}", hold.id),
            )
            .await?;

            move_wallet_balance(&mut tx, scope, hold.user_id, -amount).await?;
            total += amount;
        }

        tx.commit().await?;
        Ok(total)
    }

    async fn release_holds(
        &self,
        scope: TenantScope,
        appointment_id: Uuid,
    ) -> Result<i64, StoreError> {
        let mut tx = self.pool.begin().await?;

        let holds = sqlx::query_as::<_, RewardTransaction>(&format!(
            r#"
            SELECT {TXN_COLUMNS}
            FROM reward_transactions
            WHERE tenant_id = $1 AND location_id = $2
              AND appointment_id = $3
              AND txn_type = 'hold'::reward_transaction_type
              AND status = 'pending'::reward_transaction_status
            FOR UPDATE
            "#
        ))
        .bind(scope.tenant_id)
        .bind(scope.location_id)
        .bind(appointment_id)
        .fetch_all(&mut *tx)
        .await?;

        let mut released = 0i64;
        for hold in &holds {
            sqlx::query(
                r#"
                UPDATE reward_transactions
                SET status = 'cancelled'::reward_transaction_status, updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(hold.id)
            .execute(&mut *tx)
            .await?;

            if hold.amount.unwrap_or(0) > 0 {
                insert_txn_row(
                    &mut tx,
                    scope,
                    hold.user_id,
                    RewardTransactionType::Release,
                    RewardTransactionStatus::Confirmed,
                    hold.amount,
                    Some(appointment_id),
                    None,
                    None,
                    &format!("release of hold {}", hold.id),
                )
                .await?;
            }
            released += 1;
        }

        tx.commit().await?;
        Ok(released)
    }

    async fn pending_hold_total(
        &self,
        scope: TenantScope,
        user_id: Uuid,
    ) -> Result<i64, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(amount), 0) AS total
            FROM reward_transactions
            WHERE tenant_id = $1 AND location_id = $2
              AND user_id = $3
              AND txn_type = 'hold'::reward_transaction_type
              AND status = 'pending'::reward_transaction_status
            "#,
        )
        .bind(scope.tenant_id)
        .bind(scope.location_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get::<i64, _>("total"))
    }

    async fn credit_wallet(
        &self,
        scope: TenantScope,
        user_id: Uuid,
        amount: i64,
        attribution_id: Option<Uuid>,
        description: &str,
    ) -> Result<RewardTransaction, StoreError> {
        let mut tx = self.pool.begin().await?;
        move_wallet_balance(&mut tx, scope, user_id, amount).await?;
        let txn = insert_txn_row(
            &mut tx,
            scope,
            user_id,
            RewardTransactionType::Credit,
            RewardTransactionStatus::Confirmed,
            Some(amount),
            None,
            None,
            attribution_id,
            description,
        )
        .await?;
        tx.commit().await?;
        Ok(txn)
    }

    async fn issue_coupon(
        &self,
        scope: TenantScope,
        user_id: Uuid,
        new: NewCoupon,
        attribution_id: Option<Uuid>,
        description: &str,
    ) -> Result<(Coupon, RewardTransaction), StoreError> {
        let mut tx = self.pool.begin().await?;
        let coupon = insert_coupon_row(&mut tx, scope, &new).await?;
        let txn = insert_txn_row(
            &mut tx,
            scope,
            user_id,
            RewardTransactionType::CouponIssued,
            RewardTransactionStatus::Confirmed,
            None,
            None,
            Some(coupon.id),
            attribution_id,
            description,
        )
        .await?;
        tx.commit().await?;
        Ok((coupon, txn))
    }

    async fn apply_completion_rewards(
        &self,
        scope: TenantScope,
        rewards: CompletionRewards,
    ) -> Result<Option<IssuedRewards>, StoreError> {
        let mut tx = self.pool.begin().await?;

        // Only a BOOKED row can advance; a replay matches nothing and rolls
        // back without side effects.
        let claimed = sqlx::query_as::<_, Attribution>(
            r#"
            UPDATE referral_attributions
            SET status = 'completed'::attribution_status, updated_at = NOW()
            WHERE tenant_id = $1 AND location_id = $2 AND id = $3
              AND status = 'booked'::attribution_status
            RETURNING
                id, tenant_id, location_id, code_id, referrer_user_id, referred_user_id,
                referred_email, referred_phone, status, attributed_at, expires_at,
                first_appointment_id, metadata, created_at, updated_at
            "#,
        )
        .bind(scope.tenant_id)
        .bind(scope.location_id)
        .bind(rewards.attribution_id)
        .fetch_optional(&mut *tx)
        .await?;

        if claimed.is_none() {
            return Ok(None);
        }

        let mut referrer_txn = None;
        let mut referrer_coupon = None;
        if let Some(reward) = &rewards.referrer_reward {
            let (txn, coupon) = apply_prepared_reward(
                &mut tx,
                scope,
                rewards.referrer_user_id,
                reward,
                rewards.attribution_id,
                "referral reward (referrer)",
            )
            .await?;
            referrer_txn = Some(txn);
            referrer_coupon = coupon;
        }

        let mut referred_txn = None;
        let mut referred_coupon = None;
        if let (Some(referred_user), Some(reward)) =
            (rewards.referred_user_id, &rewards.referred_reward)
        {
            let (txn, coupon) = apply_prepared_reward(
                &mut tx,
                scope,
                referred_user,
                reward,
                rewards.attribution_id,
                "referral reward (referred)",
            )
            .await?;
            referred_txn = Some(txn);
            referred_coupon = coupon;
        }

        let attribution = sqlx::query_as::<_, Attribution>(
            r#"
            UPDATE referral_attributions
            SET status = 'rewarded'::attribution_status,
                metadata = COALESCE(metadata, '{}'::jsonb) || $4,
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
        .bind(rewards.attribution_id)
        .bind(&rewards.metadata)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

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
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            SELECT id FROM referral_attributions
            WHERE tenant_id = $1 AND location_id = $2 AND id = $3
            FOR UPDATE
            "#,
        )
        .bind(scope.tenant_id)
        .bind(scope.location_id)
        .bind(attribution_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::NotFound("attribution"))?;

        let confirmed = sqlx::query_as::<_, RewardTransaction>(&format!(
            r#"
            SELECT {TXN_COLUMNS}
            FROM reward_transactions
            WHERE tenant_id = $1 AND location_id = $2
              AND referral_attribution_id = $3
              AND status = 'confirmed'::reward_transaction_status
              AND txn_type IN ('credit'::reward_transaction_type,
                               'coupon_issued'::reward_transaction_type)
            "#
        ))
        .bind(scope.tenant_id)
        .bind(scope.location_id)
        .bind(attribution_id)
        .fetch_all(&mut *tx)
        .await?;

        let mut summary = VoidSummary::default();
        for original in &confirmed {
            match original.txn_type {
                RewardTransactionType::Credit => {
                    let amount = original.amount.unwrap_or(0);
                    move_wallet_balance(&mut tx, scope, original.user_id, -amount).await?;
                    insert_txn_row(
                        &mut tx,
                        scope,
                        original.user_id,
                        RewardTransactionType::Adjustment,
                        RewardTransactionStatus::Confirmed,
                        Some(-amount),
                        None,
                        None,
                        Some(attribution_id),
                        &format!("reversal ({}) of credit {}", reason, original.id),
                    )
                    .await?;
                    summary.reversed_amount += amount;
                    summary.adjustments_written += 1;
                }
                RewardTransactionType::CouponIssued => {
                    if let Some(coupon_id) = original.coupon_id {
                        sqlx::query(
                            r#"
                            UPDATE coupons SET is_active = FALSE
                            WHERE tenant_id = $1 AND location_id = $2 AND id = $3
                            "#,
                        )
                        .bind(scope.tenant_id)
                        .bind(scope.location_id)
                        .bind(coupon_id)
                        .execute(&mut *tx)
                        .await?;
                    }
                    insert_txn_row(
                        &mut tx,
                        scope,
                        original.user_id,
                        RewardTransactionType::Adjustment,
                        RewardTransactionStatus::Confirmed,
                        Some(0),
                        None,
                        original.coupon_id,
                        Some(attribution_id),
                        &format!("reversal ({}) of coupon {}", reason, original.id),
                    )
                    .await?;
                    summary.coupons_deactivated += 1;
                    summary.adjustments_written += 1;
                }
                _ => {}
            }
        }

        let attribution = sqlx::query_as::<_, Attribution>(
            r#"
            UPDATE referral_attributions
            SET status = 'voided'::attribution_status,
                metadata = COALESCE(metadata, '{}'::jsonb) || $4,
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
        .bind(attribution_id)
        .bind(serde_json::json!({ "void_reason": reason }))
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok((attribution, summary))
    }

    async fn get_coupon(
        &self,
        scope: TenantScope,
        coupon_id: Uuid,
    ) -> Result<Option<Coupon>, StoreError> {
        let coupon = sqlx::query_as::<_, Coupon>(&format!(
            r#"
            SELECT {COUPON_COLUMNS}
            FROM coupons
            WHERE tenant_id = $1 AND location_id = $2 AND id = $3
            "#
        ))
        .bind(scope.tenant_id)
        .bind(scope.location_id)
        .bind(coupon_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(coupon)
    }

    async fn reserve_coupon_usage(
        &self,
        scope: TenantScope,
        user_id: Uuid,
        coupon_id: Uuid,
        appointment_id: Uuid,
    ) -> Result<RewardTransaction, StoreError> {
        let mut tx = self.pool.begin().await?;

        let reserved = sqlx::query_as::<_, Coupon>(&format!(
            r#"
            UPDATE coupons
            SET used_count = used_count + 1
            WHERE tenant_id = $1 AND location_id = $2 AND id = $3
              AND is_active AND used_count < max_uses
            RETURNING {COUPON_COLUMNS}
            "#
        ))
        .bind(scope.tenant_id)
        .bind(scope.location_id)
        .bind(coupon_id)
        .fetch_optional(&mut *tx)
        .await?;

        if reserved.is_none() {
            return Err(StoreError::Conflict(format!(
                "coupon {} is inactive or exhausted",
                coupon_id
            )));
        }

        let txn = insert_txn_row(
            &mut tx,
            scope,
            user_id,
            RewardTransactionType::CouponUsed,
            RewardTransactionStatus::Pending,
            None,
            Some(appointment_id),
            Some(coupon_id),
            None,
            &format!("coupon {} reserved for appointment {}", coupon_id, appointment_id),
        )
        .await?;

        tx.commit().await?;
        Ok(txn)
    }

    async fn confirm_coupon_usage(
        &self,
        scope: TenantScope,
        appointment_id: Uuid,
    ) -> Result<i64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE reward_transactions
            SET status = 'confirmed'::reward_transaction_status, updated_at = NOW()
            WHERE tenant_id = $1 AND location_id = $2
              AND appointment_id = $3
              AND txn_type = 'coupon_used'::reward_transaction_type
              AND status = 'pending'::reward_transaction_status
            "#,
        )
        .bind(scope.tenant_id)
        .bind(scope.location_id)
        .bind(appointment_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() as i64)
    }

    async fn cancel_coupon_usage(
        &self,
        scope: TenantScope,
        appointment_id: Uuid,
    ) -> Result<i64, StoreError> {
        let mut tx = self.pool.begin().await?;

        let reservations = sqlx::query_as::<_, RewardTransaction>(&format!(
            r#"
            SELECT {TXN_COLUMNS}
            FROM reward_transactions
            WHERE tenant_id = $1 AND location_id = $2
              AND appointment_id = $3
              AND txn_type = 'coupon_used'::reward_transaction_type
              AND status = 'pending'::reward_transaction_status
            FOR UPDATE
            "#
        ))
        .bind(scope.tenant_id)
        .bind(scope.location_id)
        .bind(appointment_id)
        .fetch_all(&mut *tx)
        .await?;

        let mut cancelled = 0i64;
        for reservation in &reservations {
            sqlx::query(
                r#"
                UPDATE reward_transactions
                SET status = 'cancelled'::reward_transaction_status, updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(reservation.id)
            .execute(&mut *tx)
            .await?;

            if let Some(coupon_id) = reservation.coupon_id {
                sqlx::query(
                    r#"
                    UPDATE coupons
                    SET used_count = GREATEST(used_count - 1, 0)
                    WHERE tenant_id = $1 AND location_id = $2 AND id = $3
                    "#,
                )
                .bind(scope.tenant_id)
                .bind(scope.location_id)
                .bind(coupon_id)
                .execute(&mut *tx)
                .await?;
            }
            cancelled += 1;
        }

        tx.commit().await?;
        Ok(cancelled)
    }

    async fn transactions_for_user(
        &self,
        scope: TenantScope,
        user_id: Uuid,
        limit: i64,
    ) -> Result<Vec<RewardTransaction>, StoreError> {
        let transactions = sqlx::query_as::<_, RewardTransaction>(&format!(
            r#"
            SELECT {TXN_COLUMNS}
            FROM reward_transactions
            WHERE tenant_id = $1 AND location_id = $2 AND user_id = $3
            ORDER BY created_at DESC
            LIMIT $4
            "#
        ))
        .bind(scope.tenant_id)
        .bind(scope.location_id)
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(transactions)
    }

    async fn active_coupons_for_user(
        &self,
        scope: TenantScope,
        user_id: Uuid,
    ) -> Result<Vec<Coupon>, StoreError> {
        let coupons = sqlx::query_as::<_, Coupon>(&format!(
            r#"
            SELECT {COUPON_COLUMNS}
            FROM coupons
            WHERE tenant_id = $1 AND location_id = $2
              AND owner_user_id = $3
              AND is_active
            ORDER BY created_at DESC
            "#
        ))
        .bind(scope.tenant_id)
        .bind(scope.location_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(coupons)
    }
}

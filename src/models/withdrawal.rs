use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use super::balance::BalanceField;
use super::ledger::{mutate_balance, BalanceMutation, EntryType, LedgerEntry};
use crate::chain::Asset;
use crate::config::Config;
use crate::error::CoreError;
use crate::pricing::PriceOracle;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Withdrawal {
    pub id: Uuid,
    pub user_id: Uuid,
    pub chain: String,
    pub asset: String,
    pub to_address: String,
    pub destination_tag: Option<String>,
    /// Full debit including fee; net_amount goes on chain.
    pub amount: Decimal,
    pub fee: Decimal,
    pub net_amount: Decimal,
    pub cad_value: Option<Decimal>,
    pub status: String,
    pub failure_reason: Option<String>,
    pub tx_hash: Option<String>,
    pub requested_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
    pub broadcast_at: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct WithdrawalRequest {
    pub asset: Asset,
    pub to_address: String,
    pub destination_tag: Option<String>,
    pub amount: Decimal,
}

impl Withdrawal {
    pub fn asset(&self) -> Asset {
        self.asset
            .parse()
            .expect("withdrawal row carries a valid asset")
    }

    /// Submit a withdrawal: all eligibility checks, then debit + row insert
    /// in one transaction. The broadcaster only ever sees rows whose debit
    /// already committed.
    pub async fn submit(
        pool: &PgPool,
        config: &Config,
        prices: &dyn PriceOracle,
        user_id: Uuid,
        req: WithdrawalRequest,
    ) -> Result<Self, CoreError> {
        if req.amount <= Decimal::ZERO {
            return Err(CoreError::Validation("amount must be positive".into()));
        }
        if req.to_address.trim().is_empty() {
            return Err(CoreError::Validation("address is required".into()));
        }

        let fee = req.asset.withdrawal_fee();
        let net_amount = req.amount - fee;
        if net_amount <= Decimal::ZERO {
            return Err(CoreError::Validation(format!(
                "amount must exceed the {} network fee of {}",
                req.asset, fee
            )));
        }

        let price = prices.price_cad(req.asset).await?;
        let cad_value = LedgerEntry::round_fiat(req.amount * price);

        let now = Utc::now();
        Self::check_cooldowns(pool, config, user_id, &req, now).await?;
        Self::check_limits(pool, config, user_id, cad_value, now).await?;

        let status = if cad_value <= config.withdrawal_auto_approve_cad_limit {
            "approved"
        } else {
            "pending_review"
        };

        // The ledger key references the withdrawal id, so generate it up
        // front.
        let withdrawal_id = Uuid::new_v4();
        let mut tx = pool.begin().await?;

        mutate_balance(
            &mut tx,
            BalanceMutation::new(
                user_id,
                req.asset,
                BalanceField::Available,
                -req.amount,
                EntryType::WithdrawalRequested,
                format!("withdrawal_debit:{withdrawal_id}"),
            )
            .for_withdrawal(withdrawal_id)
            .with_note(format!("Withdraw {} {} to {}", req.amount, req.asset, req.to_address)),
        )
        .await?;

        let withdrawal = sqlx::query_as::<_, Self>(
            "INSERT INTO withdrawals
                (id, user_id, chain, asset, to_address, destination_tag,
                 amount, fee, net_amount, cad_value, status, approved_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11,
                     CASE WHEN $11 = 'approved' THEN NOW() END)
             RETURNING *",
        )
        .bind(withdrawal_id)
        .bind(user_id)
        .bind(req.asset.chain().as_str())
        .bind(req.asset.as_str())
        .bind(&req.to_address)
        .bind(&req.destination_tag)
        .bind(req.amount)
        .bind(fee)
        .bind(net_amount)
        .bind(cad_value)
        .bind(status)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(withdrawal)
    }

    /// New-address and password-change cooldowns, plus the minimum gap
    /// between withdrawals. A first-seen address enters the book and starts
    /// its cooldown immediately.
    async fn check_cooldowns(
        pool: &PgPool,
        config: &Config,
        user_id: Uuid,
        req: &WithdrawalRequest,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let pw_changed: Option<DateTime<Utc>> =
            sqlx::query_scalar("SELECT password_changed_at FROM users WHERE id = $1")
                .bind(user_id)
                .fetch_one(pool)
                .await?;
        if let Some(changed) = pw_changed {
            if now - changed < Duration::hours(config.address_cooldown_hours) {
                return Err(CoreError::RateLimited(
                    "withdrawals are paused after a password change".into(),
                ));
            }
        }

        let saved_at: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT created_at FROM saved_addresses
             WHERE user_id = $1 AND asset = $2 AND address = $3",
        )
        .bind(user_id)
        .bind(req.asset.as_str())
        .bind(&req.to_address)
        .fetch_optional(pool)
        .await?;

        let added_at = match saved_at {
            Some(at) => at,
            None => {
                sqlx::query(
                    "INSERT INTO saved_addresses (user_id, asset, address, destination_tag)
                     VALUES ($1, $2, $3, $4)
                     ON CONFLICT (user_id, asset, address) DO NOTHING",
                )
                .bind(user_id)
                .bind(req.asset.as_str())
                .bind(&req.to_address)
                .bind(&req.destination_tag)
                .execute(pool)
                .await?;
                now
            }
        };
        if now - added_at < Duration::hours(config.address_cooldown_hours) {
            return Err(CoreError::RateLimited(format!(
                "withdrawal address is in its {}h cooldown",
                config.address_cooldown_hours
            )));
        }

        let last_request: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT MAX(requested_at) FROM withdrawals WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_one(pool)
        .await?;
        if let Some(last) = last_request {
            if now - last < Duration::minutes(config.withdrawal_cooldown_minutes) {
                return Err(CoreError::RateLimited(
                    "another withdrawal was requested too recently".into(),
                ));
            }
        }

        Ok(())
    }

    async fn check_limits(
        pool: &PgPool,
        config: &Config,
        user_id: Uuid,
        cad_value: Decimal,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let day = Self::sum_cad_since(pool, user_id, now - Duration::hours(24)).await?;
        if day + cad_value > config.withdrawal_daily_limit_cad {
            return Err(CoreError::RateLimited(format!(
                "daily withdrawal limit of {} CAD exceeded",
                config.withdrawal_daily_limit_cad
            )));
        }

        let month = Self::sum_cad_since(pool, user_id, now - Duration::days(30)).await?;
        if month + cad_value > config.withdrawal_monthly_limit_cad {
            return Err(CoreError::RateLimited(format!(
                "monthly withdrawal limit of {} CAD exceeded",
                config.withdrawal_monthly_limit_cad
            )));
        }
        Ok(())
    }

    /// CAD-equivalent withdrawn since `since`, excluding refunds.
    async fn sum_cad_since(
        pool: &PgPool,
        user_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Decimal, sqlx::Error> {
        sqlx::query_scalar(
            "SELECT COALESCE(SUM(cad_value), 0) FROM withdrawals
             WHERE user_id = $1 AND requested_at >= $2
               AND status NOT IN ('failed', 'cancelled')",
        )
        .bind(user_id)
        .bind(since)
        .fetch_one(pool)
        .await
    }

    /// Claim up to `limit` approved rows for broadcasting. The compound
    /// UPDATE makes multiple broadcaster instances safe: losers see zero
    /// rows.
    pub async fn claim_for_broadcast(
        pool: &PgPool,
        limit: i64,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            "UPDATE withdrawals SET status = 'broadcasting', broadcast_at = NOW(),
                    updated_at = NOW()
             WHERE id IN (
                 SELECT id FROM withdrawals
                 WHERE status = 'approved'
                 ORDER BY requested_at ASC
                 LIMIT $1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING *",
        )
        .bind(limit)
        .fetch_all(pool)
        .await
    }

    pub async fn record_tx_hash(
        pool: &PgPool,
        withdrawal_id: Uuid,
        tx_hash: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE withdrawals SET tx_hash = $1, updated_at = NOW() WHERE id = $2")
            .bind(tx_hash)
            .bind(withdrawal_id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Exactly-once refund after a failed broadcast. If another actor moved
    /// the row first, whoever transitioned first owns the refund and this is
    /// a no-op. Returns whether the refund was applied here.
    pub async fn refund_failed(
        pool: &PgPool,
        withdrawal_id: Uuid,
        reason: &str,
    ) -> Result<bool, CoreError> {
        let mut tx = pool.begin().await?;

        let withdrawal =
            sqlx::query_as::<_, Self>("SELECT * FROM withdrawals WHERE id = $1 FOR UPDATE")
                .bind(withdrawal_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or(CoreError::NotFound("withdrawal"))?;

        if withdrawal.status != "approved" && withdrawal.status != "broadcasting" {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            "UPDATE withdrawals SET status = 'failed', failure_reason = $1, updated_at = NOW()
             WHERE id = $2",
        )
        .bind(reason)
        .bind(withdrawal_id)
        .execute(&mut *tx)
        .await?;

        mutate_balance(
            &mut tx,
            BalanceMutation::new(
                withdrawal.user_id,
                withdrawal.asset(),
                BalanceField::Available,
                withdrawal.amount,
                EntryType::WithdrawalFailed,
                format!("withdrawal_refund:{withdrawal_id}"),
            )
            .for_withdrawal(withdrawal_id)
            .with_note(format!("Refund after failed broadcast: {reason}")),
        )
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// User cancellation, only while still awaiting review.
    pub async fn cancel(pool: &PgPool, user_id: Uuid, withdrawal_id: Uuid) -> Result<Self, CoreError> {
        let mut tx = pool.begin().await?;

        let withdrawal = sqlx::query_as::<_, Self>(
            "SELECT * FROM withdrawals WHERE id = $1 AND user_id = $2 FOR UPDATE",
        )
        .bind(withdrawal_id)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(CoreError::NotFound("withdrawal"))?;

        if withdrawal.status != "pending_review" {
            return Err(CoreError::Conflict(format!(
                "withdrawal is {} and cannot be cancelled",
                withdrawal.status
            )));
        }

        mutate_balance(
            &mut tx,
            BalanceMutation::new(
                withdrawal.user_id,
                withdrawal.asset(),
                BalanceField::Available,
                withdrawal.amount,
                EntryType::WithdrawalCancelled,
                format!("withdrawal_cancel:{withdrawal_id}"),
            )
            .for_withdrawal(withdrawal_id),
        )
        .await?;

        let updated = sqlx::query_as::<_, Self>(
            "UPDATE withdrawals SET status = 'cancelled', updated_at = NOW()
             WHERE id = $1 RETURNING *",
        )
        .bind(withdrawal_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(updated)
    }

    pub async fn approve(pool: &PgPool, withdrawal_id: Uuid) -> Result<Self, CoreError> {
        sqlx::query_as::<_, Self>(
            "UPDATE withdrawals SET status = 'approved', approved_at = NOW(), updated_at = NOW()
             WHERE id = $1 AND status = 'pending_review'
             RETURNING *",
        )
        .bind(withdrawal_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| CoreError::Conflict("withdrawal is not awaiting review".into()))
    }

    /// Admin rejection mirrors user cancellation with its own ledger key.
    pub async fn reject(pool: &PgPool, withdrawal_id: Uuid, reason: &str) -> Result<Self, CoreError> {
        let mut tx = pool.begin().await?;

        let withdrawal =
            sqlx::query_as::<_, Self>("SELECT * FROM withdrawals WHERE id = $1 FOR UPDATE")
                .bind(withdrawal_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or(CoreError::NotFound("withdrawal"))?;

        if withdrawal.status != "pending_review" {
            return Err(CoreError::Conflict(format!(
                "withdrawal is {} and cannot be rejected",
                withdrawal.status
            )));
        }

        mutate_balance(
            &mut tx,
            BalanceMutation::new(
                withdrawal.user_id,
                withdrawal.asset(),
                BalanceField::Available,
                withdrawal.amount,
                EntryType::WithdrawalRejected,
                format!("withdrawal_reject:{withdrawal_id}"),
            )
            .for_withdrawal(withdrawal_id)
            .with_note(reason),
        )
        .await?;

        let updated = sqlx::query_as::<_, Self>(
            "UPDATE withdrawals SET status = 'failed', failure_reason = $1, updated_at = NOW()
             WHERE id = $2 RETURNING *",
        )
        .bind(format!("rejected: {reason}"))
        .bind(withdrawal_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(updated)
    }

    pub async fn list_broadcasting(pool: &PgPool) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            "SELECT * FROM withdrawals WHERE status = 'broadcasting' AND tx_hash IS NOT NULL",
        )
        .fetch_all(pool)
        .await
    }

    /// CAS transition to confirmed; loses quietly to any concurrent admin
    /// action that already moved the row.
    pub async fn confirm_if_broadcasting(
        pool: &PgPool,
        withdrawal_id: Uuid,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE withdrawals SET status = 'confirmed', confirmed_at = NOW(), updated_at = NOW()
             WHERE id = $1 AND status = 'broadcasting'",
        )
        .bind(withdrawal_id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn list_for_user(
        pool: &PgPool,
        user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            "SELECT * FROM withdrawals WHERE user_id = $1
             ORDER BY requested_at DESC LIMIT $2 OFFSET $3",
        )
        .bind(user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await
    }

    pub async fn get(pool: &PgPool, withdrawal_id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>("SELECT * FROM withdrawals WHERE id = $1")
            .bind(withdrawal_id)
            .fetch_optional(pool)
            .await
    }
}

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use super::balance::BalanceField;
use super::ledger::{mutate_balance, BalanceMutation, EntryType, LedgerEntry};
use crate::chain::Asset;
use crate::error::CoreError;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct StakingProduct {
    pub id: Uuid,
    pub asset: String,
    pub name: String,
    pub apy_percent: Decimal,
    pub min_amount: Decimal,
    pub max_amount: Option<Decimal>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct StakingPosition {
    pub id: Uuid,
    pub user_id: Uuid,
    pub product_id: Uuid,
    pub asset: String,
    pub amount: Decimal,
    pub status: String,
    pub accrual_count: i32,
    pub staked_at: DateTime<Utc>,
    pub last_accrual_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Earning {
    pub id: Uuid,
    pub position_id: Uuid,
    pub user_id: Uuid,
    pub asset: String,
    pub amount: Decimal,
    pub apy_percent: Decimal,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

const SECONDS_PER_DAY: i64 = 86_400;

/// Simple daily interest on the staked amount for a fractional number of
/// days, rounded down to 8 decimals so rewards never over-credit.
pub fn reward_for_period(amount: Decimal, apy_percent: Decimal, elapsed_seconds: i64) -> Decimal {
    let days = Decimal::from(elapsed_seconds) / Decimal::from(SECONDS_PER_DAY);
    let reward = amount * (apy_percent / Decimal::from(100)) / Decimal::from(365) * days;
    reward.round_dp_with_strategy(8, rust_decimal::RoundingStrategy::ToZero)
}

impl StakingProduct {
    pub async fn get(pool: &PgPool, product_id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>("SELECT * FROM staking_products WHERE id = $1")
            .bind(product_id)
            .fetch_optional(pool)
            .await
    }

    pub async fn list_active(pool: &PgPool) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>("SELECT * FROM staking_products WHERE active ORDER BY asset")
            .fetch_all(pool)
            .await
    }
}

impl StakingPosition {
    pub fn asset(&self) -> Asset {
        self.asset
            .parse()
            .expect("position row carries a valid asset")
    }

    /// Stake: move funds from available to locked and open the position in
    /// one transaction. The partial unique index on (user, product) turns a
    /// concurrent duplicate stake into a Conflict.
    pub async fn open(
        pool: &PgPool,
        user_id: Uuid,
        product_id: Uuid,
        amount: Decimal,
    ) -> Result<Self, CoreError> {
        let product = StakingProduct::get(pool, product_id)
            .await?
            .ok_or(CoreError::NotFound("staking product"))?;
        if !product.active {
            return Err(CoreError::Conflict("staking product is closed".into()));
        }
        let asset: Asset = product.asset.parse()?;

        let amount = LedgerEntry::round_crypto(amount);
        if amount < product.min_amount {
            return Err(CoreError::Validation(format!(
                "minimum stake is {} {}",
                product.min_amount, product.asset
            )));
        }
        if let Some(max) = product.max_amount {
            if amount > max {
                return Err(CoreError::Validation(format!(
                    "maximum stake is {} {}",
                    max, product.asset
                )));
            }
        }

        let mut tx = pool.begin().await?;

        let position = sqlx::query_as::<_, Self>(
            "INSERT INTO staking_positions (user_id, product_id, asset, amount)
             VALUES ($1, $2, $3, $4) RETURNING *",
        )
        .bind(user_id)
        .bind(product_id)
        .bind(product.asset.as_str())
        .bind(amount)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                CoreError::Conflict("an active position already exists for this product".into())
            }
            _ => CoreError::Database(e),
        })?;

        mutate_balance(
            &mut tx,
            BalanceMutation::new(
                user_id,
                asset,
                BalanceField::Available,
                -amount,
                EntryType::StakingLock,
                format!("staking:{}:lock:available", position.id),
            )
            .with_note(format!("Stake {} {}", amount, asset)),
        )
        .await?;

        mutate_balance(
            &mut tx,
            BalanceMutation::new(
                user_id,
                asset,
                BalanceField::Locked,
                amount,
                EntryType::StakingLock,
                format!("staking:{}:lock:locked", position.id),
            ),
        )
        .await?;

        tx.commit().await?;
        Ok(position)
    }

    /// Unstake: close the position and move funds back, under lock so a
    /// racing accrual pass sees a closed position.
    pub async fn close(pool: &PgPool, user_id: Uuid, position_id: Uuid) -> Result<Self, CoreError> {
        let mut tx = pool.begin().await?;

        let position = sqlx::query_as::<_, Self>(
            "SELECT * FROM staking_positions WHERE id = $1 AND user_id = $2 FOR UPDATE",
        )
        .bind(position_id)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(CoreError::NotFound("staking position"))?;

        if position.status != "active" {
            return Err(CoreError::Conflict("position is already closed".into()));
        }
        let asset = position.asset();

        mutate_balance(
            &mut tx,
            BalanceMutation::new(
                user_id,
                asset,
                BalanceField::Locked,
                -position.amount,
                EntryType::StakingUnlock,
                format!("staking:{}:unlock:locked", position.id),
            ),
        )
        .await?;

        mutate_balance(
            &mut tx,
            BalanceMutation::new(
                user_id,
                asset,
                BalanceField::Available,
                position.amount,
                EntryType::StakingUnlock,
                format!("staking:{}:unlock:available", position.id),
            )
            .with_note(format!("Unstake {} {}", position.amount, asset)),
        )
        .await?;

        let updated = sqlx::query_as::<_, Self>(
            "UPDATE staking_positions SET status = 'closed', closed_at = NOW()
             WHERE id = $1 RETURNING *",
        )
        .bind(position_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(updated)
    }

    /// Positions due for an accrual pass (idle at least `idle_hours`).
    pub async fn list_accruable(pool: &PgPool, idle_hours: i64) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            "SELECT * FROM staking_positions
             WHERE status = 'active'
               AND last_accrual_at < NOW() - make_interval(hours => $1::int)",
        )
        .bind(idle_hours)
        .fetch_all(pool)
        .await
    }

    /// Accrue one reward for this position. Re-checks status under lock to
    /// avoid racing an unstake; the accrual counter keys the ledger entry.
    pub async fn accrue(pool: &PgPool, position_id: Uuid) -> Result<Option<Earning>, CoreError> {
        let mut tx = pool.begin().await?;

        let position = sqlx::query_as::<_, Self>(
            "SELECT * FROM staking_positions WHERE id = $1 FOR UPDATE",
        )
        .bind(position_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(CoreError::NotFound("staking position"))?;

        if position.status != "active" {
            tx.rollback().await?;
            return Ok(None);
        }

        let product = sqlx::query_as::<_, StakingProduct>(
            "SELECT * FROM staking_products WHERE id = $1",
        )
        .bind(position.product_id)
        .fetch_one(&mut *tx)
        .await?;

        let now = Utc::now();
        let elapsed = (now - position.last_accrual_at).num_seconds();
        let reward = reward_for_period(position.amount, product.apy_percent, elapsed);
        if reward <= Decimal::ZERO {
            tx.rollback().await?;
            return Ok(None);
        }

        mutate_balance(
            &mut tx,
            BalanceMutation::new(
                position.user_id,
                position.asset(),
                BalanceField::Available,
                reward,
                EntryType::StakingReward,
                format!("staking:{}:reward:{}", position.id, position.accrual_count + 1),
            )
            .with_note(format!("Staking reward at {}% APY", product.apy_percent)),
        )
        .await?;

        let earning = sqlx::query_as::<_, Earning>(
            "INSERT INTO earnings
                (position_id, user_id, asset, amount, apy_percent, period_start, period_end)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING *",
        )
        .bind(position.id)
        .bind(position.user_id)
        .bind(&position.asset)
        .bind(reward)
        .bind(product.apy_percent)
        .bind(position.last_accrual_at)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE staking_positions
             SET last_accrual_at = $1, accrual_count = accrual_count + 1
             WHERE id = $2",
        )
        .bind(now)
        .bind(position.id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(earning))
    }

    pub async fn list_for_user(pool: &PgPool, user_id: Uuid) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            "SELECT * FROM staking_positions WHERE user_id = $1 ORDER BY staked_at DESC",
        )
        .bind(user_id)
        .fetch_all(pool)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn one_day_reward_at_known_apy() {
        // 100 ETH at 3.65% APY for one day = 100 * 0.0365 / 365 = 0.01
        let reward = reward_for_period(dec!(100), dec!(3.65), SECONDS_PER_DAY);
        assert_eq!(reward, dec!(0.01));
    }

    #[test]
    fn fractional_day_scales_linearly() {
        let half = reward_for_period(dec!(100), dec!(3.65), SECONDS_PER_DAY / 2);
        assert_eq!(half, dec!(0.005));
    }

    #[test]
    fn zero_elapsed_accrues_nothing() {
        assert_eq!(reward_for_period(dec!(100), dec!(5), 0), Decimal::ZERO);
    }
}

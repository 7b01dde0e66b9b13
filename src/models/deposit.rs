use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use super::balance::BalanceField;
use super::ledger::{mutate_balance, BalanceMutation, EntryType};
use crate::chain::{Asset, Chain, IncomingTransfer};
use crate::error::CoreError;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Deposit {
    pub id: Uuid,
    pub user_id: Uuid,
    pub wallet_id: Uuid,
    pub chain: String,
    pub asset: String,
    pub tx_hash: String,
    pub amount: Decimal,
    pub confirmations: i32,
    pub required_confirmations: i32,
    pub status: String,
    pub detected_at: DateTime<Utc>,
    pub credited_at: Option<DateTime<Utc>>,
}

impl Deposit {
    pub fn asset(&self) -> Asset {
        self.asset.parse().expect("deposit row carries a valid asset")
    }

    /// Record a detected inbound transfer and credit pending_deposit, once.
    /// Re-detections of the same (tx_hash, chain) return the existing row
    /// untouched; the idempotency key on the ledger entry backstops the
    /// pending credit.
    pub async fn process_new(
        pool: &PgPool,
        chain: Chain,
        transfer: &IncomingTransfer,
    ) -> Result<Option<Self>, CoreError> {
        let mut tx = pool.begin().await?;

        let inserted = sqlx::query_as::<_, Self>(
            "INSERT INTO deposits
                (user_id, wallet_id, chain, asset, tx_hash, amount,
                 confirmations, required_confirmations)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (tx_hash, chain) DO NOTHING
             RETURNING *",
        )
        .bind(transfer.user_id)
        .bind(transfer.wallet_id)
        .bind(chain.as_str())
        .bind(transfer.asset.as_str())
        .bind(&transfer.tx_hash)
        .bind(transfer.amount)
        .bind(transfer.confirmations)
        .bind(transfer.asset.required_confirmations())
        .fetch_optional(&mut *tx)
        .await?;

        let Some(deposit) = inserted else {
            // Already known from a previous scan cycle.
            tx.rollback().await?;
            return Ok(None);
        };

        mutate_balance(
            &mut tx,
            BalanceMutation::new(
                transfer.user_id,
                transfer.asset,
                BalanceField::PendingDeposit,
                transfer.amount,
                EntryType::DepositPending,
                format!("deposit:{}:{}:pending", transfer.tx_hash, chain),
            )
            .for_deposit(deposit.id)
            .with_note(format!("Detected {} on {}", transfer.amount, chain)),
        )
        .await?;

        tx.commit().await?;
        Ok(Some(deposit))
    }

    pub async fn list_pending(pool: &PgPool) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>("SELECT * FROM deposits WHERE status = 'pending'")
            .fetch_all(pool)
            .await
    }

    pub async fn update_confirmations(
        pool: &PgPool,
        deposit_id: Uuid,
        confirmations: i32,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE deposits SET confirmations = $1 WHERE id = $2")
            .bind(confirmations)
            .bind(deposit_id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Move a deposit to credited and shift the funds from pending_deposit
    /// to available. Monotonic: a credited deposit never regresses, and the
    /// `deposit:{id}:credit` key makes re-credit a no-op.
    pub async fn credit(pool: &PgPool, deposit_id: Uuid) -> Result<Option<Self>, CoreError> {
        let mut tx = pool.begin().await?;

        let deposit = sqlx::query_as::<_, Self>("SELECT * FROM deposits WHERE id = $1 FOR UPDATE")
            .bind(deposit_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(CoreError::NotFound("deposit"))?;

        if deposit.status != "pending" {
            tx.rollback().await?;
            return Ok(None);
        }

        let asset = deposit.asset();

        mutate_balance(
            &mut tx,
            BalanceMutation::new(
                deposit.user_id,
                asset,
                BalanceField::PendingDeposit,
                -deposit.amount,
                EntryType::DepositPendingCleared,
                format!("deposit:{}:pending_cleared", deposit.id),
            )
            .for_deposit(deposit.id),
        )
        .await?;

        mutate_balance(
            &mut tx,
            BalanceMutation::new(
                deposit.user_id,
                asset,
                BalanceField::Available,
                deposit.amount,
                EntryType::DepositConfirmed,
                format!("deposit:{}:credit", deposit.id),
            )
            .for_deposit(deposit.id)
            .with_note(format!("{} {} confirmed", deposit.amount, asset)),
        )
        .await?;

        let updated = sqlx::query_as::<_, Self>(
            "UPDATE deposits SET status = 'credited', credited_at = NOW() WHERE id = $1 RETURNING *",
        )
        .bind(deposit.id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(updated))
    }

    /// Expire a stale pending deposit, reversing its pending credit.
    pub async fn expire(pool: &PgPool, deposit_id: Uuid) -> Result<bool, CoreError> {
        let mut tx = pool.begin().await?;

        let deposit = sqlx::query_as::<_, Self>("SELECT * FROM deposits WHERE id = $1 FOR UPDATE")
            .bind(deposit_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(CoreError::NotFound("deposit"))?;

        if deposit.status != "pending" {
            tx.rollback().await?;
            return Ok(false);
        }

        mutate_balance(
            &mut tx,
            BalanceMutation::new(
                deposit.user_id,
                deposit.asset(),
                BalanceField::PendingDeposit,
                -deposit.amount,
                EntryType::DepositPendingCleared,
                format!("deposit:{}:expired", deposit.id),
            )
            .for_deposit(deposit.id)
            .with_note("Stale deposit expired"),
        )
        .await?;

        sqlx::query("UPDATE deposits SET status = 'expired' WHERE id = $1")
            .bind(deposit.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    pub async fn list_stale_pending(
        pool: &PgPool,
        older_than_hours: i64,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            "SELECT * FROM deposits WHERE status = 'pending'
               AND detected_at < NOW() - make_interval(hours => $1::int)",
        )
        .bind(older_than_hours)
        .fetch_all(pool)
        .await
    }
}

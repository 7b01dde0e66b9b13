use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::chain::Asset;

/// Which of the three balance fields a mutation touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceField {
    Available,
    Locked,
    PendingDeposit,
}

impl BalanceField {
    pub fn column(&self) -> &'static str {
        match self {
            BalanceField::Available => "available",
            BalanceField::Locked => "locked",
            BalanceField::PendingDeposit => "pending_deposit",
        }
    }
}

impl std::fmt::Display for BalanceField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.column())
    }
}

/// One row per (user, asset). Only the ledger engine writes these.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Balance {
    pub id: Uuid,
    pub user_id: Uuid,
    pub asset: String,
    pub available: Decimal,
    pub locked: Decimal,
    pub pending_deposit: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Balance {
    pub fn field(&self, field: BalanceField) -> Decimal {
        match field {
            BalanceField::Available => self.available,
            BalanceField::Locked => self.locked,
            BalanceField::PendingDeposit => self.pending_deposit,
        }
    }

    pub fn total(&self) -> Decimal {
        self.available + self.locked + self.pending_deposit
    }

    pub async fn get(
        pool: &PgPool,
        user_id: Uuid,
        asset: Asset,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>("SELECT * FROM balances WHERE user_id = $1 AND asset = $2")
            .bind(user_id)
            .bind(asset.as_str())
            .fetch_optional(pool)
            .await
    }

    pub async fn get_for_user(pool: &PgPool, user_id: Uuid) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>("SELECT * FROM balances WHERE user_id = $1 ORDER BY asset")
            .bind(user_id)
            .fetch_all(pool)
            .await
    }

    /// Row-lock a balance for the duration of the enclosing transaction.
    pub async fn lock(
        tx: &mut Transaction<'_, Postgres>,
        user_id: Uuid,
        asset: Asset,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            "SELECT * FROM balances WHERE user_id = $1 AND asset = $2 FOR UPDATE",
        )
        .bind(user_id)
        .bind(asset.as_str())
        .fetch_optional(&mut **tx)
        .await
    }

    /// Create zeroed rows for every asset. Idempotent.
    pub async fn init_for_user(
        tx: &mut Transaction<'_, Postgres>,
        user_id: Uuid,
    ) -> Result<(), sqlx::Error> {
        for asset in Asset::ALL {
            sqlx::query(
                "INSERT INTO balances (user_id, asset) VALUES ($1, $2)
                 ON CONFLICT (user_id, asset) DO NOTHING",
            )
            .bind(user_id)
            .bind(asset.as_str())
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }
}

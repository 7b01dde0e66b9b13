use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::chain::WalletDeriver;
use crate::error::CoreError;

/// The market-maker of last resort and fee sink. Its balances may go
/// negative; it is backed off-book by operator reserves.
pub const PLATFORM_USER_ID: Uuid = Uuid::from_u128(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KycStatus {
    Pending,
    Verified,
    Rejected,
    Deleted,
}

impl std::fmt::Display for KycStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KycStatus::Pending => write!(f, "pending"),
            KycStatus::Verified => write!(f, "verified"),
            KycStatus::Rejected => write!(f, "rejected"),
            KycStatus::Deleted => write!(f, "deleted"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
    pub kyc_status: String,
    pub trade_count: i32,
    pub max_trade_limit: Decimal,
    pub autodeposit_verified: bool,
    pub fee_credit_cad: Decimal,
    pub password_changed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// CAD per-order ceiling, graduating with completed trades.
pub fn trade_limit_for_count(trade_count: i32) -> Decimal {
    match trade_count {
        c if c >= 20 => Decimal::from(3000),
        c if c >= 10 => Decimal::from(2000),
        c if c >= 5 => Decimal::from(1000),
        c if c >= 3 => Decimal::from(500),
        _ => Decimal::from(250),
    }
}

impl User {
    pub fn is_platform(&self) -> bool {
        self.id == PLATFORM_USER_ID
    }

    pub fn is_verified(&self) -> bool {
        self.kyc_status == "verified"
    }

    pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>("SELECT * FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    pub async fn find_by_email(pool: &PgPool, email: &str) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>("SELECT * FROM users WHERE email = $1")
            .bind(email)
            .fetch_optional(pool)
            .await
    }

    /// Create a user together with its six balance rows, so the ledger never
    /// meets a missing row, then allocate one wallet per chain (pool claim
    /// with on-demand derivation as the fallback). Provisioning runs after
    /// the user commit and is idempotent, so a crash mid-way is repaired by
    /// re-running it for the same user.
    pub async fn create(
        pool: &PgPool,
        email: &str,
        deriver: &dyn WalletDeriver,
        encryption_key: &[u8; 32],
    ) -> Result<Self, CoreError> {
        let mut tx = pool.begin().await?;
        let user = sqlx::query_as::<_, Self>("INSERT INTO users (email) VALUES ($1) RETURNING *")
            .bind(email)
            .fetch_one(&mut *tx)
            .await?;
        super::Balance::init_for_user(&mut tx, user.id).await?;
        tx.commit().await?;

        super::Wallet::provision_all(pool, user.id, deriver, encryption_key).await?;
        Ok(user)
    }

    /// Idempotent bootstrap of the platform user and its balance rows. Runs
    /// at every startup.
    pub async fn ensure_platform(pool: &PgPool) -> Result<(), sqlx::Error> {
        let mut tx = pool.begin().await?;
        sqlx::query(
            "INSERT INTO users (id, email, kyc_status, autodeposit_verified)
             VALUES ($1, 'platform@internal', 'verified', TRUE)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(PLATFORM_USER_ID)
        .execute(&mut *tx)
        .await?;
        super::Balance::init_for_user(&mut tx, PLATFORM_USER_ID).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn set_kyc_status(
        pool: &PgPool,
        user_id: Uuid,
        status: KycStatus,
    ) -> Result<Self, CoreError> {
        sqlx::query_as::<_, Self>(
            "UPDATE users SET kyc_status = $1, updated_at = NOW() WHERE id = $2 RETURNING *",
        )
        .bind(status.to_string())
        .bind(user_id)
        .fetch_optional(pool)
        .await?
        .ok_or(CoreError::NotFound("user"))
    }

    /// Bump trade_count and re-derive max_trade_limit, inside the caller's
    /// transaction (completion and dispute resolution both use it).
    pub async fn record_completed_trade(
        tx: &mut Transaction<'_, Postgres>,
        user_id: Uuid,
    ) -> Result<(), sqlx::Error> {
        let new_count: i32 = sqlx::query_scalar(
            "UPDATE users SET trade_count = trade_count + 1, updated_at = NOW()
             WHERE id = $1 RETURNING trade_count",
        )
        .bind(user_id)
        .fetch_one(&mut **tx)
        .await?;

        sqlx::query("UPDATE users SET max_trade_limit = $1 WHERE id = $2")
            .bind(trade_limit_for_count(new_count))
            .bind(user_id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// Consume up to `wanted` CAD of the user's fee credit under lock.
    /// Returns the amount actually consumed.
    pub async fn consume_fee_credit(
        tx: &mut Transaction<'_, Postgres>,
        user_id: Uuid,
        wanted: Decimal,
    ) -> Result<Decimal, sqlx::Error> {
        let current: Decimal =
            sqlx::query_scalar("SELECT fee_credit_cad FROM users WHERE id = $1 FOR UPDATE")
                .bind(user_id)
                .fetch_one(&mut **tx)
                .await?;

        let consumed = current.min(wanted).max(Decimal::ZERO);
        if consumed > Decimal::ZERO {
            sqlx::query(
                "UPDATE users SET fee_credit_cad = fee_credit_cad - $1, updated_at = NOW()
                 WHERE id = $2",
            )
            .bind(consumed)
            .bind(user_id)
            .execute(&mut **tx)
            .await?;
        }
        Ok(consumed)
    }
}

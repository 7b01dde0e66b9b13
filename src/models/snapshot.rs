use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PortfolioSnapshot {
    pub id: Uuid,
    pub user_id: Uuid,
    pub total_cad: Decimal,
    /// JSON map of asset -> {available, locked, pending_deposit} as strings.
    pub balances: String,
    pub captured_at: DateTime<Utc>,
}

impl PortfolioSnapshot {
    pub async fn insert(
        pool: &PgPool,
        user_id: Uuid,
        total_cad: Decimal,
        balances_json: &str,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            "INSERT INTO portfolio_snapshots (user_id, total_cad, balances)
             VALUES ($1, $2, $3) RETURNING *",
        )
        .bind(user_id)
        .bind(total_cad)
        .bind(balances_json)
        .fetch_one(pool)
        .await
    }

    pub async fn list_for_user(
        pool: &PgPool,
        user_id: Uuid,
        limit: i64,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            "SELECT * FROM portfolio_snapshots WHERE user_id = $1
             ORDER BY captured_at DESC LIMIT $2",
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(pool)
        .await
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Dispute {
    pub id: Uuid,
    pub trade_id: Uuid,
    pub opened_by: Uuid,
    pub reason: Option<String>,
    pub status: String,
    pub resolved_by: Option<Uuid>,
    pub resolution_note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Dispute {
    /// One dispute per trade; a second open attempt hits the unique index.
    pub async fn open(
        tx: &mut Transaction<'_, Postgres>,
        trade_id: Uuid,
        opened_by: Uuid,
        reason: Option<&str>,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            "INSERT INTO disputes (trade_id, opened_by, reason) VALUES ($1, $2, $3) RETURNING *",
        )
        .bind(trade_id)
        .bind(opened_by)
        .bind(reason)
        .fetch_one(&mut **tx)
        .await
    }

    pub async fn resolve(
        tx: &mut Transaction<'_, Postgres>,
        trade_id: Uuid,
        outcome: &str,
        resolved_by: Uuid,
        note: Option<&str>,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            "UPDATE disputes SET status = $1, resolved_by = $2, resolution_note = $3,
                    resolved_at = NOW()
             WHERE trade_id = $4 AND status = 'open'
             RETURNING *",
        )
        .bind(outcome)
        .bind(resolved_by)
        .bind(note)
        .bind(trade_id)
        .fetch_optional(&mut **tx)
        .await
    }

    pub async fn for_trade(pool: &PgPool, trade_id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>("SELECT * FROM disputes WHERE trade_id = $1")
            .bind(trade_id)
            .fetch_optional(pool)
            .await
    }
}

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

/// Large Virtual Currency Transaction Report threshold (CAD).
pub const LVCTR_THRESHOLD_CAD: Decimal = Decimal::from_parts(10_000, 0, 0, false, 0);

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ComplianceLog {
    pub id: Uuid,
    pub kind: String,
    pub trade_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub amount_fiat: Option<Decimal>,
    pub details: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ComplianceLog {
    /// LVCTR on completion at or above threshold. Written inside the trade
    /// transaction; a failure here must roll the transition back.
    pub async fn record_lvctr(
        tx: &mut Transaction<'_, Postgres>,
        trade_id: Uuid,
        buyer_id: Uuid,
        amount_fiat: Decimal,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO compliance_logs (kind, trade_id, user_id, amount_fiat, details)
             VALUES ('lvctr', $1, $2, $3, 'large virtual currency transaction')",
        )
        .bind(trade_id)
        .bind(buyer_id)
        .bind(amount_fiat)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// STR on every dispute, same transaction as the dispute row.
    pub async fn record_str(
        tx: &mut Transaction<'_, Postgres>,
        trade_id: Uuid,
        opened_by: Uuid,
        amount_fiat: Decimal,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO compliance_logs (kind, trade_id, user_id, amount_fiat, details)
             VALUES ('str', $1, $2, $3, 'trade dispute opened')",
        )
        .bind(trade_id)
        .bind(opened_by)
        .bind(amount_fiat)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::chain::Asset;
use crate::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeStatus {
    Pending,
    EscrowFunded,
    PaymentSent,
    PaymentConfirmed,
    CryptoReleased,
    Completed,
    Expired,
    Cancelled,
    Disputed,
    ResolvedBuyer,
    ResolvedSeller,
}

impl TradeStatus {
    /// The transition table. Everything not listed is rejected.
    pub fn can_transition_to(self, next: TradeStatus) -> bool {
        use TradeStatus::*;
        matches!(
            (self, next),
            (Pending, EscrowFunded | Expired | Cancelled)
                | (EscrowFunded, PaymentSent | Expired | Cancelled)
                | (PaymentSent, PaymentConfirmed | Disputed | Expired)
                | (PaymentConfirmed, CryptoReleased | Disputed | Expired)
                | (CryptoReleased, Completed)
                | (Disputed, ResolvedBuyer | ResolvedSeller)
        )
    }

    pub fn is_terminal(self) -> bool {
        use TradeStatus::*;
        matches!(
            self,
            Completed | Expired | Cancelled | ResolvedBuyer | ResolvedSeller
        )
    }

    /// States in which the seller's crypto sits in escrow and must be
    /// returned if the trade dies.
    pub fn holds_escrow(self) -> bool {
        use TradeStatus::*;
        matches!(self, EscrowFunded | PaymentSent | PaymentConfirmed)
    }
}

impl std::fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TradeStatus::Pending => "pending",
            TradeStatus::EscrowFunded => "escrow_funded",
            TradeStatus::PaymentSent => "payment_sent",
            TradeStatus::PaymentConfirmed => "payment_confirmed",
            TradeStatus::CryptoReleased => "crypto_released",
            TradeStatus::Completed => "completed",
            TradeStatus::Expired => "expired",
            TradeStatus::Cancelled => "cancelled",
            TradeStatus::Disputed => "disputed",
            TradeStatus::ResolvedBuyer => "resolved_buyer",
            TradeStatus::ResolvedSeller => "resolved_seller",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for TradeStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TradeStatus::Pending),
            "escrow_funded" => Ok(TradeStatus::EscrowFunded),
            "payment_sent" => Ok(TradeStatus::PaymentSent),
            "payment_confirmed" => Ok(TradeStatus::PaymentConfirmed),
            "crypto_released" => Ok(TradeStatus::CryptoReleased),
            "completed" => Ok(TradeStatus::Completed),
            "expired" => Ok(TradeStatus::Expired),
            "cancelled" => Ok(TradeStatus::Cancelled),
            "disputed" => Ok(TradeStatus::Disputed),
            "resolved_buyer" => Ok(TradeStatus::ResolvedBuyer),
            "resolved_seller" => Ok(TradeStatus::ResolvedSeller),
            other => Err(CoreError::Validation(format!(
                "unknown trade status: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Trade {
    pub id: Uuid,
    pub order_id: Uuid,
    pub buyer_id: Uuid,
    pub seller_id: Uuid,
    pub crypto_asset: String,
    pub amount_crypto: Decimal,
    pub amount_fiat: Decimal,
    pub price_per_unit: Decimal,
    pub fee_percent: Decimal,
    pub fee_amount: Decimal,
    pub status: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub holding_until: Option<DateTime<Utc>>,
    pub escrow_funded_at: Option<DateTime<Utc>>,
    pub payment_sent_at: Option<DateTime<Utc>>,
    pub payment_confirmed_at: Option<DateTime<Utc>>,
    pub crypto_released_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
    pub disputed_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Trade {
    pub fn status(&self) -> TradeStatus {
        self.status
            .parse()
            .expect("trade row carries a valid status")
    }

    pub fn asset(&self) -> Asset {
        self.crypto_asset
            .parse()
            .expect("trade row carries a valid asset")
    }

    pub fn is_party(&self, user_id: Uuid) -> bool {
        self.buyer_id == user_id || self.seller_id == user_id
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn insert(
        tx: &mut Transaction<'_, Postgres>,
        order_id: Uuid,
        buyer_id: Uuid,
        seller_id: Uuid,
        asset: Asset,
        amount_crypto: Decimal,
        amount_fiat: Decimal,
        price_per_unit: Decimal,
        fee_percent: Decimal,
        fee_amount: Decimal,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            "INSERT INTO trades
                (order_id, buyer_id, seller_id, crypto_asset, amount_crypto,
                 amount_fiat, price_per_unit, fee_percent, fee_amount, status)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'pending')
             RETURNING *",
        )
        .bind(order_id)
        .bind(buyer_id)
        .bind(seller_id)
        .bind(asset.as_str())
        .bind(amount_crypto)
        .bind(amount_fiat)
        .bind(price_per_unit)
        .bind(fee_percent)
        .bind(fee_amount)
        .fetch_one(&mut **tx)
        .await
    }

    pub async fn get(pool: &PgPool, trade_id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>("SELECT * FROM trades WHERE id = $1")
            .bind(trade_id)
            .fetch_optional(pool)
            .await
    }

    pub async fn lock(
        tx: &mut Transaction<'_, Postgres>,
        trade_id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>("SELECT * FROM trades WHERE id = $1 FOR UPDATE")
            .bind(trade_id)
            .fetch_optional(&mut **tx)
            .await
    }

    pub async fn list_for_user(
        pool: &PgPool,
        user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            "SELECT * FROM trades
             WHERE buyer_id = $1 OR seller_id = $1
             ORDER BY created_at DESC
             LIMIT $2 OFFSET $3",
        )
        .bind(user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await
    }

    /// Escrowed trades past their deadline (expiry / auto-dispute sweep).
    pub async fn list_deadline_passed(
        pool: &PgPool,
        status: TradeStatus,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            "SELECT * FROM trades WHERE status = $1 AND expires_at IS NOT NULL AND expires_at < NOW()",
        )
        .bind(status.to_string())
        .fetch_all(pool)
        .await
    }

    /// payment_confirmed trades whose holding window has elapsed. A NULL
    /// holding_until means immediately releasable.
    pub async fn list_releasable(pool: &PgPool) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            "SELECT * FROM trades WHERE status = 'payment_confirmed'
               AND (holding_until IS NULL OR holding_until <= NOW())",
        )
        .fetch_all(pool)
        .await
    }

    /// Trades that made it to crypto_released but whose completion commit
    /// never landed (crash recovery).
    pub async fn list_stuck_released(pool: &PgPool) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>("SELECT * FROM trades WHERE status = 'crypto_released'")
            .fetch_all(pool)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::TradeStatus::*;

    #[test]
    fn transition_table_accepts_the_lifecycle_paths() {
        assert!(Pending.can_transition_to(EscrowFunded));
        assert!(EscrowFunded.can_transition_to(PaymentSent));
        assert!(PaymentSent.can_transition_to(PaymentConfirmed));
        assert!(PaymentConfirmed.can_transition_to(CryptoReleased));
        assert!(CryptoReleased.can_transition_to(Completed));
        assert!(PaymentSent.can_transition_to(Disputed));
        assert!(Disputed.can_transition_to(ResolvedBuyer));
        assert!(Disputed.can_transition_to(ResolvedSeller));
    }

    #[test]
    fn transition_table_rejects_everything_else() {
        assert!(!Pending.can_transition_to(PaymentSent));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!EscrowFunded.can_transition_to(PaymentConfirmed));
        assert!(!EscrowFunded.can_transition_to(Disputed));
        assert!(!PaymentConfirmed.can_transition_to(Cancelled));
        assert!(!Completed.can_transition_to(Disputed));
        assert!(!Expired.can_transition_to(EscrowFunded));
        assert!(!ResolvedBuyer.can_transition_to(Completed));
        assert!(!CryptoReleased.can_transition_to(Disputed));
    }

    #[test]
    fn terminal_states() {
        for status in [Completed, Expired, Cancelled, ResolvedBuyer, ResolvedSeller] {
            assert!(status.is_terminal());
        }
        for status in [Pending, EscrowFunded, PaymentSent, PaymentConfirmed, CryptoReleased, Disputed]
        {
            assert!(!status.is_terminal());
        }
    }

    #[test]
    fn escrow_holding_states() {
        assert!(EscrowFunded.holds_escrow());
        assert!(PaymentSent.holds_escrow());
        assert!(PaymentConfirmed.holds_escrow());
        assert!(!Pending.holds_escrow());
        assert!(!CryptoReleased.holds_escrow());
    }
}

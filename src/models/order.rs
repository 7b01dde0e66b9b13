use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::chain::Asset;
use crate::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn counter(&self) -> OrderSide {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "buy"),
            OrderSide::Sell => write!(f, "sell"),
        }
    }
}

impl std::str::FromStr for OrderSide {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "buy" => Ok(OrderSide::Buy),
            "sell" => Ok(OrderSide::Sell),
            other => Err(CoreError::Validation(format!("unknown side: {other}"))),
        }
    }
}

/// How the order prices itself: float on the oracle with a premium, or a
/// fixed CAD price per unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pricing {
    Market,
    Fixed,
}

impl std::fmt::Display for Pricing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Pricing::Market => write!(f, "market"),
            Pricing::Fixed => write!(f, "fixed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Active,
    Paused,
    Filled,
    Cancelled,
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderStatus::Active => write!(f, "active"),
            OrderStatus::Paused => write!(f, "paused"),
            OrderStatus::Filled => write!(f, "filled"),
            OrderStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Order {
    pub id: Uuid,
    pub user_id: Uuid,
    pub side: String,
    pub crypto_asset: String,
    pub amount_fiat: Decimal,
    pub remaining_fiat: Decimal,
    pub pricing: String,
    pub premium_percent: Decimal,
    pub fixed_price: Option<Decimal>,
    pub min_match_fiat: Option<Decimal>,
    pub max_match_fiat: Option<Decimal>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn side(&self) -> OrderSide {
        self.side.parse().expect("order row carries a valid side")
    }

    pub fn asset(&self) -> Asset {
        self.crypto_asset
            .parse()
            .expect("order row carries a valid asset")
    }

    /// Price per unit this order trades at, given the current market price.
    /// Sellers quote; a sell at market + premium, a fixed sell at its price.
    pub fn resolve_price(&self, market_price: Decimal) -> Decimal {
        match self.pricing.as_str() {
            "fixed" => self.fixed_price.unwrap_or(market_price),
            _ => {
                let factor = Decimal::ONE + self.premium_percent / Decimal::from(100);
                super::LedgerEntry::round_fiat(market_price * factor)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn insert(
        tx: &mut Transaction<'_, Postgres>,
        user_id: Uuid,
        side: OrderSide,
        asset: Asset,
        amount_fiat: Decimal,
        pricing: Pricing,
        premium_percent: Decimal,
        fixed_price: Option<Decimal>,
        min_match_fiat: Option<Decimal>,
        max_match_fiat: Option<Decimal>,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            "INSERT INTO orders
                (user_id, side, crypto_asset, amount_fiat, remaining_fiat, pricing,
                 premium_percent, fixed_price, min_match_fiat, max_match_fiat, status)
             VALUES ($1, $2, $3, $4, $4, $5, $6, $7, $8, $9, 'active')
             RETURNING *",
        )
        .bind(user_id)
        .bind(side.to_string())
        .bind(asset.as_str())
        .bind(amount_fiat)
        .bind(pricing.to_string())
        .bind(premium_percent)
        .bind(fixed_price)
        .bind(min_match_fiat)
        .bind(max_match_fiat)
        .fetch_one(&mut **tx)
        .await
    }

    pub async fn get(pool: &PgPool, order_id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>("SELECT * FROM orders WHERE id = $1")
            .bind(order_id)
            .fetch_optional(pool)
            .await
    }

    pub async fn lock(
        tx: &mut Transaction<'_, Postgres>,
        order_id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>("SELECT * FROM orders WHERE id = $1 FOR UPDATE")
            .bind(order_id)
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
            "SELECT * FROM orders WHERE user_id = $1
             ORDER BY created_at DESC LIMIT $2 OFFSET $3",
        )
        .bind(user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await
    }

    /// Counter-side candidates for matching, oldest first (crude FIFO; the
    /// seller's pricing rule sets the price).
    pub async fn match_candidates(
        tx: &mut Transaction<'_, Postgres>,
        side: OrderSide,
        asset: Asset,
        exclude_user: Uuid,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            "SELECT * FROM orders
             WHERE status = 'active' AND side = $1 AND crypto_asset = $2
               AND remaining_fiat > 0 AND user_id <> $3
             ORDER BY created_at ASC
             FOR UPDATE SKIP LOCKED",
        )
        .bind(side.counter().to_string())
        .bind(asset.as_str())
        .bind(exclude_user)
        .fetch_all(&mut **tx)
        .await
    }

    pub async fn list_rematchable(pool: &PgPool) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            "SELECT * FROM orders WHERE status = 'active' AND remaining_fiat > 0
             ORDER BY created_at ASC",
        )
        .fetch_all(pool)
        .await
    }

    /// Reduce remaining_fiat after a trade split; flips to filled at zero.
    pub async fn consume(
        tx: &mut Transaction<'_, Postgres>,
        order_id: Uuid,
        fiat: Decimal,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            "UPDATE orders SET
                remaining_fiat = remaining_fiat - $1,
                status = CASE WHEN remaining_fiat - $1 <= 0 THEN 'filled' ELSE status END,
                updated_at = NOW()
             WHERE id = $2
             RETURNING *",
        )
        .bind(fiat)
        .bind(order_id)
        .fetch_one(&mut **tx)
        .await
    }

    /// User-driven cancel; only pre-terminal states qualify.
    pub async fn cancel(pool: &PgPool, user_id: Uuid, order_id: Uuid) -> Result<Self, CoreError> {
        let mut tx = pool.begin().await?;
        let order = sqlx::query_as::<_, Self>(
            "SELECT * FROM orders WHERE id = $1 AND user_id = $2 FOR UPDATE",
        )
        .bind(order_id)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(CoreError::NotFound("order"))?;

        match order.status.as_str() {
            "active" | "paused" => {}
            status => {
                return Err(CoreError::Conflict(format!(
                    "order is {status} and cannot be cancelled"
                )))
            }
        }

        let updated = sqlx::query_as::<_, Self>(
            "UPDATE orders SET status = 'cancelled', updated_at = NOW() WHERE id = $1 RETURNING *",
        )
        .bind(order_id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(updated)
    }

    /// Terminal cancel from inside the intake transaction when no trade
    /// could be produced.
    pub async fn cancel_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        order_id: Uuid,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE orders SET status = 'cancelled', updated_at = NOW() WHERE id = $1")
            .bind(order_id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn order_with(pricing: &str, premium: Decimal, fixed: Option<Decimal>) -> Order {
        Order {
            id: Uuid::nil(),
            user_id: Uuid::nil(),
            side: "sell".into(),
            crypto_asset: "BTC".into(),
            amount_fiat: dec!(1000),
            remaining_fiat: dec!(1000),
            pricing: pricing.into(),
            premium_percent: premium,
            fixed_price: fixed,
            min_match_fiat: None,
            max_match_fiat: None,
            status: "active".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn market_pricing_applies_premium() {
        let order = order_with("market", dec!(2), None);
        assert_eq!(order.resolve_price(dec!(50000)), dec!(51000));
    }

    #[test]
    fn fixed_pricing_ignores_market() {
        let order = order_with("fixed", dec!(0), Some(dec!(48000)));
        assert_eq!(order.resolve_price(dec!(50000)), dec!(48000));
    }
}

pub mod platform;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{Postgres, Transaction};
use std::time::Duration;
use uuid::Uuid;

use crate::bus::{OrderBookEvent, TradeEvent, TradeEventKind};
use crate::chain::Asset;
use crate::engine::{self, fees};
use crate::error::CoreError;
use crate::models::{
    Balance, LedgerEntry, Order, OrderSide, Pricing, Trade, User,
};
use crate::AppState;

/// Order intake responses are cached under the client idempotency key for
/// this long.
const IDEMPOTENCY_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct PlaceOrderRequest {
    pub side: OrderSide,
    pub asset: Asset,
    pub amount_fiat: Decimal,
    pub pricing: Pricing,
    pub premium_percent: Decimal,
    pub fixed_price: Option<Decimal>,
    pub min_match_fiat: Option<Decimal>,
    pub max_match_fiat: Option<Decimal>,
    pub idempotency_key: Option<String>,
}

#[derive(Debug)]
pub struct PlaceOrderOutcome {
    pub order: Order,
    pub trade_ids: Vec<Uuid>,
    /// True when the response was served from the idempotency cache.
    pub replayed: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct CachedIntake {
    order_id: Uuid,
    trade_ids: Vec<Uuid>,
}

/// Order intake: validate, insert, then fill P2P-first with the platform
/// covering the residue. An order that produced no trade at all is cancelled
/// atomically and the intake fails.
pub async fn place_order(
    state: &AppState,
    user_id: Uuid,
    req: PlaceOrderRequest,
) -> Result<PlaceOrderOutcome, CoreError> {
    let cache_key = req
        .idempotency_key
        .as_ref()
        .map(|key| format!("order_intake:{user_id}:{key}"));

    if let Some(key) = &cache_key {
        if let Some(cached) = state.bus.cache_get(key).await {
            if let Ok(prior) = serde_json::from_str::<CachedIntake>(&cached) {
                let order = Order::get(&state.pool, prior.order_id)
                    .await?
                    .ok_or(CoreError::NotFound("order"))?;
                return Ok(PlaceOrderOutcome {
                    order,
                    trade_ids: prior.trade_ids,
                    replayed: true,
                });
            }
        }
    }

    let amount_fiat = LedgerEntry::round_fiat(req.amount_fiat);
    if amount_fiat <= Decimal::ZERO {
        return Err(CoreError::Validation("amount must be positive".into()));
    }
    if req.pricing == Pricing::Fixed && req.fixed_price.is_none() {
        return Err(CoreError::Validation("fixed pricing requires a price".into()));
    }

    let user = User::find_by_id(&state.pool, user_id)
        .await?
        .ok_or(CoreError::NotFound("user"))?;
    if !user.is_verified() {
        return Err(CoreError::PermissionDenied(
            "identity verification is required to trade".into(),
        ));
    }
    if req.side == OrderSide::Sell && !user.autodeposit_verified {
        return Err(CoreError::PermissionDenied(
            "sellers must verify e-Transfer autodeposit".into(),
        ));
    }
    if amount_fiat > user.max_trade_limit {
        return Err(CoreError::Validation(format!(
            "amount exceeds your {} CAD trade limit",
            user.max_trade_limit
        )));
    }

    let market_price = state.prices.price_cad(req.asset).await?;

    // Insert the order; for sells, check debit-eligibility under lock in the
    // same transaction so a concurrent spend cannot fake liquidity. No funds
    // move yet: crypto is locked per-trade, not per-order.
    let mut tx = state.pool.begin().await?;
    if req.side == OrderSide::Sell {
        let sell_price = resolve_request_price(&req, market_price);
        let needed = LedgerEntry::round_crypto(amount_fiat / sell_price);
        let balance = Balance::lock(&mut tx, user_id, req.asset)
            .await?
            .ok_or(CoreError::NoBalanceRow {
                user_id,
                asset: req.asset.as_str().to_string(),
            })?;
        if balance.available < needed {
            return Err(CoreError::InsufficientFunds {
                available: balance.available,
                required: needed,
            });
        }
    }
    let order = Order::insert(
        &mut tx,
        user_id,
        req.side,
        req.asset,
        amount_fiat,
        req.pricing,
        req.premium_percent,
        req.fixed_price,
        req.min_match_fiat,
        req.max_match_fiat,
    )
    .await?;
    tx.commit().await?;

    let trade_ids = fill_order(state, order.id).await?;

    if trade_ids.is_empty() {
        let mut tx = state.pool.begin().await?;
        Order::cancel_in_tx(&mut tx, order.id).await?;
        tx.commit().await?;
        return Err(CoreError::Conflict(
            "order could not be matched or platform-filled".into(),
        ));
    }

    let order = Order::get(&state.pool, order.id)
        .await?
        .ok_or(CoreError::NotFound("order"))?;

    if let Some(key) = &cache_key {
        let cached = CachedIntake {
            order_id: order.id,
            trade_ids: trade_ids.clone(),
        };
        if let Ok(body) = serde_json::to_string(&cached) {
            state.bus.cache_set(key, &body, IDEMPOTENCY_TTL).await;
        }
    }

    Ok(PlaceOrderOutcome {
        order,
        trade_ids,
        replayed: false,
    })
}

/// P2P pass then platform gap-fill for whatever remains. Used by intake and
/// by the rematch worker; returns the ids of trades created in this call.
pub async fn fill_order(state: &AppState, order_id: Uuid) -> Result<Vec<Uuid>, CoreError> {
    let mut trade_ids = p2p_match_pass(state, order_id).await?;

    let order = Order::get(&state.pool, order_id)
        .await?
        .ok_or(CoreError::NotFound("order"))?;
    if order.status == "active" && order.remaining_fiat > Decimal::ZERO {
        match platform::gap_fill(state, &order).await {
            Ok(trade) => trade_ids.push(trade.id),
            Err(e)
                if e.is_transient()
                    || matches!(
                        e,
                        CoreError::PriceUnavailable(_) | CoreError::InsufficientFunds { .. }
                    ) =>
            {
                // Order stays active with a positive residue; the rematch
                // worker retries next cycle.
                tracing::warn!("Platform gap fill deferred for order {}: {}", order_id, e);
            }
            Err(e) => return Err(e),
        }
    }

    publish_order_update(state, order_id).await;
    Ok(trade_ids)
}

/// Walk counter-side orders oldest-first and split trades until the order is
/// exhausted or candidates run out. One transaction for the whole pass; a
/// candidate whose seller cannot fund escrow is skipped without poisoning
/// the rest.
async fn p2p_match_pass(state: &AppState, order_id: Uuid) -> Result<Vec<Uuid>, CoreError> {
    let market_price = match Order::get(&state.pool, order_id).await? {
        Some(order) => state.prices.price_cad(order.asset()).await?,
        None => return Err(CoreError::NotFound("order")),
    };

    let mut tx = state.pool.begin().await?;
    let Some(mut order) = Order::lock(&mut tx, order_id).await? else {
        return Err(CoreError::NotFound("order"));
    };
    if order.status != "active" || order.remaining_fiat <= Decimal::ZERO {
        tx.rollback().await?;
        return Ok(Vec::new());
    }

    let candidates =
        Order::match_candidates(&mut tx, order.side(), order.asset(), order.user_id).await?;

    let mut created = Vec::new();
    for candidate in candidates {
        if order.remaining_fiat <= Decimal::ZERO {
            break;
        }

        let match_fiat = match_amount(&order, &candidate);
        if match_fiat <= Decimal::ZERO {
            continue;
        }

        // Price is always set by the sell side's rule.
        let (buy_order, sell_order) = match order.side() {
            OrderSide::Buy => (&order, &candidate),
            OrderSide::Sell => (&candidate, &order),
        };
        let price = sell_order.resolve_price(market_price);
        if price <= Decimal::ZERO {
            continue;
        }

        match split_trade(
            state,
            &mut tx,
            &order,
            buy_order.user_id,
            sell_order.user_id,
            candidate.id,
            match_fiat,
            price,
        )
        .await?
        {
            Some(trade) => {
                order = Order::consume(&mut tx, order.id, match_fiat).await?;
                Order::consume(&mut tx, candidate.id, match_fiat).await?;
                created.push(trade);
            }
            None => continue,
        }
    }

    tx.commit().await?;

    for trade in &created {
        publish_trade_created(state, trade).await;
    }

    Ok(created.into_iter().map(|t| t.id).collect())
}

/// Admin-forced pairing of two specific orders, bypassing FIFO selection
/// and per-match bounds. The price still comes from the sell side's rule;
/// everything downstream (fee credit, escrow, order consumption) is the
/// same split used by the ordinary match pass.
pub async fn manual_match(
    state: &AppState,
    buy_order_id: Uuid,
    sell_order_id: Uuid,
    amount_fiat: Option<Decimal>,
) -> Result<Trade, CoreError> {
    if buy_order_id == sell_order_id {
        return Err(CoreError::Validation("orders must be distinct".into()));
    }

    let buy_probe = Order::get(&state.pool, buy_order_id)
        .await?
        .ok_or(CoreError::NotFound("order"))?;
    let market_price = state.prices.price_cad(buy_probe.asset()).await?;

    let mut tx = state.pool.begin().await?;
    let buy = Order::lock(&mut tx, buy_order_id)
        .await?
        .ok_or(CoreError::NotFound("order"))?;
    let sell = Order::lock(&mut tx, sell_order_id)
        .await?
        .ok_or(CoreError::NotFound("order"))?;

    if buy.side() != OrderSide::Buy || sell.side() != OrderSide::Sell {
        return Err(CoreError::Validation(
            "manual match needs one buy order and one sell order".into(),
        ));
    }
    if buy.crypto_asset != sell.crypto_asset {
        return Err(CoreError::Validation("orders are for different assets".into()));
    }
    if buy.user_id == sell.user_id {
        return Err(CoreError::Validation("orders belong to the same user".into()));
    }
    for order in [&buy, &sell] {
        if order.status != "active" || order.remaining_fiat <= Decimal::ZERO {
            return Err(CoreError::Conflict(format!(
                "order {} has nothing left to fill",
                order.id
            )));
        }
    }

    let ceiling = buy.remaining_fiat.min(sell.remaining_fiat);
    let match_fiat = LedgerEntry::round_fiat(amount_fiat.unwrap_or(ceiling));
    if match_fiat <= Decimal::ZERO || match_fiat > ceiling {
        return Err(CoreError::Validation(format!(
            "match amount must be within (0, {ceiling}]"
        )));
    }

    let price = sell.resolve_price(market_price);
    if price <= Decimal::ZERO {
        return Err(CoreError::PriceUnavailable(buy.crypto_asset.clone()));
    }

    let trade = split_trade(
        state,
        &mut tx,
        &buy,
        buy.user_id,
        sell.user_id,
        sell.id,
        match_fiat,
        price,
    )
    .await?
    .ok_or_else(|| CoreError::Conflict("seller cannot cover escrow for this match".into()))?;

    Order::consume(&mut tx, buy.id, match_fiat).await?;
    Order::consume(&mut tx, sell.id, match_fiat).await?;
    tx.commit().await?;

    publish_trade_created(state, &trade).await;
    publish_order_update(state, buy_order_id).await;
    publish_order_update(state, sell_order_id).await;
    Ok(trade)
}

/// Largest fiat slice both orders accept, respecting per-match bounds.
fn match_amount(order: &Order, candidate: &Order) -> Decimal {
    let mut amount = order.remaining_fiat.min(candidate.remaining_fiat);
    for cap in [order.max_match_fiat, candidate.max_match_fiat]
        .into_iter()
        .flatten()
    {
        amount = amount.min(cap);
    }
    for floor in [order.min_match_fiat, candidate.min_match_fiat]
        .into_iter()
        .flatten()
    {
        if amount < floor {
            return Decimal::ZERO;
        }
    }
    LedgerEntry::round_fiat(amount)
}

/// Create one trade inside the matching transaction: fee credit applied for
/// the taker, trade row inserted, escrow funded. Returns None when the
/// seller cannot cover escrow (checked under lock before any write).
#[allow(clippy::too_many_arguments)]
async fn split_trade(
    state: &AppState,
    tx: &mut Transaction<'_, Postgres>,
    taker_order: &Order,
    buyer_id: Uuid,
    seller_id: Uuid,
    counter_order_id: Uuid,
    match_fiat: Decimal,
    price: Decimal,
) -> Result<Option<Trade>, CoreError> {
    let asset = taker_order.asset();
    let amount_crypto = LedgerEntry::round_crypto(match_fiat / price);
    if amount_crypto <= Decimal::ZERO {
        return Ok(None);
    }

    // Pre-check the seller under lock so a shortfall skips this candidate
    // instead of aborting the whole pass.
    let seller_balance = Balance::lock(tx, seller_id, asset)
        .await?
        .ok_or(CoreError::NoBalanceRow {
            user_id: seller_id,
            asset: asset.as_str().to_string(),
        })?;
    if seller_balance.available < amount_crypto {
        tracing::debug!(
            "Skipping candidate order {}: seller short {} {}",
            counter_order_id,
            amount_crypto,
            asset
        );
        return Ok(None);
    }

    let fee = fees::compute_fee(amount_crypto, state.config.taker_fee_percent);
    let fee_cad = LedgerEntry::round_fiat(fee.fee_amount * price);
    let credit_used = User::consume_fee_credit(tx, taker_order.user_id, fee_cad).await?;
    let (fee_amount, _) = fees::apply_fee_credit(fee.fee_amount, credit_used, price);

    let trade = Trade::insert(
        tx,
        taker_order.id,
        buyer_id,
        seller_id,
        asset,
        amount_crypto,
        match_fiat,
        price,
        state.config.taker_fee_percent,
        fee_amount,
    )
    .await?;

    let funded = engine::fund_escrow_in_tx(&state.config, tx, &trade).await?;
    Ok(Some(funded))
}

pub(crate) async fn publish_trade_created(state: &AppState, trade: &Trade) {
    state
        .bus
        .publish_trade(&TradeEvent {
            kind: TradeEventKind::TradeCreated,
            trade_id: trade.id,
            buyer_id: trade.buyer_id,
            seller_id: trade.seller_id,
            old_status: None,
            new_status: trade.status.clone(),
            timestamp: Utc::now(),
        })
        .await;
}

async fn publish_order_update(state: &AppState, order_id: Uuid) {
    let Ok(Some(order)) = Order::get(&state.pool, order_id).await else {
        return;
    };
    state
        .bus
        .publish_orderbook(&OrderBookEvent {
            order_id: order.id,
            asset: order.asset(),
            side: order.side.clone(),
            remaining_fiat: order.remaining_fiat.to_string(),
            status: order.status.clone(),
            timestamp: Utc::now(),
        })
        .await;
}

fn resolve_request_price(req: &PlaceOrderRequest, market_price: Decimal) -> Decimal {
    match req.pricing {
        Pricing::Fixed => req.fixed_price.unwrap_or(market_price),
        Pricing::Market => {
            let factor = Decimal::ONE + req.premium_percent / Decimal::from(100);
            LedgerEntry::round_fiat(market_price * factor)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn order(remaining: Decimal, min: Option<Decimal>, max: Option<Decimal>) -> Order {
        Order {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            side: "buy".into(),
            crypto_asset: "BTC".into(),
            amount_fiat: remaining,
            remaining_fiat: remaining,
            pricing: "market".into(),
            premium_percent: Decimal::ZERO,
            fixed_price: None,
            min_match_fiat: min,
            max_match_fiat: max,
            status: "active".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn match_amount_takes_the_smaller_side() {
        let a = order(dec!(1000), None, None);
        let b = order(dec!(400), None, None);
        assert_eq!(match_amount(&a, &b), dec!(400));
    }

    #[test]
    fn match_amount_respects_caps() {
        let a = order(dec!(1000), None, Some(dec!(250)));
        let b = order(dec!(400), None, None);
        assert_eq!(match_amount(&a, &b), dec!(250));
    }

    #[test]
    fn match_amount_zero_below_floor() {
        let a = order(dec!(100), None, None);
        let b = order(dec!(400), Some(dec!(200)), None);
        assert_eq!(match_amount(&a, &b), Decimal::ZERO);
    }
}

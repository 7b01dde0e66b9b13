use rand::Rng;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::engine::{self, fees, Actor};
use crate::error::CoreError;
use crate::models::{
    Balance, LedgerEntry, Order, OrderSide, Trade, TradeStatus, User, PLATFORM_USER_ID,
};
use crate::AppState;

/// Market-maker of last resort: cover an order's residual remaining_fiat at
/// the spread-adjusted oracle price. The platform is always counterparty.
pub async fn gap_fill(state: &AppState, order: &Order) -> Result<Trade, CoreError> {
    let market = state.prices.price_cad(order.asset()).await?;
    let spread = state.config.platform_spread_percent / Decimal::from(100);

    match order.side() {
        OrderSide::Buy => {
            let price = LedgerEntry::round_fiat(market * (Decimal::ONE + spread));
            create_platform_fill(state, order.id, price).await
        }
        OrderSide::Sell => {
            let price = LedgerEntry::round_fiat(market * (Decimal::ONE - spread));
            create_platform_buy_fill(state, order.id, price).await
        }
    }
}

/// Platform sells to a buy order. The fiat amount gains 1-99 random cents so
/// the operator can tell concurrent e-Transfers apart; the padding never
/// exceeds $0.99 over the residual.
pub async fn create_platform_fill(
    state: &AppState,
    buy_order_id: Uuid,
    price_per_unit: Decimal,
) -> Result<Trade, CoreError> {
    if price_per_unit <= Decimal::ZERO {
        return Err(CoreError::PriceUnavailable("platform fill".into()));
    }
    let cents: i64 = rand::thread_rng().gen_range(1..=99);

    let mut tx = state.pool.begin().await?;
    let order = Order::lock(&mut tx, buy_order_id)
        .await?
        .ok_or(CoreError::NotFound("order"))?;
    if order.status != "active" || order.remaining_fiat <= Decimal::ZERO {
        return Err(CoreError::Conflict("order has nothing left to fill".into()));
    }

    let amount_fiat = order.remaining_fiat + Decimal::new(cents, 2);
    let amount_crypto = LedgerEntry::round_crypto(amount_fiat / price_per_unit);

    let fee = fees::compute_fee(amount_crypto, state.config.taker_fee_percent);
    let fee_cad = LedgerEntry::round_fiat(fee.fee_amount * price_per_unit);
    let credit_used = User::consume_fee_credit(&mut tx, order.user_id, fee_cad).await?;
    let (fee_amount, _) = fees::apply_fee_credit(fee.fee_amount, credit_used, price_per_unit);

    let trade = Trade::insert(
        &mut tx,
        order.id,
        order.user_id,
        PLATFORM_USER_ID,
        order.asset(),
        amount_crypto,
        amount_fiat,
        price_per_unit,
        state.config.taker_fee_percent,
        fee_amount,
    )
    .await?;

    // Platform escrow: available down, locked up, both free to go negative.
    let funded = engine::fund_escrow_in_tx(&state.config, &mut tx, &trade).await?;
    Order::consume(&mut tx, order.id, order.remaining_fiat).await?;

    tx.commit().await?;

    super::publish_trade_created(state, &funded).await;
    Ok(funded)
}

/// Platform buys from a sell order: the seller's crypto goes into escrow,
/// then the trade auto-advances straight through to completed because the
/// platform owes the fiat off-platform.
pub async fn create_platform_buy_fill(
    state: &AppState,
    sell_order_id: Uuid,
    price_per_unit: Decimal,
) -> Result<Trade, CoreError> {
    if price_per_unit <= Decimal::ZERO {
        return Err(CoreError::PriceUnavailable("platform fill".into()));
    }

    let mut tx = state.pool.begin().await?;
    let order = Order::lock(&mut tx, sell_order_id)
        .await?
        .ok_or(CoreError::NotFound("order"))?;
    if order.status != "active" || order.remaining_fiat <= Decimal::ZERO {
        return Err(CoreError::Conflict("order has nothing left to fill".into()));
    }

    let asset = order.asset();
    let amount_fiat = order.remaining_fiat;
    let amount_crypto = LedgerEntry::round_crypto(amount_fiat / price_per_unit);

    let seller_balance = Balance::lock(&mut tx, order.user_id, asset)
        .await?
        .ok_or(CoreError::NoBalanceRow {
            user_id: order.user_id,
            asset: asset.as_str().to_string(),
        })?;
    if seller_balance.available < amount_crypto {
        return Err(CoreError::InsufficientFunds {
            available: seller_balance.available,
            required: amount_crypto,
        });
    }

    let fee = fees::compute_fee(amount_crypto, state.config.taker_fee_percent);
    let fee_cad = LedgerEntry::round_fiat(fee.fee_amount * price_per_unit);
    let credit_used = User::consume_fee_credit(&mut tx, order.user_id, fee_cad).await?;
    let (fee_amount, _) = fees::apply_fee_credit(fee.fee_amount, credit_used, price_per_unit);

    let trade = Trade::insert(
        &mut tx,
        order.id,
        PLATFORM_USER_ID,
        order.user_id,
        asset,
        amount_crypto,
        amount_fiat,
        price_per_unit,
        state.config.taker_fee_percent,
        fee_amount,
    )
    .await?;

    let funded = engine::fund_escrow_in_tx(&state.config, &mut tx, &trade).await?;
    Order::consume(&mut tx, order.id, amount_fiat).await?;

    tx.commit().await?;

    super::publish_trade_created(state, &funded).await;

    // Auto-advance: the platform's fiat leg settles off-book immediately.
    for status in [
        TradeStatus::PaymentSent,
        TradeStatus::PaymentConfirmed,
        TradeStatus::CryptoReleased,
        TradeStatus::Completed,
    ] {
        engine::transition_trade(state, funded.id, status, Actor::System, None).await?;
    }

    Trade::get(&state.pool, funded.id)
        .await?
        .ok_or(CoreError::NotFound("trade"))
}

/// Called after a buyer marks payment_sent on a platform-as-seller trade:
/// move to payment_confirmed with the operator's verification window instead
/// of waiting on a human seller. The release worker completes it later.
pub async fn auto_advance_platform_trade(state: &AppState, trade_id: Uuid) -> Result<(), CoreError> {
    let trade = Trade::get(&state.pool, trade_id)
        .await?
        .ok_or(CoreError::NotFound("trade"))?;

    if trade.seller_id != PLATFORM_USER_ID || trade.status() != TradeStatus::PaymentSent {
        return Ok(());
    }

    engine::transition_trade(
        state,
        trade_id,
        TradeStatus::PaymentConfirmed,
        Actor::System,
        None,
    )
    .await?;
    Ok(())
}

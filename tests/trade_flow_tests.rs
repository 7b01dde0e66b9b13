mod common;

use common::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serial_test::serial;

use exchange_core::chain::Asset;
use exchange_core::engine::{self, Actor, DisputeDetails};
use exchange_core::error::CoreError;
use exchange_core::matching::{self, PlaceOrderRequest};
use exchange_core::models::{
    Dispute, OrderSide, Pricing, Trade, TradeStatus, User, PLATFORM_USER_ID,
};
use exchange_core::AppState;

fn buy_request(amount_fiat: Decimal) -> PlaceOrderRequest {
    PlaceOrderRequest {
        side: OrderSide::Buy,
        asset: Asset::Btc,
        amount_fiat,
        pricing: Pricing::Market,
        premium_percent: Decimal::ZERO,
        fixed_price: None,
        min_match_fiat: None,
        max_match_fiat: None,
        idempotency_key: None,
    }
}

/// Create a P2P trade in escrow_funded: standing sell order from the seller,
/// incoming buy order from the buyer.
async fn p2p_trade(state: &AppState, buyer: uuid::Uuid, seller: uuid::Uuid) -> Trade {
    fixture_sell_order(&state.pool, seller, Asset::Btc, dec!(1000)).await;
    let outcome = matching::place_order(state, buyer, buy_request(dec!(1000)))
        .await
        .expect("buy order should match p2p");
    assert_eq!(outcome.trade_ids.len(), 1);
    let trade = Trade::get(&state.pool, outcome.trade_ids[0])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(trade.seller_id, seller, "p2p match, not platform fill");
    trade
}

#[tokio::test]
#[serial]
async fn happy_p2p_buy_settles_with_six_ledger_rows() {
    let state = setup_state().await;
    let buyer = create_trader(&state.pool, "happy_buyer@test.com", 5).await;
    let seller = create_trader(&state.pool, "happy_seller@test.com", 0).await;
    fund_available(&state.pool, seller, Asset::Btc, dec!(0.02)).await;

    let trade = p2p_trade(&state, buyer, seller).await;
    assert_eq!(trade.status(), TradeStatus::EscrowFunded);
    assert_eq!(trade.amount_crypto, dec!(0.02));
    assert_eq!(trade.price_per_unit, dec!(50000));
    assert_eq!(trade.fee_amount, dec!(0.0002));
    assert!(trade.expires_at.is_some());

    // Escrow moved the seller's funds into locked.
    let seller_balance = balance_of(&state.pool, seller, Asset::Btc).await;
    assert_eq!(seller_balance.available, Decimal::ZERO);
    assert_eq!(seller_balance.locked, dec!(0.02));

    engine::transition_trade(
        &state,
        trade.id,
        TradeStatus::PaymentSent,
        Actor::User(buyer),
        None,
    )
    .await
    .unwrap();
    engine::transition_trade(
        &state,
        trade.id,
        TradeStatus::PaymentConfirmed,
        Actor::User(seller),
        None,
    )
    .await
    .unwrap();

    // Buyer has five completed trades, so no holding period applies.
    let confirmed = Trade::get(&state.pool, trade.id).await.unwrap().unwrap();
    assert!(confirmed.holding_until.unwrap() <= chrono::Utc::now());

    let completed = engine::release_trade(&state, trade.id).await.unwrap();
    assert_eq!(completed.status(), TradeStatus::Completed);

    let seller_balance = balance_of(&state.pool, seller, Asset::Btc).await;
    assert_eq!(seller_balance.available, Decimal::ZERO);
    assert_eq!(seller_balance.locked, Decimal::ZERO);

    let buyer_balance = balance_of(&state.pool, buyer, Asset::Btc).await;
    assert_eq!(buyer_balance.available, dec!(0.0198));

    let platform_balance = balance_of(&state.pool, PLATFORM_USER_ID, Asset::Btc).await;
    assert_eq!(platform_balance.available, dec!(0.0002));

    // Both trade counts incremented, limits re-derived.
    let buyer_row = User::find_by_id(&state.pool, buyer).await.unwrap().unwrap();
    let seller_row = User::find_by_id(&state.pool, seller).await.unwrap().unwrap();
    assert_eq!(buyer_row.trade_count, 6);
    assert_eq!(seller_row.trade_count, 1);
    assert_eq!(buyer_row.max_trade_limit, dec!(1000));

    // Exactly six ledger rows under deterministic trade keys.
    let keys: Vec<String> = sqlx::query_scalar(
        "SELECT idempotency_key FROM balance_ledger WHERE trade_id = $1 ORDER BY idempotency_key",
    )
    .bind(trade.id)
    .fetch_all(&state.pool)
    .await
    .unwrap();
    let expected: Vec<String> = [
        "credit:available",
        "escrow_lock:available",
        "escrow_lock:locked",
        "fee:buyer",
        "fee:seller",
        "release:locked",
    ]
    .iter()
    .map(|step| format!("trade:{}:{}", trade.id, step))
    .collect();
    assert_eq!(keys, expected);
}

#[tokio::test]
#[serial]
async fn expired_escrow_round_trips_the_seller_balance() {
    let state = setup_state().await;
    let buyer = create_trader(&state.pool, "expire_buyer@test.com", 5).await;
    let seller = create_trader(&state.pool, "expire_seller@test.com", 5).await;
    fund_available(&state.pool, seller, Asset::Btc, dec!(0.05)).await;

    let before = balance_of(&state.pool, seller, Asset::Btc).await;
    let trade = p2p_trade(&state, buyer, seller).await;

    engine::transition_trade(&state, trade.id, TradeStatus::Expired, Actor::System, None)
        .await
        .unwrap();

    let after = balance_of(&state.pool, seller, Asset::Btc).await;
    assert_eq!(after.available, before.available);
    assert_eq!(after.locked, before.locked);

    let buyer_balance = balance_of(&state.pool, buyer, Asset::Btc).await;
    assert_eq!(buyer_balance.available, Decimal::ZERO);
}

#[tokio::test]
#[serial]
async fn invalid_transitions_are_rejected_without_side_effects() {
    let state = setup_state().await;
    let buyer = create_trader(&state.pool, "invalid_buyer@test.com", 5).await;
    let seller = create_trader(&state.pool, "invalid_seller@test.com", 5).await;
    fund_available(&state.pool, seller, Asset::Btc, dec!(0.02)).await;

    let trade = p2p_trade(&state, buyer, seller).await;

    // escrow_funded cannot jump to payment_confirmed or completed.
    for target in [TradeStatus::PaymentConfirmed, TradeStatus::Completed] {
        let err = engine::transition_trade(&state, trade.id, target, Actor::System, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition { .. }), "{target} must be rejected");
    }

    let unchanged = Trade::get(&state.pool, trade.id).await.unwrap().unwrap();
    assert_eq!(unchanged.status(), TradeStatus::EscrowFunded);

    let seller_balance = balance_of(&state.pool, seller, Asset::Btc).await;
    assert_eq!(seller_balance.locked, dec!(0.02));
}

#[tokio::test]
#[serial]
async fn actor_matrix_is_enforced() {
    let state = setup_state().await;
    let buyer = create_trader(&state.pool, "actor_buyer@test.com", 5).await;
    let seller = create_trader(&state.pool, "actor_seller@test.com", 5).await;
    let outsider = create_trader(&state.pool, "actor_outsider@test.com", 5).await;
    fund_available(&state.pool, seller, Asset::Btc, dec!(0.02)).await;

    let trade = p2p_trade(&state, buyer, seller).await;

    // Seller cannot mark the buyer's payment sent; outsiders cannot touch it.
    for actor in [Actor::User(seller), Actor::User(outsider)] {
        let err = engine::transition_trade(&state, trade.id, TradeStatus::PaymentSent, actor, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::PermissionDenied(_)));
    }

    engine::transition_trade(
        &state,
        trade.id,
        TradeStatus::PaymentSent,
        Actor::User(buyer),
        None,
    )
    .await
    .unwrap();

    // No user may drive the release leg.
    let err = engine::transition_trade(
        &state,
        trade.id,
        TradeStatus::PaymentConfirmed,
        Actor::User(buyer),
        None,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, CoreError::PermissionDenied(_)));

    // A user cannot cancel once escrow is funded.
    let err = engine::transition_trade(
        &state,
        trade.id,
        TradeStatus::Cancelled,
        Actor::User(buyer),
        None,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, CoreError::PermissionDenied(_)));
}

#[tokio::test]
#[serial]
async fn dispute_writes_str_and_resolution_pays_the_right_side() {
    let state = setup_state().await;
    let buyer = create_trader(&state.pool, "dispute_buyer@test.com", 5).await;
    let seller = create_trader(&state.pool, "dispute_seller@test.com", 5).await;
    fund_available(&state.pool, seller, Asset::Btc, dec!(0.02)).await;

    let trade = p2p_trade(&state, buyer, seller).await;

    engine::transition_trade(
        &state,
        trade.id,
        TradeStatus::PaymentSent,
        Actor::User(buyer),
        None,
    )
    .await
    .unwrap();
    engine::transition_trade(
        &state,
        trade.id,
        TradeStatus::Disputed,
        Actor::User(buyer),
        Some(DisputeDetails {
            opened_by: buyer,
            reason: Some("seller never confirmed".into()),
        }),
    )
    .await
    .unwrap();

    let dispute = Dispute::for_trade(&state.pool, trade.id).await.unwrap().unwrap();
    assert_eq!(dispute.opened_by, buyer);
    assert_eq!(dispute.status, "open");

    let str_rows: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM compliance_logs WHERE kind = 'str' AND trade_id = $1",
    )
    .bind(trade.id)
    .fetch_one(&state.pool)
    .await
    .unwrap();
    assert_eq!(str_rows, 1);

    // Escrow stays locked while disputed.
    let seller_balance = balance_of(&state.pool, seller, Asset::Btc).await;
    assert_eq!(seller_balance.locked, dec!(0.02));

    engine::transition_trade(
        &state,
        trade.id,
        TradeStatus::ResolvedBuyer,
        Actor::Admin,
        None,
    )
    .await
    .unwrap();

    let buyer_balance = balance_of(&state.pool, buyer, Asset::Btc).await;
    assert_eq!(buyer_balance.available, dec!(0.0198));
    let seller_balance = balance_of(&state.pool, seller, Asset::Btc).await;
    assert_eq!(seller_balance.locked, Decimal::ZERO);
    assert_eq!(seller_balance.available, Decimal::ZERO);

    // Buyer graduated, seller did not.
    let buyer_row = User::find_by_id(&state.pool, buyer).await.unwrap().unwrap();
    let seller_row = User::find_by_id(&state.pool, seller).await.unwrap().unwrap();
    assert_eq!(buyer_row.trade_count, 6);
    assert_eq!(seller_row.trade_count, 5);

    let dispute = Dispute::for_trade(&state.pool, trade.id).await.unwrap().unwrap();
    assert_eq!(dispute.status, "resolved_buyer");
}

#[tokio::test]
#[serial]
async fn seller_resolution_returns_escrow() {
    let state = setup_state().await;
    let buyer = create_trader(&state.pool, "rs_buyer@test.com", 5).await;
    let seller = create_trader(&state.pool, "rs_seller@test.com", 5).await;
    fund_available(&state.pool, seller, Asset::Btc, dec!(0.02)).await;

    let trade = p2p_trade(&state, buyer, seller).await;
    engine::transition_trade(
        &state,
        trade.id,
        TradeStatus::PaymentSent,
        Actor::User(buyer),
        None,
    )
    .await
    .unwrap();
    engine::transition_trade(&state, trade.id, TradeStatus::Disputed, Actor::User(seller), None)
        .await
        .unwrap();
    engine::transition_trade(&state, trade.id, TradeStatus::ResolvedSeller, Actor::Admin, None)
        .await
        .unwrap();

    let seller_balance = balance_of(&state.pool, seller, Asset::Btc).await;
    assert_eq!(seller_balance.available, dec!(0.02));
    assert_eq!(seller_balance.locked, Decimal::ZERO);
    let buyer_balance = balance_of(&state.pool, buyer, Asset::Btc).await;
    assert_eq!(buyer_balance.available, Decimal::ZERO);
}

#[tokio::test]
#[serial]
async fn new_buyer_gets_a_holding_window() {
    let state = setup_state().await;
    let buyer = create_trader(&state.pool, "holding_buyer@test.com", 0).await;
    let seller = create_trader(&state.pool, "holding_seller@test.com", 5).await;
    fund_available(&state.pool, seller, Asset::Btc, dec!(0.005)).await;

    fixture_sell_order(&state.pool, seller, Asset::Btc, dec!(250)).await;
    let outcome = matching::place_order(&state, buyer, buy_request(dec!(250)))
        .await
        .unwrap();
    let trade_id = outcome.trade_ids[0];

    engine::transition_trade(&state, trade_id, TradeStatus::PaymentSent, Actor::User(buyer), None)
        .await
        .unwrap();
    engine::transition_trade(
        &state,
        trade_id,
        TradeStatus::PaymentConfirmed,
        Actor::User(seller),
        None,
    )
    .await
    .unwrap();

    let trade = Trade::get(&state.pool, trade_id).await.unwrap().unwrap();
    let holding_until = trade.holding_until.expect("holding window set");
    let hours = (holding_until - chrono::Utc::now()).num_hours();
    assert!(hours >= 23, "new buyer holds for ~24h, got {hours}h");
}

#[tokio::test]
#[serial]
async fn deadline_worker_expires_escrow_and_auto_disputes_unconfirmed_payments() {
    let state = setup_state().await;
    let buyer_a = create_trader(&state.pool, "worker_buyer_a@test.com", 5).await;
    let seller_a = create_trader(&state.pool, "worker_seller_a@test.com", 5).await;
    let buyer_b = create_trader(&state.pool, "worker_buyer_b@test.com", 5).await;
    let seller_b = create_trader(&state.pool, "worker_seller_b@test.com", 5).await;
    fund_available(&state.pool, seller_a, Asset::Btc, dec!(0.02)).await;
    fund_available(&state.pool, seller_b, Asset::Btc, dec!(0.02)).await;

    // One trade stalls before payment, the other after payment_sent.
    let stalled = p2p_trade(&state, buyer_a, seller_a).await;
    let unconfirmed = p2p_trade(&state, buyer_b, seller_b).await;
    engine::transition_trade(
        &state,
        unconfirmed.id,
        TradeStatus::PaymentSent,
        Actor::User(buyer_b),
        None,
    )
    .await
    .unwrap();

    sqlx::query("UPDATE trades SET expires_at = NOW() - interval '1 minute' WHERE id = ANY($1)")
        .bind(vec![stalled.id, unconfirmed.id])
        .execute(&state.pool)
        .await
        .unwrap();

    exchange_core::workers::process_expired_trades(&state).await.unwrap();

    let stalled = Trade::get(&state.pool, stalled.id).await.unwrap().unwrap();
    assert_eq!(stalled.status(), TradeStatus::Expired);
    let seller_a_balance = balance_of(&state.pool, seller_a, Asset::Btc).await;
    assert_eq!(seller_a_balance.available, dec!(0.02));
    assert_eq!(seller_a_balance.locked, Decimal::ZERO);

    let unconfirmed = Trade::get(&state.pool, unconfirmed.id).await.unwrap().unwrap();
    assert_eq!(unconfirmed.status(), TradeStatus::Disputed);

    // Auto-dispute opens on the buyer's behalf and files an STR; escrow
    // stays locked on the seller.
    let dispute = Dispute::for_trade(&state.pool, unconfirmed.id).await.unwrap().unwrap();
    assert_eq!(dispute.opened_by, buyer_b);
    let str_rows: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM compliance_logs WHERE kind = 'str' AND trade_id = $1",
    )
    .bind(unconfirmed.id)
    .fetch_one(&state.pool)
    .await
    .unwrap();
    assert_eq!(str_rows, 1);
    let seller_b_balance = balance_of(&state.pool, seller_b, Asset::Btc).await;
    assert_eq!(seller_b_balance.locked, dec!(0.02));
}

#[tokio::test]
#[serial]
async fn large_trade_writes_lvctr() {
    let state = setup_state().await;
    let buyer = create_trader(&state.pool, "lvctr_buyer@test.com", 25).await;
    let seller = create_trader(&state.pool, "lvctr_seller@test.com", 25).await;
    fund_available(&state.pool, seller, Asset::Btc, dec!(1)).await;

    // Direct fixture at the reporting threshold; intake limits cap order
    // sizes below it.
    let mut tx = state.pool.begin().await.unwrap();
    let order = exchange_core::models::Order::insert(
        &mut tx,
        buyer,
        OrderSide::Buy,
        Asset::Btc,
        dec!(10000),
        Pricing::Market,
        Decimal::ZERO,
        None,
        None,
        None,
    )
    .await
    .unwrap();
    let trade = Trade::insert(
        &mut tx,
        order.id,
        buyer,
        seller,
        Asset::Btc,
        dec!(0.2),
        dec!(10000),
        dec!(50000),
        rust_decimal::Decimal::ONE,
        dec!(0.002),
    )
    .await
    .unwrap();
    engine::fund_escrow_in_tx(&state.config, &mut tx, &trade).await.unwrap();
    tx.commit().await.unwrap();

    engine::transition_trade(&state, trade.id, TradeStatus::PaymentSent, Actor::User(buyer), None)
        .await
        .unwrap();
    engine::transition_trade(
        &state,
        trade.id,
        TradeStatus::PaymentConfirmed,
        Actor::User(seller),
        None,
    )
    .await
    .unwrap();
    engine::release_trade(&state, trade.id).await.unwrap();

    let lvctr_rows: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM compliance_logs WHERE kind = 'lvctr' AND trade_id = $1",
    )
    .bind(trade.id)
    .fetch_one(&state.pool)
    .await
    .unwrap();
    assert_eq!(lvctr_rows, 1);
}

mod common;

use common::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serial_test::serial;
use uuid::Uuid;

use exchange_core::chain::{Asset, Chain, ChainRegistry};
use exchange_core::error::CoreError;
use exchange_core::models::{Withdrawal, WithdrawalRequest};
use exchange_core::workers;
use exchange_core::AppState;

async fn state_with_eth_client() -> (AppState, std::sync::Arc<FakeChainClient>) {
    let client = FakeChainClient::new(Chain::Ethereum);
    let mut chains = ChainRegistry::new();
    chains.register(client.clone());
    let state = setup_state_with_chains(chains).await;
    (state, client)
}

/// A funded user (registration already provisioned its wallets) with an
/// address-book entry old enough to clear the cooldown.
async fn withdrawal_ready_user(state: &AppState, email: &str, eth: Decimal) -> Uuid {
    let user = create_trader(&state.pool, email, 5).await;
    fund_available(&state.pool, user, Asset::Eth, eth).await;
    sqlx::query(
        "INSERT INTO saved_addresses (user_id, asset, address, created_at)
         VALUES ($1, 'ETH', '0xdest', NOW() - interval '2 days')",
    )
    .bind(user)
    .execute(&state.pool)
    .await
    .unwrap();
    user
}

fn eth_request(amount: Decimal) -> WithdrawalRequest {
    WithdrawalRequest {
        asset: Asset::Eth,
        to_address: "0xdest".into(),
        destination_tag: None,
        amount,
    }
}

async fn submit(state: &AppState, user: Uuid, amount: Decimal) -> Withdrawal {
    Withdrawal::submit(
        &state.pool,
        &state.config,
        state.prices.as_ref(),
        user,
        eth_request(amount),
    )
    .await
    .expect("submit withdrawal")
}

#[tokio::test]
#[serial]
async fn submit_debits_up_front_and_auto_approves_small_amounts() {
    let (state, _) = state_with_eth_client().await;
    let user = withdrawal_ready_user(&state, "wd_submit@test.com", dec!(0.2)).await;

    let withdrawal = submit(&state, user, dec!(0.1)).await;
    // 0.1 ETH at 3000 CAD is 300, under the 1000 auto-approve line.
    assert_eq!(withdrawal.status, "approved");
    assert_eq!(withdrawal.fee, dec!(0.002));
    assert_eq!(withdrawal.net_amount, dec!(0.098));
    assert_eq!(withdrawal.cad_value, Some(dec!(300)));

    let balance = balance_of(&state.pool, user, Asset::Eth).await;
    assert_eq!(balance.available, dec!(0.1), "full amount debited at submit");

    let debit: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM balance_ledger WHERE idempotency_key = $1")
        .bind(format!("withdrawal_debit:{}", withdrawal.id))
        .fetch_one(&state.pool)
        .await
        .unwrap();
    assert_eq!(debit, 1);
}

#[tokio::test]
#[serial]
async fn signing_failure_refunds_exactly_once() {
    let (state, client) = state_with_eth_client().await;
    let user = withdrawal_ready_user(&state, "wd_refund@test.com", dec!(0.2)).await;
    client.set_broadcast(BroadcastBehavior::FailSigning("bad key material".into()));

    let withdrawal = submit(&state, user, dec!(0.1)).await;
    assert_eq!(withdrawal.status, "approved");

    workers::broadcast_withdrawals(&state).await.unwrap();

    let after = Withdrawal::get(&state.pool, withdrawal.id).await.unwrap().unwrap();
    assert_eq!(after.status, "failed");
    assert!(after.failure_reason.unwrap().contains("bad key material"));

    // Full amount (fee included) came back.
    let balance = balance_of(&state.pool, user, Asset::Eth).await;
    assert_eq!(balance.available, dec!(0.2));

    for key in [
        format!("withdrawal_debit:{}", withdrawal.id),
        format!("withdrawal_refund:{}", withdrawal.id),
    ] {
        let rows: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM balance_ledger WHERE idempotency_key = $1")
                .bind(&key)
                .fetch_one(&state.pool)
                .await
                .unwrap();
        assert_eq!(rows, 1, "expected exactly one {key} row");
    }

    // A second refund attempt is a no-op: the first owner won.
    let applied = Withdrawal::refund_failed(&state.pool, withdrawal.id, "again")
        .await
        .unwrap();
    assert!(!applied);
    let balance = balance_of(&state.pool, user, Asset::Eth).await;
    assert_eq!(balance.available, dec!(0.2));
}

#[tokio::test]
#[serial]
async fn successful_broadcast_confirms_via_cas() {
    let (state, client) = state_with_eth_client().await;
    let user = withdrawal_ready_user(&state, "wd_confirm@test.com", dec!(0.2)).await;
    client.set_broadcast(BroadcastBehavior::Succeed("0xeth-tx".into()));

    let withdrawal = submit(&state, user, dec!(0.1)).await;
    workers::broadcast_withdrawals(&state).await.unwrap();

    let broadcasting = Withdrawal::get(&state.pool, withdrawal.id).await.unwrap().unwrap();
    assert_eq!(broadcasting.status, "broadcasting");
    assert_eq!(broadcasting.tx_hash.as_deref(), Some("0xeth-tx"));

    // Not enough confirmations yet.
    client.set_confirmations("0xeth-tx", 5);
    workers::poll_confirmations(&state).await.unwrap();
    let still = Withdrawal::get(&state.pool, withdrawal.id).await.unwrap().unwrap();
    assert_eq!(still.status, "broadcasting");

    client.set_confirmations("0xeth-tx", 12);
    workers::poll_confirmations(&state).await.unwrap();
    let confirmed = Withdrawal::get(&state.pool, withdrawal.id).await.unwrap().unwrap();
    assert_eq!(confirmed.status, "confirmed");
    assert!(confirmed.confirmed_at.is_some());

    // Funds stay gone; only one debit was ever written.
    let balance = balance_of(&state.pool, user, Asset::Eth).await;
    assert_eq!(balance.available, dec!(0.1));
    assert_eq!(*client.broadcast_count.lock().unwrap(), 1);
}

#[tokio::test]
#[serial]
async fn large_withdrawals_wait_for_review_and_can_be_cancelled() {
    let (state, _) = state_with_eth_client().await;
    let user = withdrawal_ready_user(&state, "wd_review@test.com", dec!(2)).await;

    // 0.5 ETH = 1500 CAD, above the 1000 auto-approve line.
    let withdrawal = submit(&state, user, dec!(0.5)).await;
    assert_eq!(withdrawal.status, "pending_review");

    let cancelled = Withdrawal::cancel(&state.pool, user, withdrawal.id).await.unwrap();
    assert_eq!(cancelled.status, "cancelled");

    let balance = balance_of(&state.pool, user, Asset::Eth).await;
    assert_eq!(balance.available, dec!(2));

    let refund: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM balance_ledger WHERE idempotency_key = $1")
        .bind(format!("withdrawal_cancel:{}", withdrawal.id))
        .fetch_one(&state.pool)
        .await
        .unwrap();
    assert_eq!(refund, 1);

    // Cancelling twice conflicts.
    let err = Withdrawal::cancel(&state.pool, user, withdrawal.id).await.unwrap_err();
    assert!(matches!(err, CoreError::Conflict(_)));
}

#[tokio::test]
#[serial]
async fn admin_reject_mirrors_cancel_with_its_own_key() {
    let (state, _) = state_with_eth_client().await;
    let user = withdrawal_ready_user(&state, "wd_reject@test.com", dec!(2)).await;

    let withdrawal = submit(&state, user, dec!(0.5)).await;
    let rejected = Withdrawal::reject(&state.pool, withdrawal.id, "address flagged")
        .await
        .unwrap();
    assert_eq!(rejected.status, "failed");

    let balance = balance_of(&state.pool, user, Asset::Eth).await;
    assert_eq!(balance.available, dec!(2));

    let refund: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM balance_ledger WHERE idempotency_key = $1")
        .bind(format!("withdrawal_reject:{}", withdrawal.id))
        .fetch_one(&state.pool)
        .await
        .unwrap();
    assert_eq!(refund, 1);

    // Approve after reject conflicts.
    let err = Withdrawal::approve(&state.pool, withdrawal.id).await.unwrap_err();
    assert!(matches!(err, CoreError::Conflict(_)));
}

#[tokio::test]
#[serial]
async fn new_address_and_daily_limit_guards() {
    let (state, _) = state_with_eth_client().await;
    let user = withdrawal_ready_user(&state, "wd_guards@test.com", dec!(10)).await;

    // A fresh address sits in its cooldown.
    let err = Withdrawal::submit(
        &state.pool,
        &state.config,
        state.prices.as_ref(),
        user,
        WithdrawalRequest {
            asset: Asset::Eth,
            to_address: "0xbrand-new".into(),
            destination_tag: None,
            amount: dec!(0.1),
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, CoreError::RateLimited(_)));

    // 4 ETH = 12000 CAD blows through the 10000 daily limit.
    let err = Withdrawal::submit(
        &state.pool,
        &state.config,
        state.prices.as_ref(),
        user,
        eth_request(dec!(4)),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, CoreError::RateLimited(_)));

    // Nothing was debited by the rejected attempts.
    let balance = balance_of(&state.pool, user, Asset::Eth).await;
    assert_eq!(balance.available, dec!(10));
}

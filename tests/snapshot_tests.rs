mod common;

use common::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serial_test::serial;

use exchange_core::chain::Asset;
use exchange_core::models::PortfolioSnapshot;
use exchange_core::workers;

#[tokio::test]
#[serial]
async fn snapshots_value_every_funded_user_in_cad() {
    let state = setup_state().await;
    let alice = create_trader(&state.pool, "snap_alice@test.com", 0).await;
    let bob = create_trader(&state.pool, "snap_bob@test.com", 0).await;
    let empty = create_trader(&state.pool, "snap_empty@test.com", 0).await;

    // Alice: 0.01 BTC (500 CAD) + 2 ETH (6000 CAD). Bob: 10 SOL (2000 CAD).
    fund_available(&state.pool, alice, Asset::Btc, dec!(0.01)).await;
    fund_available(&state.pool, alice, Asset::Eth, dec!(2)).await;
    fund_available(&state.pool, bob, Asset::Sol, dec!(10)).await;

    workers::capture_all_snapshots(&state).await.unwrap();

    let alice_snaps = PortfolioSnapshot::list_for_user(&state.pool, alice, 10).await.unwrap();
    assert_eq!(alice_snaps.len(), 1);
    assert_eq!(alice_snaps[0].total_cad, dec!(6500));

    let breakdown: serde_json::Value = serde_json::from_str(&alice_snaps[0].balances).unwrap();
    assert_eq!(breakdown["BTC"]["available"], "0.01");
    assert_eq!(breakdown["ETH"]["available"], "2");

    let bob_snaps = PortfolioSnapshot::list_for_user(&state.pool, bob, 10).await.unwrap();
    assert_eq!(bob_snaps.len(), 1);
    assert_eq!(bob_snaps[0].total_cad, dec!(2000));

    // Users with all-zero balances are skipped.
    let empty_snaps = PortfolioSnapshot::list_for_user(&state.pool, empty, 10).await.unwrap();
    assert!(empty_snaps.is_empty());
}

#[tokio::test]
#[serial]
async fn locked_and_pending_funds_count_toward_the_total() {
    let state = setup_state().await;
    let user = create_trader(&state.pool, "snap_fields@test.com", 0).await;
    fund_available(&state.pool, user, Asset::Eth, dec!(3)).await;

    // Shift one ETH into locked through the ledger.
    let mut tx = state.pool.begin().await.unwrap();
    for (field, amount, key) in [
        (
            exchange_core::models::BalanceField::Available,
            dec!(-1),
            "snap:lock:available",
        ),
        (
            exchange_core::models::BalanceField::Locked,
            dec!(1),
            "snap:lock:locked",
        ),
    ] {
        exchange_core::models::mutate_balance(
            &mut tx,
            exchange_core::models::BalanceMutation::new(
                user,
                Asset::Eth,
                field,
                amount,
                exchange_core::models::EntryType::StakingLock,
                key,
            ),
        )
        .await
        .unwrap();
    }
    tx.commit().await.unwrap();

    workers::capture_all_snapshots(&state).await.unwrap();

    let snaps = PortfolioSnapshot::list_for_user(&state.pool, user, 10).await.unwrap();
    // 2 available + 1 locked, all at 3000 CAD.
    assert_eq!(snaps[0].total_cad, dec!(9000));
    assert!(snaps[0].total_cad > Decimal::ZERO);
}

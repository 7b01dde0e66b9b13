mod common;

use common::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serial_test::serial;

use exchange_core::chain::Asset;
use exchange_core::error::CoreError;
use exchange_core::models::{
    mutate_balance, BalanceField, BalanceMutation, EntryType, LedgerEntry, MutationOutcome,
    PLATFORM_USER_ID,
};

fn credit(
    user_id: uuid::Uuid,
    amount: Decimal,
    key: &str,
) -> BalanceMutation {
    BalanceMutation::new(
        user_id,
        Asset::Btc,
        BalanceField::Available,
        amount,
        EntryType::AdminAdjustment,
        key,
    )
}

#[tokio::test]
#[serial]
async fn mutation_writes_balance_and_one_ledger_row() {
    let pool = setup_pool().await;
    let user = create_trader(&pool, "ledger_basic@test.com", 0).await;

    let mut tx = pool.begin().await.unwrap();
    let outcome = mutate_balance(&mut tx, credit(user, dec!(0.5), "t:1:credit"))
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let MutationOutcome::Applied(entry) = outcome else {
        panic!("expected an applied mutation");
    };
    assert_eq!(entry.amount, dec!(0.5));
    assert_eq!(entry.balance_after, dec!(0.5));
    assert_eq!(entry.field, "available");
    assert_eq!(entry.entry_type, "admin_adjustment");

    let balance = balance_of(&pool, user, Asset::Btc).await;
    assert_eq!(balance.available, dec!(0.5));
    assert_eq!(balance.locked, Decimal::ZERO);

    let history = LedgerEntry::history(&pool, user, Asset::Btc, 10).await.unwrap();
    assert_eq!(history.len(), 1);
}

#[tokio::test]
#[serial]
async fn replayed_idempotency_key_is_a_noop() {
    let pool = setup_pool().await;
    let user = create_trader(&pool, "ledger_replay@test.com", 0).await;

    for _ in 0..2 {
        let mut tx = pool.begin().await.unwrap();
        mutate_balance(&mut tx, credit(user, dec!(1), "t:2:credit"))
            .await
            .unwrap();
        tx.commit().await.unwrap();
    }

    let balance = balance_of(&pool, user, Asset::Btc).await;
    assert_eq!(balance.available, dec!(1), "second call must not re-apply");

    let history = LedgerEntry::history(&pool, user, Asset::Btc, 10).await.unwrap();
    assert_eq!(history.len(), 1, "exactly one ledger row");
}

#[tokio::test]
#[serial]
async fn concurrent_replays_apply_once() {
    let pool = setup_pool().await;
    let user = create_trader(&pool, "ledger_race@test.com", 0).await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move {
            let mut tx = pool.begin().await?;
            mutate_balance(&mut tx, credit(user, dec!(2), "t:race:credit")).await?;
            tx.commit().await?;
            Ok::<_, CoreError>(())
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let balance = balance_of(&pool, user, Asset::Btc).await;
    assert_eq!(balance.available, dec!(2));

    let history = LedgerEntry::history(&pool, user, Asset::Btc, 10).await.unwrap();
    assert_eq!(history.len(), 1);
}

#[tokio::test]
#[serial]
async fn overdraft_is_rejected_and_rolled_back() {
    let pool = setup_pool().await;
    let user = create_trader(&pool, "ledger_overdraft@test.com", 0).await;
    fund_available(&pool, user, Asset::Btc, dec!(0.3)).await;

    let mut tx = pool.begin().await.unwrap();
    let err = mutate_balance(&mut tx, credit(user, dec!(-0.5), "t:3:debit"))
        .await
        .unwrap_err();
    drop(tx);

    match err {
        CoreError::InsufficientFunds { available, required } => {
            assert_eq!(available, dec!(0.3));
            assert_eq!(required, dec!(0.5));
        }
        other => panic!("expected InsufficientFunds, got {other:?}"),
    }

    let balance = balance_of(&pool, user, Asset::Btc).await;
    assert_eq!(balance.available, dec!(0.3));
    assert!(LedgerEntry::reconcile(&pool, user, Asset::Btc).await.unwrap());
}

#[tokio::test]
#[serial]
async fn allow_negative_is_platform_only() {
    let pool = setup_pool().await;
    let user = create_trader(&pool, "ledger_negative@test.com", 0).await;

    let mut tx = pool.begin().await.unwrap();
    let err = mutate_balance(
        &mut tx,
        credit(user, dec!(-1), "t:4:debit").allowing_negative(),
    )
    .await
    .unwrap_err();
    drop(tx);
    assert!(matches!(err, CoreError::PermissionDenied(_)));

    // The platform itself may run a negative book.
    let mut tx = pool.begin().await.unwrap();
    mutate_balance(
        &mut tx,
        credit(PLATFORM_USER_ID, dec!(-3), "t:5:debit").allowing_negative(),
    )
    .await
    .unwrap();
    tx.commit().await.unwrap();

    let balance = balance_of(&pool, PLATFORM_USER_ID, Asset::Btc).await;
    assert_eq!(balance.available, dec!(-3));
}

#[tokio::test]
#[serial]
async fn missing_balance_row_is_a_distinct_error() {
    let pool = setup_pool().await;
    let ghost = uuid::Uuid::new_v4();

    sqlx::query("INSERT INTO users (id, email) VALUES ($1, 'ghost@test.com')")
        .bind(ghost)
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query("DELETE FROM balances WHERE user_id = $1")
        .bind(ghost)
        .execute(&pool)
        .await
        .unwrap();

    let mut tx = pool.begin().await.unwrap();
    let err = mutate_balance(&mut tx, credit(ghost, dec!(1), "t:6:credit"))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::NoBalanceRow { .. }));
}

#[tokio::test]
#[serial]
async fn balance_after_chain_replays_to_current_balance() {
    let pool = setup_pool().await;
    let user = create_trader(&pool, "ledger_chain@test.com", 0).await;

    let amounts = [dec!(1), dec!(0.25), dec!(-0.5), dec!(2), dec!(-0.75)];
    for (i, amount) in amounts.iter().enumerate() {
        let mut tx = pool.begin().await.unwrap();
        mutate_balance(&mut tx, credit(user, *amount, &format!("t:chain:{i}")))
            .await
            .unwrap();
        tx.commit().await.unwrap();
    }

    let history = LedgerEntry::history(&pool, user, Asset::Btc, 10).await.unwrap();
    assert_eq!(history.len(), amounts.len());
    // Newest first; the newest balance_after is the cached balance.
    let balance = balance_of(&pool, user, Asset::Btc).await;
    assert_eq!(history[0].balance_after, balance.available);

    let derived = LedgerEntry::derive_field(&pool, user, Asset::Btc, BalanceField::Available)
        .await
        .unwrap();
    assert_eq!(derived, balance.available);
    assert_eq!(derived, dec!(2));
}

#[tokio::test]
#[serial]
async fn fields_are_conserved_independently() {
    let pool = setup_pool().await;
    let alice = create_trader(&pool, "conserve_a@test.com", 0).await;
    let bob = create_trader(&pool, "conserve_b@test.com", 0).await;

    fund_available(&pool, alice, Asset::Eth, dec!(5)).await;
    fund_available(&pool, bob, Asset::Eth, dec!(7)).await;

    let mut tx = pool.begin().await.unwrap();
    mutate_balance(
        &mut tx,
        BalanceMutation::new(
            alice,
            Asset::Eth,
            BalanceField::Available,
            dec!(-2),
            EntryType::StakingLock,
            "t:conserve:out",
        ),
    )
    .await
    .unwrap();
    mutate_balance(
        &mut tx,
        BalanceMutation::new(
            alice,
            Asset::Eth,
            BalanceField::Locked,
            dec!(2),
            EntryType::StakingLock,
            "t:conserve:in",
        ),
    )
    .await
    .unwrap();
    tx.commit().await.unwrap();

    for field in [BalanceField::Available, BalanceField::Locked, BalanceField::PendingDeposit] {
        assert!(
            LedgerEntry::conserves(&pool, Asset::Eth, field).await.unwrap(),
            "field {field} must conserve"
        );
    }
    assert!(LedgerEntry::reconcile(&pool, alice, Asset::Eth).await.unwrap());
    assert!(LedgerEntry::reconcile(&pool, bob, Asset::Eth).await.unwrap());
}

#[tokio::test]
#[serial]
async fn concurrent_debits_never_overdraw() {
    let pool = setup_pool().await;
    let user = create_trader(&pool, "ledger_drain@test.com", 0).await;
    fund_available(&pool, user, Asset::Btc, dec!(0.5)).await;

    let mut handles = Vec::new();
    for i in 0..10 {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move {
            let mut tx = pool.begin().await?;
            mutate_balance(&mut tx, credit(user, dec!(-0.1), &format!("t:drain:{i}"))).await?;
            tx.commit().await?;
            Ok::<_, CoreError>(())
        }));
    }

    let mut successes = 0;
    let mut failures = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(()) => successes += 1,
            Err(_) => failures += 1,
        }
    }

    assert_eq!(successes, 5, "only five 0.1 debits fit in 0.5");
    assert_eq!(failures, 5);

    let balance = balance_of(&pool, user, Asset::Btc).await;
    assert_eq!(balance.available, Decimal::ZERO);
    assert!(LedgerEntry::reconcile(&pool, user, Asset::Btc).await.unwrap());
}

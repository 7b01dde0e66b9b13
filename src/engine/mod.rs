pub mod fees;

use chrono::{Duration, Utc};
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use crate::bus::{TradeEvent, TradeEventKind};
use crate::error::CoreError;
use crate::models::{
    mutate_balance, BalanceField, BalanceMutation, ComplianceLog, Dispute, EntryType, Notification,
    Trade, TradeStatus, User, LVCTR_THRESHOLD_CAD, PLATFORM_USER_ID,
};
use crate::AppState;

/// Who is driving a transition. Users get the narrow per-role matrix;
/// system and admin bypass it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    System,
    Admin,
    User(Uuid),
}

#[derive(Debug, Clone)]
pub struct DisputeDetails {
    pub opened_by: Uuid,
    pub reason: Option<String>,
}

/// Drive a trade to `new_status`, applying the balance side-effects of the
/// transition atomically with the status change. Publishes
/// trade_status_changed after commit.
pub async fn transition_trade(
    state: &AppState,
    trade_id: Uuid,
    new_status: TradeStatus,
    actor: Actor,
    dispute: Option<DisputeDetails>,
) -> Result<Trade, CoreError> {
    let mut tx = state.pool.begin().await?;

    let trade = Trade::lock(&mut tx, trade_id)
        .await?
        .ok_or(CoreError::NotFound("trade"))?;
    let from = trade.status();

    authorize(actor, &trade, from, new_status)?;

    if !from.can_transition_to(new_status) {
        return Err(CoreError::InvalidTransition {
            from: from.to_string(),
            to: new_status.to_string(),
        });
    }

    match new_status {
        TradeStatus::EscrowFunded => {
            apply_escrow_lock(&mut tx, &trade).await?;
            let expires = Utc::now() + Duration::minutes(state.config.payment_window_minutes);
            sqlx::query(
                "UPDATE trades SET status = 'escrow_funded', escrow_funded_at = NOW(),
                        expires_at = $1, updated_at = NOW()
                 WHERE id = $2",
            )
            .bind(expires)
            .bind(trade.id)
            .execute(&mut *tx)
            .await?;
        }
        TradeStatus::PaymentSent => {
            let expires = Utc::now() + Duration::minutes(state.config.confirm_window_minutes);
            sqlx::query(
                "UPDATE trades SET status = 'payment_sent', payment_sent_at = NOW(),
                        expires_at = $1, updated_at = NOW()
                 WHERE id = $2",
            )
            .bind(expires)
            .bind(trade.id)
            .execute(&mut *tx)
            .await?;
        }
        TradeStatus::PaymentConfirmed => {
            let holding_until = holding_window(state, &mut tx, &trade).await?;
            sqlx::query(
                "UPDATE trades SET status = 'payment_confirmed', payment_confirmed_at = NOW(),
                        expires_at = NULL, holding_until = $1, updated_at = NOW()
                 WHERE id = $2",
            )
            .bind(holding_until)
            .bind(trade.id)
            .execute(&mut *tx)
            .await?;
        }
        TradeStatus::CryptoReleased => {
            // Pure trigger; the money moves on completion.
            sqlx::query(
                "UPDATE trades SET status = 'crypto_released', crypto_released_at = NOW(),
                        updated_at = NOW()
                 WHERE id = $1",
            )
            .bind(trade.id)
            .execute(&mut *tx)
            .await?;
        }
        TradeStatus::Completed => {
            apply_settlement(&mut tx, &trade).await?;
            User::record_completed_trade(&mut tx, trade.buyer_id).await?;
            User::record_completed_trade(&mut tx, trade.seller_id).await?;
            if trade.amount_fiat >= LVCTR_THRESHOLD_CAD {
                ComplianceLog::record_lvctr(&mut tx, trade.id, trade.buyer_id, trade.amount_fiat)
                    .await?;
            }
            sqlx::query(
                "UPDATE trades SET status = 'completed', completed_at = NOW(), updated_at = NOW()
                 WHERE id = $1",
            )
            .bind(trade.id)
            .execute(&mut *tx)
            .await?;
        }
        TradeStatus::Expired => {
            if from.holds_escrow() {
                apply_escrow_return(&mut tx, &trade).await?;
            }
            sqlx::query(
                "UPDATE trades SET status = 'expired', expired_at = NOW(), updated_at = NOW()
                 WHERE id = $1",
            )
            .bind(trade.id)
            .execute(&mut *tx)
            .await?;
        }
        TradeStatus::Cancelled => {
            if from.holds_escrow() {
                apply_escrow_return(&mut tx, &trade).await?;
            }
            sqlx::query(
                "UPDATE trades SET status = 'cancelled', cancelled_at = NOW(), updated_at = NOW()
                 WHERE id = $1",
            )
            .bind(trade.id)
            .execute(&mut *tx)
            .await?;
        }
        TradeStatus::Disputed => {
            let opened_by = match (&dispute, actor) {
                (Some(details), _) => details.opened_by,
                (None, Actor::User(user_id)) => user_id,
                // Timeout auto-dispute is opened on behalf of the buyer.
                (None, _) => trade.buyer_id,
            };
            let reason = dispute.as_ref().and_then(|d| d.reason.as_deref());
            Dispute::open(&mut tx, trade.id, opened_by, reason).await?;
            ComplianceLog::record_str(&mut tx, trade.id, opened_by, trade.amount_fiat).await?;
            sqlx::query(
                "UPDATE trades SET status = 'disputed', disputed_at = NOW(), updated_at = NOW()
                 WHERE id = $1",
            )
            .bind(trade.id)
            .execute(&mut *tx)
            .await?;
        }
        TradeStatus::ResolvedBuyer => {
            apply_settlement(&mut tx, &trade).await?;
            User::record_completed_trade(&mut tx, trade.buyer_id).await?;
            Dispute::resolve(&mut tx, trade.id, "resolved_buyer", actor_id(actor), None).await?;
            sqlx::query(
                "UPDATE trades SET status = 'resolved_buyer', resolved_at = NOW(), updated_at = NOW()
                 WHERE id = $1",
            )
            .bind(trade.id)
            .execute(&mut *tx)
            .await?;
        }
        TradeStatus::ResolvedSeller => {
            apply_escrow_return(&mut tx, &trade).await?;
            Dispute::resolve(&mut tx, trade.id, "resolved_seller", actor_id(actor), None).await?;
            sqlx::query(
                "UPDATE trades SET status = 'resolved_seller', resolved_at = NOW(), updated_at = NOW()
                 WHERE id = $1",
            )
            .bind(trade.id)
            .execute(&mut *tx)
            .await?;
        }
        TradeStatus::Pending => {
            // Nothing transitions back into pending; the table already said no.
            unreachable!("pending is never a transition target");
        }
    }

    tx.commit().await?;

    let updated = Trade::get(&state.pool, trade_id)
        .await?
        .ok_or(CoreError::NotFound("trade"))?;

    state
        .bus
        .publish_trade(&TradeEvent {
            kind: TradeEventKind::TradeStatusChanged,
            trade_id: updated.id,
            buyer_id: updated.buyer_id,
            seller_id: updated.seller_id,
            old_status: Some(from.to_string()),
            new_status: updated.status.clone(),
            timestamp: Utc::now(),
        })
        .await;

    notify_parties(state, &updated, new_status).await;

    Ok(updated)
}

/// Escrow effects + escrow_funded stamp inside the creation transaction.
/// Trades are born pending and funded atomically with the order split that
/// produced them; the caller pre-checks seller liquidity under lock.
pub async fn fund_escrow_in_tx(
    config: &crate::config::Config,
    tx: &mut Transaction<'_, Postgres>,
    trade: &Trade,
) -> Result<Trade, CoreError> {
    apply_escrow_lock(tx, trade).await?;
    let expires = Utc::now() + Duration::minutes(config.payment_window_minutes);
    let funded = sqlx::query_as::<_, Trade>(
        "UPDATE trades SET status = 'escrow_funded', escrow_funded_at = NOW(),
                expires_at = $1, updated_at = NOW()
         WHERE id = $2 RETURNING *",
    )
    .bind(expires)
    .bind(trade.id)
    .fetch_one(&mut **tx)
    .await?;
    Ok(funded)
}

/// Holding elapsed: drive payment_confirmed through crypto_released to
/// completed. Also recovers trades left stuck in crypto_released.
pub async fn release_trade(state: &AppState, trade_id: Uuid) -> Result<Trade, CoreError> {
    let trade = Trade::get(&state.pool, trade_id)
        .await?
        .ok_or(CoreError::NotFound("trade"))?;

    if trade.status() == TradeStatus::PaymentConfirmed {
        if trade.holding_until.is_none() {
            tracing::warn!(
                "Trade {} reached payment_confirmed without holding_until; releasing now",
                trade.id
            );
        }
        transition_trade(state, trade_id, TradeStatus::CryptoReleased, Actor::System, None).await?;
    }
    transition_trade(state, trade_id, TradeStatus::Completed, Actor::System, None).await
}

fn actor_id(actor: Actor) -> Uuid {
    match actor {
        Actor::User(id) => id,
        _ => PLATFORM_USER_ID,
    }
}

fn authorize(
    actor: Actor,
    trade: &Trade,
    from: TradeStatus,
    to: TradeStatus,
) -> Result<(), CoreError> {
    let user_id = match actor {
        Actor::System | Actor::Admin => return Ok(()),
        Actor::User(id) => id,
    };

    let allowed = match to {
        TradeStatus::EscrowFunded => user_id == trade.seller_id,
        TradeStatus::PaymentSent => user_id == trade.buyer_id,
        TradeStatus::PaymentConfirmed => user_id == trade.seller_id,
        TradeStatus::Disputed => trade.is_party(user_id),
        // Users may walk away only before escrow is funded.
        TradeStatus::Cancelled => trade.is_party(user_id) && from == TradeStatus::Pending,
        _ => false,
    };

    if allowed {
        Ok(())
    } else {
        Err(CoreError::PermissionDenied(format!(
            "actor may not drive a trade to {to}"
        )))
    }
}

/// Platform balances may legitimately go negative; everyone else's may not.
fn mutation(trade_user: Uuid, m: BalanceMutation) -> BalanceMutation {
    if trade_user == PLATFORM_USER_ID {
        m.allowing_negative()
    } else {
        m
    }
}

/// Seller's crypto moves available -> locked.
pub(crate) async fn apply_escrow_lock(
    tx: &mut Transaction<'_, Postgres>,
    trade: &Trade,
) -> Result<(), CoreError> {
    let asset = trade.asset();

    mutate_balance(
        tx,
        mutation(
            trade.seller_id,
            BalanceMutation::new(
                trade.seller_id,
                asset,
                BalanceField::Available,
                -trade.amount_crypto,
                EntryType::TradeEscrowLock,
                format!("trade:{}:escrow_lock:available", trade.id),
            )
            .for_trade(trade.id)
            .with_note(format!("Escrow {} {}", trade.amount_crypto, asset)),
        ),
    )
    .await?;

    mutate_balance(
        tx,
        mutation(
            trade.seller_id,
            BalanceMutation::new(
                trade.seller_id,
                asset,
                BalanceField::Locked,
                trade.amount_crypto,
                EntryType::TradeEscrowLock,
                format!("trade:{}:escrow_lock:locked", trade.id),
            )
            .for_trade(trade.id),
        ),
    )
    .await?;

    Ok(())
}

/// Settlement money movement, shared by completion and buyer-side dispute
/// resolution (a trade settles at most once, so the keys coincide): seller's
/// escrow released, buyer credited net of fee, platform captures both fee
/// halves.
async fn apply_settlement(
    tx: &mut Transaction<'_, Postgres>,
    trade: &Trade,
) -> Result<(), CoreError> {
    let asset = trade.asset();

    mutate_balance(
        tx,
        mutation(
            trade.seller_id,
            BalanceMutation::new(
                trade.seller_id,
                asset,
                BalanceField::Locked,
                -trade.amount_crypto,
                EntryType::TradeEscrowRelease,
                format!("trade:{}:release:locked", trade.id),
            )
            .for_trade(trade.id),
        ),
    )
    .await?;

    let net = trade.amount_crypto - trade.fee_amount;
    mutate_balance(
        tx,
        mutation(
            trade.buyer_id,
            BalanceMutation::new(
                trade.buyer_id,
                asset,
                BalanceField::Available,
                net,
                EntryType::TradeCredit,
                format!("trade:{}:credit:available", trade.id),
            )
            .for_trade(trade.id)
            .with_note(format!("Bought {} {} at {}", net, asset, trade.price_per_unit)),
        ),
    )
    .await?;

    if trade.fee_amount > rust_decimal::Decimal::ZERO {
        let (buyer_half, seller_half) = fees::split_halves(trade.fee_amount);
        for (half, side) in [(buyer_half, "buyer"), (seller_half, "seller")] {
            if half <= rust_decimal::Decimal::ZERO {
                continue;
            }
            mutate_balance(
                tx,
                BalanceMutation::new(
                    PLATFORM_USER_ID,
                    asset,
                    BalanceField::Available,
                    half,
                    EntryType::FeeCredit,
                    format!("trade:{}:fee:{}", trade.id, side),
                )
                .for_trade(trade.id)
                .allowing_negative(),
            )
            .await?;
        }
    }

    Ok(())
}

/// Escrow returned to the seller untouched (expiry, cancel, seller-side
/// resolution).
async fn apply_escrow_return(
    tx: &mut Transaction<'_, Postgres>,
    trade: &Trade,
) -> Result<(), CoreError> {
    let asset = trade.asset();

    mutate_balance(
        tx,
        mutation(
            trade.seller_id,
            BalanceMutation::new(
                trade.seller_id,
                asset,
                BalanceField::Locked,
                -trade.amount_crypto,
                EntryType::TradeEscrowReturn,
                format!("trade:{}:return:locked", trade.id),
            )
            .for_trade(trade.id),
        ),
    )
    .await?;

    mutate_balance(
        tx,
        mutation(
            trade.seller_id,
            BalanceMutation::new(
                trade.seller_id,
                asset,
                BalanceField::Available,
                trade.amount_crypto,
                EntryType::TradeEscrowReturn,
                format!("trade:{}:return:available", trade.id),
            )
            .for_trade(trade.id)
            .with_note("Escrow returned"),
        ),
    )
    .await?;

    Ok(())
}

/// Post-confirmation holding window. Platform-as-seller trades hold for the
/// operator's e-Transfer verification; new buyers hold for the configured
/// hours; everyone else releases immediately.
async fn holding_window(
    state: &AppState,
    tx: &mut Transaction<'_, Postgres>,
    trade: &Trade,
) -> Result<chrono::DateTime<Utc>, CoreError> {
    let now = Utc::now();

    if trade.seller_id == PLATFORM_USER_ID {
        return Ok(now + Duration::minutes(state.config.platform_verify_minutes));
    }
    if trade.buyer_id == PLATFORM_USER_ID {
        return Ok(now);
    }

    let buyer_trade_count: i32 =
        sqlx::query_scalar("SELECT trade_count FROM users WHERE id = $1")
            .bind(trade.buyer_id)
            .fetch_one(&mut **tx)
            .await?;

    if buyer_trade_count < 3 {
        Ok(now + Duration::hours(state.config.new_user_holding_hours))
    } else {
        Ok(now)
    }
}

async fn notify_parties(state: &AppState, trade: &Trade, new_status: TradeStatus) {
    let (kind, title) = match new_status {
        TradeStatus::Completed => ("trade_completed", "Trade completed"),
        TradeStatus::Disputed => ("trade_disputed", "Trade disputed"),
        TradeStatus::Expired => ("trade_expired", "Trade expired"),
        TradeStatus::ResolvedBuyer | TradeStatus::ResolvedSeller => {
            ("dispute_resolved", "Dispute resolved")
        }
        _ => return,
    };
    let body = format!("Trade {} is now {}", trade.id, trade.status);
    for user_id in [trade.buyer_id, trade.seller_id] {
        if user_id == PLATFORM_USER_ID {
            continue;
        }
        Notification::create_best_effort(&state.pool, user_id, kind, title, Some(&body)).await;
    }
}

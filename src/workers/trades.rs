use crate::engine::{self, Actor, DisputeDetails};
use crate::error::CoreError;
use crate::models::{Trade, TradeStatus};
use crate::AppState;

/// Deadline sweep: expire unfunded payments, auto-dispute unconfirmed ones,
/// release holds that have elapsed, and recover trades stuck mid-release.
/// Each trade is handled in its own transaction; one failure never blocks
/// the rest.
pub async fn process_expired_trades(state: &AppState) -> Result<(), CoreError> {
    for trade in Trade::list_deadline_passed(&state.pool, TradeStatus::EscrowFunded).await? {
        if let Err(e) =
            engine::transition_trade(state, trade.id, TradeStatus::Expired, Actor::System, None)
                .await
        {
            tracing::error!("Failed to expire trade {}: {}", trade.id, e);
        } else {
            tracing::info!("Trade {} expired; escrow returned to seller", trade.id);
        }
    }

    // Seller never confirmed: open a dispute on the buyer's behalf so the
    // escrow stays locked until an operator looks at it.
    for trade in Trade::list_deadline_passed(&state.pool, TradeStatus::PaymentSent).await? {
        let details = DisputeDetails {
            opened_by: trade.buyer_id,
            reason: Some("payment confirmation window elapsed".into()),
        };
        if let Err(e) = engine::transition_trade(
            state,
            trade.id,
            TradeStatus::Disputed,
            Actor::System,
            Some(details),
        )
        .await
        {
            tracing::error!("Failed to auto-dispute trade {}: {}", trade.id, e);
        } else {
            tracing::warn!("Trade {} auto-disputed after confirmation timeout", trade.id);
        }
    }

    for trade in Trade::list_releasable(&state.pool).await? {
        if let Err(e) = engine::release_trade(state, trade.id).await {
            tracing::error!("Failed to release trade {}: {}", trade.id, e);
        }
    }

    for trade in Trade::list_stuck_released(&state.pool).await? {
        tracing::warn!("Recovering trade {} stuck in crypto_released", trade.id);
        if let Err(e) =
            engine::transition_trade(state, trade.id, TradeStatus::Completed, Actor::System, None)
                .await
        {
            tracing::error!("Failed to complete stuck trade {}: {}", trade.id, e);
        }
    }

    Ok(())
}

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Extension, Json, Router,
};
use serde::Deserialize;
use uuid::Uuid;

use super::ApiError;
use crate::engine::{self, Actor, DisputeDetails};
use crate::error::CoreError;
use crate::matching::platform;
use crate::models::{Trade, TradeStatus, User, PLATFORM_USER_ID};
use crate::AppState;

pub fn trade_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_trades))
        .route("/:id", get(get_trade))
        .route("/:id/payment-sent", post(mark_payment_sent))
        .route("/:id/confirm-payment", post(confirm_payment))
        .route("/:id/dispute", post(open_dispute))
        .route("/:id/cancel", post(cancel_trade))
}

async fn list_trades(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
) -> Result<Json<Vec<Trade>>, ApiError> {
    let trades = Trade::list_for_user(&state.pool, user.id, 100, 0).await?;
    Ok(Json(trades))
}

async fn get_trade(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(trade_id): Path<Uuid>,
) -> Result<Json<Trade>, ApiError> {
    let trade = Trade::get(&state.pool, trade_id)
        .await?
        .filter(|t| t.is_party(user.id))
        .ok_or(CoreError::NotFound("trade"))?;
    Ok(Json(trade))
}

/// Buyer marks the e-Transfer as sent. Platform-as-seller trades then
/// auto-advance into the operator verification hold.
async fn mark_payment_sent(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(trade_id): Path<Uuid>,
) -> Result<Json<Trade>, ApiError> {
    let trade = engine::transition_trade(
        &state,
        trade_id,
        TradeStatus::PaymentSent,
        Actor::User(user.id),
        None,
    )
    .await?;

    if trade.seller_id == PLATFORM_USER_ID {
        platform::auto_advance_platform_trade(&state, trade_id).await?;
    }

    let trade = Trade::get(&state.pool, trade_id)
        .await?
        .ok_or(CoreError::NotFound("trade"))?;
    Ok(Json(trade))
}

/// Seller confirms the fiat arrived.
async fn confirm_payment(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(trade_id): Path<Uuid>,
) -> Result<Json<Trade>, ApiError> {
    let trade = engine::transition_trade(
        &state,
        trade_id,
        TradeStatus::PaymentConfirmed,
        Actor::User(user.id),
        None,
    )
    .await?;
    Ok(Json(trade))
}

#[derive(Debug, Deserialize)]
pub struct DisputeRequest {
    pub reason: Option<String>,
}

async fn open_dispute(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(trade_id): Path<Uuid>,
    Json(req): Json<DisputeRequest>,
) -> Result<Json<Trade>, ApiError> {
    let trade = engine::transition_trade(
        &state,
        trade_id,
        TradeStatus::Disputed,
        Actor::User(user.id),
        Some(DisputeDetails {
            opened_by: user.id,
            reason: req.reason,
        }),
    )
    .await?;
    Ok(Json(trade))
}

async fn cancel_trade(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(trade_id): Path<Uuid>,
) -> Result<Json<Trade>, ApiError> {
    let trade = engine::transition_trade(
        &state,
        trade_id,
        TradeStatus::Cancelled,
        Actor::User(user.id),
        None,
    )
    .await?;
    Ok(Json(trade))
}

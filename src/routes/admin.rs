use axum::{
    extract::{Path, State},
    routing::post,
    Json, Router,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use uuid::Uuid;

use super::ApiError;
use crate::engine::{self, Actor};
use crate::error::CoreError;
use crate::matching;
use crate::models::{
    mutate_balance, BalanceField, BalanceMutation, EntryType, KycStatus, Trade, TradeStatus, User,
    Withdrawal,
};
use crate::AppState;

pub fn admin_routes() -> Router<AppState> {
    Router::new()
        .route("/trades/:id/transition", post(transition_trade))
        .route("/trades/:id/resolve", post(resolve_dispute))
        .route("/manual-match", post(manual_match))
        .route("/withdrawals/:id/approve", post(approve_withdrawal))
        .route("/withdrawals/:id/reject", post(reject_withdrawal))
        .route("/users/:id/kyc", post(set_kyc))
        .route("/adjustments", post(adjust_balance))
}

#[derive(Debug, Deserialize)]
pub struct TransitionRequest {
    pub status: TradeStatus,
}

async fn transition_trade(
    State(state): State<AppState>,
    Path(trade_id): Path<Uuid>,
    Json(req): Json<TransitionRequest>,
) -> Result<Json<Trade>, ApiError> {
    let trade =
        engine::transition_trade(&state, trade_id, req.status, Actor::Admin, None).await?;
    Ok(Json(trade))
}

#[derive(Debug, Deserialize)]
pub struct ResolveRequest {
    /// "buyer" or "seller"
    pub outcome: String,
}

async fn resolve_dispute(
    State(state): State<AppState>,
    Path(trade_id): Path<Uuid>,
    Json(req): Json<ResolveRequest>,
) -> Result<Json<Trade>, ApiError> {
    let status = match req.outcome.as_str() {
        "buyer" => TradeStatus::ResolvedBuyer,
        "seller" => TradeStatus::ResolvedSeller,
        other => {
            return Err(
                CoreError::Validation(format!("unknown resolution outcome: {other}")).into(),
            )
        }
    };
    let trade = engine::transition_trade(&state, trade_id, status, Actor::Admin, None).await?;
    Ok(Json(trade))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualMatchRequest {
    pub buy_order_id: Uuid,
    pub sell_order_id: Uuid,
    /// Defaults to the larger slice both orders can absorb.
    pub amount_fiat: Option<Decimal>,
}

/// Pair two specific orders regardless of queue position.
async fn manual_match(
    State(state): State<AppState>,
    Json(req): Json<ManualMatchRequest>,
) -> Result<Json<Trade>, ApiError> {
    let trade = matching::manual_match(
        &state,
        req.buy_order_id,
        req.sell_order_id,
        req.amount_fiat,
    )
    .await?;
    Ok(Json(trade))
}

async fn approve_withdrawal(
    State(state): State<AppState>,
    Path(withdrawal_id): Path<Uuid>,
) -> Result<Json<Withdrawal>, ApiError> {
    let withdrawal = Withdrawal::approve(&state.pool, withdrawal_id).await?;
    Ok(Json(withdrawal))
}

#[derive(Debug, Deserialize)]
pub struct RejectRequest {
    pub reason: String,
}

async fn reject_withdrawal(
    State(state): State<AppState>,
    Path(withdrawal_id): Path<Uuid>,
    Json(req): Json<RejectRequest>,
) -> Result<Json<Withdrawal>, ApiError> {
    let withdrawal = Withdrawal::reject(&state.pool, withdrawal_id, &req.reason).await?;
    Ok(Json(withdrawal))
}

#[derive(Debug, Deserialize)]
pub struct KycRequest {
    pub status: KycStatus,
}

async fn set_kyc(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Json(req): Json<KycRequest>,
) -> Result<Json<User>, ApiError> {
    let user = User::set_kyc_status(&state.pool, user_id, req.status).await?;
    Ok(Json(user))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdjustmentRequest {
    pub user_id: Uuid,
    pub asset: crate::chain::Asset,
    pub field: BalanceField,
    pub amount: Decimal,
    pub note: Option<String>,
}

/// Manual ledger correction. Each call mints its own idempotency key; the
/// ledger row is the audit trail.
async fn adjust_balance(
    State(state): State<AppState>,
    Json(req): Json<AdjustmentRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let adjustment_id = Uuid::new_v4();
    let mut tx = state.pool.begin().await.map_err(CoreError::Database)?;

    let mut mutation = BalanceMutation::new(
        req.user_id,
        req.asset,
        req.field,
        req.amount,
        EntryType::AdminAdjustment,
        format!("admin_adjustment:{adjustment_id}"),
    );
    if let Some(note) = req.note {
        mutation = mutation.with_note(note);
    }
    if req.user_id == crate::models::PLATFORM_USER_ID {
        mutation = mutation.allowing_negative();
    }

    mutate_balance(&mut tx, mutation).await?;
    tx.commit().await.map_err(CoreError::Database)?;

    Ok(Json(serde_json::json!({ "adjustmentId": adjustment_id })))
}

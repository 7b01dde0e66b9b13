use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::post,
    Extension, Json, Router,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use uuid::Uuid;

use super::ApiError;
use crate::chain::Asset;
use crate::models::{User, Withdrawal, WithdrawalRequest};
use crate::AppState;

pub fn withdrawal_routes() -> Router<AppState> {
    Router::new()
        .route("/", post(create_withdrawal).get(list_withdrawals))
        .route("/:id/cancel", post(cancel_withdrawal))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateWithdrawalRequest {
    pub asset: Asset,
    pub to_address: String,
    pub destination_tag: Option<String>,
    pub amount: Decimal,
}

async fn create_withdrawal(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Json(req): Json<CreateWithdrawalRequest>,
) -> Result<(StatusCode, Json<Withdrawal>), ApiError> {
    let withdrawal = Withdrawal::submit(
        &state.pool,
        &state.config,
        state.prices.as_ref(),
        user.id,
        WithdrawalRequest {
            asset: req.asset,
            to_address: req.to_address,
            destination_tag: req.destination_tag,
            amount: req.amount,
        },
    )
    .await?;
    Ok((StatusCode::CREATED, Json(withdrawal)))
}

async fn list_withdrawals(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
) -> Result<Json<Vec<Withdrawal>>, ApiError> {
    let withdrawals = Withdrawal::list_for_user(&state.pool, user.id, 100, 0).await?;
    Ok(Json(withdrawals))
}

async fn cancel_withdrawal(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(withdrawal_id): Path<Uuid>,
) -> Result<Json<Withdrawal>, ApiError> {
    let withdrawal = Withdrawal::cancel(&state.pool, user.id, withdrawal_id).await?;
    Ok(Json(withdrawal))
}

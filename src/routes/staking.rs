use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Extension, Json, Router,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use uuid::Uuid;

use super::ApiError;
use crate::models::{StakingPosition, StakingProduct, User};
use crate::AppState;

pub fn staking_routes() -> Router<AppState> {
    Router::new()
        .route("/products", get(list_products))
        .route("/positions", get(list_positions).post(stake))
        .route("/positions/:id/unstake", post(unstake))
}

async fn list_products(
    State(state): State<AppState>,
) -> Result<Json<Vec<StakingProduct>>, ApiError> {
    let products = StakingProduct::list_active(&state.pool).await?;
    Ok(Json(products))
}

async fn list_positions(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
) -> Result<Json<Vec<StakingPosition>>, ApiError> {
    let positions = StakingPosition::list_for_user(&state.pool, user.id).await?;
    Ok(Json(positions))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StakeRequest {
    pub product_id: Uuid,
    pub amount: Decimal,
}

async fn stake(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Json(req): Json<StakeRequest>,
) -> Result<(StatusCode, Json<StakingPosition>), ApiError> {
    let position =
        StakingPosition::open(&state.pool, user.id, req.product_id, req.amount).await?;
    Ok((StatusCode::CREATED, Json(position)))
}

async fn unstake(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(position_id): Path<Uuid>,
) -> Result<Json<StakingPosition>, ApiError> {
    let position = StakingPosition::close(&state.pool, user.id, position_id).await?;
    Ok(Json(position))
}

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{delete, post},
    Extension, Json, Router,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ApiError;
use crate::chain::Asset;
use crate::matching::{self, PlaceOrderRequest};
use crate::models::{Order, OrderSide, Pricing, User};
use crate::AppState;

pub fn order_routes() -> Router<AppState> {
    Router::new()
        .route("/", post(create_order).get(list_orders))
        .route("/:id", delete(cancel_order))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    pub side: OrderSide,
    pub asset: Asset,
    pub amount_fiat: Decimal,
    #[serde(default)]
    pub pricing: Option<Pricing>,
    #[serde(default)]
    pub premium_percent: Option<Decimal>,
    pub fixed_price: Option<Decimal>,
    pub min_match_fiat: Option<Decimal>,
    pub max_match_fiat: Option<Decimal>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderResponse {
    pub order_id: Uuid,
    pub status: String,
    pub remaining_fiat: String,
    pub trade_ids: Vec<Uuid>,
}

async fn create_order(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    headers: HeaderMap,
    Json(req): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<CreateOrderResponse>), ApiError> {
    let idempotency_key = headers
        .get("idempotency-key")
        .and_then(|h| h.to_str().ok())
        .map(str::to_string);

    let outcome = matching::place_order(
        &state,
        user.id,
        PlaceOrderRequest {
            side: req.side,
            asset: req.asset,
            amount_fiat: req.amount_fiat,
            pricing: req.pricing.unwrap_or(Pricing::Market),
            premium_percent: req.premium_percent.unwrap_or_default(),
            fixed_price: req.fixed_price,
            min_match_fiat: req.min_match_fiat,
            max_match_fiat: req.max_match_fiat,
            idempotency_key,
        },
    )
    .await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateOrderResponse {
            order_id: outcome.order.id,
            status: outcome.order.status,
            remaining_fiat: outcome.order.remaining_fiat.to_string(),
            trade_ids: outcome.trade_ids,
        }),
    ))
}

async fn list_orders(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
) -> Result<Json<Vec<Order>>, ApiError> {
    let orders = Order::list_for_user(&state.pool, user.id, 100, 0).await?;
    Ok(Json(orders))
}

async fn cancel_order(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<Order>, ApiError> {
    let order = Order::cancel(&state.pool, user.id, order_id).await?;
    Ok(Json(order))
}

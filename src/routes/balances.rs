use axum::{
    extract::{Path, State},
    routing::get,
    Extension, Json, Router,
};
use serde::Serialize;

use super::ApiError;
use crate::chain::Asset;
use crate::models::{Balance, LedgerEntry, User};
use crate::AppState;

pub fn balance_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(get_balances))
        .route("/:asset/ledger", get(get_ledger))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceResponse {
    pub asset: String,
    pub available: String,
    pub locked: String,
    pub pending_deposit: String,
}

async fn get_balances(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
) -> Result<Json<Vec<BalanceResponse>>, ApiError> {
    let balances = Balance::get_for_user(&state.pool, user.id).await?;
    Ok(Json(
        balances
            .into_iter()
            .map(|b| BalanceResponse {
                asset: b.asset,
                available: LedgerEntry::round_crypto(b.available).to_string(),
                locked: LedgerEntry::round_crypto(b.locked).to_string(),
                pending_deposit: LedgerEntry::round_crypto(b.pending_deposit).to_string(),
            })
            .collect(),
    ))
}

async fn get_ledger(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(asset): Path<Asset>,
) -> Result<Json<Vec<LedgerEntry>>, ApiError> {
    let entries = LedgerEntry::history(&state.pool, user.id, asset, 100).await?;
    Ok(Json(entries))
}

use axum::{extract::State, routing::get, Extension, Json, Router};

use super::ApiError;
use crate::models::{Notification, PortfolioSnapshot, User};
use crate::AppState;

pub fn account_routes() -> Router<AppState> {
    Router::new()
        .route("/notifications", get(list_notifications))
        .route("/snapshots", get(list_snapshots))
}

async fn list_notifications(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
) -> Result<Json<Vec<Notification>>, ApiError> {
    let notifications = Notification::list_for_user(&state.pool, user.id, 50).await?;
    Ok(Json(notifications))
}

async fn list_snapshots(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
) -> Result<Json<Vec<PortfolioSnapshot>>, ApiError> {
    let snapshots = PortfolioSnapshot::list_for_user(&state.pool, user.id, 168).await?;
    Ok(Json(snapshots))
}

mod account;
mod admin;
mod balances;
mod orders;
mod staking;
mod trades;
mod withdrawals;

pub use account::account_routes;
pub use admin::admin_routes;
pub use balances::balance_routes;
pub use orders::order_routes;
pub use staking::staking_routes;
pub use trades::trade_routes;
pub use withdrawals::withdrawal_routes;

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::models::User;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
}

/// Route-boundary wrapper: stable codes for domain errors, internals masked.
pub struct ApiError(pub CoreError);

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        ApiError(e)
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        ApiError(CoreError::Database(e))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CoreError::Validation(_)
            | CoreError::InsufficientFunds { .. }
            | CoreError::PriceUnavailable(_) => StatusCode::BAD_REQUEST,
            CoreError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::Conflict(_) | CoreError::InvalidTransition { .. } => StatusCode::CONFLICT,
            CoreError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("Internal error: {}", self.0);
            "Internal error".to_string()
        } else {
            self.0.to_string()
        };

        (
            status,
            Json(ErrorBody {
                error: message,
                code: self.0.code().to_string(),
            }),
        )
            .into_response()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: usize,
}

/// Bearer-token middleware: verify the JWT, load the user, stash it as an
/// extension. Token issuance lives outside this service.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .ok_or_else(|| unauthorized("Missing authorization header"))?;

    let claims = jsonwebtoken::decode::<Claims>(
        token,
        &jsonwebtoken::DecodingKey::from_secret(state.config.jwt_secret.as_bytes()),
        &jsonwebtoken::Validation::default(),
    )
    .map_err(|_| unauthorized("Invalid or expired token"))?
    .claims;

    let user_id: uuid::Uuid = claims
        .sub
        .parse()
        .map_err(|_| unauthorized("Invalid token"))?;

    let user = User::find_by_id(&state.pool, user_id)
        .await
        .map_err(CoreError::Database)?
        .ok_or_else(|| unauthorized("User not found"))?;

    req.extensions_mut().insert(user);
    Ok(next.run(req).await)
}

/// Admin surface is guarded by a shared key header.
pub async fn admin_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let provided = req
        .headers()
        .get("x-admin-key")
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default();

    if provided != state.config.admin_api_key {
        return Err(unauthorized("Invalid admin key"));
    }
    Ok(next.run(req).await)
}

fn unauthorized(message: &str) -> ApiError {
    // 401 semantics, carried through the PermissionDenied shape.
    ApiError(CoreError::PermissionDenied(message.to_string()))
}

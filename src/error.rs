use rust_decimal::Decimal;

/// Domain error taxonomy. Every variant maps to a stable machine code and an
/// HTTP status; internals are masked at the route boundary.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Insufficient funds: available {available}, required {required}")]
    InsufficientFunds {
        available: Decimal,
        required: Decimal,
    },

    #[error("{0} not found")]
    NotFound(&'static str),

    /// A balance row missing for a (user, asset) pair. Rows are created at
    /// user creation, so this is a bug surface, not user error.
    #[error("No balance row for user {user_id} asset {asset}")]
    NoBalanceRow { user_id: uuid::Uuid, asset: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Chain RPC error: {0}")]
    ChainRpc(String),

    #[error("Signing error: {0}")]
    Signing(String),

    #[error("Price unavailable for {0}")]
    PriceUnavailable(String),

    /// Operator page. Never auto-retried.
    #[error("Critical: {0}")]
    Critical(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl CoreError {
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::InvalidTransition { .. } => "INVALID_TRANSITION",
            CoreError::PermissionDenied(_) => "PERMISSION_DENIED",
            CoreError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            CoreError::NotFound(_) => "NOT_FOUND",
            CoreError::NoBalanceRow { .. } => "NO_BALANCE_ROW",
            CoreError::Conflict(_) => "CONFLICT",
            CoreError::RateLimited(_) => "RATE_LIMITED",
            CoreError::Validation(_) => "VALIDATION_ERROR",
            CoreError::ChainRpc(_) => "CHAIN_RPC_ERROR",
            CoreError::Signing(_) => "SIGNING_ERROR",
            CoreError::PriceUnavailable(_) => "PRICE_UNAVAILABLE",
            CoreError::Critical(_) => "CRITICAL",
            CoreError::Database(_) => "DATABASE_ERROR",
        }
    }

    /// Transient failures the workers retry on their next cycle.
    pub fn is_transient(&self) -> bool {
        matches!(self, CoreError::ChainRpc(_))
    }
}

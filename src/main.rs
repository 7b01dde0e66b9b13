use std::sync::Arc;

use axum::{middleware, routing::get, Json, Router};
use serde::Serialize;
use tower_http::cors::CorsLayer;

use exchange_core::bus::EventBus;
use exchange_core::chain::ChainRegistry;
use exchange_core::config::Config;
use exchange_core::models::User;
use exchange_core::pricing::CachedPriceOracle;
use exchange_core::routes::{
    account_routes, admin_middleware, admin_routes, auth_middleware, balance_routes, order_routes,
    staking_routes, trade_routes, withdrawal_routes,
};
use exchange_core::{db, workers, AppState};

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("exchange_core=debug".parse()?)
                .add_directive("tower_http=debug".parse()?),
        )
        .init();

    // Refuses to start without the wallet encryption key.
    let config = Config::from_env()?;

    tracing::info!("Connecting to database...");
    let pool = db::create_pool(&config.database_url).await?;

    tracing::info!("Running migrations...");
    db::run_migrations(&pool).await?;

    User::ensure_platform(&pool).await?;

    let bus = match &config.redis_url {
        Some(url) => EventBus::connect(url).await?,
        None => {
            tracing::warn!("REDIS_URL not set; events and caches are process-local");
            EventBus::in_memory()
        }
    };

    let prices = Arc::new(CachedPriceOracle::new(bus.clone()));

    // Chain clients are deployment-specific capabilities; an empty registry
    // means the deposit and withdrawal workers idle until one is installed.
    let chains = ChainRegistry::new();

    let bind_addr = config.bind_addr.clone();
    let state = AppState::new(pool, config, bus, prices, chains);

    workers::spawn_all(state.clone());

    let app = Router::new()
        .route("/health", get(health))
        .nest(
            "/api/balances",
            balance_routes()
                .layer(middleware::from_fn_with_state(state.clone(), auth_middleware)),
        )
        .nest(
            "/api/orders",
            order_routes()
                .layer(middleware::from_fn_with_state(state.clone(), auth_middleware)),
        )
        .nest(
            "/api/trades",
            trade_routes()
                .layer(middleware::from_fn_with_state(state.clone(), auth_middleware)),
        )
        .nest(
            "/api/withdrawals",
            withdrawal_routes()
                .layer(middleware::from_fn_with_state(state.clone(), auth_middleware)),
        )
        .nest(
            "/api/staking",
            staking_routes()
                .layer(middleware::from_fn_with_state(state.clone(), auth_middleware)),
        )
        .nest(
            "/api/account",
            account_routes()
                .layer(middleware::from_fn_with_state(state.clone(), auth_middleware)),
        )
        .nest(
            "/admin",
            admin_routes()
                .layer(middleware::from_fn_with_state(state.clone(), admin_middleware)),
        )
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("Exchange core listening on {}", bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

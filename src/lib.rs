pub mod bus;
pub mod chain;
pub mod config;
pub mod crypto;
pub mod db;
pub mod engine;
pub mod error;
pub mod matching;
pub mod models;
pub mod pricing;
pub mod routes;
pub mod workers;

use std::sync::Arc;

use sqlx::PgPool;

use bus::EventBus;
use chain::ChainRegistry;
use config::Config;
use pricing::PriceOracle;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<Config>,
    pub bus: EventBus,
    pub prices: Arc<dyn PriceOracle>,
    pub chains: ChainRegistry,
}

impl AppState {
    pub fn new(
        pool: PgPool,
        config: Config,
        bus: EventBus,
        prices: Arc<dyn PriceOracle>,
        chains: ChainRegistry,
    ) -> Self {
        Self {
            pool,
            config: Arc::new(config),
            bus,
            prices,
            chains,
        }
    }
}

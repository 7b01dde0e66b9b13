use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::str::FromStr;

use crate::bus::EventBus;
use crate::chain::Asset;
use crate::error::CoreError;

/// CAD price per unit of an asset. The feed itself is external; the core
/// only reads the cached quote and rejects work when it is missing or stale.
#[async_trait]
pub trait PriceOracle: Send + Sync {
    async fn price_cad(&self, asset: Asset) -> Result<Decimal, CoreError>;
}

/// Reads `price:{ASSET}` from the shared cache, written by the out-of-process
/// feed poller with a short TTL (so a stale feed reads as absent).
pub struct CachedPriceOracle {
    bus: EventBus,
}

impl CachedPriceOracle {
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl PriceOracle for CachedPriceOracle {
    async fn price_cad(&self, asset: Asset) -> Result<Decimal, CoreError> {
        let key = format!("price:{asset}");
        let raw = self
            .bus
            .cache_get(&key)
            .await
            .ok_or_else(|| CoreError::PriceUnavailable(asset.as_str().into()))?;
        let price = Decimal::from_str(raw.trim())
            .map_err(|_| CoreError::PriceUnavailable(asset.as_str().into()))?;
        if price <= Decimal::ZERO {
            return Err(CoreError::PriceUnavailable(asset.as_str().into()));
        }
        Ok(price)
    }
}

/// Static quotes for tests and local development.
pub struct FixedPriceOracle {
    prices: HashMap<Asset, Decimal>,
}

impl FixedPriceOracle {
    pub fn new(prices: HashMap<Asset, Decimal>) -> Self {
        Self { prices }
    }

    pub fn single(asset: Asset, price: Decimal) -> Self {
        Self {
            prices: HashMap::from([(asset, price)]),
        }
    }
}

#[async_trait]
impl PriceOracle for FixedPriceOracle {
    async fn price_cad(&self, asset: Asset) -> Result<Decimal, CoreError> {
        self.prices
            .get(&asset)
            .copied()
            .ok_or_else(|| CoreError::PriceUnavailable(asset.as_str().into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    #[tokio::test]
    async fn cached_oracle_reads_price_key() {
        let bus = EventBus::in_memory();
        bus.cache_set("price:BTC", "50000", Duration::from_secs(60))
            .await;
        let oracle = CachedPriceOracle::new(bus);
        assert_eq!(oracle.price_cad(Asset::Btc).await.unwrap(), dec!(50000));
        assert!(matches!(
            oracle.price_cad(Asset::Eth).await,
            Err(CoreError::PriceUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn zero_price_is_unavailable() {
        let bus = EventBus::in_memory();
        bus.cache_set("price:SOL", "0", Duration::from_secs(60)).await;
        let oracle = CachedPriceOracle::new(bus);
        assert!(oracle.price_cad(Asset::Sol).await.is_err());
    }
}

use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::chain::Asset;

/// Payload on `channel:trades`. Subscribers must tolerate duplicates and
/// out-of-order delivery; the database is the truth.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeEvent {
    #[serde(rename = "type")]
    pub kind: TradeEventKind,
    pub trade_id: Uuid,
    pub buyer_id: Uuid,
    pub seller_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_status: Option<String>,
    pub new_status: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeEventKind {
    TradeCreated,
    TradeStatusChanged,
}

/// Best-effort order-book diff on `channel:orderbook:{asset}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderBookEvent {
    pub order_id: Uuid,
    pub asset: Asset,
    pub side: String,
    pub remaining_fiat: String,
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

enum Backend {
    Redis(MultiplexedConnection),
    /// Dev/test fallback when no broker is configured: publishes are dropped,
    /// the cache lives in memory with the same TTL semantics.
    Memory(Arc<Mutex<HashMap<String, (String, Instant)>>>),
}

impl Clone for Backend {
    fn clone(&self) -> Self {
        match self {
            Backend::Redis(con) => Backend::Redis(con.clone()),
            Backend::Memory(map) => Backend::Memory(map.clone()),
        }
    }
}

/// Pub/sub fan-out plus the shared TTL cache (order idempotency, prices).
/// Everything here is best-effort: failures are logged, never propagated.
#[derive(Clone)]
pub struct EventBus {
    backend: Backend,
}

impl EventBus {
    pub async fn connect(redis_url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(redis_url)?;
        let con = client.get_multiplexed_tokio_connection().await?;
        Ok(Self {
            backend: Backend::Redis(con),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            backend: Backend::Memory(Arc::new(Mutex::new(HashMap::new()))),
        }
    }

    pub async fn publish_trade(&self, event: &TradeEvent) {
        self.publish("channel:trades", event).await;
    }

    pub async fn publish_orderbook(&self, event: &OrderBookEvent) {
        let channel = format!("channel:orderbook:{}", event.asset);
        self.publish(&channel, event).await;
    }

    async fn publish<T: Serialize>(&self, channel: &str, payload: &T) {
        let body = match serde_json::to_string(payload) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!("Failed to serialize event for {}: {}", channel, e);
                return;
            }
        };
        match &self.backend {
            Backend::Redis(con) => {
                let mut con = con.clone();
                if let Err(e) = con.publish::<_, _, ()>(channel, body).await {
                    tracing::warn!("Publish to {} failed: {}", channel, e);
                }
            }
            Backend::Memory(_) => {
                tracing::debug!("No broker configured, dropping event on {}", channel);
            }
        }
    }

    pub async fn cache_set(&self, key: &str, value: &str, ttl: Duration) {
        match &self.backend {
            Backend::Redis(con) => {
                let mut con = con.clone();
                if let Err(e) = con
                    .set_ex::<_, _, ()>(key, value, ttl.as_secs())
                    .await
                {
                    tracing::warn!("Cache set {} failed: {}", key, e);
                }
            }
            Backend::Memory(map) => {
                let mut map = map.lock().expect("cache mutex poisoned");
                map.insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
            }
        }
    }

    /// A cache failure reads as a miss.
    pub async fn cache_get(&self, key: &str) -> Option<String> {
        match &self.backend {
            Backend::Redis(con) => {
                let mut con = con.clone();
                match con.get::<_, Option<String>>(key).await {
                    Ok(value) => value,
                    Err(e) => {
                        tracing::warn!("Cache get {} failed: {}", key, e);
                        None
                    }
                }
            }
            Backend::Memory(map) => {
                let mut map = map.lock().expect("cache mutex poisoned");
                match map.get(key) {
                    Some((value, expires)) if *expires > Instant::now() => Some(value.clone()),
                    Some(_) => {
                        map.remove(key);
                        None
                    }
                    None => None,
                }
            }
        }
    }
}

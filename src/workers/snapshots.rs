use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

use crate::chain::Asset;
use crate::error::CoreError;
use crate::models::{Balance, LedgerEntry, PortfolioSnapshot};
use crate::AppState;

/// Hourly CAD valuation per user with any non-zero balance. Assets without a
/// quote are skipped (valued at zero) rather than failing the whole pass.
pub async fn capture_all_snapshots(state: &AppState) -> Result<(), CoreError> {
    let rows = sqlx::query_as::<_, Balance>(
        "SELECT * FROM balances
         WHERE available <> 0 OR locked <> 0 OR pending_deposit <> 0",
    )
    .fetch_all(&state.pool)
    .await?;
    if rows.is_empty() {
        return Ok(());
    }

    let mut prices: HashMap<Asset, Decimal> = HashMap::new();
    for asset in Asset::ALL {
        match state.prices.price_cad(asset).await {
            Ok(price) => {
                prices.insert(asset, price);
            }
            Err(e) => {
                tracing::warn!("No {} quote for snapshots: {}", asset, e);
            }
        }
    }

    let mut per_user: HashMap<Uuid, Vec<Balance>> = HashMap::new();
    for row in rows {
        per_user.entry(row.user_id).or_default().push(row);
    }

    let mut captured = 0usize;
    for (user_id, balances) in per_user {
        let mut total_cad = Decimal::ZERO;
        let mut breakdown = BTreeMap::new();
        for balance in &balances {
            let asset: Asset = match balance.asset.parse() {
                Ok(asset) => asset,
                Err(_) => continue,
            };
            if let Some(price) = prices.get(&asset) {
                total_cad += balance.total() * price;
            }
            // normalize() drops the storage scale's trailing zeros.
            breakdown.insert(
                balance.asset.clone(),
                serde_json::json!({
                    "available": balance.available.normalize().to_string(),
                    "locked": balance.locked.normalize().to_string(),
                    "pendingDeposit": balance.pending_deposit.normalize().to_string(),
                }),
            );
        }

        let balances_json = match serde_json::to_string(&breakdown) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!("Failed to serialize snapshot for {}: {}", user_id, e);
                continue;
            }
        };

        if let Err(e) = PortfolioSnapshot::insert(
            &state.pool,
            user_id,
            LedgerEntry::round_fiat(total_cad),
            &balances_json,
        )
        .await
        {
            tracing::error!("Failed to snapshot user {}: {}", user_id, e);
        } else {
            captured += 1;
        }
    }

    tracing::debug!("Captured {} portfolio snapshots", captured);
    Ok(())
}

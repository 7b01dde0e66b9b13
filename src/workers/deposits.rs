use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use crate::chain::{BlockRange, Chain, ChainClient};
use crate::error::CoreError;
use crate::models::{Deposit, Notification, Wallet};
use crate::AppState;

/// How far behind the tip the ethereum cursor starts, and the most blocks
/// one cycle will walk, to bound RPC cost.
const CURSOR_INIT_LOOKBACK: u64 = 50;
const MAX_BLOCKS_PER_CYCLE: u64 = 50;

/// Stale pending deposits are expired after this long.
const STALE_DEPOSIT_HOURS: i64 = 72;

/// One scan cycle across every configured chain. RPC failures are logged and
/// retried next cycle without touching state.
pub async fn scan_deposits(
    state: &AppState,
    cursors: &mut HashMap<Chain, u64>,
) -> Result<(), CoreError> {
    for chain in Chain::ALL {
        let Some(client) = state.chains.get(chain) else {
            tracing::debug!("No chain client for {}, skipping scan", chain);
            continue;
        };
        if let Err(e) = scan_chain(state, chain, client.clone(), cursors).await {
            tracing::warn!("Deposit scan failed on {}: {}", chain, e);
        }
    }
    Ok(())
}

async fn scan_chain(
    state: &AppState,
    chain: Chain,
    client: Arc<dyn ChainClient>,
    cursors: &mut HashMap<Chain, u64>,
) -> Result<(), CoreError> {
    let targets = Wallet::scan_targets(&state.pool, chain).await?;
    if targets.is_empty() {
        return Ok(());
    }

    let blocks = if chain.uses_block_cursor() {
        let tip = client.tip_height().await?;
        let cursor = cursors
            .entry(chain)
            .or_insert_with(|| tip.saturating_sub(CURSOR_INIT_LOOKBACK));
        if *cursor >= tip {
            return Ok(());
        }
        Some(BlockRange {
            from: *cursor + 1,
            to: tip.min(*cursor + MAX_BLOCKS_PER_CYCLE),
        })
    } else {
        None
    };

    let transfers = client.incoming_transfers(&targets, blocks).await?;

    for transfer in transfers {
        if transfer.amount < transfer.asset.min_deposit() {
            tracing::debug!(
                "Dropping below-minimum {} deposit {} on {}",
                transfer.asset,
                transfer.amount,
                chain
            );
            continue;
        }
        match Deposit::process_new(&state.pool, chain, &transfer).await {
            Ok(Some(deposit)) => {
                tracing::info!(
                    "Detected {} {} deposit {} for user {}",
                    deposit.amount,
                    deposit.asset,
                    deposit.tx_hash,
                    deposit.user_id
                );
            }
            Ok(None) => {} // already recorded by an earlier cycle
            Err(e) => {
                tracing::error!("Failed to record deposit {}: {}", transfer.tx_hash, e);
            }
        }
    }

    // Advance only after a clean scan so a failed cycle is retried in full.
    if let Some(range) = blocks {
        cursors.insert(chain, range.to);
    }
    Ok(())
}

/// Refresh confirmation counts and credit every deposit that reached its
/// threshold.
pub async fn update_pending_confirmations(state: &AppState) -> Result<(), CoreError> {
    for deposit in Deposit::list_pending(&state.pool).await? {
        let chain = match Chain::from_str(&deposit.chain) {
            Ok(chain) => chain,
            Err(e) => {
                tracing::error!("Deposit {} has invalid chain: {}", deposit.id, e);
                continue;
            }
        };
        let Some(client) = state.chains.get(chain) else {
            continue;
        };

        let confirmations = match client.tx_confirmations(&deposit.tx_hash).await {
            Ok(confirmations) => confirmations,
            Err(e) => {
                tracing::warn!("Confirmation check failed for {}: {}", deposit.tx_hash, e);
                continue;
            }
        };

        if confirmations != deposit.confirmations {
            Deposit::update_confirmations(&state.pool, deposit.id, confirmations).await?;
        }

        if confirmations >= deposit.required_confirmations {
            match Deposit::credit(&state.pool, deposit.id).await {
                Ok(Some(credited)) => {
                    tracing::info!(
                        "Credited deposit {} ({} {})",
                        credited.id,
                        credited.amount,
                        credited.asset
                    );
                    Notification::create_best_effort(
                        &state.pool,
                        credited.user_id,
                        "deposit_confirmed",
                        "Deposit confirmed",
                        Some(&format!(
                            "{} {} is now available",
                            credited.amount, credited.asset
                        )),
                    )
                    .await;
                }
                Ok(None) => {} // lost the race to a concurrent pass
                Err(e) => {
                    tracing::error!("Failed to credit deposit {}: {}", deposit.id, e);
                }
            }
        }
    }
    Ok(())
}

/// Daily sweep: pending deposits older than the staleness window are expired
/// and their pending credit reversed.
pub async fn expire_stale_deposits(state: &AppState) -> Result<(), CoreError> {
    for deposit in Deposit::list_stale_pending(&state.pool, STALE_DEPOSIT_HOURS).await? {
        match Deposit::expire(&state.pool, deposit.id).await {
            Ok(true) => tracing::warn!(
                "Expired stale deposit {} ({} {})",
                deposit.id,
                deposit.amount,
                deposit.asset
            ),
            Ok(false) => {}
            Err(e) => tracing::error!("Failed to expire deposit {}: {}", deposit.id, e),
        }
    }
    Ok(())
}

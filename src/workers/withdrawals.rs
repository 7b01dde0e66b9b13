use std::str::FromStr;

use crate::chain::{BroadcastRequest, Chain};
use crate::crypto;
use crate::error::CoreError;
use crate::models::{Notification, Wallet, Withdrawal};
use crate::AppState;

const CLAIM_BATCH: i64 = 10;

/// Claim approved withdrawals and broadcast them. The claim is a single
/// compound UPDATE under SKIP LOCKED, so any number of broadcaster instances
/// can run; each row is signed at most once, and any failure after the claim
/// refunds exactly once.
pub async fn broadcast_withdrawals(state: &AppState) -> Result<(), CoreError> {
    let claimed = Withdrawal::claim_for_broadcast(&state.pool, CLAIM_BATCH).await?;
    if claimed.is_empty() {
        return Ok(());
    }
    tracing::info!("Claimed {} withdrawals for broadcast", claimed.len());

    for withdrawal in claimed {
        if let Err(e) = broadcast_one(state, &withdrawal).await {
            tracing::warn!(
                "Broadcast failed for withdrawal {}: {}; refunding",
                withdrawal.id,
                e
            );
            refund(state, &withdrawal, &e.to_string()).await?;
        }
    }
    Ok(())
}

async fn broadcast_one(state: &AppState, withdrawal: &Withdrawal) -> Result<(), CoreError> {
    let asset = withdrawal.asset();
    let chain = asset.chain();
    let client = state
        .chains
        .get(chain)
        .ok_or_else(|| CoreError::ChainRpc(format!("no client configured for {chain}")))?;

    let wallet = Wallet::find_for_user(&state.pool, withdrawal.user_id, chain)
        .await?
        .ok_or(CoreError::NotFound("wallet"))?;

    // The decrypted key lives only for the duration of this call.
    let signing_key = crypto::open_key(
        &state.config.wallet_encryption_key,
        &wallet.encrypted_private_key,
    )
    .map_err(|e| CoreError::Signing(format!("wallet key unsealing failed: {e}")))?;

    let request = BroadcastRequest {
        withdrawal_id: withdrawal.id,
        asset,
        from_address: wallet.address.clone(),
        to_address: withdrawal.to_address.clone(),
        destination_tag: withdrawal.destination_tag.clone(),
        net_amount: withdrawal.net_amount,
    };

    let tx_hash = client.broadcast(&request, &signing_key).await?;
    drop(signing_key);

    Withdrawal::record_tx_hash(&state.pool, withdrawal.id, &tx_hash).await?;
    tracing::info!(
        "Broadcast withdrawal {} as {} on {}",
        withdrawal.id,
        tx_hash,
        chain
    );
    Ok(())
}

/// A failed refund is an operational page, not a retry: a silent retry on a
/// half-applied refund risks double-credit. The cycle stops here.
async fn refund(state: &AppState, withdrawal: &Withdrawal, reason: &str) -> Result<(), CoreError> {
    match Withdrawal::refund_failed(&state.pool, withdrawal.id, reason).await {
        Ok(true) => {
            Notification::create_best_effort(
                &state.pool,
                withdrawal.user_id,
                "withdrawal_failed",
                "Withdrawal failed",
                Some(&format!(
                    "Your {} {} withdrawal failed and was refunded",
                    withdrawal.amount, withdrawal.asset
                )),
            )
            .await;
            Ok(())
        }
        Ok(false) => {
            // Someone else (cancel, reject) moved the row first and owns the
            // refund.
            tracing::info!(
                "Withdrawal {} already transitioned; refund skipped",
                withdrawal.id
            );
            Ok(())
        }
        Err(e) => {
            tracing::error!(
                "CRITICAL: refund failed for withdrawal {} after broadcast failure: {}. \
                 Manual reconciliation required.",
                withdrawal.id,
                e
            );
            Err(CoreError::Critical(format!(
                "refund failed for withdrawal {}",
                withdrawal.id
            )))
        }
    }
}

/// Second pass: confirm broadcasting rows whose transaction reached its
/// threshold. The CAS update loses quietly to concurrent admin action.
pub async fn poll_confirmations(state: &AppState) -> Result<(), CoreError> {
    for withdrawal in Withdrawal::list_broadcasting(&state.pool).await? {
        let chain = match Chain::from_str(&withdrawal.chain) {
            Ok(chain) => chain,
            Err(e) => {
                tracing::error!("Withdrawal {} has invalid chain: {}", withdrawal.id, e);
                continue;
            }
        };
        let Some(client) = state.chains.get(chain) else {
            continue;
        };
        let Some(tx_hash) = withdrawal.tx_hash.as_deref() else {
            continue;
        };

        let confirmations = match client.tx_confirmations(tx_hash).await {
            Ok(confirmations) => confirmations,
            Err(e) => {
                tracing::warn!("Confirmation check failed for {}: {}", tx_hash, e);
                continue;
            }
        };

        if confirmations >= withdrawal.asset().required_confirmations()
            && Withdrawal::confirm_if_broadcasting(&state.pool, withdrawal.id).await?
        {
            tracing::info!("Withdrawal {} confirmed on chain", withdrawal.id);
            Notification::create_best_effort(
                &state.pool,
                withdrawal.user_id,
                "withdrawal_confirmed",
                "Withdrawal confirmed",
                Some(&format!(
                    "{} {} sent to {}",
                    withdrawal.net_amount, withdrawal.asset, withdrawal.to_address
                )),
            )
            .await;
        }
    }
    Ok(())
}

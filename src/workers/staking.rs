use crate::error::CoreError;
use crate::models::StakingPosition;
use crate::AppState;

/// Positions are accrued once they have sat idle this long, so a daily
/// reward lands even when cycle timing drifts.
const ACCRUAL_IDLE_HOURS: i64 = 23;

pub async fn accrue_earnings(state: &AppState) -> Result<(), CoreError> {
    let due = StakingPosition::list_accruable(&state.pool, ACCRUAL_IDLE_HOURS).await?;
    if due.is_empty() {
        return Ok(());
    }
    tracing::info!("Accruing rewards for {} staking positions", due.len());

    for position in due {
        // accrue() re-checks status under lock, so racing an unstake is safe.
        match StakingPosition::accrue(&state.pool, position.id).await {
            Ok(Some(earning)) => {
                tracing::debug!(
                    "Accrued {} {} for position {}",
                    earning.amount,
                    earning.asset,
                    position.id
                );
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!("Accrual failed for position {}: {}", position.id, e);
            }
        }
    }
    Ok(())
}

use crate::error::CoreError;
use crate::matching;
use crate::models::Order;
use crate::AppState;

/// Retry the match loop for every active order with residue. Orders whose
/// platform fill keeps deferring (price outage, seller shortfall) just stay
/// in the queue.
pub async fn rematch_active_orders(state: &AppState) -> Result<(), CoreError> {
    let orders = Order::list_rematchable(&state.pool).await?;
    if orders.is_empty() {
        return Ok(());
    }

    tracing::debug!("Rematching {} active orders", orders.len());
    for order in orders {
        match matching::fill_order(state, order.id).await {
            Ok(trade_ids) if !trade_ids.is_empty() => {
                tracing::info!("Rematch produced {} trades for order {}", trade_ids.len(), order.id);
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!("Rematch failed for order {}: {}", order.id, e);
            }
        }
    }
    Ok(())
}

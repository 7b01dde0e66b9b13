mod deposits;
mod orders;
mod snapshots;
mod staking;
mod trades;
mod withdrawals;

pub use deposits::{expire_stale_deposits, scan_deposits, update_pending_confirmations};
pub use orders::rematch_active_orders;
pub use snapshots::capture_all_snapshots;
pub use staking::accrue_earnings;
pub use trades::process_expired_trades;
pub use withdrawals::{broadcast_withdrawals, poll_confirmations};

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::AppState;

/// Per-worker overlap guard: when a cycle is still running at the next tick,
/// the tick is skipped and a warning logged.
#[derive(Clone)]
pub struct SingleFlight {
    name: &'static str,
    running: Arc<AtomicBool>,
}

pub struct FlightGuard {
    running: Arc<AtomicBool>,
}

impl SingleFlight {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn try_begin(&self) -> Option<FlightGuard> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            Some(FlightGuard {
                running: self.running.clone(),
            })
        } else {
            tracing::warn!("Worker {} still running, skipping tick", self.name);
            None
        }
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

fn spawn_loop<F, Fut>(name: &'static str, period: Duration, state: AppState, mut cycle: F)
where
    F: FnMut(AppState) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), crate::error::CoreError>> + Send,
{
    let flight = SingleFlight::new(name);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let Some(_guard) = flight.try_begin() else {
                continue;
            };
            if let Err(e) = cycle(state.clone()).await {
                tracing::error!("Worker {} cycle failed: {}", name, e);
            }
        }
    });
}

/// Spawn every periodic worker. One process hosts them all alongside the
/// HTTP surface.
pub fn spawn_all(state: AppState) {
    spawn_loop(
        "process_expired_trades",
        Duration::from_secs(60),
        state.clone(),
        |s| async move { process_expired_trades(&s).await },
    );

    spawn_loop(
        "rematch_active_orders",
        Duration::from_secs(60),
        state.clone(),
        |s| async move { rematch_active_orders(&s).await },
    );

    // The deposit scanner owns its block cursors across cycles;
    // process-local by design, duplicate detections downstream are
    // idempotent.
    {
        let scan_period = Duration::from_millis(state.config.deposit_scan_interval_ms);
        let mut cursors: HashMap<crate::chain::Chain, u64> = HashMap::new();
        let flight = SingleFlight::new("scan_deposits");
        let state = state.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(scan_period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(_guard) = flight.try_begin() else {
                    continue;
                };
                if let Err(e) = scan_deposits(&state, &mut cursors).await {
                    tracing::error!("Worker scan_deposits cycle failed: {}", e);
                }
                if let Err(e) = update_pending_confirmations(&state).await {
                    tracing::error!("Deposit confirmation pass failed: {}", e);
                }
            }
        });
    }

    spawn_loop(
        "broadcast_withdrawals",
        Duration::from_millis(state.config.withdrawal_broadcast_interval_ms),
        state.clone(),
        |s| async move {
            broadcast_withdrawals(&s).await?;
            poll_confirmations(&s).await
        },
    );

    spawn_loop(
        "accrue_earnings",
        Duration::from_secs(6 * 3600),
        state.clone(),
        |s| async move { accrue_earnings(&s).await },
    );

    spawn_loop(
        "capture_all_snapshots",
        Duration::from_secs(3600),
        state.clone(),
        |s| async move { capture_all_snapshots(&s).await },
    );

    spawn_loop(
        "expire_stale_deposits",
        Duration::from_secs(24 * 3600),
        state,
        |s| async move { expire_stale_deposits(&s).await },
    );

    tracing::info!("Periodic workers started");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_flight_blocks_overlap() {
        let flight = SingleFlight::new("test");
        let guard = flight.try_begin();
        assert!(guard.is_some());
        assert!(flight.try_begin().is_none());
        drop(guard);
        assert!(flight.try_begin().is_some());
    }
}

//! Periodic housekeeping.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cache::ContextCache;

/// Every `interval`, drop compiled contexts unused for longer than `max_age`.
/// Runs until `token` is cancelled.
pub fn start_maintenance(
    cache: Arc<ContextCache>,
    interval: Duration,
    max_age: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately; nothing can be stale yet.
        ticker.tick().await;

        debug!(?interval, ?max_age, "Maintenance started");
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let swept = cache.sweep(max_age).await;
            if swept > 0 {
                let remaining = cache.len().await;
                info!(swept, remaining, "Swept stale compiled contexts");
            }
        }
        debug!("Maintenance stopped");
    })
}

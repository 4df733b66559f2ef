//! Background eviction of stale counters.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use super::store::CounterStore;
use super::unix_now;
use crate::config::JanitorConfig;

/// Periodically sweep the counter store, evicting counters idle beyond the
/// configured threshold. A failed sweep is logged and skipped; it never
/// reaches request-handling paths.
pub async fn run(store: Arc<dyn CounterStore>, config: JanitorConfig) {
    let mut interval = tokio::time::interval(Duration::from_secs(config.interval_secs));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let now = unix_now();
        match store
            .sweep(now, config.idle_threshold_secs, config.evict_token_buckets)
            .await
        {
            Ok(evicted) if evicted > 0 => {
                debug!(
                    evicted,
                    remaining = store.counter_count(),
                    "Evicted stale counters"
                );
            }
            Ok(_) => trace!("Janitor sweep found nothing to evict"),
            Err(e) => warn!(error = %e, "Janitor sweep failed, skipping this cycle"),
        }
    }
}

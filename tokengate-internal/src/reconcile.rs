//! Periodic usage reconciliation.
//!
//! Folds fast-path usage counters into the durable store on a fixed
//! interval. The sync is idempotent and non-transactional: increments that
//! race with a pass are picked up by the next one. Per-key failures are
//! logged and skipped; a pass always scans to exhaustion.

use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::cache::{CacheConnectionInfo, USAGE_KEY_PREFIX};
use crate::config::RECONCILE_INTERVAL_SECS;
use crate::store::StoreConnectionInfo;

#[derive(Clone)]
pub struct UsageReconciler {
    cache: CacheConnectionInfo,
    store: StoreConnectionInfo,
}

impl UsageReconciler {
    pub fn new(cache: CacheConnectionInfo, store: StoreConnectionInfo) -> Self {
        Self { cache, store }
    }

    /// Spawn the background loop. Runs until the process exits.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut timer = interval(Duration::from_secs(RECONCILE_INTERVAL_SECS));
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so boot is quiet.
            timer.tick().await;
            loop {
                timer.tick().await;
                self.run_once().await;
            }
        })
    }

    /// One full reconciliation pass over every usage counter.
    pub async fn run_once(&self) {
        tracing::info!("Starting usage reconciliation pass");
        let mut cursor = 0u64;
        let mut synced = 0u32;
        loop {
            let (next_cursor, keys) = match self.cache.scan_prefix(USAGE_KEY_PREFIX, cursor).await {
                Ok(page) => page,
                Err(e) => {
                    tracing::error!("Usage scan failed at cursor {cursor}: {e}");
                    break;
                }
            };
            for key in keys {
                if self.sync_key(&key).await {
                    synced += 1;
                }
            }
            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }
        tracing::info!("Usage reconciliation pass completed ({synced} subjects synced)");
    }

    /// Sync one counter into the durable store. Failures are contained here.
    async fn sync_key(&self, key: &str) -> bool {
        let Some(subject) = key.strip_prefix(USAGE_KEY_PREFIX) else {
            tracing::warn!("Skipping unexpected key in usage scan: {key}");
            return false;
        };
        let usage = match self.cache.get(key).await {
            Ok(Some(raw)) => match raw.parse::<u64>() {
                Ok(usage) => usage,
                Err(e) => {
                    tracing::error!("Unparseable usage counter {key}: {e}");
                    return false;
                }
            },
            Ok(None) => return false,
            Err(e) => {
                tracing::error!("Failed to read usage counter {key}: {e}");
                return false;
            }
        };
        if let Err(e) = self.store.set_usage(subject, usage).await {
            tracing::error!("Failed to sync usage for {subject}: {e}");
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_once_syncs_all_counters() {
        let cache = CacheConnectionInfo::new_mock();
        let store = StoreConnectionInfo::new_mock();
        store.init_usage("a", 0, None).await.unwrap();
        store.init_usage("b", 0, None).await.unwrap();
        cache.set("llm_usage:a", "120").await.unwrap();
        cache.set("llm_usage:b", "7").await.unwrap();
        // Unrelated keys are not picked up by the scan.
        cache.set("llm_limit:a", "1000").await.unwrap();

        let reconciler = UsageReconciler::new(cache, store.clone());
        reconciler.run_once().await;

        assert_eq!(
            store.get_usage("a").await.unwrap().unwrap().total_tokens_used,
            120
        );
        assert_eq!(
            store.get_usage("b").await.unwrap().unwrap().total_tokens_used,
            7
        );
    }

    #[tokio::test]
    async fn test_run_once_is_idempotent() {
        let cache = CacheConnectionInfo::new_mock();
        let store = StoreConnectionInfo::new_mock();
        store.init_usage("a", 0, None).await.unwrap();
        cache.set("llm_usage:a", "55").await.unwrap();

        let reconciler = UsageReconciler::new(cache, store.clone());
        reconciler.run_once().await;
        reconciler.run_once().await;

        assert_eq!(
            store.get_usage("a").await.unwrap().unwrap().total_tokens_used,
            55
        );
    }

    #[tokio::test]
    async fn test_bad_counter_does_not_abort_pass() {
        let cache = CacheConnectionInfo::new_mock();
        let store = StoreConnectionInfo::new_mock();
        store.init_usage("good", 0, None).await.unwrap();
        cache.set("llm_usage:bad", "not-a-number").await.unwrap();
        cache.set("llm_usage:good", "33").await.unwrap();

        let reconciler = UsageReconciler::new(cache, store.clone());
        reconciler.run_once().await;

        assert_eq!(
            store
                .get_usage("good")
                .await
                .unwrap()
                .unwrap()
                .total_tokens_used,
            33
        );
    }
}

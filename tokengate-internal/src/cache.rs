//! Fast-path cache client.
//!
//! All cross-request coordination (replay markers, session floors, admission
//! counters, usage mirrors) goes through this client. The cache is advisory
//! and best-effort; the durable store remains the system of record.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;

use crate::error::{Error, ErrorDetails};

pub const USED_KEY_PREFIX: &str = "used_key:";
pub const MIN_IAT_KEY_PREFIX: &str = "llm_min_iat:";
pub const ACTIVE_KEY_PREFIX: &str = "llm_active:";
pub const RATE_LIMIT_KEY_PREFIX: &str = "llm_rate_limit:";
pub const USAGE_KEY_PREFIX: &str = "llm_usage:";
pub const LIMIT_KEY_PREFIX: &str = "llm_limit:";
pub const GLOBAL_LIMIT_KEY: &str = "llm_global_limit";

/// Mock entries hold the value plus an optional expiry instant.
pub type MockEntryState = (String, Option<Instant>);

/// Cache connection handle, constructed once at startup and injected into
/// components (never an ambient singleton).
#[derive(Clone)]
pub enum CacheConnectionInfo {
    Mock {
        entries: Arc<Mutex<HashMap<String, MockEntryState>>>,
    },
    Production {
        conn: MultiplexedConnection,
    },
}

impl CacheConnectionInfo {
    pub fn new_mock() -> Self {
        Self::Mock {
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn new_production(url: &str) -> Result<Self, Error> {
        let client = redis::Client::open(url).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to create Redis client: {e}"),
            })
        })?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                Error::new(ErrorDetails::Config {
                    message: format!("Failed to connect to Redis: {e}"),
                })
            })?;
        Ok(Self::Production { conn })
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        match self {
            Self::Mock { entries } => Ok(with_mock(entries, |map| {
                live_entry(map, key).map(|(value, _)| value.clone())
            })),
            Self::Production { conn } => {
                let mut conn = conn.clone();
                conn.get(key).await.map_err(cache_err)
            }
        }
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<(), Error> {
        match self {
            Self::Mock { entries } => {
                with_mock(entries, |map| {
                    map.insert(key.to_string(), (value.to_string(), None));
                });
                Ok(())
            }
            Self::Production { conn } => {
                let mut conn = conn.clone();
                conn.set::<_, _, ()>(key, value).await.map_err(cache_err)
            }
        }
    }

    pub async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), Error> {
        match self {
            Self::Mock { entries } => {
                with_mock(entries, |map| {
                    map.insert(
                        key.to_string(),
                        (
                            value.to_string(),
                            Some(Instant::now() + Duration::from_secs(ttl_secs)),
                        ),
                    );
                });
                Ok(())
            }
            Self::Production { conn } => {
                let mut conn = conn.clone();
                conn.set_ex::<_, _, ()>(key, value, ttl_secs)
                    .await
                    .map_err(cache_err)
            }
        }
    }

    pub async fn del(&self, key: &str) -> Result<(), Error> {
        match self {
            Self::Mock { entries } => {
                with_mock(entries, |map| {
                    map.remove(key);
                });
                Ok(())
            }
            Self::Production { conn } => {
                let mut conn = conn.clone();
                conn.del::<_, ()>(key).await.map_err(cache_err)
            }
        }
    }

    /// Atomic increment; returns the post-increment value.
    pub async fn incr(&self, key: &str) -> Result<i64, Error> {
        self.incr_by(key, 1).await
    }

    pub async fn incr_by(&self, key: &str, amount: i64) -> Result<i64, Error> {
        match self {
            Self::Mock { entries } => Ok(with_mock(entries, |map| {
                let current = live_entry(map, key)
                    .and_then(|(value, _)| value.parse::<i64>().ok())
                    .unwrap_or(0);
                let next = current + amount;
                let expires_at = live_entry(map, key).and_then(|(_, exp)| *exp);
                map.insert(key.to_string(), (next.to_string(), expires_at));
                next
            })),
            Self::Production { conn } => {
                let mut conn = conn.clone();
                conn.incr(key, amount).await.map_err(cache_err)
            }
        }
    }

    /// Atomic decrement; returns the post-decrement value.
    pub async fn decr(&self, key: &str) -> Result<i64, Error> {
        self.incr_by(key, -1).await
    }

    pub async fn expire(&self, key: &str, ttl_secs: i64) -> Result<(), Error> {
        match self {
            Self::Mock { entries } => {
                with_mock(entries, |map| {
                    if let Some(entry) = live_entry(map, key) {
                        entry.1 = u64::try_from(ttl_secs)
                            .ok()
                            .map(|t| Instant::now() + Duration::from_secs(t));
                    }
                });
                Ok(())
            }
            Self::Production { conn } => {
                let mut conn = conn.clone();
                conn.expire::<_, ()>(key, ttl_secs).await.map_err(cache_err)
            }
        }
    }

    /// One page of a cursor-paginated prefix scan. A returned cursor of 0
    /// means the scan is exhausted.
    pub async fn scan_prefix(&self, prefix: &str, cursor: u64) -> Result<(u64, Vec<String>), Error> {
        match self {
            Self::Mock { entries } => Ok(with_mock(entries, |map| {
                let now = Instant::now();
                let keys = map
                    .iter()
                    .filter(|(key, (_, expires_at))| {
                        key.starts_with(prefix) && expires_at.map(|at| at > now).unwrap_or(true)
                    })
                    .map(|(key, _)| key.clone())
                    .collect();
                (0, keys)
            })),
            Self::Production { conn } => {
                let mut conn = conn.clone();
                redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(format!("{prefix}*"))
                    .arg("COUNT")
                    .arg(100)
                    .query_async(&mut conn)
                    .await
                    .map_err(cache_err)
            }
        }
    }
}

fn cache_err(e: redis::RedisError) -> Error {
    Error::new(ErrorDetails::Cache {
        message: e.to_string(),
    })
}

fn with_mock<T>(
    entries: &Arc<Mutex<HashMap<String, MockEntryState>>>,
    f: impl FnOnce(&mut HashMap<String, MockEntryState>) -> T,
) -> T {
    #[expect(clippy::expect_used)]
    let mut map = entries.lock().expect("mock cache mutex poisoned");
    f(&mut map)
}

/// Returns the entry for `key` if present and unexpired, purging it otherwise.
fn live_entry<'a>(
    map: &'a mut HashMap<String, MockEntryState>,
    key: &str,
) -> Option<&'a mut MockEntryState> {
    let expired = map
        .get(key)
        .and_then(|(_, expires_at)| *expires_at)
        .map(|at| at <= Instant::now())
        .unwrap_or(false);
    if expired {
        map.remove(key);
    }
    map.get_mut(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_incr_decr() {
        let cache = CacheConnectionInfo::new_mock();
        assert_eq!(cache.incr("llm_active:s1").await.unwrap(), 1);
        assert_eq!(cache.incr("llm_active:s1").await.unwrap(), 2);
        assert_eq!(cache.decr("llm_active:s1").await.unwrap(), 1);
        assert_eq!(cache.decr("llm_active:s1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_mock_ttl_expiry() {
        let cache = CacheConnectionInfo::new_mock();
        cache.set_ex("llm_rate_limit:s1", "1", 0).await.unwrap();
        // TTL of zero is already in the past.
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(cache.get("llm_rate_limit:s1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_mock_scan_prefix() {
        let cache = CacheConnectionInfo::new_mock();
        cache.set("llm_usage:a", "10").await.unwrap();
        cache.set("llm_usage:b", "20").await.unwrap();
        cache.set("llm_limit:a", "1000").await.unwrap();

        let (cursor, mut keys) = cache.scan_prefix(USAGE_KEY_PREFIX, 0).await.unwrap();
        keys.sort();
        assert_eq!(cursor, 0);
        assert_eq!(keys, vec!["llm_usage:a", "llm_usage:b"]);
    }

    #[tokio::test]
    async fn test_mock_incr_preserves_ttl() {
        let cache = CacheConnectionInfo::new_mock();
        cache.set_ex("llm_usage:a", "5", 60).await.unwrap();
        assert_eq!(cache.incr_by("llm_usage:a", 10).await.unwrap(), 15);
        assert_eq!(cache.get("llm_usage:a").await.unwrap().as_deref(), Some("15"));
    }
}

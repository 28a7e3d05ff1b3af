//! Application state shared across handlers.
//!
//! Client handles (cache connection, store client, upstream HTTP client) are
//! created once at startup and injected, never referenced as ambient
//! singletons.

use std::sync::Arc;

use crate::admission::AdmissionController;
use crate::cache::CacheConnectionInfo;
use crate::config::Config;
use crate::error::Error;
use crate::quota::QuotaLedger;
use crate::relay::StreamRelay;
use crate::store::StoreConnectionInfo;

#[derive(Clone)]
pub struct AppStateData {
    pub config: Arc<Config>,
    pub cache: CacheConnectionInfo,
    pub store: StoreConnectionInfo,
    pub admission: AdmissionController,
    pub ledger: QuotaLedger,
    pub http_client: reqwest::Client,
}

impl AppStateData {
    pub fn new(config: Config, cache: CacheConnectionInfo, store: StoreConnectionInfo) -> Self {
        let admission = AdmissionController::new(cache.clone());
        let ledger = QuotaLedger::new(cache.clone(), config.default_global_quota);
        Self {
            config: Arc::new(config),
            cache,
            store,
            admission,
            ledger,
            http_client: reqwest::Client::new(),
        }
    }

    /// Production wiring: connect to Redis, and to the durable store when one
    /// is configured (otherwise durable operations are inert).
    pub async fn from_config(config: Config) -> Result<Self, Error> {
        let cache = CacheConnectionInfo::new_production(&config.redis_url).await?;
        let http_client = reqwest::Client::new();
        let store = match &config.store_url {
            Some(url) => StoreConnectionInfo::new_production(
                url.clone(),
                config.store_admin_secret.clone(),
                http_client.clone(),
            ),
            None => {
                tracing::warn!("STORE_URL not set; durable usage records are disabled");
                StoreConnectionInfo::Disabled
            }
        };
        Ok(Self::new(config, cache, store))
    }

    /// In-memory wiring for tests.
    pub fn new_mock(config: Config) -> Self {
        Self::new(
            config,
            CacheConnectionInfo::new_mock(),
            StoreConnectionInfo::new_mock(),
        )
    }

    pub fn relay(&self) -> StreamRelay {
        StreamRelay {
            config: self.config.clone(),
            store: self.store.clone(),
            admission: self.admission.clone(),
            ledger: self.ledger.clone(),
            http_client: self.http_client.clone(),
        }
    }
}

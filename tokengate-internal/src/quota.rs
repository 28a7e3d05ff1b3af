//! Token quota ledger.
//!
//! Resolves the effective limit (per-subject override or global fallback) and
//! tracks cumulative usage in the fast-path counter. The check and the relay
//! are not atomic: an admitted-but-unaccounted request can overshoot the
//! limit by one request's worth of tokens (soft quota).

use crate::cache::{CacheConnectionInfo, GLOBAL_LIMIT_KEY, LIMIT_KEY_PREFIX, USAGE_KEY_PREFIX};
use crate::error::{Error, ErrorDetails};

#[derive(Clone)]
pub struct QuotaLedger {
    cache: CacheConnectionInfo,
    global_fallback: u64,
}

impl QuotaLedger {
    pub fn new(cache: CacheConnectionInfo, global_fallback: u64) -> Self {
        Self {
            cache,
            global_fallback,
        }
    }

    /// Effective limit: per-subject override if present, else the global
    /// quota (cache override key, else the configured fallback).
    pub async fn resolve_limit(&self, subject: &str) -> Result<u64, Error> {
        let limit_key = format!("{LIMIT_KEY_PREFIX}{subject}");
        if let Some(raw) = self.cache.get(&limit_key).await? {
            if let Ok(limit) = raw.parse::<u64>() {
                return Ok(limit);
            }
        }
        match self.cache.get(GLOBAL_LIMIT_KEY).await {
            Ok(Some(raw)) => {
                if let Ok(limit) = raw.parse::<u64>() {
                    return Ok(limit);
                }
            }
            Ok(None) => {}
            Err(e) => tracing::error!("Failed to read global limit override: {e}"),
        }
        Ok(self.global_fallback)
    }

    pub async fn current_usage(&self, subject: &str) -> Result<u64, Error> {
        let usage_key = format!("{USAGE_KEY_PREFIX}{subject}");
        Ok(self
            .cache
            .get(&usage_key)
            .await?
            .and_then(|raw| raw.parse::<u64>().ok())
            .unwrap_or(0))
    }

    /// Gate on usage at check time only; projected post-request usage does
    /// not factor in.
    pub async fn check_and_admit(&self, subject: &str) -> Result<(), Error> {
        let usage = self.current_usage(subject).await?;
        let limit = self.resolve_limit(subject).await?;
        if usage >= limit {
            return Err(Error::new(ErrorDetails::QuotaExceeded));
        }
        Ok(())
    }

    /// Fold consumed tokens into the fast-path counter. Never decrements;
    /// only reconciliation performs absolute sets.
    pub async fn record_usage(&self, subject: &str, tokens: u64) -> Result<(), Error> {
        if tokens == 0 {
            return Ok(());
        }
        let usage_key = format!("{USAGE_KEY_PREFIX}{subject}");
        let amount = i64::try_from(tokens).map_err(|_| {
            Error::new(ErrorDetails::InternalError {
                message: format!("token count {tokens} out of range"),
            })
        })?;
        self.cache.incr_by(&usage_key, amount).await?;
        Ok(())
    }
}

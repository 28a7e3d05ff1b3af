//! Per-subject admission control.
//!
//! Bounds concurrency (at most one in-flight request) and request frequency
//! using only the cache's atomic increment/decrement/set-with-expiry
//! primitives; there is no distributed lock manager. The rate-limit step is a
//! check-then-set and therefore best-effort under races.

use crate::cache::{CacheConnectionInfo, ACTIVE_KEY_PREFIX, RATE_LIMIT_KEY_PREFIX};
use crate::config::{ACTIVE_COUNTER_TTL_SECS, RATE_LIMIT_TTL_SECS};
use crate::error::{Error, ErrorDetails};

#[derive(Clone)]
pub struct AdmissionController {
    cache: CacheConnectionInfo,
}

impl AdmissionController {
    pub fn new(cache: CacheConnectionInfo) -> Self {
        Self { cache }
    }

    /// Claim the subject's single in-flight slot. On success the caller owns
    /// the claim and must release it exactly once via [`Self::release`],
    /// whatever the outcome of the request. Every rejection after the claim
    /// is taken, including cache failures, releases it before returning.
    pub async fn admit(&self, subject: &str) -> Result<(), Error> {
        let active_key = format!("{ACTIVE_KEY_PREFIX}{subject}");
        let active = self.cache.incr(&active_key).await?;

        if active > 1 {
            self.release(subject).await;
            return Err(Error::new(ErrorDetails::TooManyConcurrent));
        }

        if let Err(e) = self.gate(subject, &active_key).await {
            self.release(subject).await;
            return Err(e);
        }
        Ok(())
    }

    /// Steps that run while holding the claim; any error here means the
    /// caller's claim is released by [`Self::admit`].
    async fn gate(&self, subject: &str, active_key: &str) -> Result<(), Error> {
        // Safety net: a crashed relay cannot hold the slot forever.
        self.cache
            .expire(active_key, ACTIVE_COUNTER_TTL_SECS)
            .await?;

        let rate_key = format!("{RATE_LIMIT_KEY_PREFIX}{subject}");
        if self.cache.get(&rate_key).await?.is_some() {
            return Err(Error::new(ErrorDetails::TooFrequent));
        }
        self.cache
            .set_ex(&rate_key, "1", RATE_LIMIT_TTL_SECS.unsigned_abs())
            .await
    }

    /// Release the in-flight claim taken by [`Self::admit`].
    pub async fn release(&self, subject: &str) {
        let active_key = format!("{ACTIVE_KEY_PREFIX}{subject}");
        if let Err(e) = self.cache.decr(&active_key).await {
            tracing::error!("Failed to release active-request claim for {subject}: {e}");
        }
    }
}

//! Access-credential exchange.
//!
//! A one-time RS256-signed access key is exchanged for a reusable HS256
//! session token. Replay is prevented by a cache marker keyed on `jti` (the
//! fail-safe barrier) plus a best-effort durable credential-usage log.

use chrono::Utc;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::cache::{
    CacheConnectionInfo, LIMIT_KEY_PREFIX, MIN_IAT_KEY_PREFIX, USAGE_KEY_PREFIX, USED_KEY_PREFIX,
};
use crate::config::Config;
use crate::error::{Error, ErrorDetails};
use crate::session::issue_session_token;
use crate::store::StoreConnectionInfo;

/// Claims carried by a one-time access credential.
#[derive(Debug, Deserialize)]
pub struct AccessCredentialClaims {
    pub sub: String,
    pub jti: String,
    pub exp: u64,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub quota: Option<u64>,
}

/// Result of a successful credential exchange.
#[derive(Debug, Serialize)]
pub struct IssuedSession {
    pub token: String,
    pub subject: String,
    pub email: Option<String>,
}

pub struct CredentialVerifier<'a> {
    pub config: &'a Config,
    pub cache: &'a CacheConnectionInfo,
    pub store: &'a StoreConnectionInfo,
}

impl CredentialVerifier<'_> {
    /// Exchange a one-time access credential for a session token.
    ///
    /// Replay-marker and session-floor cache writes are mandatory (the
    /// request fails rather than risk replay); everything on the quota-sync
    /// path is best-effort.
    pub async fn verify(&self, access_key: &str) -> Result<IssuedSession, Error> {
        let public_key = self.config.credential_public_key.as_ref().ok_or_else(|| {
            Error::new(ErrorDetails::Config {
                message: "Server configuration error (public key missing)".to_string(),
            })
        })?;

        let decoding_key = DecodingKey::from_rsa_pem(public_key.as_bytes()).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Invalid credential public key: {e}"),
            })
        })?;
        let mut validation = Validation::new(Algorithm::RS256);
        // No expiry leeway: an accepted credential must have remaining
        // validity, so its replay marker below always gets a positive TTL.
        validation.leeway = 0;
        let claims = decode::<AccessCredentialClaims>(access_key, &decoding_key, &validation)
            .map_err(|e| {
                Error::new(ErrorDetails::InvalidCredential {
                    message: e.to_string(),
                })
            })?
            .claims;

        let used_key = format!("{USED_KEY_PREFIX}{}", claims.jti);
        if self.cache.get(&used_key).await?.is_some() {
            return Err(Error::new(ErrorDetails::CredentialReplayed));
        }
        // Second replay barrier: the durable log survives cache flushes.
        match self.store.credential_was_used(&claims.jti).await {
            Ok(true) => return Err(Error::new(ErrorDetails::CredentialReplayed)),
            Ok(false) => {}
            Err(e) => tracing::warn!("Durable credential-log check failed: {e}"),
        }

        let now = Utc::now().timestamp();
        // Mandatory write: failing open here would allow replay. The marker
        // lives as long as the credential does (at least one second, in case
        // the clock landed exactly on `exp`).
        let ttl = (i64::try_from(claims.exp).unwrap_or(0) - now).max(1);
        self.cache
            .set_ex(&used_key, "1", ttl.unsigned_abs())
            .await?;

        // Any session issued before this instant is superseded.
        self.cache
            .set(
                &format!("{MIN_IAT_KEY_PREFIX}{}", claims.sub),
                &now.to_string(),
            )
            .await?;

        if let Err(e) = self
            .store
            .log_credential_use(&claims.sub, &claims.jti, claims.email.as_deref())
            .await
        {
            tracing::warn!("Failed to log credential use: {e}");
        }

        self.sync_quota(&claims).await;

        let token = issue_session_token(self.config, &claims.sub, claims.email.as_deref())?;
        Ok(IssuedSession {
            token,
            subject: claims.sub,
            email: claims.email,
        })
    }

    /// Resolve-or-create the durable usage record and mirror its limit and
    /// usage into the cache. Every step is best-effort: a failure here must
    /// not block session issuance.
    async fn sync_quota(&self, claims: &AccessCredentialClaims) {
        let record = match self.store.get_usage(&claims.sub).await {
            Ok(Some(record)) => Some(record),
            Ok(None) => {
                let limit = claims.quota.unwrap_or(0);
                match self
                    .store
                    .init_usage(&claims.sub, limit, claims.email.as_deref())
                    .await
                {
                    Ok(record) => record,
                    Err(e) => {
                        tracing::warn!("Failed to create usage record for {}: {e}", claims.sub);
                        None
                    }
                }
            }
            Err(e) => {
                tracing::warn!("Failed to read usage record for {}: {e}", claims.sub);
                None
            }
        };

        let limit_key = format!("{LIMIT_KEY_PREFIX}{}", claims.sub);
        let db_limit = record.as_ref().map(|r| r.token_limit).unwrap_or(0);
        let sync = if db_limit > 0 {
            self.cache.set(&limit_key, &db_limit.to_string()).await
        } else if let Some(quota) = claims.quota.filter(|q| *q > 0) {
            // The durable write raced or failed; fall back to the credential's quota.
            self.cache.set(&limit_key, &quota.to_string()).await
        } else {
            // No custom limit: delete the override so /chat falls back to global.
            self.cache.del(&limit_key).await
        };
        if let Err(e) = sync {
            tracing::warn!("Failed to sync quota limit for {}: {e}", claims.sub);
        }

        // Cold-start backfill: seed usage from the durable checkpoint only if
        // the cache has no counter yet. A warm counter is never overwritten.
        if let Some(record) = record {
            let usage_key = format!("{USAGE_KEY_PREFIX}{}", claims.sub);
            match self.cache.get(&usage_key).await {
                Ok(None) => {
                    if let Err(e) = self
                        .cache
                        .set(&usage_key, &record.total_tokens_used.to_string())
                        .await
                    {
                        tracing::warn!("Failed to backfill usage for {}: {e}", claims.sub);
                    }
                }
                Ok(Some(_)) => {}
                Err(e) => tracing::warn!("Failed to read usage counter for {}: {e}", claims.sub),
            }
        }
    }
}

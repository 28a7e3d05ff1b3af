use std::path::PathBuf;

use secrecy::{ExposeSecret, SecretString};

use crate::error::{Error, ErrorDetails};

/// Session tokens are valid for 12 hours from issuance.
pub const SESSION_VALIDITY_SECS: i64 = 12 * 3600;
/// Safety TTL on the per-subject active-request counter, so a crashed relay
/// cannot permanently block a subject.
pub const ACTIVE_COUNTER_TTL_SECS: i64 = 300;
/// Minimum interval between accepted requests per subject.
pub const RATE_LIMIT_TTL_SECS: i64 = 3;
/// How often fast-path usage counters are folded into the durable store.
pub const RECONCILE_INTERVAL_SECS: u64 = 300;
/// Fallback global quota when neither the cache override nor the env var is set.
pub const DEFAULT_GLOBAL_QUOTA: u64 = 500_000;
/// Rough chars-to-tokens ratio used only when the provider reports no usage.
/// This is a documented approximation, not a tokenizer.
pub const TOKEN_ESTIMATE_RATIO: f64 = 0.7;

/// The model name that routes to the dedicated provider credential pair.
pub const QWEN_MODEL_NAME: &str = "Qwen3-Max";
pub const DEFAULT_MODEL_NAME: &str = "gpt-3.5-turbo";

/// Upstream provider credentials resolved for one request.
#[derive(Clone)]
pub struct ProviderCredentials {
    pub api_key: SecretString,
    pub base_url: Option<String>,
}

#[derive(Clone)]
pub struct Config {
    /// PEM public key material for verifying access credentials (RS256).
    pub credential_public_key: Option<String>,
    /// HS256 secret for signing session tokens.
    pub session_secret: SecretString,
    /// Global quota fallback from the environment.
    pub default_global_quota: u64,
    /// Default upstream provider credentials, if configured.
    pub provider: Option<ProviderCredentials>,
    /// Override credentials for the named model (`Qwen3-Max`).
    pub qwen_provider: Option<ProviderCredentials>,
    pub redis_url: String,
    pub store_url: Option<url::Url>,
    pub store_admin_secret: Option<SecretString>,
}

impl Config {
    pub fn from_env() -> Result<Self, Error> {
        let credential_public_key = load_public_key()?;

        let session_secret = SecretString::from(
            std::env::var("LLM_SESSION_SECRET")
                .unwrap_or_else(|_| "tokengate_llm_session_secret".to_string()),
        );

        let default_global_quota = match std::env::var("LLM_DEFAULT_LIMIT") {
            Ok(raw) => raw.parse::<u64>().map_err(|e| {
                Error::new(ErrorDetails::Config {
                    message: format!("Invalid LLM_DEFAULT_LIMIT `{raw}`: {e}"),
                })
            })?,
            Err(_) => DEFAULT_GLOBAL_QUOTA,
        };

        let provider = provider_from_env("LLM_API_KEY", "LLM_API_URL");
        let qwen_provider = provider_from_env("QWEN_API_KEY", "QWEN_API_URL");

        let redis_url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".to_string());

        let store_url = match std::env::var("STORE_URL") {
            Ok(raw) => Some(url::Url::parse(&raw).map_err(|e| {
                Error::new(ErrorDetails::Config {
                    message: format!("Invalid STORE_URL `{raw}`: {e}"),
                })
            })?),
            Err(_) => None,
        };
        let store_admin_secret = std::env::var("STORE_ADMIN_SECRET")
            .ok()
            .map(SecretString::from);

        Ok(Self {
            credential_public_key,
            session_secret,
            default_global_quota,
            provider,
            qwen_provider,
            redis_url,
            store_url,
            store_admin_secret,
        })
    }

    /// Resolve provider credentials for a request, honoring the named-model override.
    pub fn resolve_provider(&self, model: &str) -> Option<&ProviderCredentials> {
        if model == QWEN_MODEL_NAME {
            if let Some(qwen) = &self.qwen_provider {
                return Some(qwen);
            }
        }
        self.provider.as_ref()
    }
}

fn provider_from_env(key_var: &str, url_var: &str) -> Option<ProviderCredentials> {
    let api_key = std::env::var(key_var).ok()?;
    Some(ProviderCredentials {
        api_key: SecretString::from(api_key),
        base_url: std::env::var(url_var).ok(),
    })
}

/// Reads the credential verification key from `LLM_PUBLIC_KEY` (with `\n`
/// escapes) or from the path in `LLM_PUBLIC_KEY_PATH`. Absence is not an
/// error here; `/verify` reports 500 when the key is actually needed.
fn load_public_key() -> Result<Option<String>, Error> {
    if let Ok(material) = std::env::var("LLM_PUBLIC_KEY") {
        return Ok(Some(material.replace("\\n", "\n")));
    }
    let path = std::env::var("LLM_PUBLIC_KEY_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("public_key.pem"));
    if path.exists() {
        let pem = std::fs::read_to_string(&path).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to read public key at {}: {e}", path.display()),
            })
        })?;
        return Ok(Some(pem));
    }
    tracing::warn!("LLM public key not found at {}", path.display());
    Ok(None)
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("credential_public_key", &self.credential_public_key.is_some())
            .field("default_global_quota", &self.default_global_quota)
            .field("provider", &self.provider.is_some())
            .field("qwen_provider", &self.qwen_provider.is_some())
            .field("redis_url", &self.redis_url)
            .field("store_url", &self.store_url)
            .finish_non_exhaustive()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            credential_public_key: None,
            session_secret: SecretString::from("tokengate_llm_session_secret"),
            default_global_quota: DEFAULT_GLOBAL_QUOTA,
            provider: None,
            qwen_provider: None,
            redis_url: "redis://127.0.0.1/".to_string(),
            store_url: None,
            store_admin_secret: None,
        }
    }
}

impl Config {
    pub fn session_secret_bytes(&self) -> &[u8] {
        self.session_secret.expose_secret().as_bytes()
    }
}

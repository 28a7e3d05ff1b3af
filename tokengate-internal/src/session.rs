//! Session tokens and per-request authentication.
//!
//! Sessions are stateless HS256 tokens. They are invalidated logically: each
//! credential exchange raises the subject's issued-at floor in the cache, and
//! any token minted before the floor is rejected. No revocation list exists.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::cache::MIN_IAT_KEY_PREFIX;
use crate::config::{Config, SESSION_VALIDITY_SECS};
use crate::error::{Error, ErrorDetails};
use crate::gateway_util::AppStateData;

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionClaims {
    pub sub: String,
    #[serde(default)]
    pub email: Option<String>,
    pub role: String,
    #[serde(rename = "type")]
    pub token_type: String,
    pub iat: i64,
    pub exp: i64,
}

/// Identity attached to the request after session validation.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub subject: String,
    pub email: Option<String>,
    pub role: String,
}

pub fn issue_session_token(
    config: &Config,
    subject: &str,
    email: Option<&str>,
) -> Result<String, Error> {
    let now = Utc::now().timestamp();
    let claims = SessionClaims {
        sub: subject.to_string(),
        email: email.map(str::to_string),
        role: "student".to_string(),
        token_type: "llm_session".to_string(),
        iat: now,
        exp: now + SESSION_VALIDITY_SECS,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(config.session_secret_bytes()),
    )
    .map_err(|e| {
        Error::new(ErrorDetails::InternalError {
            message: format!("Failed to sign session token: {e}"),
        })
    })
}

pub fn decode_session_token(config: &Config, token: &str) -> Result<SessionClaims, Error> {
    let claims = decode::<SessionClaims>(
        token,
        &DecodingKey::from_secret(config.session_secret_bytes()),
        &Validation::default(),
    )
    .map_err(|e| {
        Error::new(ErrorDetails::Auth {
            message: format!("Invalid session token: {e}"),
        })
    })?
    .claims;
    if claims.token_type != "llm_session" {
        return Err(Error::new(ErrorDetails::Auth {
            message: "Invalid session token: wrong token type".to_string(),
        }));
    }
    Ok(claims)
}

/// Axum middleware that validates the Bearer session token and attaches an
/// [`AuthenticatedUser`] extension. Pure validation, no mutation.
pub async fn require_session(
    State(state): State<AppStateData>,
    mut request: Request,
    next: Next,
) -> Result<Response, Response> {
    let header = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::trim);

    let token = match header.and_then(|h| h.strip_prefix("Bearer ")) {
        Some(token) => token.to_string(),
        None => {
            return Err(Error::new(ErrorDetails::Auth {
                message: "Missing or invalid Authorization header".to_string(),
            })
            .into_response())
        }
    };

    let claims = match decode_session_token(&state.config, &token) {
        Ok(claims) => claims,
        Err(e) => return Err(e.into_response()),
    };

    // Reject tokens issued before the subject's floor (newer login wins).
    let floor_key = format!("{MIN_IAT_KEY_PREFIX}{}", claims.sub);
    match state.cache.get(&floor_key).await {
        Ok(Some(floor)) => {
            if let Ok(min_iat) = floor.parse::<i64>() {
                if claims.iat < min_iat {
                    return Err(Error::new(ErrorDetails::SessionSuperseded).into_response());
                }
            }
        }
        Ok(None) => {}
        Err(e) => return Err(e.into_response()),
    }

    request.extensions_mut().insert(AuthenticatedUser {
        subject: claims.sub,
        email: claims.email,
        role: claims.role,
    });
    Ok(next.run(request).await)
}

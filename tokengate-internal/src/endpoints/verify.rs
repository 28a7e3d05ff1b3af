//! `POST /llm/verify` — exchange a one-time access key for a session token.

use axum::extract::State;
use axum::response::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::credential::CredentialVerifier;
use crate::error::{Error, ErrorDetails};
use crate::gateway_util::AppStateData;

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    #[serde(rename = "accessKey")]
    pub access_key: Option<String>,
}

pub async fn verify_handler(
    State(state): State<AppStateData>,
    Json(body): Json<VerifyRequest>,
) -> Result<Json<Value>, Error> {
    let access_key = body
        .access_key
        .filter(|key| !key.is_empty())
        .ok_or_else(|| {
            Error::new(ErrorDetails::InvalidRequest {
                message: "Access key is required".to_string(),
            })
        })?;

    let verifier = CredentialVerifier {
        config: &state.config,
        cache: &state.cache,
        store: &state.store,
    };
    let session = verifier.verify(&access_key).await?;

    Ok(Json(json!({
        "token": session.token,
        "user": {
            "studentNo": session.subject,
            "email": session.email,
        }
    })))
}

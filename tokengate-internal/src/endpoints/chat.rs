//! `POST /llm/chat` — relay a streaming completion for an authenticated
//! session. Admission, quota, and relay are delegated to [`StreamRelay`];
//! this handler only validates the body.

use axum::extract::State;
use axum::response::Response;
use axum::{Extension, Json};
use serde::Deserialize;

use crate::error::{Error, ErrorDetails};
use crate::gateway_util::AppStateData;
use crate::provider::Message;
use crate::session::AuthenticatedUser;

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub messages: Option<Vec<Message>>,
    pub model: Option<String>,
}

pub async fn chat_handler(
    State(state): State<AppStateData>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(body): Json<ChatRequest>,
) -> Result<Response, Error> {
    let messages = body
        .messages
        .filter(|messages| !messages.is_empty())
        .ok_or_else(|| {
            Error::new(ErrorDetails::InvalidRequest {
                message: "Messages array is required".to_string(),
            })
        })?;

    state
        .relay()
        .respond(&user.subject, body.model, messages)
        .await
}

//! Streaming completion relay.
//!
//! Drives a request from admission through upstream streaming to completion.
//! The relay owns the active-request claim taken at admission; a
//! [`RelayGuard`] releases it exactly once and folds observed token usage
//! into the ledger on every terminal path, including a mid-stream client
//! disconnect (stream drop).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use futures::StreamExt;
use reqwest_eventsource::Event as EsEvent;
use serde_json::json;

use crate::admission::AdmissionController;
use crate::config::{Config, DEFAULT_MODEL_NAME};
use crate::error::{Error, ErrorDetails};
use crate::provider::{estimate_tokens, ChatCompletionChunk, Message, ProviderClient};
use crate::quota::QuotaLedger;
use crate::store::StoreConnectionInfo;

/// Owns the in-flight claim for one relay. Terminal paths call
/// [`RelayGuard::finish`]; if the relay future is dropped instead (client
/// disconnect), `Drop` spawns the same cleanup.
pub struct RelayGuard {
    admission: AdmissionController,
    ledger: QuotaLedger,
    subject: String,
    tokens: Arc<AtomicU64>,
    finished: Arc<AtomicBool>,
}

impl RelayGuard {
    pub fn new(admission: AdmissionController, ledger: QuotaLedger, subject: String) -> Self {
        Self {
            admission,
            ledger,
            subject,
            tokens: Arc::new(AtomicU64::new(0)),
            finished: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Record the authoritative token count once the provider reports it.
    pub fn observe_usage(&self, tokens: u64) {
        self.tokens.store(tokens, Ordering::SeqCst);
    }

    pub fn observed(&self) -> u64 {
        self.tokens.load(Ordering::SeqCst)
    }

    /// Record usage and release the claim. Idempotent.
    pub async fn finish(&self) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        finalize(
            self.admission.clone(),
            self.ledger.clone(),
            self.subject.clone(),
            self.observed(),
        )
        .await;
    }
}

impl Drop for RelayGuard {
    fn drop(&mut self) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        let admission = self.admission.clone();
        let ledger = self.ledger.clone();
        let subject = self.subject.clone();
        let tokens = self.tokens.load(Ordering::SeqCst);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(finalize(admission, ledger, subject, tokens));
            }
            Err(_) => {
                // No runtime left (process teardown); the counter's TTL is the backstop.
                tracing::error!("Relay guard dropped outside a runtime; claim for {subject} leaks until TTL");
            }
        }
    }
}

async fn finalize(
    admission: AdmissionController,
    ledger: QuotaLedger,
    subject: String,
    tokens: u64,
) {
    if tokens > 0 {
        if let Err(e) = ledger.record_usage(&subject, tokens).await {
            tracing::error!("Failed to record {tokens} tokens for {subject}: {e}");
        }
    }
    admission.release(&subject).await;
}

pub struct StreamRelay {
    pub config: Arc<Config>,
    pub store: StoreConnectionInfo,
    pub admission: AdmissionController,
    pub ledger: QuotaLedger,
    pub http_client: reqwest::Client,
}

impl StreamRelay {
    /// Run the full admission → quota → relay pipeline for one request.
    /// Every rejection before streaming carries an HTTP status; once the
    /// response is committed, failures become in-stream error events.
    pub async fn respond(
        &self,
        subject: &str,
        model: Option<String>,
        messages: Vec<Message>,
    ) -> Result<Response, Error> {
        self.admission.admit(subject).await?;
        let guard = RelayGuard::new(
            self.admission.clone(),
            self.ledger.clone(),
            subject.to_string(),
        );

        // Quota-exceeded is terminal before any upstream call is made.
        if let Err(e) = self.ledger.check_and_admit(subject).await {
            guard.finish().await;
            return Err(e);
        }

        let model = model.unwrap_or_else(|| DEFAULT_MODEL_NAME.to_string());

        let Some(credentials) = self.config.resolve_provider(&model) else {
            // Soft degradation: no provider configured, answer with a mock
            // completion instead of failing.
            guard.finish().await;
            return Ok(Json(json!({
                "choices": [{
                    "message": {
                        "role": "assistant",
                        "content": "Mock: backend configured but no API key.",
                    }
                }]
            }))
            .into_response());
        };

        // Capability lookup failures are non-fatal; thinking defaults to off.
        let enable_thinking = match self.store.get_model_config(&model).await {
            Ok(Some(capability)) => capability.deep_thinking,
            Ok(None) => false,
            Err(e) => {
                tracing::warn!("Failed to fetch model config for {model}: {e}");
                false
            }
        };

        let client = ProviderClient {
            http_client: &self.http_client,
            credentials,
        };
        let mut event_source = match client.open_stream(&model, &messages, enable_thinking) {
            Ok(es) => es,
            Err(e) => {
                guard.finish().await;
                return Err(e);
            }
        };

        // Hold the response uncommitted until the upstream connection opens,
        // so early upstream failures still map to an HTTP error status.
        let mut pending = None;
        match event_source.next().await {
            Some(Ok(EsEvent::Open)) => {}
            Some(Ok(EsEvent::Message(message))) => pending = Some(message),
            Some(Err(e)) => {
                guard.finish().await;
                return Err(map_eventsource_error(e));
            }
            None => {
                guard.finish().await;
                return Err(Error::new(ErrorDetails::Upstream {
                    message: "stream ended before opening".to_string(),
                }));
            }
        }

        let fallback_estimate = estimate_tokens(&messages);
        let stream = async_stream::stream! {
            let mut failed = false;
            let mut next = pending.map(|m| Ok(EsEvent::Message(m)));
            loop {
                let event = match next.take() {
                    Some(event) => Some(event),
                    None => event_source.next().await,
                };
                match event {
                    Some(Ok(EsEvent::Open)) => continue,
                    Some(Ok(EsEvent::Message(message))) => {
                        if message.data == "[DONE]" {
                            break;
                        }
                        let chunk = match serde_json::from_str::<ChatCompletionChunk>(&message.data) {
                            Ok(chunk) => chunk,
                            Err(e) => {
                                tracing::warn!("Skipping malformed upstream chunk: {e}");
                                continue;
                            }
                        };
                        if let Some(usage) = chunk.usage {
                            guard.observe_usage(usage.total_tokens);
                        }
                        if let Some(delta) = chunk.choices.first().map(|c| &c.delta) {
                            if delta.content.is_some() || delta.reasoning_content.is_some() {
                                yield Ok(Event::default().data(
                                    json!({
                                        "content": delta.content,
                                        "reasoning": delta.reasoning_content,
                                    })
                                    .to_string(),
                                ));
                            }
                        }
                    }
                    Some(Err(reqwest_eventsource::Error::StreamEnded)) | None => break,
                    Some(Err(e)) => {
                        // Headers are committed; the only channel left is an
                        // in-stream error event.
                        let error = map_eventsource_error(e);
                        yield Ok(Event::default().data(
                            json!({ "error": error.to_string() }).to_string(),
                        ));
                        failed = true;
                        break;
                    }
                }
            }

            if !failed {
                if guard.observed() == 0 {
                    // The provider never reported usage; fall back to the
                    // documented content-length estimate.
                    guard.observe_usage(fallback_estimate);
                }
                yield Ok::<_, Error>(Event::default().data("[DONE]"));
            }
            guard.finish().await;
        };

        Ok(Sse::new(stream).keep_alive(KeepAlive::new()).into_response())
    }
}

fn map_eventsource_error(e: reqwest_eventsource::Error) -> Error {
    let message = match &e {
        reqwest_eventsource::Error::InvalidStatusCode(status, _) => {
            format!("provider returned {status}")
        }
        _ => e.to_string(),
    };
    Error::new(ErrorDetails::Upstream { message })
}

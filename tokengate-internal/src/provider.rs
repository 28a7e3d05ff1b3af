//! Upstream completion provider client (OpenAI-compatible streaming API).

use reqwest_eventsource::{EventSource, RequestBuilderExt};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::{ProviderCredentials, TOKEN_ESTIMATE_RATIO};
use crate::error::{Error, ErrorDetails};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// One conversation turn, passed through to the provider unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChatCompletionChunk {
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
    /// Terminal usage report, if the provider supplies one. Authoritative
    /// when present.
    #[serde(default)]
    pub usage: Option<ChunkUsage>,
}

#[derive(Debug, Deserialize)]
pub struct ChunkChoice {
    #[serde(default)]
    pub delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
pub struct ChunkDelta {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub reasoning_content: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChunkUsage {
    #[serde(default)]
    pub total_tokens: u64,
}

pub struct ProviderClient<'a> {
    pub http_client: &'a reqwest::Client,
    pub credentials: &'a ProviderCredentials,
}

impl ProviderClient<'_> {
    /// Open a streaming completion. Dropping the returned [`EventSource`]
    /// aborts the upstream call, which is how client cancellation propagates.
    pub fn open_stream(
        &self,
        model: &str,
        messages: &[Message],
        enable_thinking: bool,
    ) -> Result<EventSource, Error> {
        let base_url = self
            .credentials
            .base_url
            .as_deref()
            .unwrap_or(DEFAULT_BASE_URL);
        let url = format!("{}/chat/completions", base_url.trim_end_matches('/'));

        let mut body = json!({
            "model": model,
            "messages": messages,
            "stream": true,
            "stream_options": { "include_usage": true },
        });
        if enable_thinking {
            body["enable_thinking"] = json!(true);
        }

        self.http_client
            .post(url)
            .bearer_auth(self.credentials.api_key.expose_secret())
            .json(&body)
            .eventsource()
            .map_err(|e| {
                Error::new(ErrorDetails::Upstream {
                    message: format!("Failed to open completion stream: {e}"),
                })
            })
    }
}

/// Last-resort token estimate from input content length. The provider's
/// usage report wins whenever it exists.
pub fn estimate_tokens(messages: &[Message]) -> u64 {
    let input_len: usize = messages
        .iter()
        .map(|m| m.content.as_deref().map(str::len).unwrap_or(0))
        .sum();
    (input_len as f64 * TOKEN_ESTIMATE_RATIO).ceil() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(content: &str) -> Message {
        Message {
            role: "user".to_string(),
            content: Some(content.to_string()),
        }
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(&[]), 0);
        // 10 chars * 0.7 = 7
        assert_eq!(estimate_tokens(&[message("0123456789")]), 7);
        // 3 chars * 0.7 = 2.1, rounded up
        assert_eq!(estimate_tokens(&[message("abc")]), 3);
        // Messages without content contribute nothing.
        let empty = Message {
            role: "assistant".to_string(),
            content: None,
        };
        assert_eq!(estimate_tokens(&[message("abc"), empty]), 3);
    }

    #[test]
    fn test_chunk_deserialization() {
        let chunk: ChatCompletionChunk = serde_json::from_str(
            r#"{"choices":[{"delta":{"content":"hi","reasoning_content":null}}]}"#,
        )
        .unwrap();
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("hi"));
        assert!(chunk.usage.is_none());

        let usage_chunk: ChatCompletionChunk =
            serde_json::from_str(r#"{"choices":[],"usage":{"total_tokens":123}}"#).unwrap();
        assert_eq!(usage_chunk.usage.unwrap().total_tokens, 123);
    }
}

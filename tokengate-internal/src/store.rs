//! Durable account/usage store client (GraphQL over HTTP).
//!
//! The store owns `UsageRecord`s and the credential-usage log; the cache only
//! mirrors them. Every operation here is a suspension point and most callers
//! treat failures as non-fatal (best-effort sync).

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use url::Url;

use crate::error::{Error, ErrorDetails};

/// Durable per-subject usage record. `token_limit == 0` means "follow the
/// global quota".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub subject: String,
    pub total_tokens_used: u64,
    pub token_limit: u64,
    #[serde(default)]
    pub email: Option<String>,
}

/// Capability flags for a named model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelCapability {
    pub name: String,
    pub deep_thinking: bool,
}

#[derive(Default)]
pub struct MockStoreState {
    pub records: HashMap<String, UsageRecord>,
    pub models: HashMap<String, ModelCapability>,
    pub credential_log: HashSet<String>,
}

/// Durable store connection handle.
#[derive(Clone)]
pub enum StoreConnectionInfo {
    Disabled,
    Mock {
        state: Arc<Mutex<MockStoreState>>,
    },
    Production {
        url: Url,
        admin_secret: Option<SecretString>,
        http_client: reqwest::Client,
    },
}

impl StoreConnectionInfo {
    pub fn new_mock() -> Self {
        Self::Mock {
            state: Arc::new(Mutex::new(MockStoreState::default())),
        }
    }

    pub fn new_production(
        url: Url,
        admin_secret: Option<SecretString>,
        http_client: reqwest::Client,
    ) -> Self {
        Self::Production {
            url,
            admin_secret,
            http_client,
        }
    }

    pub async fn get_usage(&self, subject: &str) -> Result<Option<UsageRecord>, Error> {
        match self {
            Self::Disabled => Ok(None),
            Self::Mock { state } => Ok(with_mock(state, |s| s.records.get(subject).cloned())),
            Self::Production { .. } => {
                let data = self
                    .request(
                        r"query GetUsage($student_no: String!) {
                            user_llm_usage_by_pk(student_no: $student_no) {
                                student_no
                                total_tokens_used
                                token_limit
                                email
                            }
                        }",
                        json!({ "student_no": subject }),
                    )
                    .await?;
                parse_record(&data["user_llm_usage_by_pk"])
            }
        }
    }

    /// Idempotent create: on conflict only the email column is updated.
    /// Returns the resulting record.
    pub async fn init_usage(
        &self,
        subject: &str,
        token_limit: u64,
        email: Option<&str>,
    ) -> Result<Option<UsageRecord>, Error> {
        match self {
            Self::Disabled => Ok(None),
            Self::Mock { state } => Ok(with_mock(state, |s| {
                let record = s
                    .records
                    .entry(subject.to_string())
                    .and_modify(|r| {
                        if email.is_some() {
                            r.email = email.map(str::to_string);
                        }
                    })
                    .or_insert_with(|| UsageRecord {
                        subject: subject.to_string(),
                        total_tokens_used: 0,
                        token_limit,
                        email: email.map(str::to_string),
                    });
                Some(record.clone())
            })),
            Self::Production { .. } => {
                let data = self
                    .request(
                        r"mutation InitUsage($student_no: String!, $token_limit: bigint!, $email: String) {
                            insert_user_llm_usage_one(
                                object: { student_no: $student_no, token_limit: $token_limit, email: $email }
                                on_conflict: { constraint: user_llm_usage_pkey, update_columns: [email] }
                            ) {
                                student_no
                                total_tokens_used
                                token_limit
                                email
                            }
                        }",
                        json!({ "student_no": subject, "token_limit": token_limit, "email": email }),
                    )
                    .await?;
                parse_record(&data["insert_user_llm_usage_one"])
            }
        }
    }

    pub async fn increment_usage(&self, subject: &str, tokens: u64) -> Result<(), Error> {
        match self {
            Self::Disabled => Ok(()),
            Self::Mock { state } => {
                with_mock(state, |s| {
                    if let Some(record) = s.records.get_mut(subject) {
                        record.total_tokens_used += tokens;
                    }
                });
                Ok(())
            }
            Self::Production { .. } => {
                self.request(
                    r"mutation IncrementUsage($student_no: String!, $tokens: bigint!, $updated_at: timestamptz!) {
                        update_user_llm_usage_by_pk(
                            pk_columns: { student_no: $student_no }
                            _inc: { total_tokens_used: $tokens }
                            _set: { last_updated_at: $updated_at }
                        ) { student_no }
                    }",
                    json!({
                        "student_no": subject,
                        "tokens": tokens,
                        "updated_at": Utc::now().to_rfc3339(),
                    }),
                )
                .await?;
                Ok(())
            }
        }
    }

    /// Absolute set used by reconciliation. Last-write-wins against the fast
    /// path; increments that race with the read are dropped until the next tick.
    pub async fn set_usage(&self, subject: &str, total: u64) -> Result<(), Error> {
        match self {
            Self::Disabled => Ok(()),
            Self::Mock { state } => {
                with_mock(state, |s| {
                    if let Some(record) = s.records.get_mut(subject) {
                        record.total_tokens_used = total;
                    }
                });
                Ok(())
            }
            Self::Production { .. } => {
                self.request(
                    r"mutation SetUsage($student_no: String!, $total: bigint!, $updated_at: timestamptz!) {
                        update_user_llm_usage_by_pk(
                            pk_columns: { student_no: $student_no }
                            _set: { total_tokens_used: $total, last_updated_at: $updated_at }
                        ) { student_no }
                    }",
                    json!({
                        "student_no": subject,
                        "total": total,
                        "updated_at": Utc::now().to_rfc3339(),
                    }),
                )
                .await?;
                Ok(())
            }
        }
    }

    pub async fn get_model_config(&self, model: &str) -> Result<Option<ModelCapability>, Error> {
        match self {
            Self::Disabled => Ok(None),
            Self::Mock { state } => Ok(with_mock(state, |s| s.models.get(model).cloned())),
            Self::Production { .. } => {
                let data = self
                    .request(
                        r"query GetModelConfig($model: String!) {
                            llm_list(where: { value: { _eq: $model } }) {
                                name
                                deepthinkingmodel
                            }
                        }",
                        json!({ "model": model }),
                    )
                    .await?;
                let row = match data["llm_list"].as_array().and_then(|rows| rows.first()) {
                    Some(row) => row,
                    None => return Ok(None),
                };
                Ok(Some(ModelCapability {
                    name: row["name"].as_str().unwrap_or(model).to_string(),
                    deep_thinking: row["deepthinkingmodel"].as_str() == Some("enabled"),
                }))
            }
        }
    }

    /// Append to the durable credential-usage log. Best-effort for callers.
    pub async fn log_credential_use(
        &self,
        subject: &str,
        jti: &str,
        email: Option<&str>,
    ) -> Result<(), Error> {
        match self {
            Self::Disabled => Ok(()),
            Self::Mock { state } => {
                with_mock(state, |s| {
                    s.credential_log.insert(jti.to_string());
                });
                Ok(())
            }
            Self::Production { .. } => {
                self.request(
                    r"mutation LogCredentialUse($student_no: String!, $jti: String!, $email: String) {
                        insert_access_key_log_one(
                            object: { student_no: $student_no, jti: $jti, email: $email }
                        ) { id }
                    }",
                    json!({ "student_no": subject, "jti": jti, "email": email }),
                )
                .await?;
                Ok(())
            }
        }
    }

    pub async fn credential_was_used(&self, jti: &str) -> Result<bool, Error> {
        match self {
            Self::Disabled => Ok(false),
            Self::Mock { state } => Ok(with_mock(state, |s| s.credential_log.contains(jti))),
            Self::Production { .. } => {
                let data = self
                    .request(
                        r"query CheckCredentialUse($jti: String!) {
                            access_key_log(where: { jti: { _eq: $jti } }) { id }
                        }",
                        json!({ "jti": jti }),
                    )
                    .await?;
                Ok(data["access_key_log"]
                    .as_array()
                    .map(|rows| !rows.is_empty())
                    .unwrap_or(false))
            }
        }
    }

    async fn request(&self, query: &str, variables: Value) -> Result<Value, Error> {
        let Self::Production {
            url,
            admin_secret,
            http_client,
        } = self
        else {
            return Err(Error::new(ErrorDetails::InternalError {
                message: "store request called on non-production connection".to_string(),
            }));
        };

        let mut builder = http_client
            .post(url.clone())
            .json(&json!({ "query": query, "variables": variables }));
        if let Some(secret) = admin_secret {
            builder = builder.header("x-hasura-admin-secret", secret.expose_secret());
        }

        let response = builder.send().await.map_err(|e| {
            Error::new(ErrorDetails::Store {
                message: format!("request failed: {e}"),
            })
        })?;
        let body: Value = response.json().await.map_err(|e| {
            Error::new(ErrorDetails::Store {
                message: format!("invalid response body: {e}"),
            })
        })?;
        if let Some(errors) = body.get("errors") {
            return Err(Error::new(ErrorDetails::Store {
                message: format!("query returned errors: {errors}"),
            }));
        }
        Ok(body.get("data").cloned().unwrap_or(Value::Null))
    }
}

/// The store schema calls the subject column `student_no`.
fn parse_record(value: &Value) -> Result<Option<UsageRecord>, Error> {
    if value.is_null() {
        return Ok(None);
    }
    let subject = value["student_no"]
        .as_str()
        .ok_or_else(|| {
            Error::new(ErrorDetails::Store {
                message: "usage record missing student_no".to_string(),
            })
        })?
        .to_string();
    Ok(Some(UsageRecord {
        subject,
        total_tokens_used: value["total_tokens_used"].as_u64().unwrap_or(0),
        token_limit: value["token_limit"].as_u64().unwrap_or(0),
        email: value["email"].as_str().map(str::to_string),
    }))
}

fn with_mock<T>(state: &Arc<Mutex<MockStoreState>>, f: impl FnOnce(&mut MockStoreState) -> T) -> T {
    #[expect(clippy::expect_used)]
    let mut state = state.lock().expect("mock store mutex poisoned");
    f(&mut state)
}

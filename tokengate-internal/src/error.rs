use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::{json, Value};
use std::fmt::Display;

#[derive(Debug, PartialEq)]
// As long as the struct member is private, we force people to use the `new` method and log the error.
// We box `ErrorDetails` per the `clippy::result_large_err` lint
pub struct Error(Box<ErrorDetails>);

impl Error {
    pub fn new(details: ErrorDetails) -> Self {
        details.log();
        Error(Box::new(details))
    }

    pub fn new_without_logging(details: ErrorDetails) -> Self {
        Error(Box::new(details))
    }

    pub fn status_code(&self) -> StatusCode {
        self.0.status_code()
    }

    pub fn get_details(&self) -> &ErrorDetails {
        &self.0
    }

    pub fn log(&self) {
        self.0.log();
    }

    pub fn to_response_json(&self) -> (StatusCode, Value) {
        let status = self.status_code();
        let body = json!({
            "error": {
                "message": self.to_string(),
                "type": self.0.error_type(),
                "code": status.as_u16(),
            }
        });
        (status, body)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl std::error::Error for Error {}

impl From<ErrorDetails> for Error {
    fn from(details: ErrorDetails) -> Self {
        Error::new(details)
    }
}

#[derive(Debug, PartialEq)]
pub enum ErrorDetails {
    Auth {
        message: String,
    },
    SessionSuperseded,
    InvalidCredential {
        message: String,
    },
    CredentialReplayed,
    InvalidRequest {
        message: String,
    },
    TooManyConcurrent,
    TooFrequent,
    QuotaExceeded,
    Cache {
        message: String,
    },
    Store {
        message: String,
    },
    Config {
        message: String,
    },
    Upstream {
        message: String,
    },
    Serialization {
        message: String,
    },
    InternalError {
        message: String,
    },
}

impl ErrorDetails {
    /// Defines the error level for logging this error
    fn level(&self) -> tracing::Level {
        match self {
            ErrorDetails::Auth { .. } => tracing::Level::WARN,
            ErrorDetails::SessionSuperseded => tracing::Level::DEBUG,
            ErrorDetails::InvalidCredential { .. } => tracing::Level::WARN,
            ErrorDetails::CredentialReplayed => tracing::Level::WARN,
            ErrorDetails::InvalidRequest { .. } => tracing::Level::WARN,
            ErrorDetails::TooManyConcurrent => tracing::Level::DEBUG,
            ErrorDetails::TooFrequent => tracing::Level::DEBUG,
            ErrorDetails::QuotaExceeded => tracing::Level::INFO,
            ErrorDetails::Cache { .. } => tracing::Level::ERROR,
            ErrorDetails::Store { .. } => tracing::Level::ERROR,
            ErrorDetails::Config { .. } => tracing::Level::ERROR,
            ErrorDetails::Upstream { .. } => tracing::Level::ERROR,
            ErrorDetails::Serialization { .. } => tracing::Level::ERROR,
            ErrorDetails::InternalError { .. } => tracing::Level::ERROR,
        }
    }

    /// Defines the HTTP status code for responses involving this error
    fn status_code(&self) -> StatusCode {
        match self {
            ErrorDetails::Auth { .. } => StatusCode::UNAUTHORIZED,
            ErrorDetails::SessionSuperseded => StatusCode::UNAUTHORIZED,
            ErrorDetails::InvalidCredential { .. } => StatusCode::FORBIDDEN,
            ErrorDetails::CredentialReplayed => StatusCode::FORBIDDEN,
            ErrorDetails::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            ErrorDetails::TooManyConcurrent => StatusCode::TOO_MANY_REQUESTS,
            ErrorDetails::TooFrequent => StatusCode::TOO_MANY_REQUESTS,
            ErrorDetails::QuotaExceeded => StatusCode::PAYMENT_REQUIRED,
            ErrorDetails::Cache { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::Store { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::Config { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            // Provider failures are the gateway's fault from the client's
            // perspective; the provider's own status stays in the message.
            ErrorDetails::Upstream { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::Serialization { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::InternalError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable error class included in response bodies
    fn error_type(&self) -> &'static str {
        match self {
            ErrorDetails::Auth { .. } | ErrorDetails::SessionSuperseded => "auth_error",
            ErrorDetails::InvalidCredential { .. } | ErrorDetails::CredentialReplayed => {
                "credential_error"
            }
            ErrorDetails::InvalidRequest { .. } => "invalid_request_error",
            ErrorDetails::TooManyConcurrent | ErrorDetails::TooFrequent => "admission_error",
            ErrorDetails::QuotaExceeded => "quota_error",
            ErrorDetails::Upstream { .. } => "upstream_error",
            _ => "internal_error",
        }
    }

    pub fn log(&self) {
        match self.level() {
            tracing::Level::ERROR => tracing::error!("{self}"),
            tracing::Level::WARN => tracing::warn!("{self}"),
            tracing::Level::INFO => tracing::info!("{self}"),
            tracing::Level::DEBUG => tracing::debug!("{self}"),
            tracing::Level::TRACE => tracing::trace!("{self}"),
        }
    }
}

impl Display for ErrorDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorDetails::Auth { message } => {
                write!(f, "Authentication failed: {message}")
            }
            ErrorDetails::SessionSuperseded => {
                write!(f, "Session expired (logged in elsewhere)")
            }
            ErrorDetails::InvalidCredential { message } => {
                write!(f, "Invalid or expired access key: {message}")
            }
            ErrorDetails::CredentialReplayed => {
                write!(f, "Access key has already been used")
            }
            ErrorDetails::InvalidRequest { message } => {
                write!(f, "{message}")
            }
            ErrorDetails::TooManyConcurrent => {
                write!(
                    f,
                    "Too many concurrent requests. Please wait for the previous request to finish."
                )
            }
            ErrorDetails::TooFrequent => {
                write!(f, "Request too frequent. Please wait a few seconds.")
            }
            ErrorDetails::QuotaExceeded => {
                write!(f, "Token quota exceeded. Please contact admin.")
            }
            ErrorDetails::Cache { message } => {
                write!(f, "Cache error: {message}")
            }
            ErrorDetails::Store { message } => {
                write!(f, "Durable store error: {message}")
            }
            ErrorDetails::Config { message } => {
                write!(f, "Configuration error: {message}")
            }
            ErrorDetails::Upstream { message } => {
                write!(f, "Failed to fetch from LLM provider: {message}")
            }
            ErrorDetails::Serialization { message } => {
                write!(f, "Serialization error: {message}")
            }
            ErrorDetails::InternalError { message } => {
                write!(f, "Internal error: {message}")
            }
        }
    }
}

impl IntoResponse for Error {
    /// Log the error and convert it into an Axum response
    fn into_response(self) -> Response {
        let (status_code, body) = self.to_response_json();
        (status_code, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            Error::new_without_logging(ErrorDetails::QuotaExceeded).status_code(),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(
            Error::new_without_logging(ErrorDetails::TooFrequent).status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            Error::new_without_logging(ErrorDetails::CredentialReplayed).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            Error::new_without_logging(ErrorDetails::SessionSuperseded).status_code(),
            StatusCode::UNAUTHORIZED
        );
        // A provider-side rejection never leaks its status into ours.
        let upstream = Error::new_without_logging(ErrorDetails::Upstream {
            message: "provider returned 429 Too Many Requests".to_string(),
        });
        assert_eq!(upstream.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_response_json_shape() {
        let error = Error::new_without_logging(ErrorDetails::TooManyConcurrent);
        let (status, body) = error.to_response_json();
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["error"]["code"], 429);
        assert_eq!(body["error"]["type"], "admission_error");
    }
}

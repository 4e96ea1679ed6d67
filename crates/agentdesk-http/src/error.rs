//! Request core error types

use std::{fmt, time::Duration};

use serde_json::Value;
use thiserror::Error;

/// Result type for request core operations
pub type Result<T> = std::result::Result<T, ClientError>;

/// A non-success HTTP response, finalized after all recovery attempts
///
/// Built once from the status and raw body of the response and read-only
/// afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequestError {
    status: u16,
    code: Option<String>,
    message: String,
    details: Option<Value>,
    url: String,
}

impl ApiRequestError {
    /// Build an error from a response status and its raw body
    ///
    /// The body is parsed as JSON when possible. A string `error` field becomes
    /// the machine code; the human message prefers `message`, then `error`,
    /// then a generic `Request failed: {status}`.
    pub fn from_response(status: u16, url: impl Into<String>, body: &[u8]) -> Self {
        let details = if body.is_empty() {
            None
        } else {
            serde_json::from_slice::<Value>(body).ok()
        };

        let field = |name: &str| {
            details
                .as_ref()
                .and_then(|d| d.get(name))
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        let code = field("error");
        let message = field("message")
            .or_else(|| code.clone())
            .unwrap_or_else(|| format!("Request failed: {status}"));

        Self {
            status,
            code,
            message,
            details,
            url: url.into(),
        }
    }

    /// HTTP status code
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Machine-readable error code from the body, if any
    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    /// Human-readable message
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Full parsed body, `None` when missing or not JSON
    pub fn details(&self) -> Option<&Value> {
        self.details.as_ref()
    }

    /// URL of the failed request
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Whether the status belongs to the retryable set {408, 425, 429, 5xx}
    pub fn is_retryable_status(&self) -> bool {
        is_retryable_status(self.status)
    }
}

impl fmt::Display for ApiRequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ApiRequestError {}

/// Statuses an idempotent mutation may be retried on
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 425 | 429) || status >= 500
}

/// Failure classes callers can branch on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// 401 before any bootstrap; handled inside the client
    AuthRequired,
    /// 401 that survived the single bootstrap-and-retry cycle
    AuthExhausted,
    /// Timeouts, network failures and 408/425/429/5xx
    Transient,
    /// Any other failure; never retried
    Permanent,
    /// A successful response whose body could not be decoded
    Malformed,
}

impl FailureKind {
    /// Classify a non-success HTTP status
    ///
    /// A 401 is `AuthRequired` while the session may still be bootstrapped
    /// and `AuthExhausted` once that cycle has been spent. Errors returned to
    /// callers are always classified with the cycle spent.
    pub fn for_status(status: u16, reauth_available: bool) -> Self {
        match status {
            401 if reauth_available => FailureKind::AuthRequired,
            401 => FailureKind::AuthExhausted,
            s if is_retryable_status(s) => FailureKind::Transient,
            _ => FailureKind::Permanent,
        }
    }
}

/// Request core errors
#[derive(Debug, Error)]
pub enum ClientError {
    /// Server answered with a non-success status
    #[error("{0}")]
    Api(ApiRequestError),

    /// Network request failed
    #[error("Network request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// Request attempt timed out
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Successful response carried a body that is not the expected JSON
    #[error("Failed to decode response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },

    /// Invalid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Request body cannot carry an idempotency key
    #[error("Invalid request body: {0}")]
    InvalidBody(String),

    /// Request body could not be serialized
    #[error("Failed to serialize request body: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Client build error
    #[error("Failed to build HTTP client: {0}")]
    Build(String),

    /// Retry loop finished without producing a result
    #[error("Request retry loop exited unexpectedly")]
    Unreachable,
}

impl From<ApiRequestError> for ClientError {
    fn from(err: ApiRequestError) -> Self {
        ClientError::Api(err)
    }
}

impl ClientError {
    /// The HTTP failure behind this error, if it is one
    pub fn as_api_error(&self) -> Option<&ApiRequestError> {
        match self {
            ClientError::Api(err) => Some(err),
            _ => None,
        }
    }

    /// Whether this error is an [`ApiRequestError`]
    pub fn is_api_request_error(&self) -> bool {
        self.as_api_error().is_some()
    }

    /// HTTP status of the failure, if any
    pub fn status(&self) -> Option<u16> {
        self.as_api_error().map(ApiRequestError::status)
    }

    /// Classify the error
    pub fn kind(&self) -> FailureKind {
        match self {
            ClientError::Api(err) => FailureKind::for_status(err.status(), false),
            ClientError::Transport(e) if e.is_builder() => FailureKind::Permanent,
            ClientError::Transport(_) | ClientError::Timeout(_) => FailureKind::Transient,
            ClientError::Decode { .. } => FailureKind::Malformed,
            ClientError::InvalidUrl(_)
            | ClientError::InvalidBody(_)
            | ClientError::Serialization(_)
            | ClientError::Config(_)
            | ClientError::Build(_)
            | ClientError::Unreachable => FailureKind::Permanent,
        }
    }

    /// Check if a mutation may be attempted again after this error
    pub fn is_retryable(&self) -> bool {
        self.kind() == FailureKind::Transient
    }
}

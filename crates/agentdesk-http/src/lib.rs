//! Resilient request core for the AgentDesk console
//!
//! Every console API call goes through [`ApiClient`], which owns the bearer
//! token, the cookie jar and the session bootstrap state.
//!
//! ## Features
//!
//! - **Token injection**: `Authorization: Bearer <token>` unless the caller set one
//! - **Session bootstrap**: single-flight, with an injected [`CredentialPrompt`]
//! - **One re-auth cycle**: a 401 bootstraps the session and retries once
//! - **Idempotent mutations**: stable [`IdempotencyKey`], per-attempt timeout,
//!   exponential backoff with jitter on 408/425/429/5xx and network failures
//! - **Typed errors**: [`ClientError`] and [`ApiRequestError`]
//!
//! ## Example
//!
//! ```ignore
//! use agentdesk_http::{ApiClient, ClientConfig, IdempotencyKey};
//!
//! let client = ApiClient::new(ClientConfig::for_base_url("http://localhost:8080"))?;
//! let tasks: serde_json::Value = client.get("/api/tasks").await?;
//!
//! let key = IdempotencyKey::new("send-message");
//! let sent: serde_json::Value = client
//!     .post_with_idempotency("/api/messages", &serde_json::json!({"text": "hi"}), &key)
//!     .await?;
//! ```

pub mod backoff;
pub mod bootstrap;
pub mod client;
pub mod config;
pub mod error;
pub mod idempotency;
pub mod mutation;
pub mod prompt;
pub mod token;

pub use backoff::Backoff;
pub use client::{ApiClient, ApiClientBuilder, ApiRequest};
pub use config::ClientConfig;
pub use error::{is_retryable_status, ApiRequestError, ClientError, FailureKind, Result};
pub use idempotency::{IdempotencyKey, IDEMPOTENCY_KEY_FIELD, IDEMPOTENCY_KEY_HEADER};
pub use prompt::{CredentialPrompt, PromptFn};
pub use token::{FileSessionStorage, MemorySessionStorage, SessionStorage, TokenStore};

/// Re-export commonly used types
pub use reqwest::{header, Method, StatusCode};

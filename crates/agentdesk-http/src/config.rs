//! Request core configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ClientError, Result};

/// Configuration for [`ApiClient`](crate::ApiClient)
///
/// Durations are expressed in milliseconds when (de)serialized so the config
/// reads naturally from TOML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Base URL that relative request paths are joined onto
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Path of the session bootstrap endpoint
    #[serde(default = "default_bootstrap_path")]
    pub bootstrap_path: String,

    /// Overall timeout of plain requests
    #[serde(default = "default_request_timeout", with = "duration_ms")]
    pub request_timeout: Duration,

    /// Connection timeout
    #[serde(default = "default_connect_timeout", with = "duration_ms")]
    pub connect_timeout: Duration,

    /// Per-attempt timeout of idempotent mutations
    #[serde(default = "default_mutation_timeout", with = "duration_ms")]
    pub mutation_timeout: Duration,

    /// Retries after the first attempt of an idempotent mutation
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,

    /// Backoff delay before the first retry
    #[serde(default = "default_backoff_base", with = "duration_ms")]
    pub backoff_base: Duration,

    /// Upper bound of the exponential part of the backoff
    #[serde(default = "default_backoff_cap", with = "duration_ms")]
    pub backoff_cap: Duration,

    /// Exclusive upper bound of the random jitter added to each delay
    #[serde(default = "default_backoff_jitter", with = "duration_ms")]
    pub backoff_jitter: Duration,

    /// Custom user agent
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Name of the session storage slot holding the bearer token
    #[serde(default = "default_token_storage_key")]
    pub token_storage_key: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            bootstrap_path: default_bootstrap_path(),
            request_timeout: default_request_timeout(),
            connect_timeout: default_connect_timeout(),
            mutation_timeout: default_mutation_timeout(),
            retry_limit: default_retry_limit(),
            backoff_base: default_backoff_base(),
            backoff_cap: default_backoff_cap(),
            backoff_jitter: default_backoff_jitter(),
            user_agent: default_user_agent(),
            token_storage_key: default_token_storage_key(),
        }
    }
}

impl ClientConfig {
    /// Create a new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a config pointing at the given backend
    pub fn for_base_url(base_url: impl Into<String>) -> Self {
        Self::default().with_base_url(base_url)
    }

    /// Parse a config from TOML, filling missing fields with defaults
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(source).map_err(|e| ClientError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the config for values the client cannot work with
    pub fn validate(&self) -> Result<()> {
        let base = url::Url::parse(&self.base_url)
            .map_err(|e| ClientError::Config(format!("invalid base_url: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(ClientError::Config(format!(
                "base_url cannot be a base: {}",
                self.base_url
            )));
        }
        if !self.bootstrap_path.starts_with('/') {
            return Err(ClientError::Config(format!(
                "bootstrap_path must start with '/': {}",
                self.bootstrap_path
            )));
        }
        if self.mutation_timeout.is_zero() {
            return Err(ClientError::Config(
                "mutation_timeout must be greater than zero".to_string(),
            ));
        }
        if self.backoff_cap < self.backoff_base {
            return Err(ClientError::Config(
                "backoff_cap must not be smaller than backoff_base".to_string(),
            ));
        }
        if self.token_storage_key.trim().is_empty() {
            return Err(ClientError::Config(
                "token_storage_key must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Set base URL
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Set bootstrap endpoint path
    pub fn with_bootstrap_path(mut self, path: impl Into<String>) -> Self {
        self.bootstrap_path = path.into();
        self
    }

    /// Set per-attempt mutation timeout
    pub fn with_mutation_timeout(mut self, timeout: Duration) -> Self {
        self.mutation_timeout = timeout;
        self
    }

    /// Set plain request timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set mutation retry limit
    pub fn with_retry_limit(mut self, limit: u32) -> Self {
        self.retry_limit = limit;
        self
    }

    /// Set backoff base, cap and jitter
    pub fn with_backoff(mut self, base: Duration, cap: Duration, jitter: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_cap = cap;
        self.backoff_jitter = jitter;
        self
    }

    /// Set user agent
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Set token storage slot name
    pub fn with_token_storage_key(mut self, key: impl Into<String>) -> Self {
        self.token_storage_key = key.into();
        self
    }
}

// Default value functions for serde
fn default_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_bootstrap_path() -> String {
    "/api/auth/bootstrap".to_string()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_mutation_timeout() -> Duration {
    Duration::from_secs(12)
}

fn default_retry_limit() -> u32 {
    2
}

fn default_backoff_base() -> Duration {
    Duration::from_millis(250)
}

fn default_backoff_cap() -> Duration {
    Duration::from_millis(2000)
}

fn default_backoff_jitter() -> Duration {
    Duration::from_millis(120)
}

fn default_user_agent() -> String {
    format!("AgentDesk/{}", env!("CARGO_PKG_VERSION"))
}

fn default_token_storage_key() -> String {
    "agentdesk.auth_token".to_string()
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

//! Idempotency keys for mutating calls

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Header carrying the idempotency key (`X-Idempotency-Key`)
pub const IDEMPOTENCY_KEY_HEADER: &str = "x-idempotency-key";

/// Body field mirroring the idempotency key
pub const IDEMPOTENCY_KEY_FIELD: &str = "idempotency_key";

/// Identifier of one logical mutation
///
/// Generate one per user intent and reuse it for every physical attempt so the
/// server can collapse redeliveries into a single effect.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// New key of the form `{prefix}-{uuid}`
    pub fn new(prefix: &str) -> Self {
        Self(format!("{}-{}", prefix, Uuid::new_v4()))
    }

    /// Wrap an existing key, e.g. one restored after a restart
    pub fn from_string(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Key as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for IdempotencyKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

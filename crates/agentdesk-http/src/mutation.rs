//! Idempotent mutations with bounded retries
//!
//! A logical mutation is sent up to `retry_limit + 1` times. Every attempt
//! carries the same [`IdempotencyKey`], runs under its own timeout and, when
//! it fails transiently, is followed by an exponential backoff with jitter.
//! A 401 triggers one session bootstrap, after which the mutation starts over
//! with a fresh attempt budget.

use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE},
    StatusCode,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};
use url::Url;

use crate::{
    client::{finish_response, ApiClient},
    error::{ClientError, FailureKind, Result},
    idempotency::{IdempotencyKey, IDEMPOTENCY_KEY_FIELD, IDEMPOTENCY_KEY_HEADER},
};

impl ApiClient {
    /// POST `body` with an idempotency key, retrying transient failures
    ///
    /// `body` must serialize to a JSON object (or `null`, sent as `{}`); the
    /// key is added to it as `idempotency_key` and sent in the
    /// `X-Idempotency-Key` header. Statuses 408, 425, 429 and 5xx, network
    /// failures and attempt timeouts are retried while attempts remain.
    pub async fn post_with_idempotency<B, T>(
        &self,
        url: &str,
        body: &B,
        key: &IdempotencyKey,
    ) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.resolve_url(url)?;
        let payload = idempotent_payload(body, key)?;
        let headers = idempotent_headers(key)?;

        let limit = self.inner.config.retry_limit;
        let timeout = self.inner.config.mutation_timeout;
        let mut auth_retries: u32 = if self.is_bootstrap_url(&url) { 0 } else { 1 };
        let mut attempt: u32 = 0;

        while attempt <= limit {
            debug!("HTTP POST (idempotent, attempt {}): {} [{}]", attempt + 1, url, key);

            let outcome =
                tokio::time::timeout(timeout, self.send_attempt(&url, &headers, &payload)).await;

            let failure = match outcome {
                Ok(Ok((status, _)))
                    if FailureKind::for_status(status.as_u16(), auth_retries > 0)
                        == FailureKind::AuthRequired =>
                {
                    auth_retries -= 1;
                    debug!("HTTP 401 from {url}, bootstrapping session before resending");
                    self.bootstrap(true).await;
                    attempt = 0;
                    continue;
                }
                Ok(Ok((status, body))) => match finish_response(status, &url, &body) {
                    Ok(value) => {
                        if attempt > 0 {
                            debug!("Mutation succeeded after {attempt} retries");
                        }
                        return Ok(value);
                    }
                    Err(e) => e,
                },
                Ok(Err(e)) => ClientError::Transport(e),
                Err(_) => ClientError::Timeout(timeout),
            };

            if attempt < limit && failure.is_retryable() {
                let delay = self.inner.backoff.delay(attempt);
                warn!(
                    "Mutation failed (attempt {}/{}), retrying in {:?}: {}",
                    attempt + 1,
                    limit + 1,
                    delay,
                    failure
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }

            debug!("Mutation to {url} failed: {failure}");
            return Err(failure);
        }

        Err(ClientError::Unreachable)
    }

    /// One physical attempt: send and read the whole body
    async fn send_attempt(
        &self,
        url: &Url,
        headers: &HeaderMap,
        payload: &Value,
    ) -> reqwest::Result<(StatusCode, Vec<u8>)> {
        let response = self
            .inner
            .http
            .post(url.clone())
            .headers(self.auth_headers(headers))
            .json(payload)
            .send()
            .await?;
        let status = response.status();
        let body = response.bytes().await?.to_vec();
        Ok((status, body))
    }
}

fn idempotent_payload<B: Serialize + ?Sized>(body: &B, key: &IdempotencyKey) -> Result<Value> {
    let mut payload = match serde_json::to_value(body)? {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            return Err(ClientError::InvalidBody(format!(
                "idempotent mutations need a JSON object body, got {other}"
            )))
        }
    };
    payload.insert(
        IDEMPOTENCY_KEY_FIELD.to_string(),
        Value::String(key.as_str().to_string()),
    );
    Ok(Value::Object(payload))
}

fn idempotent_headers(key: &IdempotencyKey) -> Result<HeaderMap> {
    let value = HeaderValue::from_str(key.as_str()).map_err(|_| {
        ClientError::InvalidBody(format!("idempotency key is not a valid header value: {key}"))
    })?;

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(HeaderName::from_static(IDEMPOTENCY_KEY_HEADER), value);
    Ok(headers)
}

//! Single-flight session bootstrap

use futures::FutureExt;
use parking_lot::Mutex;
use reqwest::{header::HeaderMap, StatusCode};
use tracing::{debug, info, warn};

use crate::client::{ApiClient, PendingBootstrap};

/// Empties the pending-bootstrap slot when the running bootstrap settles
struct ClearPending<'a>(&'a Mutex<Option<PendingBootstrap>>);

impl Drop for ClearPending<'_> {
    fn drop(&mut self) {
        self.0.lock().take();
    }
}

impl ApiClient {
    /// Establish or repair the server session
    ///
    /// Concurrent callers share one in-flight attempt and its result. On a 401
    /// the configured [`CredentialPrompt`](crate::CredentialPrompt) is asked
    /// once (when `prompt_on_unauthorized` is set) and a supplied credential is
    /// stored before the bootstrap endpoint is tried again. Returns `false` on
    /// any failure, including a missing or declined prompt.
    ///
    /// Dropping the returned future does not cancel the attempt; it still
    /// runs to completion, and callers arriving after it settles start a fresh
    /// one. Must be called within a Tokio runtime.
    pub async fn bootstrap(&self, prompt_on_unauthorized: bool) -> bool {
        let pending = {
            let mut slot = self.inner.pending_bootstrap.lock();
            match slot.as_ref() {
                Some(pending) => {
                    debug!("Joining in-flight session bootstrap");
                    pending.clone()
                }
                None => {
                    // Runs on its own task so it settles with no caller left.
                    // The slot stays locked until the entry is stored.
                    let client = self.clone();
                    let task = tokio::spawn(async move {
                        let _clear = ClearPending(&client.inner.pending_bootstrap);
                        client.run_bootstrap(prompt_on_unauthorized).await
                    });
                    let attempt = task
                        .map(|joined| {
                            joined.unwrap_or_else(|e| {
                                warn!("Session bootstrap task failed: {e}");
                                false
                            })
                        })
                        .boxed()
                        .shared();
                    *slot = Some(attempt.clone());
                    attempt
                }
            }
        };

        pending.await
    }

    /// Whether a bootstrap is currently in flight
    pub fn is_bootstrapping(&self) -> bool {
        self.inner.pending_bootstrap.lock().is_some()
    }

    async fn run_bootstrap(&self, prompt_on_unauthorized: bool) -> bool {
        let url = &self.inner.bootstrap_url;
        let mut prompts_remaining: u32 = u32::from(prompt_on_unauthorized);

        loop {
            debug!("Session bootstrap: GET {url}");
            let response = self
                .inner
                .http
                .get(url.clone())
                .headers(self.auth_headers(&HeaderMap::new()))
                .send()
                .await;

            let status = match response {
                Ok(response) => response.status(),
                Err(e) => {
                    warn!("Session bootstrap request failed: {e}");
                    return false;
                }
            };

            if status.is_success() {
                info!("Session bootstrap succeeded");
                return true;
            }
            if status != StatusCode::UNAUTHORIZED || prompts_remaining == 0 {
                warn!("Session bootstrap failed with HTTP {status}");
                return false;
            }
            prompts_remaining -= 1;

            let Some(prompt) = self.inner.prompt.as_ref() else {
                warn!("Session bootstrap needs a credential but no prompt is configured");
                return false;
            };
            let credential = prompt
                .request_credential()
                .await
                .map(|c| c.trim().to_string())
                .unwrap_or_default();
            if credential.is_empty() {
                info!("Credential prompt declined; session bootstrap failed");
                return false;
            }

            self.inner.tokens.write(Some(&credential));
            debug!("Stored prompted credential, retrying session bootstrap");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use async_trait::async_trait;
    use wiremock::{
        matchers::{header, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;
    use crate::{config::ClientConfig, prompt::CredentialPrompt};

    struct CountingPrompt {
        answer: Option<String>,
        calls: AtomicUsize,
    }

    impl CountingPrompt {
        fn answering(answer: Option<&str>) -> Arc<Self> {
            Arc::new(Self {
                answer: answer.map(str::to_string),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl CredentialPrompt for CountingPrompt {
        async fn request_credential(&self) -> Option<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answer.clone()
        }
    }

    fn client_with_prompt(server: &MockServer, prompt: Arc<CountingPrompt>) -> ApiClient {
        ApiClient::builder(ClientConfig::for_base_url(server.uri()))
            .prompt(prompt)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_bootstrap_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/auth/bootstrap"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let client = ApiClient::new(ClientConfig::for_base_url(server.uri())).unwrap();
        assert!(client.bootstrap(true).await);
        assert!(!client.is_bootstrapping());
    }

    #[tokio::test]
    async fn test_concurrent_bootstraps_share_one_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/auth/bootstrap"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(200)))
            .expect(1)
            .mount(&server)
            .await;

        let client = ApiClient::new(ClientConfig::for_base_url(server.uri())).unwrap();
        let results = futures::future::join_all((0..8).map(|_| client.bootstrap(true))).await;

        assert!(results.into_iter().all(|ok| ok));
        assert!(!client.is_bootstrapping());
    }

    #[tokio::test]
    async fn test_abandoned_bootstrap_still_settles() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/auth/bootstrap"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(200)))
            .expect(2)
            .mount(&server)
            .await;

        let client = ApiClient::new(ClientConfig::for_base_url(server.uri())).unwrap();
        let abandoned =
            tokio::time::timeout(Duration::from_millis(50), client.bootstrap(true)).await;
        assert!(abandoned.is_err());
        assert!(client.is_bootstrapping());

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(!client.is_bootstrapping());
        assert_eq!(Arc::strong_count(&client.inner), 1);

        // A later caller starts a fresh attempt rather than joining a stale one
        assert!(client.bootstrap(true).await);
    }

    #[tokio::test]
    async fn test_slot_cleared_after_failure_allows_new_attempt() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/auth/bootstrap"))
            .respond_with(ResponseTemplate::new(500))
            .expect(2)
            .mount(&server)
            .await;

        let client = ApiClient::new(ClientConfig::for_base_url(server.uri())).unwrap();
        assert!(!client.bootstrap(true).await);
        assert!(!client.is_bootstrapping());
        assert!(!client.bootstrap(true).await);
    }

    #[tokio::test]
    async fn test_prompted_credential_is_stored_and_used() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/auth/bootstrap"))
            .and(header("authorization", "Bearer abc123"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/auth/bootstrap"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let prompt = CountingPrompt::answering(Some("  abc123 "));
        let client = client_with_prompt(&server, prompt.clone());

        assert!(client.bootstrap(true).await);
        assert_eq!(prompt.calls.load(Ordering::SeqCst), 1);
        assert_eq!(client.tokens().read(), "abc123");
    }

    #[tokio::test]
    async fn test_prompt_asked_at_most_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/auth/bootstrap"))
            .respond_with(ResponseTemplate::new(401))
            .expect(2)
            .mount(&server)
            .await;

        let prompt = CountingPrompt::answering(Some("wrong"));
        let client = client_with_prompt(&server, prompt.clone());

        assert!(!client.bootstrap(true).await);
        assert_eq!(prompt.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_declined_or_missing_prompt_fails_closed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/auth/bootstrap"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let declined = CountingPrompt::answering(Some("   "));
        let client = client_with_prompt(&server, declined.clone());
        assert!(!client.bootstrap(true).await);
        assert_eq!(declined.calls.load(Ordering::SeqCst), 1);
        assert!(!client.tokens().has_token());

        let headless = ApiClient::new(ClientConfig::for_base_url(server.uri())).unwrap();
        assert!(!headless.bootstrap(true).await);
    }

    #[tokio::test]
    async fn test_no_prompt_when_disabled() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/auth/bootstrap"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let prompt = CountingPrompt::answering(Some("abc"));
        let client = client_with_prompt(&server, prompt.clone());

        assert!(!client.bootstrap(false).await);
        assert_eq!(prompt.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_network_failure_returns_false() {
        // Nothing listens on port 1
        let client = ApiClient::new(ClientConfig::for_base_url("http://127.0.0.1:1")).unwrap();
        assert!(!client.bootstrap(true).await);
        assert!(!client.is_bootstrapping());
    }
}

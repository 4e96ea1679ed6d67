//! API client and the general request path

use std::sync::Arc;

use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION},
    Method, StatusCode,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::{
    backoff::Backoff,
    config::ClientConfig,
    error::{ApiRequestError, ClientError, FailureKind, Result},
    prompt::CredentialPrompt,
    token::{MemorySessionStorage, SessionStorage, TokenStore},
};

pub(crate) type PendingBootstrap = Shared<BoxFuture<'static, bool>>;

pub(crate) struct ClientInner {
    pub(crate) http: reqwest::Client,
    pub(crate) config: ClientConfig,
    pub(crate) base_url: Url,
    pub(crate) bootstrap_url: Url,
    pub(crate) tokens: TokenStore,
    pub(crate) prompt: Option<Arc<dyn CredentialPrompt>>,
    pub(crate) backoff: Backoff,
    pub(crate) pending_bootstrap: Mutex<Option<PendingBootstrap>>,
}

/// Shared client every console API call goes through
///
/// Cloning is cheap; clones share the token, the cookie jar and the pending
/// session bootstrap.
#[derive(Clone)]
pub struct ApiClient {
    pub(crate) inner: Arc<ClientInner>,
}

/// Builder for [`ApiClient`]
pub struct ApiClientBuilder {
    config: ClientConfig,
    storage: Option<Arc<dyn SessionStorage>>,
    prompt: Option<Arc<dyn CredentialPrompt>>,
}

impl ApiClientBuilder {
    /// Session storage holding the bearer token (in-memory by default)
    pub fn storage(mut self, storage: Arc<dyn SessionStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Interactive credential prompt used when bootstrap gets a 401
    pub fn prompt(mut self, prompt: Arc<dyn CredentialPrompt>) -> Self {
        self.prompt = Some(prompt);
        self
    }

    /// Build the client
    pub fn build(self) -> Result<ApiClient> {
        let config = self.config;
        config.validate()?;

        let base_url =
            Url::parse(&config.base_url).map_err(|e| ClientError::InvalidUrl(e.to_string()))?;
        let bootstrap_url = base_url
            .join(&config.bootstrap_path)
            .map_err(|e| ClientError::InvalidUrl(e.to_string()))?;

        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .user_agent(&config.user_agent)
            .cookie_store(true)
            .build()
            .map_err(|e| ClientError::Build(e.to_string()))?;

        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(MemorySessionStorage::new()));
        let tokens = TokenStore::new(storage, config.token_storage_key.clone());
        let backoff = Backoff::from_config(&config);

        Ok(ApiClient {
            inner: Arc::new(ClientInner {
                http,
                config,
                base_url,
                bootstrap_url,
                tokens,
                prompt: self.prompt,
                backoff,
                pending_bootstrap: Mutex::new(None),
            }),
        })
    }
}

/// A single call through [`ApiClient::request`]
#[derive(Debug, Clone)]
pub struct ApiRequest {
    method: Method,
    url: String,
    headers: HeaderMap,
    body: Option<Value>,
}

impl ApiRequest {
    /// Request with an arbitrary method
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    /// GET request
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    /// Add a header; an `Authorization` header here suppresses token injection
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Attach a JSON body (sets `Content-Type: application/json`)
    pub fn json<B: Serialize + ?Sized>(mut self, body: &B) -> Result<Self> {
        self.body = Some(serde_json::to_value(body)?);
        Ok(self)
    }

    /// HTTP method
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Target URL or path
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl ApiClient {
    /// Create a client with in-memory token storage and no credential prompt
    pub fn new(config: ClientConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    /// Start building a client
    pub fn builder(config: ClientConfig) -> ApiClientBuilder {
        ApiClientBuilder {
            config,
            storage: None,
            prompt: None,
        }
    }

    /// Client configuration
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Bearer token store
    pub fn tokens(&self) -> &TokenStore {
        &self.inner.tokens
    }

    /// Execute a request, bootstrapping the session once on 401
    ///
    /// The decoded JSON body is returned on 2xx; an empty body decodes as
    /// `null`. Any other final status becomes [`ClientError::Api`].
    ///
    /// Each send is bounded by [`ClientConfig::request_timeout`] (30 s by
    /// default). A request that runs past it fails with
    /// [`ClientError::Transport`] of kind [`FailureKind::Transient`] and is not
    /// retried.
    pub async fn request<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T> {
        let url = self.resolve_url(&request.url)?;
        let mut auth_retries: u32 = if self.is_bootstrap_url(&url) { 0 } else { 1 };

        loop {
            debug!("HTTP {}: {}", request.method, url);

            let mut builder = self
                .inner
                .http
                .request(request.method.clone(), url.clone())
                .headers(self.auth_headers(&request.headers));
            if let Some(body) = &request.body {
                builder = builder.json(body);
            }

            let response = builder.send().await?;
            let status = response.status();

            if FailureKind::for_status(status.as_u16(), auth_retries > 0)
                == FailureKind::AuthRequired
            {
                auth_retries -= 1;
                debug!("HTTP 401 from {url}, bootstrapping session before retry");
                self.bootstrap(true).await;
                continue;
            }

            let body = response.bytes().await?;
            return finish_response(status, &url, &body);
        }
    }

    /// GET `url`
    pub async fn get<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        self.request(ApiRequest::get(url)).await
    }

    /// POST `body` as JSON to `url`
    pub async fn post<B, T>(&self, url: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.request(ApiRequest::new(Method::POST, url).json(body)?)
            .await
    }

    /// PATCH `body` as JSON to `url`
    pub async fn patch<B, T>(&self, url: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.request(ApiRequest::new(Method::PATCH, url).json(body)?)
            .await
    }

    /// PUT `body` as JSON to `url`
    pub async fn put<B, T>(&self, url: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.request(ApiRequest::new(Method::PUT, url).json(body)?)
            .await
    }

    /// DELETE `url`
    pub async fn delete<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        self.request(ApiRequest::new(Method::DELETE, url)).await
    }

    /// Absolute URLs pass through; anything else is joined onto the base URL
    pub(crate) fn resolve_url(&self, url: &str) -> Result<Url> {
        match Url::parse(url) {
            Ok(absolute) => Ok(absolute),
            Err(url::ParseError::RelativeUrlWithoutBase) => self
                .inner
                .base_url
                .join(url)
                .map_err(|e| ClientError::InvalidUrl(format!("{url}: {e}"))),
            Err(e) => Err(ClientError::InvalidUrl(format!("{url}: {e}"))),
        }
    }

    pub(crate) fn is_bootstrap_url(&self, url: &Url) -> bool {
        let bootstrap = &self.inner.bootstrap_url;
        url.origin() == bootstrap.origin() && url.path() == bootstrap.path()
    }

    /// Caller headers plus `Authorization: Bearer <token>` when the caller set
    /// none and a token is stored
    pub(crate) fn auth_headers(&self, headers: &HeaderMap) -> HeaderMap {
        let mut headers = headers.clone();
        if headers.contains_key(AUTHORIZATION) {
            return headers;
        }

        let token = self.inner.tokens.read();
        if token.is_empty() {
            return headers;
        }
        match HeaderValue::from_str(&format!("Bearer {token}")) {
            Ok(mut value) => {
                value.set_sensitive(true);
                headers.insert(AUTHORIZATION, value);
            }
            Err(_) => warn!("Stored token is not a valid header value; sending without it"),
        }
        headers
    }
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.inner.base_url.as_str())
            .field("bootstrap_url", &self.inner.bootstrap_url.as_str())
            .finish_non_exhaustive()
    }
}

/// Turn a finished response into the decoded body or an [`ApiRequestError`]
pub(crate) fn finish_response<T: DeserializeOwned>(
    status: StatusCode,
    url: &Url,
    body: &[u8],
) -> Result<T> {
    if !status.is_success() {
        return Err(ApiRequestError::from_response(status.as_u16(), url.as_str(), body).into());
    }

    let decoded = if body.iter().all(u8::is_ascii_whitespace) {
        serde_json::from_value(Value::Null)
    } else {
        serde_json::from_slice(body)
    };
    decoded.map_err(|source| ClientError::Decode {
        url: url.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use wiremock::{
        matchers::{body_json, header, header_exists, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;

    fn client_for(server: &MockServer) -> ApiClient {
        ApiClient::new(ClientConfig::for_base_url(server.uri())).unwrap()
    }

    #[test]
    fn test_client_creation_with_defaults() {
        let client = ApiClient::new(ClientConfig::default());
        assert!(client.is_ok());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = ApiClient::new(ClientConfig::for_base_url("not a url"));
        assert!(matches!(result, Err(ClientError::Config(_))));
    }

    #[test]
    fn test_url_resolution() {
        let client = ApiClient::new(ClientConfig::for_base_url("http://host:1/")).unwrap();

        assert_eq!(
            client.resolve_url("/api/tasks").unwrap().as_str(),
            "http://host:1/api/tasks"
        );
        assert_eq!(
            client.resolve_url("https://other/x").unwrap().as_str(),
            "https://other/x"
        );
        assert!(client.is_bootstrap_url(&client.resolve_url("/api/auth/bootstrap?x=1").unwrap()));
        assert!(!client.is_bootstrap_url(&client.resolve_url("/api/auth/other").unwrap()));
        assert!(matches!(
            client.resolve_url("http://[bad"),
            Err(ClientError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_auth_header_injection() {
        let client = ApiClient::new(ClientConfig::default()).unwrap();
        assert!(client.auth_headers(&HeaderMap::new()).get(AUTHORIZATION).is_none());

        client.tokens().write(Some("abc"));
        let headers = client.auth_headers(&HeaderMap::new());
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer abc");

        let mut custom = HeaderMap::new();
        custom.insert(AUTHORIZATION, HeaderValue::from_static("Basic xyz"));
        let headers = client.auth_headers(&custom);
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Basic xyz");
    }

    #[test]
    fn test_empty_success_body_decodes_as_null() {
        let url = Url::parse("http://host/x").unwrap();
        let value: Option<Value> = finish_response(StatusCode::NO_CONTENT, &url, b"").unwrap();
        assert!(value.is_none());

        let result: Result<Value> = finish_response(StatusCode::OK, &url, b"not json");
        assert_eq!(result.unwrap_err().kind(), FailureKind::Malformed);
    }

    #[tokio::test]
    async fn test_get_returns_json_with_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/agents"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": 1}])))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        client.tokens().write(Some("tok"));

        let agents: Value = client.get("/api/agents").await.unwrap();
        assert_eq!(agents, json!([{"id": 1}]));
    }

    #[tokio::test]
    async fn test_post_patch_put_delete_sugar() {
        let server = MockServer::start().await;
        for verb in ["POST", "PATCH", "PUT"] {
            Mock::given(method(verb))
                .and(path("/api/rules/7"))
                .and(header("content-type", "application/json"))
                .and(body_json(json!({"enabled": true})))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": verb})))
                .expect(1)
                .mount(&server)
                .await;
        }
        Mock::given(method("DELETE"))
            .and(path("/api/rules/7"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let body = json!({"enabled": true});

        let posted: Value = client.post("/api/rules/7", &body).await.unwrap();
        let patched: Value = client.patch("/api/rules/7", &body).await.unwrap();
        let put: Value = client.put("/api/rules/7", &body).await.unwrap();
        client.delete::<()>("/api/rules/7").await.unwrap();

        assert_eq!(posted["ok"], "POST");
        assert_eq!(patched["ok"], "PATCH");
        assert_eq!(put["ok"], "PUT");
    }

    #[tokio::test]
    async fn test_caller_authorization_is_preserved() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/skills"))
            .and(header("authorization", "Bearer caller"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        client.tokens().write(Some("stored"));

        let request = ApiRequest::get("/api/skills")
            .header(AUTHORIZATION, HeaderValue::from_static("Bearer caller"));
        let _: Value = client.request(request).await.unwrap();
    }

    #[tokio::test]
    async fn test_permanent_error_surfaces_code_and_details() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tasks/9"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "error": "task_not_found",
                "message": "No task with id 9"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = client.get::<Value>("/api/tasks/9").await.unwrap_err();

        let api = err.as_api_error().unwrap();
        assert_eq!(api.status(), 404);
        assert_eq!(api.code(), Some("task_not_found"));
        assert_eq!(api.message(), "No task with id 9");
        assert!(api.url().ends_with("/api/tasks/9"));
        assert_eq!(err.kind(), FailureKind::Permanent);
    }

    #[tokio::test]
    async fn test_plain_request_never_retries_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/departments"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = client.get::<Value>("/api/departments").await.unwrap_err();
        assert_eq!(err.status(), Some(503));
    }

    #[tokio::test]
    async fn test_plain_request_bounded_by_request_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/agents"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .expect(1)
            .mount(&server)
            .await;

        let config =
            ClientConfig::for_base_url(server.uri()).with_request_timeout(Duration::from_millis(100));
        let client = ApiClient::new(config).unwrap();
        let err = client.get::<Value>("/api/agents").await.unwrap_err();

        assert!(matches!(&err, ClientError::Transport(e) if e.is_timeout()));
        assert_eq!(err.kind(), FailureKind::Transient);
    }

    #[tokio::test]
    async fn test_single_reauth_then_auth_exhausted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tasks"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({"error": "unauthorized"})))
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/auth/bootstrap"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = client.get::<Value>("/api/tasks").await.unwrap_err();

        assert_eq!(err.status(), Some(401));
        assert_eq!(err.kind(), FailureKind::AuthExhausted);
    }

    #[tokio::test]
    async fn test_bootstrap_endpoint_is_not_reauthenticated() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/auth/bootstrap"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = client.get::<Value>("/api/auth/bootstrap").await.unwrap_err();
        assert_eq!(err.status(), Some(401));
    }

    #[tokio::test]
    async fn test_no_token_means_no_authorization_header() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header_exists("authorization"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/gateways"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let gateways: Vec<Value> = client.get("/api/gateways").await.unwrap();
        assert!(gateways.is_empty());
    }
}

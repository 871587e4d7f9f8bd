use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::{Client, Method, Request, RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::{
    CredentialRecord, Envelope, HttpRefreshExchange, RefreshCoordinator, RefreshExchange,
    ResultCodes,
};
use crate::error::{ClientError, RefreshError, Result};
use crate::middleware::{
    attach_token, AuthDecision, AuthInterceptor, LogRedirect, LoginRedirect, ResponseGuard,
    Verdict,
};
use crate::store::CredentialStore;

/// Default request timeout (milliseconds)
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Connection settings for the session client
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// API root, e.g. `https://example.com/api/`
    pub base_url: Url,
    pub timeout: Duration,
    pub codes: ResultCodes,
}

impl ClientOptions {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            codes: ResultCodes::default(),
        }
    }
}

/// Fully buffered response
#[derive(Debug, Clone)]
pub struct ApiResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    code: Option<i64>,
}

impl ApiResponse {
    pub fn from_parts(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        let code = serde_json::from_slice::<serde_json::Value>(&body)
            .ok()
            .and_then(|value| value.get("code").and_then(|c| c.as_i64()));

        Self {
            status,
            headers,
            body,
            code,
        }
    }

    /// Transport status
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Application-level result code from the `{code, data, msg}` envelope
    pub fn code(&self) -> Option<i64> {
        self.code
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn envelope<T: DeserializeOwned>(&self) -> Result<Envelope<T>> {
        self.json()
    }
}

/// Authenticated REST client
///
/// Every request passes through the [`AuthInterceptor`] on the way out and the
/// [`ResponseGuard`] on the way back. Both share one [`RefreshCoordinator`], so
/// concurrent requests never issue more than one refresh exchange.
pub struct SessionClient {
    client: Client,
    base_url: Url,
    store: CredentialStore,
    coordinator: Arc<RefreshCoordinator>,
    interceptor: AuthInterceptor,
    guard: ResponseGuard,
}

impl SessionClient {
    /// Create a client that refreshes through the backend's `updateToken` endpoint
    pub fn new(options: ClientOptions, store: CredentialStore) -> Result<Self> {
        let client = build_http_client(options.timeout)?;
        let exchange = HttpRefreshExchange::new(client.clone(), &options.base_url, options.codes)
            .map_err(|e| ClientError::InvalidUrl(e.to_string()))?;

        Ok(Self::assemble(client, options, store, Arc::new(exchange)))
    }

    /// Create a client with a custom refresh exchange
    pub fn with_exchange(
        options: ClientOptions,
        store: CredentialStore,
        exchange: Arc<dyn RefreshExchange>,
    ) -> Result<Self> {
        let client = build_http_client(options.timeout)?;
        Ok(Self::assemble(client, options, store, exchange))
    }

    fn assemble(
        client: Client,
        options: ClientOptions,
        store: CredentialStore,
        exchange: Arc<dyn RefreshExchange>,
    ) -> Self {
        let coordinator = Arc::new(RefreshCoordinator::new(store.clone(), exchange));
        let exempt_path = options
            .base_url
            .join(crate::auth::REFRESH_PATH)
            .map(|url| url.path().to_string())
            .unwrap_or_default();
        let interceptor = AuthInterceptor::new(store.clone(), coordinator.clone(), exempt_path);
        let guard = ResponseGuard::new(store.clone(), options.codes, Arc::new(LogRedirect));

        Self {
            client,
            base_url: options.base_url,
            store,
            coordinator,
            interceptor,
            guard,
        }
    }

    /// Replace the hook invoked when the session ends
    pub fn with_redirect(mut self, redirect: Arc<dyn LoginRedirect>) -> Self {
        self.guard.set_redirect(redirect);
        self
    }

    /// Start building a request for a path relative to the API root
    pub fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let url = self.url(path)?;
        Ok(self.client.request(method, url))
    }

    pub async fn get(&self, path: &str) -> Result<ApiResponse> {
        let request = self.request(Method::GET, path)?.build()?;
        self.execute(request).await
    }

    pub async fn post<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<ApiResponse> {
        let request = self.request(Method::POST, path)?.json(body).build()?;
        self.execute(request).await
    }

    pub async fn put<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<ApiResponse> {
        let request = self.request(Method::PUT, path)?.json(body).build()?;
        self.execute(request).await
    }

    pub async fn delete(&self, path: &str) -> Result<ApiResponse> {
        let request = self.request(Method::DELETE, path)?.build()?;
        self.execute(request).await
    }

    /// Send a request through the interceptor and response guard
    ///
    /// A response reporting an expired token triggers one coordinated refresh
    /// and a single replay; a response reporting an invalid session ends it.
    pub async fn execute(&self, mut request: Request) -> Result<ApiResponse> {
        let request_id = uuid::Uuid::new_v4().to_string()[..8].to_string();

        let decision = self.interceptor.prepare(&mut request).await;
        tracing::debug!(
            "[{}] {} {} ({:?})",
            request_id,
            request.method(),
            request.url().path(),
            decision
        );
        if let AuthDecision::RefreshFailed(ref e) = decision {
            if e.is_terminal() {
                self.guard.end_session();
            }
        }

        let replay = request.try_clone();
        let response = self.dispatch(request).await?;

        match self.guard.classify(&response) {
            Verdict::Pass => Ok(response),
            Verdict::SessionInvalid => {
                tracing::warn!("[{}] Backend reports session invalid", request_id);
                self.guard.end_session();
                Ok(response)
            }
            Verdict::TokenExpired => {
                let Some(mut replay) = replay else {
                    tracing::warn!("[{}] Token expired but request body cannot be replayed", request_id);
                    return Ok(response);
                };

                match self.coordinator.demand().await {
                    Ok(token) => {
                        attach_token(&mut replay, &token);
                        tracing::debug!("[{}] Replaying request with refreshed token", request_id);
                        let retried = self.dispatch(replay).await?;
                        if self.guard.classify(&retried) == Verdict::SessionInvalid {
                            self.guard.end_session();
                        }
                        Ok(retried)
                    }
                    Err(e) => {
                        tracing::warn!(
                            "[{}] Token refresh after expiry failed: {}",
                            request_id,
                            e
                        );
                        if e.is_terminal() {
                            self.guard.end_session();
                        }
                        Ok(response)
                    }
                }
            }
        }
    }

    /// Force a refresh exchange now
    pub async fn refresh(&self) -> std::result::Result<String, RefreshError> {
        self.coordinator.demand().await
    }

    /// Persist credentials obtained from a login
    pub fn login(&self, record: &CredentialRecord) {
        self.store.store_session(record);
        self.guard.session_started();
        tracing::info!("Session established");
    }

    pub fn logout(&self) {
        self.store.clear_session();
        tracing::info!("Logged out");
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    pub fn coordinator(&self) -> &Arc<RefreshCoordinator> {
        &self.coordinator
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| ClientError::InvalidUrl(format!("{}: {}", path, e)))
    }

    async fn dispatch(&self, request: Request) -> Result<ApiResponse> {
        let url = request.url().clone();

        let response = match self.client.execute(request).await {
            Ok(response) => response,
            Err(e) => {
                let error_kind = if e.is_timeout() {
                    "timeout"
                } else if e.is_connect() {
                    "connection_failed"
                } else if e.is_request() {
                    "request_error"
                } else {
                    "unknown"
                };
                tracing::warn!(
                    error_kind = error_kind,
                    error = %e,
                    url = %url,
                    "HTTP request error"
                );
                return Err(e.into());
            }
        };

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;

        tracing::debug!(status = %status, url = %url, "Received HTTP response");
        Ok(ApiResponse::from_parts(status, headers, body))
    }
}

fn build_http_client(timeout: Duration) -> Result<Client> {
    Ok(Client::builder().timeout(timeout).build()?)
}

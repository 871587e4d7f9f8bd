// Outbound authorization

use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::Request;
use std::sync::Arc;

use crate::auth::RefreshCoordinator;
use crate::error::RefreshError;
use crate::store::{CredentialStore, Lookup};

/// What the interceptor did to an outgoing request
#[derive(Debug, Clone, PartialEq)]
pub enum AuthDecision {
    /// Refresh exchange itself, never touched
    Exempt,
    /// Cached access token attached
    Cached,
    /// Token obtained through the coordinator attached
    Refreshed,
    /// Refresh was attempted and failed; sent without credentials
    RefreshFailed(RefreshError),
    /// No credentials at all (or storage unusable)
    Anonymous,
}

/// Attaches the access token to every outgoing request
///
/// Decision order: cached access token, then a coordinated refresh when a
/// refresh token exists, otherwise the request goes out unauthenticated.
pub struct AuthInterceptor {
    store: CredentialStore,
    coordinator: Arc<RefreshCoordinator>,
    exempt_path: String,
}

impl AuthInterceptor {
    pub fn new(
        store: CredentialStore,
        coordinator: Arc<RefreshCoordinator>,
        exempt_path: impl Into<String>,
    ) -> Self {
        Self {
            store,
            coordinator,
            exempt_path: exempt_path.into(),
        }
    }

    pub async fn prepare(&self, request: &mut Request) -> AuthDecision {
        if request.url().path() == self.exempt_path {
            return AuthDecision::Exempt;
        }

        if !self.store.is_available() {
            tracing::warn!("Credential storage unavailable, sending request without token");
            return AuthDecision::Anonymous;
        }

        if let Lookup::Hit(token) = self.store.access_token() {
            return if attach_token(request, &token) {
                AuthDecision::Cached
            } else {
                AuthDecision::Anonymous
            };
        }

        if !self.store.refresh_token().is_hit() {
            return AuthDecision::Anonymous;
        }

        match self.coordinator.demand().await {
            Ok(token) => {
                if attach_token(request, &token) {
                    AuthDecision::Refreshed
                } else {
                    AuthDecision::Anonymous
                }
            }
            Err(e) => {
                tracing::warn!("Token refresh failed, continuing without token: {}", e);
                AuthDecision::RefreshFailed(e)
            }
        }
    }
}

/// Set the authorization header; returns false for tokens that are not valid header values
pub fn attach_token(request: &mut Request, token: &str) -> bool {
    match HeaderValue::from_str(token) {
        Ok(mut value) => {
            value.set_sensitive(true);
            request.headers_mut().insert(AUTHORIZATION, value);
            true
        }
        Err(e) => {
            tracing::warn!("Access token is not a valid header value: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{RefreshExchange, TokenGrant};
    use crate::store::MemoryStorage;
    use async_trait::async_trait;
    use reqwest::{Method, Url};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingExchange {
        calls: AtomicUsize,
        result: Result<TokenGrant, RefreshError>,
    }

    #[async_trait]
    impl RefreshExchange for CountingExchange {
        async fn exchange(&self, _refresh_token: &str) -> Result<TokenGrant, RefreshError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result.clone()
        }
    }

    fn setup(
        result: Result<TokenGrant, RefreshError>,
    ) -> (AuthInterceptor, CredentialStore, Arc<MemoryStorage>, Arc<CountingExchange>) {
        let storage = Arc::new(MemoryStorage::new());
        let store = CredentialStore::new(storage.clone());
        let exchange = Arc::new(CountingExchange {
            calls: AtomicUsize::new(0),
            result,
        });
        let coordinator = Arc::new(RefreshCoordinator::new(store.clone(), exchange.clone()));
        let interceptor =
            AuthInterceptor::new(store.clone(), coordinator, "/api/v1/auth/updateToken");
        (interceptor, store, storage, exchange)
    }

    fn request(path: &str) -> Request {
        let url = Url::parse("http://localhost/api/").unwrap().join(path).unwrap();
        Request::new(Method::GET, url)
    }

    fn new_grant() -> Result<TokenGrant, RefreshError> {
        Ok(TokenGrant {
            access_token: "fresh".to_string(),
            refresh_token: None,
            user_id: None,
        })
    }

    #[tokio::test]
    async fn test_cached_token_is_attached() {
        let (interceptor, store, _, exchange) = setup(new_grant());
        store.save_access_token("cached");

        let mut req = request("v1/user/getUserInfo");
        assert_eq!(interceptor.prepare(&mut req).await, AuthDecision::Cached);
        assert_eq!(req.headers()[AUTHORIZATION], "cached");
        assert_eq!(exchange.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_refresh_token_triggers_refresh() {
        let (interceptor, store, _, exchange) = setup(new_grant());
        store.save_refresh_token("r1");

        let mut req = request("v1/user/getUserInfo");
        assert_eq!(interceptor.prepare(&mut req).await, AuthDecision::Refreshed);
        assert_eq!(req.headers()[AUTHORIZATION], "fresh");
        assert_eq!(exchange.calls.load(Ordering::SeqCst), 1);

        let mut req = request("v1/user/getUserInfo");
        assert_eq!(interceptor.prepare(&mut req).await, AuthDecision::Cached);
        assert_eq!(exchange.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_refresh_proceeds_without_header() {
        let (interceptor, store, _, _) = setup(Err(RefreshError::Network("down".to_string())));
        store.save_refresh_token("r1");

        let mut req = request("v1/user/getUserInfo");
        let decision = interceptor.prepare(&mut req).await;
        assert!(matches!(decision, AuthDecision::RefreshFailed(_)));
        assert!(req.headers().get(AUTHORIZATION).is_none());
    }

    #[tokio::test]
    async fn test_no_credentials_is_anonymous() {
        let (interceptor, _, _, exchange) = setup(new_grant());

        let mut req = request("v1/user/getUserBaseInfo");
        assert_eq!(interceptor.prepare(&mut req).await, AuthDecision::Anonymous);
        assert!(req.headers().get(AUTHORIZATION).is_none());
        assert_eq!(exchange.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_refresh_endpoint_is_exempt() {
        let (interceptor, store, _, _) = setup(new_grant());
        store.save_access_token("cached");

        let mut req = request("v1/auth/updateToken");
        assert_eq!(interceptor.prepare(&mut req).await, AuthDecision::Exempt);
        assert!(req.headers().get(AUTHORIZATION).is_none());
    }

    #[tokio::test]
    async fn test_unavailable_storage_is_anonymous() {
        let (interceptor, store, storage, exchange) = setup(new_grant());
        store.save_access_token("cached");
        storage.set_available(false);

        let mut req = request("v1/user/getUserInfo");
        assert_eq!(interceptor.prepare(&mut req).await, AuthDecision::Anonymous);
        assert!(req.headers().get(AUTHORIZATION).is_none());
        assert_eq!(exchange.calls.load(Ordering::SeqCst), 0);
    }
}

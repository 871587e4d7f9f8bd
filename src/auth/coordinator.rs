// Single-flight refresh coordination
//
// Concurrent demands for a fresh access token collapse into one exchange call.
// The first demand while idle starts the exchange on its own task; every demand,
// that first one included, queues up and is resumed in arrival order once the
// exchange settles. A caller that gives up only drops its own place in line.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

use super::refresh::RefreshExchange;
use super::types::TokenGrant;
use crate::error::RefreshError;
use crate::store::{CredentialStore, Lookup, ACCESS_TOKEN_KEY};

type RefreshResult = Result<String, RefreshError>;
type Waiter = oneshot::Sender<RefreshResult>;

/// Internal state; the waiter queue only exists while refreshing
enum CoordinatorState {
    Idle,
    Refreshing { waiters: VecDeque<Waiter> },
}

/// Observable coordinator phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Refreshing,
}

/// State shared with the task running the exchange
struct Shared {
    store: CredentialStore,
    exchange: Arc<dyn RefreshExchange>,
    state: Mutex<CoordinatorState>,
    refreshes: AtomicU64,
}

/// Turns "I need a valid access token" into at most one in-flight exchange
pub struct RefreshCoordinator {
    shared: Arc<Shared>,
}

impl RefreshCoordinator {
    pub fn new(store: CredentialStore, exchange: Arc<dyn RefreshExchange>) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                exchange,
                state: Mutex::new(CoordinatorState::Idle),
                refreshes: AtomicU64::new(0),
            }),
        }
    }

    /// Obtain a freshly exchanged access token
    ///
    /// Starts a new exchange when idle, otherwise waits for the one in flight.
    /// Fails immediately, without touching state, when no refresh token is cached.
    pub async fn demand(&self) -> RefreshResult {
        let (tx, rx) = oneshot::channel();

        // Queue position is decided under the lock; no await happens while it is held.
        let start = {
            let mut state = self.shared.state.lock();
            match &mut *state {
                CoordinatorState::Refreshing { waiters } => {
                    waiters.push_back(tx);
                    tracing::debug!(position = waiters.len(), "Refresh in flight, queued");
                    None
                }
                CoordinatorState::Idle => {
                    let refresh_token = match self.shared.store.refresh_token() {
                        Lookup::Hit(token) => token,
                        Lookup::Miss | Lookup::Unavailable => {
                            tracing::debug!("Refresh demanded without a refresh token");
                            return Err(RefreshError::MissingRefreshToken);
                        }
                    };
                    *state = CoordinatorState::Refreshing {
                        waiters: VecDeque::from([tx]),
                    };
                    Some(refresh_token)
                }
            }
        };

        if let Some(refresh_token) = start {
            let shared = self.shared.clone();
            tokio::spawn(async move { shared.run(refresh_token).await });
        }

        rx.await.unwrap_or(Err(RefreshError::Abandoned))
    }

    pub fn phase(&self) -> Phase {
        match *self.shared.state.lock() {
            CoordinatorState::Idle => Phase::Idle,
            CoordinatorState::Refreshing { .. } => Phase::Refreshing,
        }
    }

    /// Number of callers waiting on the in-flight exchange
    pub fn waiting(&self) -> usize {
        match &*self.shared.state.lock() {
            CoordinatorState::Idle => 0,
            CoordinatorState::Refreshing { waiters } => waiters.len(),
        }
    }

    /// Exchange calls issued since construction
    pub fn refresh_count(&self) -> u64 {
        self.shared.refreshes.load(Ordering::SeqCst)
    }

    pub fn store(&self) -> &CredentialStore {
        &self.shared.store
    }
}

impl Shared {
    async fn run(&self, refresh_token: String) {
        let mut guard = SettleGuard {
            shared: self,
            armed: true,
        };

        let attempt = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(attempt = attempt, "Starting token refresh");

        let result = match self.exchange.exchange(&refresh_token).await {
            Ok(grant) => Ok(self.apply_grant(&refresh_token, grant)),
            Err(e) => {
                self.apply_failure(&e);
                Err(e)
            }
        };

        guard.armed = false;
        self.settle(&result);
    }

    fn apply_grant(&self, previous_refresh: &str, grant: TokenGrant) -> String {
        self.store.save_access_token(&grant.access_token);

        if let Some(ref refresh_token) = grant.refresh_token {
            if refresh_token != previous_refresh {
                self.store.save_refresh_token(refresh_token);
                tracing::debug!("Refresh token rotated");
            }
        }

        if let Some(ref user_id) = grant.user_id {
            self.store.save_user_id(user_id);
        }

        tracing::info!("Access token refreshed");
        grant.access_token
    }

    fn apply_failure(&self, error: &RefreshError) {
        if error.is_terminal() {
            tracing::warn!("Refresh token rejected, clearing session");
            self.store.clear_session();
        } else {
            tracing::error!("Token refresh failed: {}", error);
            self.store.remove(ACCESS_TOKEN_KEY);
        }
    }

    /// Return to idle and resume every waiter, oldest first
    fn settle(&self, result: &RefreshResult) {
        let waiters = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, CoordinatorState::Idle) {
                CoordinatorState::Refreshing { waiters } => waiters,
                CoordinatorState::Idle => VecDeque::new(),
            }
        };

        tracing::debug!(waiters = waiters.len(), ok = result.is_ok(), "Resuming queued callers");

        for waiter in waiters {
            // A receiver that gave up is simply skipped.
            let _ = waiter.send(result.clone());
        }
    }
}

/// Settles the attempt as abandoned if the exchange task dies mid-flight
struct SettleGuard<'a> {
    shared: &'a Shared,
    armed: bool,
}

impl Drop for SettleGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            tracing::warn!("Token refresh abandoned before completion");
            self.shared.settle(&Err(RefreshError::Abandoned));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStorage, REFRESH_TOKEN_KEY, USER_ID_KEY};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::{mpsc, Semaphore};

    /// Exchange that blocks until the test releases it
    struct GatedExchange {
        calls: AtomicUsize,
        gate: Semaphore,
        started: mpsc::UnboundedSender<String>,
        outcome: Mutex<Result<TokenGrant, RefreshError>>,
    }

    impl GatedExchange {
        fn new(
            outcome: Result<TokenGrant, RefreshError>,
        ) -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let exchange = Arc::new(Self {
                calls: AtomicUsize::new(0),
                gate: Semaphore::new(0),
                started: tx,
                outcome: Mutex::new(outcome),
            });
            (exchange, rx)
        }

        fn release(&self) {
            self.gate.add_permits(1);
        }

        fn set_outcome(&self, outcome: Result<TokenGrant, RefreshError>) {
            *self.outcome.lock() = outcome;
        }
    }

    #[async_trait]
    impl RefreshExchange for GatedExchange {
        async fn exchange(&self, refresh_token: &str) -> Result<TokenGrant, RefreshError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let _ = self.started.send(refresh_token.to_string());
            let permit = self.gate.acquire().await.map_err(|_| RefreshError::Abandoned)?;
            permit.forget();
            self.outcome.lock().clone()
        }
    }

    fn grant(access: &str, refresh: Option<&str>) -> TokenGrant {
        TokenGrant {
            access_token: access.to_string(),
            refresh_token: refresh.map(str::to_string),
            user_id: Some("7".to_string()),
        }
    }

    fn store_with_refresh(token: Option<&str>) -> CredentialStore {
        let store = CredentialStore::new(Arc::new(MemoryStorage::new()));
        if let Some(token) = token {
            store.save_refresh_token(token);
        }
        store
    }

    async fn wait_for_waiters(coordinator: &RefreshCoordinator, count: usize) {
        while coordinator.waiting() < count {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_concurrent_demands_share_one_exchange() {
        let (exchange, mut started) = GatedExchange::new(Ok(grant("new-access", None)));
        let coordinator = Arc::new(RefreshCoordinator::new(
            store_with_refresh(Some("r1")),
            exchange.clone(),
        ));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let coordinator = coordinator.clone();
            handles.push(tokio::spawn(async move { coordinator.demand().await }));
        }

        assert_eq!(started.recv().await.as_deref(), Some("r1"));
        wait_for_waiters(&coordinator, 8).await;
        assert_eq!(coordinator.phase(), Phase::Refreshing);

        exchange.release();
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "new-access");
        }

        assert_eq!(exchange.calls.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.refresh_count(), 1);
        assert_eq!(coordinator.phase(), Phase::Idle);
        assert_eq!(coordinator.waiting(), 0);
    }

    #[tokio::test]
    async fn test_waiters_resume_in_enqueue_order() {
        let (exchange, mut started) = GatedExchange::new(Ok(grant("t", None)));
        let coordinator = Arc::new(RefreshCoordinator::new(
            store_with_refresh(Some("r1")),
            exchange.clone(),
        ));
        let order = Arc::new(Mutex::new(Vec::new()));

        let leader = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.demand().await })
        };
        started.recv().await;
        wait_for_waiters(&coordinator, 1).await;

        let mut followers = Vec::new();
        for i in 0..5 {
            let handle = coordinator.clone();
            let order = order.clone();
            followers.push(tokio::spawn(async move {
                let result = handle.demand().await;
                order.lock().push(i);
                result
            }));
            wait_for_waiters(&coordinator, i + 2).await;
        }

        exchange.release();
        leader.await.unwrap().unwrap();
        for follower in followers {
            follower.await.unwrap().unwrap();
        }

        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_success_writes_credentials() {
        let (exchange, _started) = GatedExchange::new(Ok(grant("a2", Some("r2"))));
        exchange.release();
        let coordinator = RefreshCoordinator::new(store_with_refresh(Some("r1")), exchange);

        assert_eq!(coordinator.demand().await.unwrap(), "a2");

        let store = coordinator.store();
        assert_eq!(store.access_token(), Lookup::Hit("a2".to_string()));
        assert_eq!(store.refresh_token(), Lookup::Hit("r2".to_string()));
        assert_eq!(store.get::<String>(USER_ID_KEY), Lookup::Hit("7".to_string()));
    }

    #[tokio::test]
    async fn test_unchanged_refresh_token_keeps_original_expiry() {
        let (exchange, _started) = GatedExchange::new(Ok(grant("a2", Some("r1"))));
        exchange.release();
        let store = store_with_refresh(Some("r1"));
        let expiry = store.expiry_of(REFRESH_TOKEN_KEY);
        let coordinator = RefreshCoordinator::new(store, exchange);

        coordinator.demand().await.unwrap();
        assert_eq!(coordinator.store().expiry_of(REFRESH_TOKEN_KEY), expiry);
    }

    #[tokio::test]
    async fn test_missing_refresh_token_fails_without_call() {
        let (exchange, _started) = GatedExchange::new(Ok(grant("a", None)));
        let coordinator = RefreshCoordinator::new(store_with_refresh(None), exchange.clone());

        assert_eq!(
            coordinator.demand().await,
            Err(RefreshError::MissingRefreshToken)
        );
        assert_eq!(exchange.calls.load(Ordering::SeqCst), 0);
        assert_eq!(coordinator.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn test_failure_resumes_all_and_allows_new_attempt() {
        let failure = RefreshError::Network("connection reset".to_string());
        let (exchange, mut started) = GatedExchange::new(Err(failure.clone()));
        let coordinator = Arc::new(RefreshCoordinator::new(
            store_with_refresh(Some("r1")),
            exchange.clone(),
        ));

        let mut handles = Vec::new();
        for _ in 0..3 {
            let coordinator = coordinator.clone();
            handles.push(tokio::spawn(async move { coordinator.demand().await }));
        }
        started.recv().await;
        wait_for_waiters(&coordinator, 3).await;

        exchange.release();
        for handle in handles {
            assert_eq!(handle.await.unwrap(), Err(failure.clone()));
        }
        assert_eq!(coordinator.phase(), Phase::Idle);
        assert!(coordinator.store().refresh_token().is_hit());

        exchange.set_outcome(Ok(grant("a3", None)));
        exchange.release();
        assert_eq!(coordinator.demand().await.unwrap(), "a3");
        assert_eq!(exchange.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_session_invalid_clears_credentials() {
        let (exchange, _started) = GatedExchange::new(Err(RefreshError::SessionInvalid));
        exchange.release();
        let store = store_with_refresh(Some("r1"));
        store.save_access_token("stale");
        store.save_user_id("7");
        let coordinator = RefreshCoordinator::new(store, exchange);

        assert_eq!(coordinator.demand().await, Err(RefreshError::SessionInvalid));

        let store = coordinator.store();
        assert_eq!(store.access_token(), Lookup::Miss);
        assert_eq!(store.refresh_token(), Lookup::Miss);
        assert_eq!(store.user_id(), Lookup::Miss);
    }

    #[tokio::test]
    async fn test_dropped_first_caller_does_not_cancel_refresh() {
        let (exchange, mut started) = GatedExchange::new(Ok(grant("a", Some("r2"))));
        let coordinator = Arc::new(RefreshCoordinator::new(
            store_with_refresh(Some("r1")),
            exchange.clone(),
        ));

        let first = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.demand().await })
        };
        started.recv().await;

        let second = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.demand().await })
        };
        wait_for_waiters(&coordinator, 2).await;

        first.abort();
        assert!(first.await.unwrap_err().is_cancelled());
        assert_eq!(coordinator.phase(), Phase::Refreshing);

        exchange.release();
        assert_eq!(second.await.unwrap().unwrap(), "a");
        assert_eq!(coordinator.phase(), Phase::Idle);
        assert_eq!(exchange.calls.load(Ordering::SeqCst), 1);

        let store = coordinator.store();
        assert_eq!(store.access_token(), Lookup::Hit("a".to_string()));
        assert_eq!(store.refresh_token(), Lookup::Hit("r2".to_string()));
    }

    #[tokio::test]
    async fn test_timed_out_caller_leaves_refresh_running() {
        let (exchange, mut started) = GatedExchange::new(Ok(grant("late", None)));
        let coordinator = Arc::new(RefreshCoordinator::new(
            store_with_refresh(Some("r1")),
            exchange.clone(),
        ));

        let first =
            tokio::time::timeout(std::time::Duration::from_millis(20), coordinator.demand()).await;
        assert!(first.is_err());
        assert_eq!(started.recv().await.as_deref(), Some("r1"));

        let second = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.demand().await })
        };
        wait_for_waiters(&coordinator, 2).await;

        exchange.release();
        assert_eq!(second.await.unwrap().unwrap(), "late");
        assert_eq!(
            coordinator.store().access_token(),
            Lookup::Hit("late".to_string())
        );
        assert_eq!(exchange.calls.load(Ordering::SeqCst), 1);
    }
}

//! Coordinated bearer-token refresh.
//!
//! Concurrent 401s collapse into a single execution of the refresh handler.
//! The first caller starts the refresh; every caller (the starter included)
//! suspends as a waiter keyed by a unique id, so cancelling any one of them
//! detaches only that waiter. The handler itself runs on a task of its own
//! and always completes, resuming the captured waiters exactly once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::error::{ErrorKind, NetworkError, Result};

/// Persistence seam for the bearer token shared by the auth interceptor and
/// the refresh coordinator.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Loads the current token, if any.
    async fn load(&self) -> Option<String>;
    /// Replaces the stored token.
    async fn save(&self, token: String);
    /// Removes the stored token.
    async fn clear(&self);
}

/// A process-local [`TokenStore`].
#[derive(Debug, Default)]
pub struct InMemoryTokenStore {
    token: RwLock<Option<String>>,
}

impl InMemoryTokenStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store seeded with a token.
    #[must_use]
    pub fn with_token(token: impl Into<String>) -> Self {
        Self { token: RwLock::new(Some(token.into())) }
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn load(&self) -> Option<String> {
        self.token.read().await.clone()
    }

    async fn save(&self, token: String) {
        *self.token.write().await = Some(token);
    }

    async fn clear(&self) {
        *self.token.write().await = None;
    }
}

type RefreshOutcome = Result<String>;
type RefreshHandler =
    Arc<dyn Fn() -> BoxFuture<'static, RefreshOutcome> + Send + Sync>;

enum RefreshState {
    Idle,
    Refreshing { waiters: HashMap<u64, oneshot::Sender<RefreshOutcome>> },
}

impl RefreshState {
    fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Refreshing { .. } => "refreshing",
        }
    }
}

/// Collapses concurrent refresh requests into one handler execution.
///
/// Multiple interceptors may share one coordinator; the single-flight
/// contract holds across them.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    state: Mutex<RefreshState>,
    next_waiter_id: AtomicU64,
    handler: RefreshHandler,
    store: Arc<dyn TokenStore>,
}

impl std::fmt::Debug for RefreshCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshCoordinator").finish_non_exhaustive()
    }
}

impl RefreshCoordinator {
    /// Creates a coordinator over a token store and a refresh handler.
    ///
    /// The handler performs the actual credential exchange and resolves to
    /// the new token; on success the token is saved to the store before
    /// waiters resume.
    pub fn new<F, Fut>(store: Arc<dyn TokenStore>, handler: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = RefreshOutcome> + Send + 'static,
    {
        let handler: RefreshHandler = Arc::new(move || {
            let refresh: BoxFuture<'static, RefreshOutcome> =
                Box::pin(handler());
            refresh
        });
        Self {
            inner: Arc::new(CoordinatorInner {
                state: Mutex::new(RefreshState::Idle),
                next_waiter_id: AtomicU64::new(0),
                handler,
                store,
            }),
        }
    }

    /// The token store this coordinator saves into.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn TokenStore> {
        &self.inner.store
    }

    /// Joins (or starts) the current refresh and waits for its outcome.
    ///
    /// Exactly one handler execution happens per `idle -> refreshing ->
    /// idle` transition regardless of how many callers pile in. Cancelling
    /// `cancel` abandons only this caller's wait with
    /// [`ErrorKind::Cancelled`]; the refresh and the other waiters are
    /// unaffected.
    pub async fn refresh_if_needed(
        &self,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let waiter_id =
            self.inner.next_waiter_id.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = oneshot::channel();

        let starts_refresh = {
            let mut state = self.inner.state.lock().await;
            match &mut *state {
                RefreshState::Idle => {
                    log::debug!("token refresh started (waiter {waiter_id})");
                    *state = RefreshState::Refreshing {
                        waiters: HashMap::from([(waiter_id, tx)]),
                    };
                    true
                }
                RefreshState::Refreshing { waiters } => {
                    log::trace!(
                        "token refresh in progress, enqueued waiter {waiter_id} ({} waiting)",
                        waiters.len() + 1
                    );
                    waiters.insert(waiter_id, tx);
                    false
                }
            }
        };

        if starts_refresh {
            // The handler runs on its own task so that cancelling any
            // waiter, the starter included, cannot abort it.
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                let outcome = (inner.handler)().await;
                if let Ok(token) = &outcome {
                    inner.store.save(token.clone()).await;
                }
                let waiters = {
                    let mut state = inner.state.lock().await;
                    match std::mem::replace(&mut *state, RefreshState::Idle) {
                        RefreshState::Refreshing { waiters } => waiters,
                        RefreshState::Idle => HashMap::new(),
                    }
                };
                log::debug!(
                    "token refresh finished ({}), resuming {} waiter(s)",
                    if outcome.is_ok() { "ok" } else { "error" },
                    waiters.len()
                );
                for (_, waiter) in waiters {
                    let _ = waiter.send(outcome.clone());
                }
            });
        }

        tokio::select! {
            outcome = &mut rx => match outcome {
                Ok(result) => result,
                // The refresher task died without resuming us.
                Err(_) => Err(NetworkError::new(ErrorKind::Unknown)),
            },
            () = cancel.cancelled() => {
                let mut state = self.inner.state.lock().await;
                if let RefreshState::Refreshing { waiters } = &mut *state {
                    waiters.remove(&waiter_id);
                }
                log::trace!(
                    "waiter {waiter_id} cancelled while coordinator {}",
                    state.name()
                );
                Err(NetworkError::new(ErrorKind::Cancelled))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn coordinator_with_counter(
        outcome: RefreshOutcome,
    ) -> (RefreshCoordinator, Arc<AtomicUsize>) {
        let executions = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&executions);
        let coordinator = RefreshCoordinator::new(
            Arc::new(InMemoryTokenStore::new()),
            move || {
                let counter = Arc::clone(&counter);
                let outcome = outcome.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    outcome
                }
            },
        );
        (coordinator, executions)
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_refresh() {
        let (coordinator, executions) =
            coordinator_with_counter(Ok("fresh".to_owned()));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let coordinator = coordinator.clone();
            handles.push(tokio::spawn(async move {
                coordinator
                    .refresh_if_needed(&CancellationToken::new())
                    .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "fresh");
        }
        assert_eq!(executions.load(Ordering::SeqCst), 1);
        assert_eq!(
            coordinator.store().load().await.as_deref(),
            Some("fresh")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_one_waiter_leaves_the_rest_unaffected() {
        let (coordinator, executions) =
            coordinator_with_counter(Ok("fresh".to_owned()));

        let cancel = CancellationToken::new();
        let doomed = {
            let coordinator = coordinator.clone();
            let cancel = cancel.clone();
            tokio::spawn(
                async move { coordinator.refresh_if_needed(&cancel).await },
            )
        };
        let mut survivors = Vec::new();
        for _ in 0..9 {
            let coordinator = coordinator.clone();
            survivors.push(tokio::spawn(async move {
                coordinator
                    .refresh_if_needed(&CancellationToken::new())
                    .await
            }));
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let err = doomed.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        for survivor in survivors {
            assert_eq!(survivor.await.unwrap().unwrap(), "fresh");
        }
        assert_eq!(executions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn handler_error_resumes_every_waiter_with_the_error() {
        let (coordinator, executions) = coordinator_with_counter(Err(
            NetworkError::new(ErrorKind::Unauthorized),
        ));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let coordinator = coordinator.clone();
            handles.push(tokio::spawn(async move {
                coordinator
                    .refresh_if_needed(&CancellationToken::new())
                    .await
            }));
        }
        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Unauthorized);
        }
        assert_eq!(executions.load(Ordering::SeqCst), 1);

        // A failed refresh returns the coordinator to idle; retry allowed.
        let err = coordinator
            .refresh_if_needed(&CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
        assert_eq!(executions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn sequential_calls_refresh_again() {
        let (coordinator, executions) =
            coordinator_with_counter(Ok("fresh".to_owned()));
        coordinator
            .refresh_if_needed(&CancellationToken::new())
            .await
            .unwrap();
        coordinator
            .refresh_if_needed(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(executions.load(Ordering::SeqCst), 2);
    }
}

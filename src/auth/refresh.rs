// Coalesced credential refresh.
// Concurrent 401s share one refresh; every waiter sees the same outcome.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};

use crate::error::{FetchError, Result};

use super::credentials::CredentialStore;

type SharedRefresh = Shared<BoxFuture<'static, Result<()>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshPhase {
    Idle,
    Refreshing,
}

#[derive(Default)]
struct RefreshState {
    /// Bumped every time a refresh settles.
    generation: u64,
    last_succeeded: bool,
    started: u64,
    in_flight: Option<SharedRefresh>,
}

pub struct AuthRefreshCoordinator {
    credentials: Arc<dyn CredentialStore>,
    state: Arc<Mutex<RefreshState>>,
}

impl std::fmt::Debug for AuthRefreshCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthRefreshCoordinator")
            .field("phase", &self.phase())
            .field("generation", &self.generation())
            .finish()
    }
}

impl AuthRefreshCoordinator {
    pub fn new(credentials: Arc<dyn CredentialStore>) -> Self {
        Self {
            credentials,
            state: Arc::new(Mutex::new(RefreshState::default())),
        }
    }

    pub fn credentials(&self) -> &Arc<dyn CredentialStore> {
        &self.credentials
    }

    fn lock(&self) -> MutexGuard<'_, RefreshState> {
        lock_state(&self.state)
    }

    /// Read before sending a request and hand back to [`Self::refresh`] on a 401.
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    pub fn phase(&self) -> RefreshPhase {
        if self.lock().in_flight.is_some() {
            RefreshPhase::Refreshing
        } else {
            RefreshPhase::Idle
        }
    }

    /// Number of refresh operations actually started.
    pub fn refresh_count(&self) -> u64 {
        self.lock().started
    }

    /// Refresh credentials after a 401 seen at `observed_generation`.
    ///
    /// A refresh that settled after that generation answers immediately with
    /// its outcome. Otherwise the caller joins the running refresh or starts
    /// one. On failure credentials are cleared once, by the shared task.
    pub async fn refresh(&self, observed_generation: u64) -> Result<()> {
        let shared = {
            let mut state = self.lock();
            if state.generation != observed_generation {
                return if state.last_succeeded {
                    Ok(())
                } else {
                    Err(FetchError::AuthenticationFailed)
                };
            }
            match &state.in_flight {
                Some(shared) => shared.clone(),
                None => {
                    let shared = self.start(&mut state);
                    state.in_flight = Some(shared.clone());
                    shared
                }
            }
        };
        shared.await
    }

    fn start(&self, state: &mut RefreshState) -> SharedRefresh {
        state.started += 1;
        tracing::info!("credentials rejected, refreshing");

        let credentials = self.credentials.clone();
        let mut settle = SettleRefresh {
            state: self.state.clone(),
            succeeded: false,
        };
        let handle = tokio::spawn(async move {
            match credentials.refresh_credentials().await {
                Ok(_) => {
                    tracing::info!("credential refresh succeeded");
                    settle.succeeded = true;
                    Ok(())
                }
                Err(err) => {
                    tracing::warn!(error = %err, "credential refresh failed, clearing credentials");
                    credentials.clear_credentials().await;
                    Err(FetchError::AuthenticationFailed)
                }
            }
        });

        async move {
            handle
                .await
                .unwrap_or(Err(FetchError::AuthenticationFailed))
        }
        .boxed()
        .shared()
    }

    /// Drop any in-flight refresh handle. A running task still settles.
    pub fn reset(&self) {
        self.lock().in_flight = None;
    }
}

fn lock_state(state: &Mutex<RefreshState>) -> MutexGuard<'_, RefreshState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Publishes a refresh outcome when its task ends, including by panic.
struct SettleRefresh {
    state: Arc<Mutex<RefreshState>>,
    succeeded: bool,
}

impl Drop for SettleRefresh {
    fn drop(&mut self) {
        let mut state = lock_state(&self.state);
        state.generation = state.generation.wrapping_add(1);
        state.last_succeeded = self.succeeded;
        state.in_flight = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::credentials::Credentials;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct CountingStore {
        fail: bool,
        refreshes: AtomicUsize,
        clears: AtomicUsize,
    }

    #[async_trait]
    impl CredentialStore for CountingStore {
        async fn credentials(&self) -> Option<Credentials> {
            Some(Credentials::bearer("t"))
        }

        async fn refresh_credentials(&self) -> Result<Credentials> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self.fail {
                Err(FetchError::Http {
                    status: 400,
                    message: "invalid refresh token".to_string(),
                })
            } else {
                Ok(Credentials::bearer("fresh"))
            }
        }

        async fn clear_credentials(&self) {
            self.clears.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn coordinator(fail: bool) -> (Arc<CountingStore>, AuthRefreshCoordinator) {
        let store = Arc::new(CountingStore {
            fail,
            ..Default::default()
        });
        (store.clone(), AuthRefreshCoordinator::new(store))
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_refreshes_coalesce() {
        let (store, auth) = coordinator(false);
        let generation = auth.generation();

        let (a, b, c) = tokio::join!(
            auth.refresh(generation),
            auth.refresh(generation),
            auth.refresh(generation)
        );

        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(store.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(auth.refresh_count(), 1);
        assert_eq!(auth.phase(), RefreshPhase::Idle);
        assert_eq!(auth.generation(), generation + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_refresh_clears_once() {
        let (store, auth) = coordinator(true);
        let generation = auth.generation();

        let (a, b, c) = tokio::join!(
            auth.refresh(generation),
            auth.refresh(generation),
            auth.refresh(generation)
        );

        for outcome in [a, b, c] {
            assert_eq!(outcome, Err(FetchError::AuthenticationFailed));
        }
        assert_eq!(store.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(store.clears.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_caller_reuses_settled_outcome() {
        let (store, auth) = coordinator(false);
        let stale = auth.generation();
        auth.refresh(stale).await.unwrap();

        // A 401 from a request sent before the refresh finished.
        auth.refresh(stale).await.unwrap();
        assert_eq!(store.refreshes.load(Ordering::SeqCst), 1);

        auth.refresh(auth.generation()).await.unwrap();
        assert_eq!(store.refreshes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_phase_while_refreshing() {
        let (_store, auth) = coordinator(false);
        let auth = Arc::new(auth);
        let generation = auth.generation();
        let worker = {
            let auth = auth.clone();
            tokio::spawn(async move { auth.refresh(generation).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(auth.phase(), RefreshPhase::Refreshing);

        worker.await.unwrap().unwrap();
        assert_eq!(auth.phase(), RefreshPhase::Idle);
    }
}

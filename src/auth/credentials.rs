// Credential store boundary.
// The coordinator reads, refreshes and clears credentials only through this trait.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::error::{FetchError, Result};

/// Bearer credentials attached to outgoing requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_token: String,
    pub refresh_token: Option<String>,
}

impl Credentials {
    pub fn bearer(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
        }
    }

    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }

    pub fn authorization(&self) -> String {
        format!("Bearer {}", self.access_token)
    }
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Current credentials, if the session has any.
    async fn credentials(&self) -> Option<Credentials>;

    /// Obtain fresh credentials and store them.
    async fn refresh_credentials(&self) -> Result<Credentials>;

    /// Forget every stored credential.
    async fn clear_credentials(&self);
}

/// Async function turning the current credentials into fresh ones.
pub type Refresher =
    Arc<dyn Fn(Option<Credentials>) -> BoxFuture<'static, Result<Credentials>> + Send + Sync>;

/// Credentials held in memory with an optional refresh function.
#[derive(Default)]
pub struct InMemoryCredentials {
    current: Mutex<Option<Credentials>>,
    refresher: Option<Refresher>,
}

impl InMemoryCredentials {
    pub fn new(credentials: Option<Credentials>) -> Self {
        Self {
            current: Mutex::new(credentials),
            refresher: None,
        }
    }

    pub fn with_refresher(mut self, refresher: Refresher) -> Self {
        self.refresher = Some(refresher);
        self
    }

    /// Replace the stored credentials, e.g. after an interactive login.
    pub fn set(&self, credentials: Option<Credentials>) {
        *self.lock() = credentials;
    }

    fn lock(&self) -> MutexGuard<'_, Option<Credentials>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for InMemoryCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryCredentials")
            .field("has_credentials", &self.lock().is_some())
            .field("can_refresh", &self.refresher.is_some())
            .finish()
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentials {
    async fn credentials(&self) -> Option<Credentials> {
        self.lock().clone()
    }

    async fn refresh_credentials(&self) -> Result<Credentials> {
        let Some(refresher) = self.refresher.clone() else {
            return Err(FetchError::AuthenticationFailed);
        };
        let current = self.lock().clone();
        let fresh = refresher(current).await?;
        *self.lock() = Some(fresh.clone());
        Ok(fresh)
    }

    async fn clear_credentials(&self) {
        *self.lock() = None;
    }
}

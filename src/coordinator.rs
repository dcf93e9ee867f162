// Request coordinator.
// Composes cache, guards, single-flight and auth refresh into read and mutate.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Method;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::auth::{AuthRefreshCoordinator, CredentialStore, InMemoryCredentials};
use crate::cache::{
    CacheEntry, CacheStore, DiskStore, MemoryStore, QueryParams, RequestContext, RequestKey,
};
use crate::clock::{Clock, SystemClock};
use crate::config::CoordinatorConfig;
use crate::error::{FetchError, Result};
use crate::flight::PendingRequestRegistry;
use crate::guard::{CooldownGuard, RateLimitGuard};
use crate::http::{HttpRequest, ReqwestTransport, ResponseOutcome, Transport, classify};
use crate::invalidation::InvalidationEngine;
use crate::stats::{CoordinatorStats, StatsSnapshot};

/// Per-call read behaviour.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadOptions {
    /// TTL stored with a freshly fetched value, at millisecond granularity;
    /// the config default if unset.
    pub ttl: Option<Duration>,
    /// Skip the cache lookup and go to the network.
    pub force_refresh: bool,
    /// Answer from cache and refresh the entry in the background.
    pub stale_while_revalidate: bool,
}

impl ReadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn force_refresh(mut self) -> Self {
        self.force_refresh = true;
        self
    }

    pub fn stale_while_revalidate(mut self) -> Self {
        self.stale_while_revalidate = true;
        self
    }
}

/// Shared mutable state, one per process in production and one per test.
pub struct CoordinatorState {
    pub clock: Arc<dyn Clock>,
    pub cache: Arc<dyn CacheStore>,
    pub pending: PendingRequestRegistry,
    pub cooldown: CooldownGuard,
    pub rate_limit: RateLimitGuard,
    pub refresh: AuthRefreshCoordinator,
    pub stats: CoordinatorStats,
}

impl CoordinatorState {
    pub fn new(
        config: &CoordinatorConfig,
        cache: Arc<dyn CacheStore>,
        credentials: Arc<dyn CredentialStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            cooldown: CooldownGuard::new(config.cooldown(), clock.clone()),
            rate_limit: RateLimitGuard::new(
                clock.clone(),
                config.default_retry_after(),
                config.max_retry_after(),
            ),
            refresh: AuthRefreshCoordinator::new(credentials),
            pending: PendingRequestRegistry::new(),
            stats: CoordinatorStats::default(),
            cache,
            clock,
        }
    }

    /// Return every component to its initial state.
    pub fn reset(&self) {
        self.cache.clear_all();
        self.pending.clear();
        self.cooldown.reset();
        self.rate_limit.reset();
        self.refresh.reset();
        self.stats.reset();
    }
}

impl std::fmt::Debug for CoordinatorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatorState")
            .field("cached", &self.cache.len())
            .field("pending", &self.pending)
            .field("rate_limit", &self.rate_limit)
            .field("refresh", &self.refresh)
            .finish()
    }
}

/// Everything a read needs once its key is known.
#[derive(Debug, Clone)]
struct ReadTarget {
    key: RequestKey,
    endpoint: String,
    context: RequestContext,
    ttl: Duration,
    request: HttpRequest,
}

struct Inner {
    config: CoordinatorConfig,
    transport: Arc<dyn Transport>,
    state: Arc<CoordinatorState>,
    invalidation: InvalidationEngine,
}

/// Entry point for cached reads and invalidating mutations.
#[derive(Clone)]
pub struct RequestCoordinator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RequestCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestCoordinator")
            .field("base_url", &self.inner.config.base_url())
            .field("state", &self.inner.state)
            .finish()
    }
}

impl RequestCoordinator {
    pub fn builder(config: CoordinatorConfig) -> CoordinatorBuilder {
        CoordinatorBuilder::new(config)
    }

    /// Build from [`CoordinatorConfig::load`] with default collaborators.
    pub fn from_env() -> Result<Self> {
        CoordinatorBuilder::new(CoordinatorConfig::load()?).build()
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    pub fn state(&self) -> &Arc<CoordinatorState> {
        &self.inner.state
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.state.stats.snapshot()
    }

    /// Read `endpoint` for `context`, from cache when possible.
    pub async fn read(
        &self,
        endpoint: &str,
        params: &QueryParams,
        context: &RequestContext,
        options: ReadOptions,
    ) -> Result<Value> {
        let state = &self.inner.state;
        let target = self.target(endpoint, params, context, &options)?;

        if state.rate_limit.is_paused() {
            if let Some(value) = self.stale_value(&target.key) {
                tracing::debug!(key = %target.key, "rate limited, serving cached value");
                return Ok(value);
            }
            state.stats.record_rate_limited();
            return Err(FetchError::RateLimited {
                retry_after_secs: ceil_secs(state.rate_limit.remaining()),
            });
        }

        if !options.force_refresh {
            if let Some(entry) = state.cache.get(&target.key) {
                let now = state.clock.now();
                if entry.is_fresh(now) {
                    tracing::debug!(key = %target.key, "cache hit");
                    state.stats.record_cache_hit();
                    if options.stale_while_revalidate {
                        self.spawn_revalidation(target);
                    }
                    return Ok(entry.value);
                }
                if options.stale_while_revalidate
                    && entry.is_within(now, self.inner.config.stale_window())
                {
                    tracing::debug!(key = %target.key, "serving stale entry while revalidating");
                    state.stats.record_stale_hit();
                    self.spawn_revalidation(target);
                    return Ok(entry.value);
                }
            }
        }

        self.load(target).await
    }

    /// [`Self::read`] decoded into `T`.
    pub async fn read_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        params: &QueryParams,
        context: &RequestContext,
        options: ReadOptions,
    ) -> Result<T> {
        let value = self.read(endpoint, params, context, options).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Send a create/update/delete and evict the cache entries it affects.
    pub async fn mutate(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<Value>,
        context: &RequestContext,
    ) -> Result<Value> {
        let base_url = self.inner.config.base_url().ok_or(FetchError::NotConfigured)?;
        let request = HttpRequest::new(method.clone(), base_url, endpoint, &QueryParams::new())?
            .with_body(body);

        let value = self.inner.execute(request).await?;

        let evicted = self.inner.invalidation.invalidate(&method, endpoint, context);
        self.inner.state.stats.record_invalidated(evicted);
        Ok(value)
    }

    /// [`Self::mutate`] with a typed body and response.
    pub async fn mutate_json<B: Serialize, T: DeserializeOwned>(
        &self,
        method: Method,
        endpoint: &str,
        body: &B,
        context: &RequestContext,
    ) -> Result<T> {
        let body = serde_json::to_value(body)?;
        let value = self.mutate(method, endpoint, Some(body), context).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Evict every cached entry matching `filter`, e.g. a user on logout.
    pub fn invalidate_context(&self, filter: &RequestContext) -> usize {
        let evicted = self.inner.state.cache.delete_by_context(filter);
        self.inner.state.stats.record_invalidated(evicted);
        evicted
    }

    pub fn clear_cache(&self) {
        self.inner.state.cache.clear_all();
    }

    fn target(
        &self,
        endpoint: &str,
        params: &QueryParams,
        context: &RequestContext,
        options: &ReadOptions,
    ) -> Result<ReadTarget> {
        let base_url = self.inner.config.base_url().ok_or(FetchError::NotConfigured)?;
        Ok(ReadTarget {
            key: RequestKey::new(endpoint, params, context),
            endpoint: endpoint.to_string(),
            context: context.clone(),
            ttl: options.ttl.unwrap_or_else(|| self.inner.config.default_ttl()),
            request: HttpRequest::new(Method::GET, base_url, endpoint, params)?,
        })
    }

    /// Cached value still inside the widened stale tolerance.
    fn stale_value(&self, key: &RequestKey) -> Option<Value> {
        let state = &self.inner.state;
        let entry = state.cache.get(key)?;
        if !entry.is_within(state.clock.now(), self.inner.config.stale_window()) {
            return None;
        }
        state.stats.record_stale_hit();
        Some(entry.value)
    }

    /// Join or start the network fetch for `target`.
    async fn load(&self, target: ReadTarget) -> Result<Value> {
        let state = &self.inner.state;

        if let Some(flight) = state.pending.get(&target.key) {
            tracing::debug!(key = %target.key, "joining pending request");
            state.stats.record_joined();
            return flight.await;
        }

        if !state.cooldown.try_begin(&target.key) {
            if let Some(value) = self.stale_value(&target.key) {
                tracing::debug!(key = %target.key, "cooling down, serving cached value");
                return Ok(value);
            }
            // Nothing to serve; blocking here could stall the caller forever.
            tracing::debug!(key = %target.key, "cooling down without cached value, proceeding");
        }

        let key = target.key.clone();
        let inner = self.inner.clone();
        let flight = state
            .pending
            .join_or_start(&key, move || async move { inner.fetch_and_store(target).await });
        if flight.is_joined() {
            state.stats.record_joined();
        }
        flight.into_future().await
    }

    fn spawn_revalidation(&self, target: ReadTarget) {
        let coordinator = self.clone();
        let delay = self.inner.config.revalidate_delay();
        self.inner.state.stats.record_background_revalidation();

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if coordinator.inner.state.rate_limit.is_paused() {
                tracing::debug!(key = %target.key, "rate limited, skipping revalidation");
                return;
            }
            let endpoint = target.endpoint.clone();
            if let Err(err) = coordinator.load(target).await {
                tracing::warn!(endpoint = %endpoint, error = %err, "background revalidation failed");
            }
        });
    }
}

impl Inner {
    async fn fetch_and_store(&self, target: ReadTarget) -> Result<Value> {
        let value = self.execute(target.request).await?;
        let state = &self.state;
        state.cache.set(CacheEntry::new(
            target.key,
            target.endpoint,
            value.clone(),
            state.clock.now(),
            target.ttl,
            target.context,
        ));
        Ok(value)
    }

    /// Send with the current credentials, refreshing and retrying once on a 401.
    async fn execute(&self, request: HttpRequest) -> Result<Value> {
        let result = self.execute_with_refresh(request).await;
        if let Err(err) = &result {
            tracing::debug!(error = %err, "request failed");
            self.state.stats.record_error();
        }
        result
    }

    async fn execute_with_refresh(&self, request: HttpRequest) -> Result<Value> {
        let refresh = &self.state.refresh;
        let generation = refresh.generation();

        match self.send(request.clone()).await? {
            ResponseOutcome::Unauthorized => {
                refresh.refresh(generation).await?;
                match self.send(request).await? {
                    ResponseOutcome::Unauthorized => {
                        tracing::warn!("request rejected again after credential refresh");
                        Err(FetchError::AuthenticationFailed)
                    }
                    outcome => self.settle(outcome),
                }
            }
            outcome => self.settle(outcome),
        }
    }

    async fn send(&self, mut request: HttpRequest) -> Result<ResponseOutcome> {
        match self.state.refresh.credentials().credentials().await {
            Some(credentials) => request.set_authorization(&credentials.authorization())?,
            None => request.clear_authorization(),
        }

        self.state.stats.record_network_request();
        tracing::debug!(method = %request.method, url = %request.url, "sending request");
        let response = self.transport.send(request).await?;
        Ok(classify(&response))
    }

    fn settle(&self, outcome: ResponseOutcome) -> Result<Value> {
        match outcome {
            ResponseOutcome::Success(value) => Ok(value),
            ResponseOutcome::RateLimited { retry_after } => {
                let backoff = self.state.rate_limit.trip(retry_after);
                self.state.stats.record_rate_limited();
                Err(FetchError::RateLimited {
                    retry_after_secs: ceil_secs(backoff),
                })
            }
            ResponseOutcome::Unauthorized => Err(FetchError::AuthenticationFailed),
            ResponseOutcome::Failed(err) => Err(err),
        }
    }
}

fn ceil_secs(duration: Duration) -> u64 {
    duration.as_secs() + u64::from(duration.subsec_nanos() > 0)
}

/// Assembles a coordinator, filling unset collaborators with defaults.
pub struct CoordinatorBuilder {
    config: CoordinatorConfig,
    transport: Option<Arc<dyn Transport>>,
    credentials: Option<Arc<dyn CredentialStore>>,
    cache: Option<Arc<dyn CacheStore>>,
    clock: Option<Arc<dyn Clock>>,
    state: Option<Arc<CoordinatorState>>,
}

impl CoordinatorBuilder {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            config,
            transport: None,
            credentials: None,
            cache: None,
            clock: None,
            state: None,
        }
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn credentials(mut self, credentials: Arc<dyn CredentialStore>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Share existing state; credentials, cache and clock then come from it.
    pub fn state(mut self, state: Arc<CoordinatorState>) -> Self {
        self.state = Some(state);
        self
    }

    pub fn build(self) -> Result<RequestCoordinator> {
        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new(&self.config)?),
        };

        let state = match self.state {
            Some(state) => state,
            None => {
                let cache: Arc<dyn CacheStore> = match (self.cache, &self.config.cache_dir) {
                    (Some(cache), _) => cache,
                    (None, Some(dir)) => Arc::new(DiskStore::new(dir.clone())),
                    (None, None) => Arc::new(MemoryStore::with_capacity(
                        self.config.memory_cache_capacity,
                    )),
                };
                let credentials: Arc<dyn CredentialStore> = match self.credentials {
                    Some(credentials) => credentials,
                    None => Arc::new(InMemoryCredentials::default()),
                };
                let clock: Arc<dyn Clock> = match self.clock {
                    Some(clock) => clock,
                    None => Arc::new(SystemClock),
                };
                Arc::new(CoordinatorState::new(&self.config, cache, credentials, clock))
            }
        };

        let invalidation =
            InvalidationEngine::new(state.cache.clone(), self.config.invalidation_rules.clone());

        Ok(RequestCoordinator {
            inner: Arc::new(Inner {
                config: self.config,
                transport,
                state,
                invalidation,
            }),
        })
    }
}

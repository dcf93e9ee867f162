// Cache store contract and entry type.
// Stores answer lookups synchronously and never fail a read.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::elapsed_since;

use super::key::{RequestContext, RequestKey};

/// Default TTL for cached responses: 5 minutes.
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

/// A cached response with its freshness metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: RequestKey,
    /// Endpoint the value was fetched from, used for prefix invalidation.
    pub endpoint: String,
    pub value: Value,
    pub stored_at: DateTime<Utc>,
    pub ttl_ms: u64,
    pub context: RequestContext,
}

impl CacheEntry {
    pub fn new(
        key: RequestKey,
        endpoint: impl Into<String>,
        value: Value,
        stored_at: DateTime<Utc>,
        ttl: Duration,
        context: RequestContext,
    ) -> Self {
        Self {
            key,
            endpoint: endpoint.into(),
            value,
            stored_at,
            ttl_ms: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
            context,
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        elapsed_since(now, self.stored_at)
    }

    /// Fresh iff `now - stored_at <= ttl`.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.age(now) <= self.ttl()
    }

    /// Acceptable when older data is tolerated for up to `stale_window` past the TTL.
    pub fn is_within(&self, now: DateTime<Utc>, stale_window: Duration) -> bool {
        self.age(now) <= self.ttl().saturating_add(stale_window)
    }
}

/// Key/value store holding cached responses.
///
/// Implementations own their eviction policy; every operation is idempotent
/// and safe to call with keys that were never set.
pub trait CacheStore: Send + Sync {
    /// Look up an entry. Staleness is judged by the caller from `stored_at`.
    fn get(&self, key: &RequestKey) -> Option<CacheEntry>;

    /// Insert or overwrite an entry.
    fn set(&self, entry: CacheEntry);

    /// Delete every entry the predicate selects, returning how many went.
    fn delete_where(&self, predicate: &dyn Fn(&CacheEntry) -> bool) -> usize;

    fn clear_all(&self);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove(&self, key: &RequestKey) -> usize {
        self.delete_where(&|entry| &entry.key == key)
    }

    /// Delete entries whose endpoint lies under `prefix`, see [`is_under_prefix`].
    fn delete_by_prefix(&self, prefix: &str) -> usize {
        self.delete_where(&|entry| is_under_prefix(&entry.endpoint, prefix))
    }

    /// Delete entries whose context matches every field set in `filter`.
    /// An empty filter deletes nothing; use `clear_all` for that.
    fn delete_by_context(&self, filter: &RequestContext) -> usize {
        if filter.is_empty() {
            return 0;
        }
        self.delete_where(&|entry| entry.context.matches(filter))
    }

    /// Delete entries under `prefix` whose context matches `filter`.
    fn delete_matching(&self, prefix: &str, filter: &RequestContext) -> usize {
        self.delete_where(&|entry| {
            is_under_prefix(&entry.endpoint, prefix) && entry.context.matches(filter)
        })
    }
}

/// True when `endpoint` equals `prefix` or continues it at a path segment.
///
/// `/things` covers `/things`, `/things/1` and `/things?page=2`, not `/thingsettings`.
/// A prefix ending in `/` covers anything below it.
pub fn is_under_prefix(endpoint: &str, prefix: &str) -> bool {
    match endpoint.strip_prefix(prefix) {
        Some(rest) => {
            prefix.is_empty()
                || prefix.ends_with('/')
                || rest.is_empty()
                || rest.starts_with(['/', '?'])
        }
        None => false,
    }
}

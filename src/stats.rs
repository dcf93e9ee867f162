// Coordinator metrics.
// Counters for cache, network and invalidation activity.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Point-in-time copy of the coordinator counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Requests actually sent to the transport, retries included.
    pub network_requests: u64,
    /// Reads answered by a fresh cache entry.
    pub cache_hits: u64,
    /// Reads answered by a stale entry during a rate-limit pause or cooldown.
    pub stale_hits: u64,
    /// Reads that joined an in-flight request.
    pub joined: u64,
    pub rate_limited: u64,
    pub background_revalidations: u64,
    pub invalidated_entries: u64,
    pub errors: u64,
}

#[derive(Debug, Default)]
pub struct CoordinatorStats {
    network_requests: AtomicU64,
    cache_hits: AtomicU64,
    stale_hits: AtomicU64,
    joined: AtomicU64,
    rate_limited: AtomicU64,
    background_revalidations: AtomicU64,
    invalidated_entries: AtomicU64,
    errors: AtomicU64,
}

impl CoordinatorStats {
    pub fn record_network_request(&self) {
        self.network_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_hit(&self) {
        self.stale_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_joined(&self) {
        self.joined.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_background_revalidation(&self) {
        self.background_revalidations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalidated(&self, entries: usize) {
        self.invalidated_entries
            .fetch_add(entries as u64, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            network_requests: self.network_requests.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            stale_hits: self.stale_hits.load(Ordering::Relaxed),
            joined: self.joined.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            background_revalidations: self.background_revalidations.load(Ordering::Relaxed),
            invalidated_entries: self.invalidated_entries.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.network_requests,
            &self.cache_hits,
            &self.stale_hits,
            &self.joined,
            &self.rate_limited,
            &self.background_revalidations,
            &self.invalidated_entries,
            &self.errors,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_and_reset() {
        let stats = CoordinatorStats::default();
        stats.record_cache_hit();
        stats.record_cache_hit();
        stats.record_invalidated(3);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.cache_hits, 2);
        assert_eq!(snapshot.invalidated_entries, 3);

        stats.reset();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }
}

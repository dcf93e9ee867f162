// In-memory cache store.
// Bounded map that evicts the oldest entry once capacity is reached.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::key::RequestKey;
use super::store::{CacheEntry, CacheStore};

/// Mutex-guarded map store. A capacity of zero means unbounded.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<RequestKey, CacheEntry>>,
    capacity: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::with_capacity(capacity.min(1024))),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RequestKey, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CacheStore for MemoryStore {
    fn get(&self, key: &RequestKey) -> Option<CacheEntry> {
        self.lock().get(key).cloned()
    }

    fn set(&self, entry: CacheEntry) {
        let mut entries = self.lock();
        if self.capacity > 0 && !entries.contains_key(&entry.key) && entries.len() >= self.capacity
        {
            let oldest = entries
                .values()
                .min_by_key(|e| e.stored_at)
                .map(|e| e.key.clone());
            if let Some(oldest) = oldest {
                tracing::debug!(key = %oldest, "evicting oldest cache entry");
                entries.remove(&oldest);
            }
        }
        entries.insert(entry.key.clone(), entry);
    }

    fn delete_where(&self, predicate: &dyn Fn(&CacheEntry) -> bool) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| !predicate(entry));
        before - entries.len()
    }

    fn clear_all(&self) {
        self.lock().clear();
    }

    fn len(&self) -> usize {
        self.lock().len()
    }
}

// Per-key cooldown for new network attempts.
// Marks expire lazily; an expired mark never blocks an attempt.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::cache::RequestKey;
use crate::clock::{Clock, elapsed_since};

/// Default minimum spacing between attempts for the same key.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(1);

/// Marks are pruned once the map grows past this many keys.
const PRUNE_THRESHOLD: usize = 256;

#[derive(Debug)]
pub struct CooldownGuard {
    window: Duration,
    clock: Arc<dyn Clock>,
    marks: Mutex<HashMap<RequestKey, DateTime<Utc>>>,
}

impl CooldownGuard {
    pub fn new(window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            window,
            clock,
            marks: Mutex::new(HashMap::new()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RequestKey, DateTime<Utc>>> {
        self.marks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record an attempt for `key` unless one happened inside the window.
    pub fn try_begin(&self, key: &RequestKey) -> bool {
        let now = self.clock.now();
        let mut marks = self.lock();

        if let Some(last) = marks.get(key) {
            if elapsed_since(now, *last) < self.window {
                return false;
            }
        }

        if marks.len() >= PRUNE_THRESHOLD {
            let window = self.window;
            marks.retain(|_, at| elapsed_since(now, *at) < window);
        }
        marks.insert(key.clone(), now);
        true
    }

    /// Whether a new attempt for `key` would currently be refused.
    pub fn is_cooling(&self, key: &RequestKey) -> bool {
        let now = self.clock.now();
        self.lock()
            .get(key)
            .is_some_and(|last| elapsed_since(now, *last) < self.window)
    }

    pub fn reset(&self) {
        self.lock().clear();
    }
}

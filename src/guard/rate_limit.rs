// Global pause gate for server overload signals.
// A 429 from any endpoint pauses every outbound request from the coordinator.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::clock::{Clock, elapsed_since};

/// Backoff used when the server gives no retry hint.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(30);

/// Upper bound on any single pause.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(10 * 60);

#[derive(Debug)]
pub struct RateLimitGuard {
    clock: Arc<dyn Clock>,
    default_backoff: Duration,
    max_backoff: Duration,
    paused_until: Mutex<Option<DateTime<Utc>>>,
}

impl RateLimitGuard {
    pub fn new(clock: Arc<dyn Clock>, default_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            clock,
            default_backoff,
            max_backoff,
            paused_until: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<DateTime<Utc>>> {
        self.paused_until
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// True while the pause deadline lies ahead. Clears an expired deadline.
    pub fn is_paused(&self) -> bool {
        let now = self.clock.now();
        let mut paused_until = self.lock();
        match *paused_until {
            Some(until) if now < until => true,
            Some(_) => {
                tracing::info!("rate limit pause expired, resuming requests");
                *paused_until = None;
                false
            }
            None => false,
        }
    }

    /// Pause all requests for `retry_after`, or the default backoff.
    /// A later deadline already in place is kept.
    pub fn trip(&self, retry_after: Option<Duration>) -> Duration {
        let backoff = retry_after
            .unwrap_or(self.default_backoff)
            .min(self.max_backoff);
        let now = self.clock.now();
        let until = chrono::Duration::from_std(backoff)
            .ok()
            .and_then(|delta| now.checked_add_signed(delta))
            .unwrap_or(now);

        let mut paused_until = self.lock();
        let deadline = match *paused_until {
            Some(existing) if existing > until => existing,
            _ => until,
        };
        *paused_until = Some(deadline);
        tracing::warn!(
            backoff_secs = backoff.as_secs(),
            until = %deadline,
            "server signalled overload, pausing requests"
        );
        elapsed_since(deadline, now)
    }

    pub fn paused_until(&self) -> Option<DateTime<Utc>> {
        *self.lock()
    }

    /// Time left on the current pause, zero when not paused.
    pub fn remaining(&self) -> Duration {
        let now = self.clock.now();
        self.lock()
            .map(|until| elapsed_since(until, now))
            .unwrap_or(Duration::ZERO)
    }

    pub fn reset(&self) {
        *self.lock() = None;
    }
}

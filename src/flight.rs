// Single-flight registry for in-progress requests.
// At most one network call runs per key; every joiner shares its outcome.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde_json::Value;

use crate::cache::RequestKey;
use crate::error::{FetchError, Result};

/// Cloneable handle to an in-progress request.
pub type SharedFlight = Shared<BoxFuture<'static, Result<Value>>>;

/// How a caller attached to a flight.
pub enum Flight {
    /// This caller started the network call.
    Started(SharedFlight),
    /// Another caller had already started it.
    Joined(SharedFlight),
}

impl Flight {
    pub fn is_joined(&self) -> bool {
        matches!(self, Flight::Joined(_))
    }

    pub fn into_future(self) -> SharedFlight {
        match self {
            Flight::Started(shared) | Flight::Joined(shared) => shared,
        }
    }
}

#[derive(Default)]
struct Flights {
    next_id: u64,
    entries: HashMap<RequestKey, (u64, SharedFlight)>,
}

#[derive(Clone, Default)]
pub struct PendingRequestRegistry {
    flights: Arc<Mutex<Flights>>,
}

impl std::fmt::Debug for PendingRequestRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequestRegistry")
            .field("in_flight", &self.len())
            .finish()
    }
}

impl PendingRequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Flights> {
        self.flights.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The in-progress flight for `key`, if any.
    pub fn get(&self, key: &RequestKey) -> Option<SharedFlight> {
        self.lock()
            .entries
            .get(key)
            .map(|(_, shared)| shared.clone())
    }

    pub fn contains(&self, key: &RequestKey) -> bool {
        self.lock().entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Join the flight for `key`, or start one from `factory`.
    ///
    /// The future runs on its own task, so dropping every handle does not
    /// cancel it. Its registration is removed once it settles, whether it
    /// succeeds, fails or panics. `factory` runs under the registry lock and
    /// must only build the future.
    pub fn join_or_start<F, Fut>(&self, key: &RequestKey, factory: F) -> Flight
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let mut flights = self.lock();
        if let Some((_, shared)) = flights.entries.get(key) {
            tracing::debug!(key = %key, "joining in-flight request");
            return Flight::Joined(shared.clone());
        }

        let id = flights.next_id;
        flights.next_id = flights.next_id.wrapping_add(1);

        let operation = factory();
        let cleanup = FlightCleanup {
            registry: self.clone(),
            key: key.clone(),
            id,
        };
        // The lock is still held, so the task cannot settle before the
        // registration below is in place.
        let handle = tokio::spawn(async move {
            let _cleanup = cleanup;
            operation.await
        });

        let shared = async move {
            handle.await.unwrap_or_else(|err| {
                Err(FetchError::Transport(format!("request task failed: {err}")))
            })
        }
        .boxed()
        .shared();

        flights.entries.insert(key.clone(), (id, shared.clone()));
        Flight::Started(shared)
    }

    /// Forget every registration. Running tasks still complete.
    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    fn release(&self, key: &RequestKey, id: u64) {
        let mut flights = self.lock();
        if flights
            .entries
            .get(key)
            .is_some_and(|(current, _)| *current == id)
        {
            flights.entries.remove(key);
        }
    }
}

/// Removes a flight's registration when its task finishes or unwinds.
struct FlightCleanup {
    registry: PendingRequestRegistry,
    key: RequestKey,
    id: u64,
}

impl Drop for FlightCleanup {
    fn drop(&mut self) {
        self.registry.release(&self.key, self.id);
    }
}

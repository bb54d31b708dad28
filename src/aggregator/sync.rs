//! Per-key serialization primitives
//!
//! [`KeyedLocks`] hands out one async mutex per key so operations on one
//! server id are serialized while different ids never block each other.
//! [`SingleFlight`] collapses concurrent calls for one key into a single
//! execution whose result every caller shares.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// One async mutex per key.
#[derive(Debug, Default, Clone)]
pub struct KeyedLocks {
    locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for and take the lock for `key`.
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
            Arc::clone(locks.entry(key.to_string()).or_default())
        };
        mutex.lock_owned().await
    }

    /// Forget the lock for `key`. Holders of a guard keep their mutex alive.
    pub fn forget(&self, key: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        locks.remove(key);
    }
}

type Flight<T> = Shared<BoxFuture<'static, Option<T>>>;

/// Deduplicates concurrent executions per key.
///
/// Each run executes on its own task, so it finishes and leaves the map even
/// when every caller waiting on it has been dropped.
pub struct SingleFlight<T: Clone> {
    inflight: Arc<Mutex<HashMap<String, Flight<T>>>>,
}

impl<T: Clone> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<T: Clone> std::fmt::Debug for SingleFlight<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys: Vec<String> = self
            .inflight
            .lock()
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        f.debug_struct("SingleFlight").field("inflight", &keys).finish()
    }
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `make()` for `key` unless a run is already in flight, in which
    /// case wait for that run and return its result. `make` is only called
    /// when a new run starts.
    ///
    /// Returns `None` if the run panicked or the runtime aborted it.
    pub async fn run<F, Fut>(&self, key: &str, make: F) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let flight = {
            let mut inflight = self.inflight.lock().unwrap_or_else(|p| p.into_inner());
            match inflight.get(key) {
                Some(existing) => existing.clone(),
                None => {
                    let work = make();
                    let registry = Arc::clone(&self.inflight);
                    let owned_key = key.to_string();
                    let handle = tokio::spawn(async move {
                        let out = work.await;
                        registry
                            .lock()
                            .unwrap_or_else(|p| p.into_inner())
                            .remove(&owned_key);
                        out
                    });
                    let flight = handle.map(|joined| joined.ok()).boxed().shared();
                    inflight.insert(key.to_string(), flight.clone());
                    flight
                }
            }
        };
        flight.await
    }

    /// Whether a run for `key` is currently in flight.
    pub fn is_in_flight(&self, key: &str) -> bool {
        self.inflight
            .lock()
            .map(|m| m.contains_key(key))
            .unwrap_or(false)
    }
}

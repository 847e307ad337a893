//! Coalesce concurrent work for the same key into a single execution.
//!
//! The first caller for a key runs the operation; callers arriving while it is
//! in flight subscribe and receive the same result. Errors are shared as
//! `DaemonError::Shared` so every waiter sees the original kind.

use crate::error::DaemonError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::broadcast;

type Shared<V> = Result<Arc<V>, Arc<DaemonError>>;

pub struct SingleFlight<K, V> {
    in_flight: Mutex<HashMap<K, broadcast::Sender<Shared<V>>>>,
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Hash + Eq + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Removes the in-flight entry if the executing future is dropped early, so
/// waiters see a closed channel instead of hanging.
struct Leader<'a, K: Hash + Eq, V> {
    map: &'a Mutex<HashMap<K, broadcast::Sender<Shared<V>>>>,
    key: Option<K>,
}

impl<K: Hash + Eq, V> Leader<'_, K, V> {
    fn finish(mut self, result: Shared<V>) {
        if let Some(key) = self.key.take() {
            if let Some(tx) = self.map.lock().remove(&key) {
                let _ = tx.send(result);
            }
        }
    }
}

impl<K: Hash + Eq, V> Drop for Leader<'_, K, V> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.map.lock().remove(&key);
        }
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Hash + Eq + Clone,
{
    pub fn new() -> Self {
        Self {
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Run `f` for `key` unless a run is already in flight, in which case wait
    /// for that run's result.
    pub async fn execute<F, Fut>(&self, key: K, f: F) -> Result<Arc<V>, DaemonError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, DaemonError>>,
    {
        let waiter = {
            let mut guard = self.in_flight.lock();
            match guard.get(&key) {
                Some(tx) => Some(tx.subscribe()),
                None => {
                    // capacity 1: exactly one result is ever sent
                    let (tx, _) = broadcast::channel(1);
                    guard.insert(key.clone(), tx);
                    None
                }
            }
        };

        if let Some(mut rx) = waiter {
            return match rx.recv().await {
                Ok(Ok(v)) => Ok(v),
                Ok(Err(e)) => Err(DaemonError::Shared(e)),
                Err(_) => Err(DaemonError::Fault(
                    "in-flight operation abandoned".to_string(),
                )),
            };
        }

        let leader = Leader {
            map: &self.in_flight,
            key: Some(key),
        };
        let result: Shared<V> = f().await.map(Arc::new).map_err(Arc::new);
        leader.finish(result.clone());
        result.map_err(DaemonError::Shared)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }
}

// ============================================================================
// Single-flight helpers
// ============================================================================
//
// `OnceMap` publishes values built synchronously (metadata, rendered
// statements): readers take a shared lock only, builders serialize per key.
// `SingleFlight` collapses concurrent async work for the same key (statement
// prepare) into one future whose result every waiter receives.
//
// ============================================================================

use super::Result;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

pub struct OnceMap<K, V> {
    values: RwLock<HashMap<K, V>>,
    gates: Mutex<HashMap<K, Arc<Mutex<()>>>>,
}

impl<K, V> Default for OnceMap<K, V> {
    fn default() -> Self {
        Self {
            values: RwLock::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> OnceMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.values.read().ok()?.get(key).cloned()
    }

    /// Returns the published value for `key`, building it with `build` if
    /// absent. Concurrent callers for the same key wait for the first builder.
    /// A failed build publishes nothing; the next caller retries.
    pub fn get_or_try_insert<F>(&self, key: &K, build: F) -> Result<V>
    where
        F: FnOnce() -> Result<V>,
    {
        if let Some(value) = self.get(key) {
            return Ok(value);
        }

        let gate = {
            let mut gates = self.gates.lock()?;
            gates.entry(key.clone()).or_default().clone()
        };
        let _guard = gate.lock()?;

        if let Some(value) = self.get(key) {
            return Ok(value);
        }

        let value = build()?;
        self.values.write()?.insert(key.clone(), value.clone());
        self.gates.lock()?.remove(key);
        Ok(value)
    }

    pub fn len(&self) -> usize {
        self.values.read().map(|values| values.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut values) = self.values.write() {
            values.clear();
        }
    }
}

type Flight<V> = Shared<BoxFuture<'static, Result<V>>>;

pub struct SingleFlight<K, V> {
    calls: Mutex<HashMap<K, (u64, Flight<V>)>>,
    generation: AtomicU64,
}

impl<K, V> Default for SingleFlight<K, V> {
    fn default() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `work` unless a call for `key` is already in flight, in which case
    /// the caller joins it.
    pub async fn run<F, Fut>(&self, key: K, work: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let (generation, flight) = {
            let mut calls = self.calls.lock()?;
            match calls.get(&key) {
                Some((generation, flight)) => (*generation, flight.clone()),
                None => {
                    let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                    let flight = work().boxed().shared();
                    calls.insert(key.clone(), (generation, flight.clone()));
                    (generation, flight)
                }
            }
        };

        let result = flight.await;

        if let Ok(mut calls) = self.calls.lock() {
            if calls.get(&key).is_some_and(|(current, _)| *current == generation) {
                calls.remove(&key);
            }
        }
        result
    }

    pub fn in_flight(&self) -> usize {
        self.calls.lock().map(|calls| calls.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_once_map_builds_once() {
        let map: OnceMap<&'static str, Arc<String>> = OnceMap::new();
        let builds = AtomicUsize::new(0);

        for _ in 0..3 {
            let value = map
                .get_or_try_insert(&"users", || {
                    builds.fetch_add(1, Ordering::SeqCst);
                    Ok(Arc::new("users".to_string()))
                })
                .unwrap();
            assert_eq!(value.as_str(), "users");
        }

        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_once_map_failure_not_published() {
        let map: OnceMap<u8, u8> = OnceMap::new();
        let failed = map.get_or_try_insert(&1, || Err(crate::DacError::TransactionAbsent));
        assert!(failed.is_err());
        assert_eq!(map.get_or_try_insert(&1, || Ok(9)).unwrap(), 9);
    }

    #[tokio::test]
    async fn test_single_flight_collapses_concurrent_calls() {
        let flight: Arc<SingleFlight<String, usize>> = Arc::new(SingleFlight::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let flight = flight.clone();
            let runs = runs.clone();
            handles.push(tokio::spawn(async move {
                flight
                    .run("SELECT 1".to_string(), || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(7)
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 7);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(flight.in_flight(), 0);
    }
}

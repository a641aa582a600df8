//! Single-flight memoization
//!
//! One load runs per key at a time. Later callers for the same key await a
//! shared handle to the running load instead of starting another. The load
//! runs on its own task, so a caller that gives up (drops its future) does not
//! cancel it for the others.
//!
//! Completed values live in a read-mostly map; failures are handed to every
//! waiter and then forgotten, so the next call tries again.

use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::{Mutex, RwLock};
use tracing::trace;

use crate::error::{Result, SchemaError};

type SharedLoad<V> = Shared<BoxFuture<'static, Result<V>>>;

struct Inner<K, V> {
    completed: RwLock<HashMap<K, V>>,
    /// key -> (generation, running load)
    in_flight: Mutex<HashMap<K, (u64, SharedLoad<V>)>>,
    generation: AtomicU64,
}

/// A memoizing map where each missing key is loaded exactly once
pub struct SingleFlight<K, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Clone for SingleFlight<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                completed: RwLock::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Completed value for `key`, without loading
    pub async fn get(&self, key: &K) -> Option<V> {
        self.inner.completed.read().await.get(key).cloned()
    }

    pub async fn insert(&self, key: K, value: V) {
        self.inner.completed.write().await.insert(key, value);
    }

    /// Store `value` only if `keep` still holds once the map is locked.
    pub async fn insert_if<F>(&self, key: K, value: V, keep: F) -> bool
    where
        F: FnOnce() -> bool,
    {
        let mut completed = self.inner.completed.write().await;
        if !keep() {
            return false;
        }
        completed.insert(key, value);
        true
    }

    /// Forget `key`. A load still running for it will not be stored.
    pub async fn remove(&self, key: &K) -> Option<V> {
        let mut in_flight = self.inner.in_flight.lock().await;
        in_flight.remove(key);
        let removed = self.inner.completed.write().await.remove(key);
        removed
    }

    /// Detach every running load. Current waiters still get their results,
    /// but none of them is stored and the next call loads again.
    pub async fn forget_in_flight(&self) {
        self.inner.in_flight.lock().await.clear();
    }

    /// Keep only the completed entries for which `keep` returns true
    pub async fn retain<F>(&self, keep: F)
    where
        F: FnMut(&K, &mut V) -> bool,
    {
        self.inner.completed.write().await.retain(keep);
    }

    pub async fn len(&self) -> usize {
        self.inner.completed.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn keys(&self) -> Vec<K> {
        self.inner.completed.read().await.keys().cloned().collect()
    }

    /// Number of loads currently running
    pub async fn in_flight(&self) -> usize {
        self.inner.in_flight.lock().await.len()
    }

    /// Return the value for `key`, running `load` only if no value is cached
    /// and no load for `key` is already running.
    pub async fn get_or_load<F>(&self, key: K, load: F) -> Result<V>
    where
        F: Future<Output = Result<V>> + Send + 'static,
    {
        if let Some(value) = self.get(&key).await {
            trace!(key = ?key, "single-flight hit");
            return Ok(value);
        }

        let shared = {
            let mut in_flight = self.inner.in_flight.lock().await;
            if let Some(value) = self.inner.completed.read().await.get(&key) {
                return Ok(value.clone());
            }
            match in_flight.get(&key) {
                Some((_, running)) => {
                    trace!(key = ?key, "joining in-flight load");
                    running.clone()
                }
                None => {
                    let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
                    let shared = self.spawn_load(key.clone(), generation, load);
                    in_flight.insert(key, (generation, shared.clone()));
                    shared
                }
            }
        };

        shared.await
    }

    fn spawn_load<F>(&self, key: K, generation: u64, load: F) -> SharedLoad<V>
    where
        F: Future<Output = Result<V>> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let result = load.await;
            let mut in_flight = inner.in_flight.lock().await;
            let current = matches!(in_flight.get(&key), Some((g, _)) if *g == generation);
            if current {
                if let Ok(value) = &result {
                    inner.completed.write().await.insert(key.clone(), value.clone());
                }
                in_flight.remove(&key);
            }
            result
        });

        async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => Err(SchemaError::Internal(format!("load task failed: {}", e))),
            }
        }
        .boxed()
        .shared()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn counted(calls: &Arc<AtomicUsize>, value: u32, delay: Duration) -> impl Future<Output = Result<u32>> + Send + 'static {
        let calls = Arc::clone(calls);
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            Ok(value)
        }
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_load() {
        let flight: SingleFlight<u32, u32> = SingleFlight::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let flight = flight.clone();
            let load = counted(&calls, 42, Duration::from_millis(50));
            tasks.push(tokio::spawn(async move { flight.get_or_load(1, load).await }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(flight.get(&1).await, Some(42));
        assert_eq!(flight.in_flight().await, 0);
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let flight: SingleFlight<&'static str, u32> = SingleFlight::new();
        let err = flight
            .get_or_load("k", async { Err(SchemaError::RegistryUnavailable("down".into())) })
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(flight.get(&"k").await.is_none());
        assert_eq!(flight.get_or_load("k", async { Ok(7) }).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_cancelled_caller_does_not_poison_waiters() {
        let flight: SingleFlight<u32, u32> = SingleFlight::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let first = flight.get_or_load(5, counted(&calls, 9, Duration::from_millis(100)));
        let timed_out = tokio::time::timeout(Duration::from_millis(10), first).await;
        assert!(timed_out.is_err());

        let second = flight
            .get_or_load(5, counted(&calls, 0, Duration::ZERO))
            .await
            .unwrap();
        assert_eq!(second, 9);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_remove_discards_running_load() {
        let flight: SingleFlight<u32, u32> = SingleFlight::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let waiter = {
            let flight = flight.clone();
            let load = counted(&calls, 1, Duration::from_millis(50));
            tokio::spawn(async move { flight.get_or_load(3, load).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        flight.remove(&3).await;
        assert_eq!(waiter.await.unwrap().unwrap(), 1);
        assert!(flight.get(&3).await.is_none());
    }

    #[tokio::test]
    async fn test_insert_if_checks_condition() {
        let flight: SingleFlight<u32, u32> = SingleFlight::new();
        assert!(!flight.insert_if(1, 10, || false).await);
        assert!(flight.get(&1).await.is_none());
        assert!(flight.insert_if(1, 10, || true).await);
        assert_eq!(flight.get(&1).await, Some(10));
    }

    #[tokio::test]
    async fn test_forget_in_flight_detaches_every_load() {
        let flight: SingleFlight<u32, u32> = SingleFlight::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut waiters = Vec::new();
        for key in [1, 2] {
            let flight = flight.clone();
            let load = counted(&calls, key * 10, Duration::from_millis(50));
            waiters.push(tokio::spawn(async move { flight.get_or_load(key, load).await }));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(flight.in_flight().await, 2);

        flight.forget_in_flight().await;
        assert_eq!(flight.in_flight().await, 0);
        for waiter in waiters {
            waiter.await.unwrap().unwrap();
        }
        assert!(flight.is_empty().await);

        let again = flight
            .get_or_load(1, counted(&calls, 11, Duration::ZERO))
            .await
            .unwrap();
        assert_eq!(again, 11);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retain() {
        let flight: SingleFlight<u32, u32> = SingleFlight::new();
        flight.insert(1, 10).await;
        flight.insert(2, 20).await;
        flight.retain(|_, v| *v > 10).await;
        assert_eq!(flight.keys().await, vec![2]);
    }
}

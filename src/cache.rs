//! Single-flight response cache with TTL and LRU eviction.
//!
//! Keys are content fingerprints. Concurrent requests for the same missing
//! key coalesce onto one computation: the first caller computes, later
//! callers subscribe to a watch channel and receive the shared result.
//! Failures are never cached, and a cancelled computation releases its
//! waiters instead of wedging them.
//!
//! Expiry is lazy: an entry past its TTL is discarded on the next lookup.
//! When the cache is full, inserting evicts the least recently used ready
//! entry. In-flight computations are never evicted.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tokio::sync::watch;

use crate::error::{EngineError, Result};

/// Fingerprint for cache keys: SHA-256 over the content plus a salt that
/// invalidates entries when preparation settings change.
pub fn fingerprint(bytes: &[u8], salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.update([0u8]);
    hasher.update(salt.as_bytes());
    format!("{:x}", hasher.finalize())
}

enum FlightState<V> {
    Pending,
    Done(Arc<V>),
    Failed { detail: String, retryable: bool },
}

impl<V> Clone for FlightState<V> {
    fn clone(&self) -> Self {
        match self {
            Self::Pending => Self::Pending,
            Self::Done(v) => Self::Done(Arc::clone(v)),
            Self::Failed { detail, retryable } => Self::Failed {
                detail: detail.clone(),
                retryable: *retryable,
            },
        }
    }
}

enum Slot<V> {
    Ready {
        value: Arc<V>,
        inserted: Instant,
        last_used: u64,
    },
    InFlight(watch::Receiver<FlightState<V>>),
}

struct CacheState<V> {
    slots: HashMap<String, Slot<V>>,
    tick: u64,
}

pub struct ResponseCache<V> {
    state: Mutex<CacheState<V>>,
    ttl: Duration,
    capacity: usize,
}

enum Lookup<V> {
    Hit(Arc<V>),
    Wait(watch::Receiver<FlightState<V>>),
    Compute(watch::Sender<FlightState<V>>),
}

impl<V: Send + Sync + 'static> ResponseCache<V> {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            state: Mutex::new(CacheState {
                slots: HashMap::new(),
                tick: 0,
            }),
            ttl,
            capacity: capacity.max(1),
        }
    }

    /// Return the cached value for `key`, or run `compute` to produce it.
    ///
    /// Exactly one caller computes per missing key; the rest wait on the
    /// same result. If the computing caller fails or is cancelled, waiters
    /// are released with an error and the key is recomputable immediately.
    pub async fn get_or_compute<F, Fut>(&self, key: &str, compute: F) -> Result<Arc<V>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        match self.lookup(key) {
            Lookup::Hit(value) => Ok(value),
            Lookup::Wait(rx) => self.await_flight(rx).await,
            Lookup::Compute(tx) => {
                let guard = FlightGuard {
                    cache: self,
                    key: key.to_string(),
                    settled: false,
                };
                self.run_compute(guard, tx, compute).await
            }
        }
    }

    /// Number of ready entries (in-flight computations excluded).
    pub fn len(&self) -> usize {
        let state = self.state.lock().unwrap();
        state
            .slots
            .values()
            .filter(|s| matches!(s, Slot::Ready { .. }))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup(&self, key: &str) -> Lookup<V> {
        let mut state = self.state.lock().unwrap();
        state.tick += 1;
        let tick = state.tick;

        let mut expired = false;
        match state.slots.get_mut(key) {
            Some(Slot::Ready {
                value,
                inserted,
                last_used,
            }) => {
                if inserted.elapsed() <= self.ttl {
                    *last_used = tick;
                    return Lookup::Hit(Arc::clone(value));
                }
                expired = true;
            }
            Some(Slot::InFlight(rx)) => return Lookup::Wait(rx.clone()),
            None => {}
        }
        if expired {
            state.slots.remove(key);
        }

        let (tx, rx) = watch::channel(FlightState::Pending);
        state.slots.insert(key.to_string(), Slot::InFlight(rx));
        Lookup::Compute(tx)
    }

    async fn run_compute<F, Fut>(
        &self,
        mut guard: FlightGuard<'_, V>,
        tx: watch::Sender<FlightState<V>>,
        compute: F,
    ) -> Result<Arc<V>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        match compute().await {
            Ok(value) => {
                let value = Arc::new(value);
                guard.settle();
                self.insert_ready(&guard.key, Arc::clone(&value));
                let _ = tx.send(FlightState::Done(Arc::clone(&value)));
                Ok(value)
            }
            Err(e) => {
                guard.settle();
                self.remove(&guard.key);
                let _ = tx.send(FlightState::Failed {
                    detail: e.to_string(),
                    retryable: e.is_retryable(),
                });
                Err(e)
            }
        }
    }

    async fn await_flight(&self, mut rx: watch::Receiver<FlightState<V>>) -> Result<Arc<V>> {
        loop {
            let settled = rx.changed().await.is_err();
            let state = rx.borrow().clone();
            match state {
                FlightState::Done(value) => return Ok(value),
                FlightState::Failed { detail, retryable } => {
                    return Err(EngineError::Upstream { detail, retryable });
                }
                FlightState::Pending if settled => {
                    // Computing caller was dropped before finishing.
                    return Err(EngineError::Cancelled);
                }
                FlightState::Pending => continue,
            }
        }
    }

    fn insert_ready(&self, key: &str, value: Arc<V>) {
        let mut state = self.state.lock().unwrap();
        state.tick += 1;
        let tick = state.tick;

        let ready_count = state
            .slots
            .values()
            .filter(|s| matches!(s, Slot::Ready { .. }))
            .count();
        if ready_count >= self.capacity {
            let victim = state
                .slots
                .iter()
                .filter_map(|(k, s)| match s {
                    Slot::Ready { last_used, .. } => Some((*last_used, k.clone())),
                    Slot::InFlight(_) => None,
                })
                .min()
                .map(|(_, k)| k);
            if let Some(victim) = victim {
                state.slots.remove(&victim);
            }
        }

        state.slots.insert(
            key.to_string(),
            Slot::Ready {
                value,
                inserted: Instant::now(),
                last_used: tick,
            },
        );
    }

    fn remove(&self, key: &str) {
        let mut state = self.state.lock().unwrap();
        state.slots.remove(key);
    }
}

/// Removes the in-flight slot if the computation is dropped mid-way, so
/// cancellation never leaves a permanently pending key.
struct FlightGuard<'a, V> {
    cache: &'a ResponseCache<V>,
    key: String,
    settled: bool,
}

impl<V> FlightGuard<'_, V> {
    fn settle(&mut self) {
        self.settled = true;
    }
}

impl<V> Drop for FlightGuard<'_, V> {
    fn drop(&mut self) {
        if !self.settled {
            let mut state = self.cache.state.lock().unwrap();
            if matches!(state.slots.get(&self.key), Some(Slot::InFlight(_))) {
                state.slots.remove(&self.key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cache(ttl_ms: u64, capacity: usize) -> ResponseCache<String> {
        ResponseCache::new(Duration::from_millis(ttl_ms), capacity)
    }

    #[tokio::test]
    async fn computes_once_then_hits() {
        let cache = cache(60_000, 8);
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let value = cache
                .get_or_compute("k1", || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok("computed".to_string())
                })
                .await
                .unwrap();
            assert_eq!(*value, "computed");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn expired_entry_recomputed() {
        let cache = cache(20, 8);
        let calls = AtomicUsize::new(0);
        let compute = || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok("v".to_string()) }
        };

        cache.get_or_compute("k1", compute).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        cache.get_or_compute("k1", compute).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failures_not_cached() {
        let cache = cache(60_000, 8);

        let err = cache
            .get_or_compute("k1", || async {
                Err::<String, _>(EngineError::upstream("boom"))
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "upstream");
        assert_eq!(cache.len(), 0);

        let value = cache
            .get_or_compute("k1", || async { Ok("recovered".to_string()) })
            .await
            .unwrap();
        assert_eq!(*value, "recovered");
    }

    #[tokio::test]
    async fn concurrent_requests_coalesce() {
        let cache = Arc::new(cache(60_000, 8));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute("k1", || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Ok("shared".to_string())
                    })
                    .await
                    .unwrap()
            }));
        }

        for handle in handles {
            assert_eq!(*handle.await.unwrap(), "shared");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_compute_releases_waiters() {
        let cache = Arc::new(cache(60_000, 8));

        let computing = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                cache
                    .get_or_compute("k1", || async {
                        futures::future::pending::<()>().await;
                        Ok("never".to_string())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let waiter = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.get_or_compute("k1", || async { unreachable!() }).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        computing.abort();
        let err = waiter.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), "cancelled");

        // The key is recomputable right away.
        let value = cache
            .get_or_compute("k1", || async { Ok("fresh".to_string()) })
            .await
            .unwrap();
        assert_eq!(*value, "fresh");
    }

    #[tokio::test]
    async fn lru_eviction_at_capacity() {
        let cache = cache(60_000, 2);
        let calls = AtomicUsize::new(0);
        let compute = |v: &'static str| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok(v.to_string()) }
        };

        cache.get_or_compute("a", || compute("a")).await.unwrap();
        cache.get_or_compute("b", || compute("b")).await.unwrap();
        // Touch "a" so "b" becomes least recently used.
        cache.get_or_compute("a", || compute("a")).await.unwrap();
        cache.get_or_compute("c", || compute("c")).await.unwrap();
        assert_eq!(cache.len(), 2);

        // "a" survived, "b" was evicted.
        cache.get_or_compute("a", || compute("a")).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        cache.get_or_compute("b", || compute("b")).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn fingerprint_depends_on_salt() {
        let a = fingerprint(b"same bytes", "salt-1");
        let b = fingerprint(b"same bytes", "salt-2");
        assert_ne!(a, b);
        assert_eq!(a, fingerprint(b"same bytes", "salt-1"));
    }
}

//! Request-scoped result cache
//!
//! [`ResultCache`] memoizes an async computation by key, bounded by entry
//! count (least-recently-used eviction) and by age (lazy TTL expiry).
//! Concurrent misses on the same key share a single computation.
//!
//! The backing store is pluggable through [`CacheStore`]. A store that
//! reports [`CacheUnavailable`] turns the call into a forced miss: the
//! value is computed fresh and not stored.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tokio::time::Instant;

use crate::error::CacheUnavailable;

/// A cached value with its timestamps
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub inserted_at: Instant,
    pub last_access: Instant,
}

impl<V> CacheEntry<V> {
    fn new(value: V, now: Instant) -> Self {
        Self {
            value,
            inserted_at: now,
            last_access: now,
        }
    }

    /// Whether the entry's age has reached `ttl`
    pub fn is_expired(&self, ttl: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted_at) >= ttl
    }
}

/// Outcome of a store lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<V> {
    /// A live value
    Hit(V),
    /// Nothing stored under the key
    Miss,
    /// An entry was found past its TTL and removed
    Expired,
}

impl<V> Lookup<V> {
    pub fn into_value(self) -> Option<V> {
        match self {
            Self::Hit(value) => Some(value),
            Self::Miss | Self::Expired => None,
        }
    }
}

/// Storage behind a [`ResultCache`]
///
/// Implementations must make each call atomic with respect to other
/// callers; a reader never sees a partially written entry.
pub trait CacheStore<K, V>: Send + Sync {
    /// Live value for `key`, refreshing its recency; expired entries are dropped
    fn get(&self, key: &K, now: Instant) -> Result<Lookup<V>, CacheUnavailable>;

    /// Store a value, returning how many entries were evicted to make room
    fn insert(&self, key: K, value: V, now: Instant) -> Result<usize, CacheUnavailable>;

    /// Drop every expired entry, returning how many were removed
    fn purge_expired(&self, now: Instant) -> Result<usize, CacheUnavailable>;

    /// Number of stored entries (expired ones included until purged)
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn clear(&self);
}

/// In-memory LRU store with lazy TTL expiry
pub struct LruStore<K: Hash + Eq, V> {
    entries: Mutex<LruCache<K, CacheEntry<V>>>,
    ttl: Duration,
}

impl<K: Hash + Eq, V> LruStore<K, V> {
    pub fn new(maxsize: NonZeroUsize, ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(maxsize)),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn capacity(&self) -> usize {
        self.entries.lock().cap().get()
    }
}

impl<K, V> CacheStore<K, V> for LruStore<K, V>
where
    K: Hash + Eq + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    fn get(&self, key: &K, now: Instant) -> Result<Lookup<V>, CacheUnavailable> {
        let mut entries = self.entries.lock();
        let expired = match entries.peek(key) {
            Some(entry) => entry.is_expired(self.ttl, now),
            None => return Ok(Lookup::Miss),
        };
        if expired {
            entries.pop(key);
            return Ok(Lookup::Expired);
        }
        Ok(match entries.get_mut(key) {
            Some(entry) => {
                entry.last_access = now;
                Lookup::Hit(entry.value.clone())
            }
            None => Lookup::Miss,
        })
    }

    fn insert(&self, key: K, value: V, now: Instant) -> Result<usize, CacheUnavailable> {
        if self.ttl.is_zero() {
            return Ok(0);
        }

        let mut entries = self.entries.lock();
        let mut evicted = 0;
        if entries.len() >= entries.cap().get() && !entries.contains(&key) {
            evicted += purge_locked(&mut entries, self.ttl, now);
        }
        if let Some((old_key, _)) = entries.push(key.clone(), CacheEntry::new(value, now)) {
            if old_key != key {
                evicted += 1;
            }
        }
        Ok(evicted)
    }

    fn purge_expired(&self, now: Instant) -> Result<usize, CacheUnavailable> {
        let mut entries = self.entries.lock();
        Ok(purge_locked(&mut entries, self.ttl, now))
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }

    fn clear(&self) {
        self.entries.lock().clear();
    }
}

fn purge_locked<K: Hash + Eq + Clone, V>(
    entries: &mut LruCache<K, CacheEntry<V>>,
    ttl: Duration,
    now: Instant,
) -> usize {
    let expired: Vec<K> = entries
        .iter()
        .filter(|(_, entry)| entry.is_expired(ttl, now))
        .map(|(key, _)| key.clone())
        .collect();
    for key in &expired {
        entries.pop(key);
    }
    expired.len()
}

/// Counters describing cache behaviour
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Calls answered without running `compute`
    pub hits: u64,
    /// Calls that ran `compute`
    pub misses: u64,
    /// Entries evicted to respect `maxsize` or because they expired
    pub evictions: u64,
    /// Calls that bypassed an unavailable store
    pub degraded: u64,
    /// Entries currently stored
    pub entries: usize,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    degraded: AtomicU64,
}

/// Key-based memoization of an async computation
///
/// One instance is shared by every concurrent caller of a service.
pub struct ResultCache<K, V> {
    store: Arc<dyn CacheStore<K, V>>,
    inflight: Mutex<HashMap<K, Arc<OnceCell<V>>>>,
    counters: Counters,
}

/// A caller's registration in the in-flight map
///
/// Dropping it (normal return, error or cancellation) removes the cell
/// once it holds a value or no other caller is waiting on it.
struct Flight<'a, K: Hash + Eq, V> {
    inflight: &'a Mutex<HashMap<K, Arc<OnceCell<V>>>>,
    key: K,
    cell: Option<Arc<OnceCell<V>>>,
}

impl<K: Hash + Eq, V> Flight<'_, K, V> {
    fn cell(&self) -> Option<&OnceCell<V>> {
        self.cell.as_deref()
    }
}

impl<K: Hash + Eq, V> Drop for Flight<'_, K, V> {
    fn drop(&mut self) {
        let mut inflight = self.inflight.lock();
        // Released under the lock so the count below is exact
        let Some(cell) = self.cell.take() else {
            return;
        };
        let registered = inflight.get(&self.key).is_some_and(|c| Arc::ptr_eq(c, &cell));
        // One reference is the map's, one is ours
        let last_waiter = Arc::strong_count(&cell) <= 2;
        if registered && (cell.initialized() || last_waiter) {
            inflight.remove(&self.key);
        }
        drop(cell);
    }
}

impl<K, V> ResultCache<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create a cache holding at most `maxsize` entries for `ttl` each.
    ///
    /// A zero `maxsize` is treated as 1; a zero `ttl` disables storage.
    pub fn new(maxsize: usize, ttl: Duration) -> Self {
        let maxsize = NonZeroUsize::new(maxsize).unwrap_or(NonZeroUsize::MIN);
        Self::with_store(Arc::new(LruStore::new(maxsize, ttl)))
    }

    /// Create a cache over a custom backing store
    pub fn with_store(store: Arc<dyn CacheStore<K, V>>) -> Self {
        Self {
            store,
            inflight: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    /// Return the live value for `key`, or run `compute` and store its result.
    ///
    /// Errors from `compute` are returned to the caller and never cached.
    pub async fn get_or_compute<F, Fut, E>(&self, key: K, compute: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        match self.lookup(&key) {
            Ok(Some(value)) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(value);
            }
            Ok(None) => {}
            Err(e) => {
                log::warn!("{}; computing without cache", e);
                self.counters.degraded.fetch_add(1, Ordering::Relaxed);
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return compute().await;
            }
        }

        let flight = self.register(key.clone());

        // A leader may have stored and deregistered since the first lookup
        if let Ok(Some(value)) = self.lookup(&key) {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(value);
        }

        let Some(cell) = flight.cell() else {
            return compute().await;
        };

        let mut led = false;
        let outcome = cell
            .get_or_try_init(|| {
                led = true;
                let pending = compute();
                async move {
                    let value = pending.await?;
                    // Stored before waiters are released
                    self.store_value(key, &value);
                    Ok::<V, E>(value)
                }
            })
            .await
            .cloned();

        if led {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
        } else {
            // Another caller computed the value
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
        }
        outcome
    }

    /// Store lookup that records expiries as evictions
    fn lookup(&self, key: &K) -> Result<Option<V>, CacheUnavailable> {
        let found = self.store.get(key, Instant::now())?;
        if matches!(found, Lookup::Expired) {
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        }
        Ok(found.into_value())
    }

    fn register(&self, key: K) -> Flight<'_, K, V> {
        let cell = {
            let mut inflight = self.inflight.lock();
            Arc::clone(
                inflight
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(OnceCell::new())),
            )
        };
        Flight {
            inflight: &self.inflight,
            key,
            cell: Some(cell),
        }
    }

    fn store_value(&self, key: K, value: &V) {
        match self.store.insert(key, value.clone(), Instant::now()) {
            Ok(evicted) => {
                self.counters
                    .evictions
                    .fetch_add(evicted as u64, Ordering::Relaxed);
            }
            Err(e) => {
                log::warn!("{}; result not stored", e);
                self.counters.degraded.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    #[cfg(test)]
    fn inflight_len(&self) -> usize {
        self.inflight.lock().len()
    }

    /// Drop expired entries now instead of at lookup time
    pub fn purge_expired(&self) -> usize {
        match self.store.purge_expired(Instant::now()) {
            Ok(removed) => {
                self.counters
                    .evictions
                    .fetch_add(removed as u64, Ordering::Relaxed);
                removed
            }
            Err(e) => {
                log::warn!("{}; skipping purge", e);
                0
            }
        }
    }

    /// Remove every entry
    pub fn clear(&self) {
        self.store.clear();
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            degraded: self.counters.degraded.load(Ordering::Relaxed),
            entries: self.store.len(),
        }
    }
}

/// A [`ResultCache`] that derives its key from the call arguments
///
/// The key function picks the arguments that identify a result (query
/// text, scope id) and leaves out injected collaborators.
pub struct KeyedCache<A: ?Sized, K, V> {
    cache: ResultCache<K, V>,
    key_fn: Box<dyn Fn(&A) -> K + Send + Sync>,
}

impl<A: ?Sized, K, V> KeyedCache<A, K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(cache: ResultCache<K, V>, key_fn: impl Fn(&A) -> K + Send + Sync + 'static) -> Self {
        Self {
            cache,
            key_fn: Box::new(key_fn),
        }
    }

    /// Derive the key for a set of arguments
    pub fn key(&self, args: &A) -> K {
        (self.key_fn)(args)
    }

    /// Memoize `compute` under the key derived from `args`
    pub async fn get_or_compute<F, Fut, E>(&self, args: &A, compute: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let key = self.key(args);
        self.cache.get_or_compute(key, compute).await
    }

    pub fn cache(&self) -> &ResultCache<K, V> {
        &self.cache
    }
}

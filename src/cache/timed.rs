//! TTL-bounded fetch-on-miss cache
//!
//! Every other cache in branchfs is built on [`TimedCache`]. Entries expire a
//! fixed TTL after insertion. A miss calls the fetch function supplied by the
//! caller; concurrent misses on the same key may both fetch, in which case the
//! last result stored wins.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Source of "now" for expiry decisions
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Clock backed by [`Instant::now`]
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Manually advanced clock, for driving expiry in tests
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock()
    }
}

/// A cached value and the instant it stops being valid
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub expiry: Instant,
}

/// Generic key/value cache with time-based expiry
///
/// A TTL of zero means entries never expire; they only go away through
/// [`drop_entry`](Self::drop_entry) or [`drop_all`](Self::drop_all).
pub struct TimedCache<K, V> {
    ttl: Duration,
    clock: Arc<dyn Clock>,
    entries: RwLock<HashMap<K, CacheEntry<V>>>,
}

impl<K, V> TimedCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create a cache using the monotonic clock
    pub fn new(ttl: Duration) -> Self {
        Self::with_clock(ttl, Arc::new(MonotonicClock))
    }

    pub fn with_clock(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl,
            clock,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn is_valid(&self, entry: &CacheEntry<V>, now: Instant) -> bool {
        self.ttl.is_zero() || entry.expiry > now
    }

    /// Return the cached value, fetching it on a miss or after expiry
    pub fn get<F>(&self, key: &K, fetch: F) -> V
    where
        F: FnOnce(&K) -> (V, bool),
    {
        {
            let entries = self.entries.read();
            if let Some(entry) = entries.get(key) {
                if self.is_valid(entry, self.clock.now()) {
                    return entry.value.clone();
                }
            }
        }
        self.get_fresh(key, fetch)
    }

    /// Always fetch, storing the result when the fetcher marks it cacheable
    pub fn get_fresh<F>(&self, key: &K, fetch: F) -> V
    where
        F: FnOnce(&K) -> (V, bool),
    {
        let (value, cacheable) = fetch(key);
        if cacheable {
            self.set(key.clone(), value.clone());
        }
        value
    }

    /// Cached value if present and unexpired, without fetching
    pub fn peek(&self, key: &K) -> Option<V> {
        self.peek_with(key, V::clone)
    }

    /// Borrow a live entry without cloning it
    pub fn peek_with<R, F>(&self, key: &K, f: F) -> Option<R>
    where
        F: FnOnce(&V) -> R,
    {
        let entries = self.entries.read();
        let entry = entries.get(key)?;
        if self.is_valid(entry, self.clock.now()) {
            Some(f(&entry.value))
        } else {
            None
        }
    }

    /// Mutate a live entry in place, keeping its expiry. Returns false if
    /// there was no live entry.
    pub fn update<F>(&self, key: &K, f: F) -> bool
    where
        F: FnOnce(&mut V),
    {
        let now = self.clock.now();
        let mut entries = self.entries.write();
        match entries.get_mut(key) {
            Some(entry) if self.ttl.is_zero() || entry.expiry > now => {
                f(&mut entry.value);
                true
            }
            _ => false,
        }
    }

    pub fn set(&self, key: K, value: V) {
        let expiry = self.clock.now() + self.ttl;
        self.entries.write().insert(key, CacheEntry { value, expiry });
    }

    pub fn drop_entry(&self, key: &K) {
        self.entries.write().remove(key);
    }

    /// Drop the given keys, or everything when `keys` is `None`
    pub fn drop_all(&self, keys: Option<&[K]>) {
        let mut entries = self.entries.write();
        match keys {
            None => entries.clear(),
            Some(keys) => {
                for key in keys {
                    entries.remove(key);
                }
            }
        }
    }

    /// Remove every expired entry
    pub fn purge(&self) -> usize {
        if self.ttl.is_zero() {
            return 0;
        }
        let now = self.clock.now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| entry.expiry > now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

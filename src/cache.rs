//! In-memory LRU caches with idle TTL.
//! An entry is visible while `now - last_used <= ttl`; every hit refreshes
//! `last_used` and moves it to the most-recently-used position.
//! Three independently bounded caches: words, phrases, and a typed generic cache.

use std::any::Any;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use crate::config::CacheSection;
use crate::repository::record::{DictionaryEntry, PhraseEntry};

/// Fixed bookkeeping cost charged per cached entry in memory estimates.
pub const ENTRY_OVERHEAD_BYTES: usize = 64;

/// Approximate heap weight of a cached value (string lengths × 2).
pub trait CacheWeight {
    fn weight(&self) -> usize;
}

impl CacheWeight for String {
    fn weight(&self) -> usize {
        self.len() * 2
    }
}

/// Values stored in the generic cache; their weight is not known.
pub type GenericValue = Arc<dyn Any + Send + Sync>;

impl CacheWeight for GenericValue {
    fn weight(&self) -> usize {
        0
    }
}

struct CacheEntry<V> {
    value: V,
    last_used: Instant,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct Inner<K: Hash + Eq, V> {
    map: LruCache<K, CacheEntry<V>>,
    capacity: usize,
    ttl: Duration,
    stats: CacheStats,
}

/// Bounded LRU map whose entries expire after `ttl` without use.
pub struct TtlLruCache<K: Hash + Eq, V> {
    inner: Mutex<Inner<K, V>>,
}

fn non_zero(capacity: usize) -> NonZeroUsize {
    NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)
}

impl<K, V> TtlLruCache<K, V>
where
    K: Hash + Eq + CacheWeight,
    V: Clone + CacheWeight,
{
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                map: LruCache::new(non_zero(capacity)),
                capacity: capacity.max(1),
                ttl,
                stats: CacheStats::default(),
            }),
        }
    }

    /// Look up a value. Expired entries are dropped and count as a miss.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let now = Instant::now();

        let found = match inner.map.get_mut(key) {
            None => None,
            Some(entry) if now.saturating_duration_since(entry.last_used) > inner.ttl => Some(None),
            Some(entry) => {
                entry.last_used = now;
                Some(Some(entry.value.clone()))
            }
        };

        match found {
            Some(Some(value)) => {
                inner.stats.hits += 1;
                Some(value)
            }
            Some(None) => {
                inner.map.pop(key);
                inner.stats.expirations += 1;
                inner.stats.misses += 1;
                None
            }
            None => {
                inner.stats.misses += 1;
                None
            }
        }
    }

    /// Insert at the most-recently-used position, evicting LRU entries while over capacity.
    pub fn set(&self, key: K, value: V) {
        let mut inner = self.inner.lock();
        inner.map.pop(&key);
        let evicted = inner.map.push(
            key,
            CacheEntry {
                value,
                last_used: Instant::now(),
            },
        );
        if evicted.is_some() {
            inner.stats.evictions += 1;
        }
    }

    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.inner.lock().map.pop(key).map(|e| e.value)
    }

    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.inner.lock().map.contains(key)
    }

    /// Apply new limits and run an eviction pass: shrink to capacity, then drop expired entries.
    pub fn configure(&self, capacity: usize, ttl: Duration) -> usize {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let before = inner.map.len();
        inner.capacity = capacity.max(1);
        inner.ttl = ttl;
        inner.map.resize(non_zero(inner.capacity));
        let resized_out = before - inner.map.len();
        inner.stats.evictions += resized_out as u64;
        resized_out + Self::purge_expired_locked(inner)
    }

    /// Drop every entry whose idle time exceeds the TTL.
    pub fn purge_expired(&self) -> usize {
        let mut guard = self.inner.lock();
        Self::purge_expired_locked(&mut guard)
    }

    fn purge_expired_locked(inner: &mut Inner<K, V>) -> usize {
        let now = Instant::now();
        let ttl = inner.ttl;
        let mut removed = 0;
        // Iteration order is MRU → LRU, and last_used is monotonic along it,
        // so expired entries form a suffix at the LRU end.
        while let Some((_, entry)) = inner.map.peek_lru() {
            if now.saturating_duration_since(entry.last_used) <= ttl {
                break;
            }
            inner.map.pop_lru();
            removed += 1;
        }
        inner.stats.expirations += removed as u64;
        removed
    }

    /// Remove every entry whose key matches `pred`. Returns the number removed.
    pub fn remove_where<F>(&self, pred: F) -> usize
    where
        K: Clone,
        F: Fn(&K) -> bool,
    {
        let mut inner = self.inner.lock();
        let doomed: Vec<K> = inner
            .map
            .iter()
            .filter(|(k, _)| pred(k))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            inner.map.pop(key);
        }
        doomed.len()
    }

    pub fn clear(&self) {
        self.inner.lock().map.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    pub fn ttl(&self) -> Duration {
        self.inner.lock().ttl
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats
    }

    /// Keys from most- to least-recently used.
    pub fn keys_mru(&self) -> Vec<K>
    where
        K: Clone,
    {
        self.inner.lock().map.iter().map(|(k, _)| k.clone()).collect()
    }

    /// Estimated footprint: key + value weights plus fixed overhead per entry.
    pub fn estimated_bytes(&self) -> usize {
        self.inner
            .lock()
            .map
            .iter()
            .map(|(k, e)| k.weight() + e.value.weight() + ENTRY_OVERHEAD_BYTES)
            .sum()
    }
}

/// Capacity limits for the three caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheLimits {
    pub words: usize,
    pub phrases: usize,
    pub generic: usize,
}

impl From<&CacheSection> for CacheLimits {
    fn from(section: &CacheSection) -> Self {
        Self {
            words: section.word_cache_size,
            phrases: section.phrase_cache_size,
            generic: section.generic_cache_size,
        }
    }
}

/// Snapshot of one cache for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct CacheReport {
    pub entries: usize,
    pub capacity: usize,
    pub hit_rate: f64,
    pub estimated_bytes: usize,
    pub stats: CacheStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheInfo {
    pub words: CacheReport,
    pub phrases: CacheReport,
    pub generic: CacheReport,
    pub ttl_seconds: u64,
    pub hit_rate: f64,
    pub estimated_bytes: usize,
}

/// Word, phrase, and generic caches sharing one TTL.
pub struct CacheManager {
    words: TtlLruCache<String, DictionaryEntry>,
    phrases: TtlLruCache<String, PhraseEntry>,
    generic: TtlLruCache<String, GenericValue>,
}

impl CacheManager {
    pub fn new(limits: CacheLimits, ttl: Duration) -> Self {
        Self {
            words: TtlLruCache::new(limits.words, ttl),
            phrases: TtlLruCache::new(limits.phrases, ttl),
            generic: TtlLruCache::new(limits.generic, ttl),
        }
    }

    pub fn from_config(section: &CacheSection) -> Self {
        Self::new(CacheLimits::from(section), section.ttl())
    }

    pub fn words(&self) -> &TtlLruCache<String, DictionaryEntry> {
        &self.words
    }

    pub fn phrases(&self) -> &TtlLruCache<String, PhraseEntry> {
        &self.phrases
    }

    /// Typed lookup in the generic cache. A value stored under a different type is a miss.
    pub fn get<T>(&self, key: &str) -> Option<T>
    where
        T: Any + Send + Sync + Clone,
    {
        self.generic
            .get(key)
            .and_then(|value| value.downcast_ref::<T>().cloned())
    }

    pub fn set<T>(&self, key: impl Into<String>, value: T)
    where
        T: Any + Send + Sync,
    {
        self.generic.set(key.into(), Arc::new(value));
    }

    pub fn invalidate(&self, key: &str) {
        self.generic.remove(key);
    }

    /// Apply new limits/TTL to all three caches and evict immediately.
    pub fn configure(&self, limits: CacheLimits, ttl: Duration) {
        let evicted = self.words.configure(limits.words, ttl)
            + self.phrases.configure(limits.phrases, ttl)
            + self.generic.configure(limits.generic, ttl);
        debug!(
            words = limits.words,
            phrases = limits.phrases,
            generic = limits.generic,
            ttl_secs = ttl.as_secs(),
            evicted,
            "cache_configured"
        );
    }

    pub fn clear(&self) {
        self.words.clear();
        self.phrases.clear();
        self.generic.clear();
    }

    pub fn info(&self) -> CacheInfo {
        let words = report(&self.words);
        let phrases = report(&self.phrases);
        let generic = report(&self.generic);
        let hits = words.stats.hits + phrases.stats.hits + generic.stats.hits;
        let misses = words.stats.misses + phrases.stats.misses + generic.stats.misses;
        let estimated_bytes = words.estimated_bytes + phrases.estimated_bytes + generic.estimated_bytes;
        CacheInfo {
            ttl_seconds: self.words.ttl().as_secs(),
            hit_rate: if hits + misses == 0 {
                0.0
            } else {
                hits as f64 / (hits + misses) as f64
            },
            estimated_bytes,
            words,
            phrases,
            generic,
        }
    }
}

fn report<V: Clone + CacheWeight>(cache: &TtlLruCache<String, V>) -> CacheReport {
    let stats = cache.stats();
    CacheReport {
        entries: cache.len(),
        capacity: cache.capacity(),
        hit_rate: stats.hit_rate(),
        estimated_bytes: cache.estimated_bytes(),
        stats,
    }
}

//! TTL cache with an LRU entry cap.
//!
//! Entries are disposable copies of re-computable reads. A lookup hits only
//! while the time since insertion is strictly below the caller's TTL; an
//! expired entry is evicted on the lookup that finds it.
//!
//! Caches created from the same [`InvalidationBus`] drop each other's
//! invalidated keys. Received invalidations are applied before every
//! operation, so a linked instance never serves a key another instance has
//! already dropped.
//!
//! Every applied invalidation, local or remote, advances the cache's
//! generation. A reader that snapshots [`TtlCache::generation`] before a slow
//! read and stores through [`TtlCache::put_if_generation`] never caches a
//! result that an invalidation raced past.

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::time::Instant;

static NEXT_CACHE_ID: AtomicU64 = AtomicU64::new(1);

/// What an invalidation drops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationScope {
    Key(String),
    Prefix(String),
    All,
}

#[derive(Debug, Clone)]
struct Invalidation {
    origin: u64,
    scope: InvalidationScope,
}

/// Broadcast channel linking cache instances.
#[derive(Debug, Clone)]
pub struct InvalidationBus {
    sender: broadcast::Sender<Invalidation>,
}

impl InvalidationBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribers(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for InvalidationBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
}

/// Counter snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub expirations: u64,
    pub evictions: u64,
    pub invalidations: u64,
    pub entries: usize,
    pub capacity: usize,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    expirations: AtomicU64,
    evictions: AtomicU64,
    invalidations: AtomicU64,
}

struct Link {
    sender: broadcast::Sender<Invalidation>,
    receiver: Mutex<broadcast::Receiver<Invalidation>>,
}

pub struct TtlCache<V> {
    id: u64,
    entries: Mutex<LruCache<String, CacheEntry<V>>>,
    capacity: usize,
    counters: Counters,
    generation: AtomicU64,
    link: Option<Link>,
}

impl<V> std::fmt::Debug for TtlCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtlCache")
            .field("id", &self.id)
            .field("capacity", &self.capacity)
            .field("linked", &self.link.is_some())
            .finish()
    }
}

impl<V: Clone> TtlCache<V> {
    /// Process-local cache holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self::build(capacity, None)
    }

    /// Cache that publishes to and applies invalidations from `bus`.
    pub fn linked(capacity: usize, bus: &InvalidationBus) -> Self {
        Self::build(
            capacity,
            Some(Link {
                sender: bus.sender.clone(),
                receiver: Mutex::new(bus.sender.subscribe()),
            }),
        )
    }

    fn build(capacity: usize, link: Option<Link>) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            id: NEXT_CACHE_ID.fetch_add(1, Ordering::Relaxed),
            entries: Mutex::new(LruCache::new(cap)),
            capacity: cap.get(),
            counters: Counters::default(),
            generation: AtomicU64::new(0),
            link,
        }
    }

    /// Value for `key` if it was inserted less than `ttl` ago.
    pub fn get(&self, key: &str, ttl: Duration) -> Option<V> {
        self.apply_remote();
        let mut entries = self.entries.lock();

        let expired = match entries.get(key) {
            Some(entry) if entry.inserted_at.elapsed() < ttl => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            entries.pop(key);
            self.counters.expirations.fetch_add(1, Ordering::Relaxed);
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Insert or replace `key`, evicting the least recently used entry when full.
    pub fn put(&self, key: impl Into<String>, value: V) {
        self.apply_remote();
        let mut entries = self.entries.lock();
        self.insert(&mut entries, key.into(), value);
    }

    /// Invalidations applied so far, including ones received from the bus.
    pub fn generation(&self) -> u64 {
        self.apply_remote();
        self.generation.load(Ordering::Acquire)
    }

    /// Insert `key` only if no invalidation has been applied since `seen` was
    /// read from [`TtlCache::generation`]. Returns whether the value was stored.
    pub fn put_if_generation(&self, key: impl Into<String>, value: V, seen: u64) -> bool {
        self.apply_remote();
        let mut entries = self.entries.lock();
        if self.generation.load(Ordering::Acquire) != seen {
            return false;
        }
        self.insert(&mut entries, key.into(), value);
        true
    }

    fn insert(&self, entries: &mut LruCache<String, CacheEntry<V>>, key: String, value: V) {
        let entry = CacheEntry {
            value,
            inserted_at: Instant::now(),
        };
        if let Some((evicted, _)) = entries.push(key.clone(), entry) {
            if evicted != key {
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn invalidate(&self, key: &str) {
        self.apply(&InvalidationScope::Key(key.to_string()));
        self.publish(InvalidationScope::Key(key.to_string()));
    }

    pub fn invalidate_prefix(&self, prefix: &str) {
        self.apply(&InvalidationScope::Prefix(prefix.to_string()));
        self.publish(InvalidationScope::Prefix(prefix.to_string()));
    }

    pub fn clear(&self) {
        self.apply(&InvalidationScope::All);
        self.publish(InvalidationScope::All);
    }

    pub fn len(&self) -> usize {
        self.apply_remote();
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
            entries: self.len(),
            capacity: self.capacity,
        }
    }

    fn apply(&self, scope: &InvalidationScope) {
        let mut entries = self.entries.lock();
        let removed = match scope {
            InvalidationScope::Key(key) => entries.pop(key.as_str()).map_or(0, |_| 1),
            InvalidationScope::Prefix(prefix) => {
                let keys: Vec<String> = entries
                    .iter()
                    .filter(|(k, _)| k.starts_with(prefix.as_str()))
                    .map(|(k, _)| k.clone())
                    .collect();
                for key in &keys {
                    entries.pop(key.as_str());
                }
                keys.len()
            }
            InvalidationScope::All => {
                let n = entries.len();
                entries.clear();
                n
            }
        };
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.counters
            .invalidations
            .fetch_add(removed as u64, Ordering::Relaxed);
    }

    fn publish(&self, scope: InvalidationScope) {
        if let Some(link) = &self.link {
            // No other subscriber is not an error.
            let _ = link.sender.send(Invalidation {
                origin: self.id,
                scope,
            });
        }
    }

    fn apply_remote(&self) {
        let Some(link) = &self.link else {
            return;
        };
        let mut receiver = link.receiver.lock();
        loop {
            match receiver.try_recv() {
                Ok(message) if message.origin == self.id => {}
                Ok(message) => self.apply(&message.scope),
                Err(TryRecvError::Lagged(skipped)) => {
                    tracing::warn!(cache = self.id, skipped, "Invalidation bus lagged, clearing cache");
                    self.apply(&InvalidationScope::All);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
    }
}

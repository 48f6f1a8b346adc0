//! Generic bounded cache with LRU eviction and per-entry TTL.
//!
//! # Responsibilities
//! - Enforce an entry-count budget and an estimated byte-size budget
//! - Evict least-recently-accessed entries first (access order, not insertion)
//! - Expire entries lazily on `get` and eagerly from a periodic sweep
//! - Count hits, misses, evictions and expirations
//!
//! # Design Decisions
//! - Entry size is the length of the value's compact JSON serialization plus
//!   the key length; values that cannot be serialized are rejected
//! - Recency is an access tick; a `BTreeMap<tick, key>` gives the LRU order
//! - `has` and `delete` never touch recency
//! - All state lives behind one mutex so every operation is a single step

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time;

use crate::clock::SharedClock;
use crate::config::CacheConfig;
use crate::lifecycle::Shutdown;
use crate::observability::metrics;

/// Errors returned by [`BoundedCache::set`].
#[derive(Debug, Error)]
pub enum CacheError {
    /// The value could not be serialized for size estimation.
    #[error("Cannot estimate entry size: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A single entry is larger than the whole cache budget.
    #[error("Entry of {size} bytes exceeds cache budget of {max} bytes")]
    EntryTooLarge { size: u64, max: u64 },
}

/// A cached value with its bookkeeping.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub key: String,
    pub value: V,
    pub size_bytes: u64,
    pub created_at: u64,
    pub last_accessed_at: u64,
    pub expires_at: u64,
    tick: u64,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: u64) -> bool {
        now > self.expires_at
    }
}

/// Point-in-time counters for one cache instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub size_bytes: u64,
    pub max_entries: usize,
    pub max_size_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub hit_rate: f64,
}

struct CacheState<V> {
    entries: HashMap<String, CacheEntry<V>>,
    order: BTreeMap<u64, String>,
    next_tick: u64,
    total_size: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

impl<V> CacheState<V> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            next_tick: 0,
            total_size: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
            expirations: 0,
        }
    }

    fn tick(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry<V>> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.tick);
        self.total_size -= entry.size_bytes;
        Some(entry)
    }

    /// Drop the least-recently-accessed entry.
    fn evict_one(&mut self) -> bool {
        match self.order.pop_first() {
            Some((_, key)) => {
                if let Some(entry) = self.entries.remove(&key) {
                    self.total_size -= entry.size_bytes;
                }
                self.evictions += 1;
                true
            }
            None => false,
        }
    }
}

/// Bounded LRU + TTL cache.
pub struct BoundedCache<V> {
    name: String,
    config: CacheConfig,
    clock: SharedClock,
    state: Mutex<CacheState<V>>,
    shutdown: Shutdown,
}

impl<V> BoundedCache<V>
where
    V: Clone + Serialize + Send + 'static,
{
    /// Create an empty cache.
    pub fn new(name: impl Into<String>, config: CacheConfig, clock: SharedClock) -> Self {
        Self {
            name: name.into(),
            config,
            clock,
            state: Mutex::new(CacheState::new()),
            shutdown: Shutdown::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Insert or replace `key`, then evict until both budgets hold.
    pub fn set(&self, key: impl Into<String>, value: V) -> Result<(), CacheError> {
        let key = key.into();
        let size = estimate_size(&key, &value)?;
        if size > self.config.max_size_bytes {
            return Err(CacheError::EntryTooLarge {
                size,
                max: self.config.max_size_bytes,
            });
        }

        let now = self.clock.now_ms();
        let evicted = {
            let mut state = self.state.lock().expect("cache mutex poisoned");
            state.remove(&key);

            let tick = state.tick();
            state.order.insert(tick, key.clone());
            state.total_size += size;
            state.entries.insert(
                key.clone(),
                CacheEntry {
                    key,
                    value,
                    size_bytes: size,
                    created_at: now,
                    last_accessed_at: now,
                    expires_at: now.saturating_add(self.config.ttl_ms),
                    tick,
                },
            );

            let mut evicted = 0;
            while state.entries.len() > self.config.max_entries
                || state.total_size > self.config.max_size_bytes
            {
                if !state.evict_one() {
                    break;
                }
                evicted += 1;
            }
            evicted
        };

        if evicted > 0 {
            metrics::record_cache_evictions(&self.name, evicted);
            tracing::debug!(cache = %self.name, evicted, "Evicted least-recently-used entries");
        }
        Ok(())
    }

    /// Look up `key`, refreshing its recency on a hit.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = self.clock.now_ms();
        let mut state = self.state.lock().expect("cache mutex poisoned");

        let expired = match state.entries.get(key) {
            None => {
                state.misses += 1;
                return None;
            }
            Some(entry) => entry.is_expired(now),
        };

        if expired {
            state.remove(key);
            state.expirations += 1;
            state.misses += 1;
            return None;
        }

        let tick = state.tick();
        let state = &mut *state;
        let entry = state.entries.get_mut(key)?;
        state.order.remove(&entry.tick);
        entry.tick = tick;
        entry.last_accessed_at = now;
        state.order.insert(tick, key.to_string());
        let value = entry.value.clone();
        state.hits += 1;
        Some(value)
    }

    /// Whether a live entry exists. Does not affect recency or counters.
    pub fn has(&self, key: &str) -> bool {
        let now = self.clock.now_ms();
        let state = self.state.lock().expect("cache mutex poisoned");
        state
            .entries
            .get(key)
            .map(|e| !e.is_expired(now))
            .unwrap_or(false)
    }

    /// Remove `key`. Returns true if it was present.
    pub fn delete(&self, key: &str) -> bool {
        let mut state = self.state.lock().expect("cache mutex poisoned");
        state.remove(key).is_some()
    }

    /// Drop every entry. Counters are kept.
    pub fn clear(&self) {
        let mut state = self.state.lock().expect("cache mutex poisoned");
        state.entries.clear();
        state.order.clear();
        state.total_size = 0;
    }

    /// Remove every expired entry. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let mut state = self.state.lock().expect("cache mutex poisoned");
        let expired: Vec<String> = state
            .entries
            .values()
            .filter(|e| e.is_expired(now))
            .map(|e| e.key.clone())
            .collect();
        for key in &expired {
            state.remove(key);
        }
        state.expirations += expired.len() as u64;
        expired.len()
    }

    /// Evict the least-recently-accessed `fraction` (0.0..=1.0) of entries.
    pub fn trim(&self, fraction: f64) -> usize {
        let evicted = {
            let mut state = self.state.lock().expect("cache mutex poisoned");
            let target = (state.entries.len() as f64 * fraction.clamp(0.0, 1.0)).ceil() as usize;
            let mut evicted = 0;
            while evicted < target && state.evict_one() {
                evicted += 1;
            }
            evicted
        };
        if evicted > 0 {
            metrics::record_cache_evictions(&self.name, evicted);
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("cache mutex poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total estimated size of live entries.
    pub fn size_bytes(&self) -> u64 {
        self.state.lock().expect("cache mutex poisoned").total_size
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock().expect("cache mutex poisoned");
        let lookups = state.hits + state.misses;
        CacheStats {
            entries: state.entries.len(),
            size_bytes: state.total_size,
            max_entries: self.config.max_entries,
            max_size_bytes: self.config.max_size_bytes,
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
            expirations: state.expirations,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                state.hits as f64 / lookups as f64
            },
        }
    }

    /// Spawn the periodic expiry sweep. Returns `None` after `destroy`.
    pub fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self.shutdown.is_triggered() {
            return None;
        }
        let mut shutdown = self.shutdown.subscribe();
        let cache = Arc::clone(self);

        Some(tokio::spawn(async move {
            let mut ticker = time::interval(Duration::from_millis(cache.config.cleanup_interval_ms));
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = cache.sweep_expired();
                        if removed > 0 {
                            tracing::debug!(cache = %cache.name, removed, "Swept expired cache entries");
                        }
                        let stats = cache.stats();
                        metrics::record_cache_usage(&cache.name, stats.size_bytes, stats.entries);
                    }
                    _ = shutdown.recv() => {
                        tracing::debug!(cache = %cache.name, "Cache sweeper stopped");
                        break;
                    }
                }
            }
        }))
    }

    /// Stop the sweep task.
    pub fn destroy(&self) {
        self.shutdown.trigger();
    }
}

/// Estimated footprint of an entry: compact JSON length plus key length.
pub fn estimate_size<V: Serialize>(key: &str, value: &V) -> Result<u64, serde_json::Error> {
    let encoded = serde_json::to_vec(value)?;
    Ok((encoded.len() + key.len()) as u64)
}

//! Named cache instances.
//!
//! One [`BoundedCache`] per logical result type (`color_conversion`,
//! `palette`, `image`, ...). The manager exposes deterministic key generation
//! and aggregate size/entry counts, which the resource manager reads as a
//! memory-pressure signal.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::cache::bounded::{BoundedCache, CacheError, CacheStats};
use crate::clock::SharedClock;
use crate::config::CacheSettings;

/// Cache of tool results keyed by canonical parameters.
pub type ResultCache = BoundedCache<Value>;

/// Multiplexes named cache instances.
pub struct CacheManager {
    settings: CacheSettings,
    clock: SharedClock,
    caches: DashMap<String, Arc<ResultCache>>,
    started: AtomicBool,
}

impl CacheManager {
    /// Create the manager with one instance per configured type.
    pub fn new(settings: CacheSettings, clock: SharedClock) -> Self {
        let caches = DashMap::new();
        for (name, config) in &settings.types {
            caches.insert(
                name.clone(),
                Arc::new(ResultCache::new(name.clone(), *config, clock.clone())),
            );
        }
        Self {
            settings,
            clock,
            caches,
            started: AtomicBool::new(false),
        }
    }

    /// Get the instance for `cache_type`, creating it with default settings.
    pub fn cache(&self, cache_type: &str) -> Arc<ResultCache> {
        if let Some(cache) = self.caches.get(cache_type) {
            return cache.value().clone();
        }

        let mut created = false;
        let cache = self
            .caches
            .entry(cache_type.to_string())
            .or_insert_with(|| {
                created = true;
                Arc::new(ResultCache::new(
                    cache_type,
                    self.settings.defaults,
                    self.clock.clone(),
                ))
            })
            .value()
            .clone();

        if created {
            tracing::debug!(cache = %cache_type, "Created cache instance with default settings");
            if self.started.load(Ordering::SeqCst) {
                cache.start();
            }
        }
        cache
    }

    /// Deterministic key for `params` within `cache_type`.
    pub fn generate_key(&self, cache_type: &str, params: &Value) -> String {
        cache_key(cache_type, params)
    }

    pub fn get(&self, cache_type: &str, key: &str) -> Option<Value> {
        self.cache(cache_type).get(key)
    }

    pub fn set(&self, cache_type: &str, key: impl Into<String>, value: Value) -> Result<(), CacheError> {
        self.cache(cache_type).set(key, value)
    }

    /// Names of all live instances, sorted.
    pub fn cache_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.caches.iter().map(|c| c.key().clone()).collect();
        names.sort();
        names
    }

    /// Sum of estimated entry sizes across all instances.
    pub fn total_size(&self) -> u64 {
        self.caches.iter().map(|c| c.value().size_bytes()).sum()
    }

    /// Sum of entry counts across all instances.
    pub fn total_entries(&self) -> usize {
        self.caches.iter().map(|c| c.value().len()).sum()
    }

    /// Clear one instance, or all of them when `cache_type` is `None`.
    pub fn clear(&self, cache_type: Option<&str>) {
        match cache_type {
            Some(name) => {
                if let Some(cache) = self.caches.get(name) {
                    cache.clear();
                    tracing::info!(cache = %name, "Cache cleared");
                }
            }
            None => {
                for cache in self.caches.iter() {
                    cache.value().clear();
                }
                tracing::info!("All caches cleared");
            }
        }
    }

    /// Evict the least-recently-used `fraction` of every instance.
    pub fn trim(&self, fraction: f64) -> usize {
        self.caches.iter().map(|c| c.value().trim(fraction)).sum()
    }

    /// Remove expired entries from every instance.
    pub fn sweep_expired(&self) -> usize {
        self.caches.iter().map(|c| c.value().sweep_expired()).sum()
    }

    /// Per-instance statistics.
    pub fn stats(&self) -> BTreeMap<String, CacheStats> {
        self.caches
            .iter()
            .map(|c| (c.key().clone(), c.value().stats()))
            .collect()
    }

    /// Start every instance's expiry sweep.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        for cache in self.caches.iter() {
            cache.value().start();
        }
        tracing::info!(instances = self.caches.len(), "Cache sweepers started");
    }

    /// Stop every sweep.
    pub fn destroy(&self) {
        self.started.store(false, Ordering::SeqCst);
        for cache in self.caches.iter() {
            cache.value().destroy();
        }
    }
}

/// `"<type>:<sha256 of canonical params>"`.
///
/// Object keys are sorted recursively before hashing, so insertion order
/// never changes the key.
pub fn cache_key(cache_type: &str, params: &Value) -> String {
    let mut canonical = String::new();
    write_canonical(params, &mut canonical);

    let mut hasher = Sha256::new();
    hasher.update(cache_type.as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical.as_bytes());
    format!("{}:{}", cache_type, hex::encode(hasher.finalize()))
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::CacheConfig;
    use serde_json::json;

    fn manager() -> CacheManager {
        CacheManager::new(CacheSettings::default(), Arc::new(ManualClock::new(0)))
    }

    #[test]
    fn test_key_ignores_insertion_order() {
        let mut a = serde_json::Map::new();
        a.insert("color".into(), json!("#FF0000"));
        a.insert("output_format".into(), json!("hsl"));
        a.insert("nested".into(), json!({"b": 1, "a": [1, 2]}));

        let mut b = serde_json::Map::new();
        b.insert("nested".into(), json!({"a": [1, 2], "b": 1}));
        b.insert("output_format".into(), json!("hsl"));
        b.insert("color".into(), json!("#FF0000"));

        assert_eq!(
            cache_key("color_conversion", &Value::Object(a)),
            cache_key("color_conversion", &Value::Object(b))
        );
    }

    #[test]
    fn test_key_differs_for_any_value_change() {
        let base = json!({"color": "#FF0000", "output_format": "hsl"});
        let keys = [
            cache_key("color_conversion", &base),
            cache_key("color_conversion", &json!({"color": "#FF0001", "output_format": "hsl"})),
            cache_key("color_conversion", &json!({"color": "#FF0000", "output_format": "rgb"})),
            cache_key("palette", &base),
            cache_key("color_conversion", &json!({"color": "#FF0000"})),
            cache_key("color_conversion", &json!({"color": ["#FF0000"], "output_format": "hsl"})),
        ];
        for i in 0..keys.len() {
            for j in (i + 1)..keys.len() {
                assert_ne!(keys[i], keys[j], "keys {} and {} collide", i, j);
            }
        }
        assert!(keys[0].starts_with("color_conversion:"));
    }

    #[test]
    fn test_totals_and_clear() {
        let manager = manager();
        manager.set("palette", "p1", json!(["#000", "#fff"])).unwrap();
        manager.set("image", "i1", json!("data")).unwrap();
        manager.set("image", "i2", json!("data")).unwrap();

        assert_eq!(manager.total_entries(), 3);
        assert!(manager.total_size() > 0);

        manager.clear(Some("image"));
        assert_eq!(manager.total_entries(), 1);
        assert_eq!(manager.get("palette", "p1"), Some(json!(["#000", "#fff"])));

        manager.clear(None);
        assert_eq!(manager.total_entries(), 0);
        assert_eq!(manager.total_size(), 0);
    }

    #[test]
    fn test_unknown_type_uses_defaults() {
        let mut settings = CacheSettings::default();
        settings.defaults = CacheConfig {
            max_entries: 1,
            ..CacheConfig::default()
        };
        let manager = CacheManager::new(settings, Arc::new(ManualClock::new(0)));

        manager.set("gradient", "a", json!(1)).unwrap();
        manager.set("gradient", "b", json!(2)).unwrap();
        assert_eq!(manager.cache("gradient").len(), 1);
        assert!(manager.cache_types().contains(&"gradient".to_string()));
    }

    #[test]
    fn test_stats_per_instance() {
        let manager = manager();
        manager.set("palette", "k", json!("v")).unwrap();
        manager.get("palette", "k");
        manager.get("palette", "nope");

        let stats = manager.stats();
        let palette = &stats["palette"];
        assert_eq!(palette.hits, 1);
        assert_eq!(palette.misses, 1);
        assert!((palette.hit_rate - 0.5).abs() < f64::EPSILON);
    }
}

//! Caching subsystem.
//!
//! # Data Flow
//! ```text
//! Gate::execute
//!     → manager.rs generate_key(type, params)
//!     → bounded.rs get (lazy TTL check, LRU refresh)
//!     → miss: tool handler runs, bounded.rs set (size estimate, evict)
//!
//! Resource manager:
//!     → manager.rs total_size() as a pressure signal
//!     → trim / clear under moderate / aggressive degradation
//! ```

pub mod bounded;
pub mod manager;

pub use bounded::{BoundedCache, CacheEntry, CacheError, CacheStats};
pub use manager::{cache_key, CacheManager, ResultCache};

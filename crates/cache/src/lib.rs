//! Cache system for filebridge
//!
//! A TTL-keyed key/value store with an in-process tier and a JSON-file tier
//! under the bridge's `cache/` directory. Expiry is the only eviction
//! mechanism; there is no size-based eviction of live entries.

pub mod entry;
pub mod manager;
pub mod stats;

pub use entry::CacheEntry;
pub use manager::CacheManager;
pub use stats::{CacheStatistics, CleanupReport};

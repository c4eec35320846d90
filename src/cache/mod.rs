//! Two-tier caching for offline support.
//!
//! - `MemoryCache`: volatile, per-process map of the latest payload per key
//! - `PersistentCache`: durable entries with TTL and stale-window metadata,
//!   stored through a `KeyValueStorage` backend (SQLite by default)

mod entry;
mod memory;
mod persistent;
mod storage;

pub use entry::{CacheEntry, CacheHit, Freshness};
pub use memory::MemoryCache;
pub use persistent::{PersistentCache, CACHE_PREFIX, DEFAULT_TTL};
pub use storage::{KeyValueStorage, MemoryStorage, NoopStorage, SqliteStorage};

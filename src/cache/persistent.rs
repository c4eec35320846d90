//! Persistent query cache backed by durable key/value storage.
//!
//! Every operation here is best-effort: storage and serialization failures
//! are logged and treated as a cache miss, never returned to the caller.

use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use super::entry::{CacheEntry, CacheHit, Freshness};
use super::storage::KeyValueStorage;
use crate::clock::{Clock, SystemClock};
use crate::error::SyncError;

/// Namespace prefix for every key this cache writes.
pub const CACHE_PREFIX: &str = "pq_cache_";

/// Default TTL for entries written without an explicit one.
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

pub struct PersistentCache {
  storage: Arc<dyn KeyValueStorage>,
  clock: Arc<dyn Clock>,
  prefix: String,
}

impl PersistentCache {
  pub fn new(storage: Arc<dyn KeyValueStorage>) -> Self {
    Self {
      storage,
      clock: Arc::new(SystemClock),
      prefix: CACHE_PREFIX.to_string(),
    }
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  /// Use a different namespace prefix.
  pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
    self.prefix = prefix.into();
    self
  }

  fn storage_key(&self, key: &str) -> String {
    format!("{}{}", self.prefix, key)
  }

  /// Save data under `key`, replacing any previous entry.
  pub fn set<T: Serialize>(&self, key: &str, data: &T, ttl: Duration) {
    if let Err(e) = self.try_set(key, data, ttl) {
      error!(key, error = %e, "PersistentCache.set failed");
    }
  }

  fn try_set<T: Serialize>(&self, key: &str, data: &T, ttl: Duration) -> Result<(), SyncError> {
    let entry = CacheEntry::new(data, self.clock.now(), ttl);
    let raw = serde_json::to_string(&entry)?;
    self.storage.set(&self.storage_key(key), &raw)?;
    Ok(())
  }

  /// Read an entry.
  ///
  /// Fresh entries come back with `is_stale == false`, entries inside the
  /// stale window with `is_stale == true`. Anything older is deleted and
  /// reported as absent.
  pub fn get<T: DeserializeOwned>(&self, key: &str, stale_window: Duration) -> Option<CacheHit<T>> {
    match self.try_get(key, stale_window) {
      Ok(hit) => hit,
      Err(e) => {
        error!(key, error = %e, "PersistentCache.get failed");
        None
      }
    }
  }

  fn try_get<T: DeserializeOwned>(
    &self,
    key: &str,
    stale_window: Duration,
  ) -> Result<Option<CacheHit<T>>, SyncError> {
    let storage_key = self.storage_key(key);
    let raw = match self.storage.get(&storage_key)? {
      Some(raw) => raw,
      None => return Ok(None),
    };

    let entry: CacheEntry<T> = match serde_json::from_str(&raw) {
      Ok(entry) => entry,
      Err(e) => {
        // Unreadable entries would fail forever; drop them.
        self.storage.remove(&storage_key)?;
        return Err(e.into());
      }
    };

    let is_stale = match entry.freshness(self.clock.now(), stale_window) {
      Freshness::Fresh => false,
      Freshness::Stale => true,
      Freshness::Expired => {
        debug!(key, "Persistent cache entry expired past stale window");
        self.storage.remove(&storage_key)?;
        return Ok(None);
      }
    };

    Ok(Some(CacheHit {
      data: entry.data,
      is_stale,
      written_at: entry.written_at,
    }))
  }

  /// Remove a specific cache entry.
  pub fn remove(&self, key: &str) {
    if let Err(e) = self.storage.remove(&self.storage_key(key)) {
      error!(key, error = %e, "PersistentCache.remove failed");
    }
  }

  /// Remove every entry under this cache's namespace. Other keys in the
  /// same storage are left alone.
  pub fn clear_all(&self) {
    let result = self.storage.list_keys().and_then(|keys| {
      let ours: Vec<String> = keys
        .into_iter()
        .filter(|k| k.starts_with(&self.prefix))
        .collect();
      if !ours.is_empty() {
        self.storage.remove_many(&ours)?;
      }
      Ok(ours.len())
    });

    match result {
      Ok(count) => info!(count, "PersistentCache cleared entries"),
      Err(e) => error!(error = %e, "PersistentCache.clear_all failed"),
    }
  }

  /// Keys (without namespace) currently held by this cache.
  pub fn keys(&self) -> Vec<String> {
    match self.storage.list_keys() {
      Ok(keys) => keys
        .into_iter()
        .filter_map(|k| k.strip_prefix(&self.prefix).map(String::from))
        .collect(),
      Err(e) => {
        error!(error = %e, "PersistentCache.keys failed");
        Vec::new()
      }
    }
  }
}

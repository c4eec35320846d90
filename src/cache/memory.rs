//! Volatile in-memory cache tier.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

use super::entry::CacheEntry;

/// Keyed map of the most recent payload per query key. Values are kept as
/// JSON so queries of different types can share one map.
#[derive(Default)]
pub struct MemoryCache {
  entries: Mutex<HashMap<String, CacheEntry<Value>>>,
}

impl MemoryCache {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn get(&self, key: &str) -> Option<CacheEntry<Value>> {
    self.lock().get(key).cloned()
  }

  pub fn set(&self, key: &str, entry: CacheEntry<Value>) {
    self.lock().insert(key.to_string(), entry);
  }

  pub fn remove(&self, key: &str) {
    self.lock().remove(key);
  }

  pub fn clear(&self) {
    self.lock().clear();
  }

  pub fn len(&self) -> usize {
    self.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CacheEntry<Value>>> {
    // The map holds plain data; a panic mid-insert cannot leave it torn.
    self.entries.lock().unwrap_or_else(|e| e.into_inner())
  }
}

//! Async query abstraction with a two-tier cache.
//!
//! Inspired by TanStack Query, a `Query<T>` wraps one remote read and keeps
//! a `QueryResult<T>` view of it: data, loading, error and staleness. Reads
//! are served from the in-memory tier when fresh, rehydrated from the
//! persistent tier when not, and refreshed through the retry wrapper in the
//! background (stale-while-revalidate).
//!
//! # Example
//!
//! ```ignore
//! let backend = backend.clone();
//! let mut spots = client
//!   .query(Some("spots"), move || {
//!     let backend = backend.clone();
//!     async move { backend.select("spots", "select=*").await }
//!   })
//!   .with_ttl(Duration::from_secs(60))
//!   .persist(true);
//!
//! spots.activate();
//!
//! // In event loop tick
//! if spots.poll() {
//!   // State changed, trigger re-render
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::cache::{CacheEntry, Freshness, MemoryCache, PersistentCache, DEFAULT_TTL};
use crate::clock::{Clock, SystemClock};
use crate::error::SyncError;
use crate::retry::{with_retry, RetryPolicy};

/// Default grace period after TTL during which cached data is still served.
pub const DEFAULT_STALE_WINDOW: Duration = Duration::from_secs(10 * 60);

/// A boxed future that resolves to a fetch result
pub type BoxFuture<T> = futures::future::BoxFuture<'static, Result<T, SyncError>>;

/// A factory function that creates futures for fetching data
pub type Fetcher<T> = Arc<dyn Fn() -> BoxFuture<T> + Send + Sync>;

/// Box a closure returning a future into a `Fetcher`.
pub fn fetcher<T, F, Fut>(f: F) -> Fetcher<T>
where
  F: Fn() -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<T, SyncError>> + Send + 'static,
{
  Arc::new(move || -> BoxFuture<T> { Box::pin(f()) })
}

/// Per-query caching and retry options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryOptions {
  pub ttl: Duration,
  pub stale_window: Duration,
  pub retry: RetryPolicy,
  pub enabled: bool,
  /// Write results to, and rehydrate from, the persistent tier
  pub persist: bool,
}

impl Default for QueryOptions {
  fn default() -> Self {
    Self {
      ttl: DEFAULT_TTL,
      stale_window: DEFAULT_STALE_WINDOW,
      retry: RetryPolicy::default(),
      enabled: true,
      persist: false,
    }
  }
}

/// What a consumer sees of a query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult<T> {
  pub data: Option<T>,
  /// True only while no usable data exists yet, or during an explicit refetch
  pub loading: bool,
  pub error: Option<String>,
  /// Data is past its TTL but still shown
  pub is_stale: bool,
}

impl<T> Default for QueryResult<T> {
  fn default() -> Self {
    Self {
      data: None,
      loading: false,
      error: None,
      is_stale: false,
    }
  }
}

/// Shared cache state for all queries in the process.
pub struct QueryClient {
  memory: MemoryCache,
  persistent: Arc<PersistentCache>,
  clock: Arc<dyn Clock>,
  defaults: QueryOptions,
}

impl QueryClient {
  pub fn new(persistent: Arc<PersistentCache>) -> Self {
    Self {
      memory: MemoryCache::new(),
      persistent,
      clock: Arc::new(SystemClock),
      defaults: QueryOptions::default(),
    }
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn with_defaults(mut self, defaults: QueryOptions) -> Self {
    self.defaults = defaults;
    self
  }

  pub fn defaults(&self) -> QueryOptions {
    self.defaults
  }

  /// Create a query. Nothing is fetched until `activate()` is called.
  pub fn query<T, F, Fut>(self: &Arc<Self>, key: Option<&str>, fetch: F) -> Query<T>
  where
    T: Serialize + DeserializeOwned + Clone + Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, SyncError>> + Send + 'static,
  {
    Query::new(Arc::clone(self), key.map(String::from), fetcher(fetch))
  }

  /// Drop cached data for `key` from both tiers, or everything when `None`.
  pub fn invalidate(&self, key: Option<&str>) {
    match key {
      Some(key) => {
        self.memory.remove(key);
        self.persistent.remove(key);
        debug!(key, "Invalidated cache entry");
      }
      None => {
        self.memory.clear();
        self.persistent.clear_all();
        debug!("Invalidated all cache entries");
      }
    }
  }

  pub fn memory(&self) -> &MemoryCache {
    &self.memory
  }

  fn write_back(&self, key: &str, value: Value, ttl: Duration, persist: bool) -> DateTime<Utc> {
    let entry = CacheEntry::new(value, self.clock.now(), ttl);
    if persist {
      self.persistent.set(key, &entry.data, ttl);
    }
    let written_at = entry.written_at;
    self.memory.set(key, entry);
    written_at
  }
}

/// Cloneable handle that asks its query to refetch.
///
/// Every handle obtained from the same query compares equal, so it can be
/// stored by timers and effects without causing duplicate work.
#[derive(Clone, Debug)]
pub struct Refetch {
  requested: Arc<AtomicBool>,
}

impl Refetch {
  /// Request a refetch. Applied on the query's next `poll()` or `settle()`.
  pub fn trigger(&self) {
    self.requested.store(true, Ordering::SeqCst);
  }

  fn take(&self) -> bool {
    self.requested.swap(false, Ordering::SeqCst)
  }
}

impl PartialEq for Refetch {
  fn eq(&self, other: &Self) -> bool {
    Arc::ptr_eq(&self.requested, &other.requested)
  }
}

impl Eq for Refetch {}

type Outcome<T> = Result<(T, DateTime<Utc>), SyncError>;

/// A single cached remote read and its state.
pub struct Query<T> {
  client: Arc<QueryClient>,
  key: Option<String>,
  options: QueryOptions,
  fetcher: Fetcher<T>,
  result: QueryResult<T>,
  written_at: Option<DateTime<Utc>>,
  receiver: Option<mpsc::UnboundedReceiver<Outcome<T>>>,
  /// Cleared on drop; in-flight fetches check it before touching anything
  alive: Arc<AtomicBool>,
  /// Bumped by every fetch; only the latest one may write the caches
  generation: Arc<AtomicU64>,
  refetch: Refetch,
}

impl<T> Query<T>
where
  T: Serialize + DeserializeOwned + Clone + Send + 'static,
{
  fn new(client: Arc<QueryClient>, key: Option<String>, fetcher: Fetcher<T>) -> Self {
    let options = client.defaults;
    Self {
      client,
      key,
      options,
      fetcher,
      result: QueryResult::default(),
      written_at: None,
      receiver: None,
      alive: Arc::new(AtomicBool::new(true)),
      generation: Arc::new(AtomicU64::new(0)),
      refetch: Refetch {
        requested: Arc::new(AtomicBool::new(false)),
      },
    }
  }

  pub fn with_ttl(mut self, ttl: Duration) -> Self {
    self.options.ttl = ttl;
    self
  }

  pub fn with_stale_window(mut self, stale_window: Duration) -> Self {
    self.options.stale_window = stale_window;
    self
  }

  pub fn with_retries(mut self, retries: u32) -> Self {
    self.options.retry.retries = retries;
    self
  }

  pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
    self.options.retry = retry;
    self
  }

  pub fn enabled(mut self, enabled: bool) -> Self {
    self.options.enabled = enabled;
    self
  }

  pub fn persist(mut self, persist: bool) -> Self {
    self.options.persist = persist;
    self
  }

  pub fn key(&self) -> Option<&str> {
    self.key.as_deref()
  }

  pub fn options(&self) -> &QueryOptions {
    &self.options
  }

  pub fn result(&self) -> &QueryResult<T> {
    &self.result
  }

  pub fn data(&self) -> Option<&T> {
    self.result.data.as_ref()
  }

  pub fn is_loading(&self) -> bool {
    self.result.loading
  }

  pub fn error(&self) -> Option<&str> {
    self.result.error.as_deref()
  }

  pub fn is_stale(&self) -> bool {
    self.result.is_stale
  }

  /// Whether a fetch is currently outstanding.
  pub fn is_fetching(&self) -> bool {
    self.receiver.is_some()
  }

  /// The stable refetch handle for this query.
  pub fn refetch_handle(&self) -> Refetch {
    self.refetch.clone()
  }

  /// Serve whatever the caches hold and start a background refresh unless
  /// the in-memory copy is still fresh.
  ///
  /// This is a no-op if the query is disabled or already fetching.
  pub fn activate(&mut self) {
    if !self.options.enabled {
      self.result.loading = false;
      return;
    }
    if self.is_fetching() {
      return;
    }

    if let Some(key) = self.key.clone() {
      if self.serve_from_memory(&key) {
        return;
      }
      if self.result.data.is_none() && self.options.persist {
        self.serve_from_persistent(&key);
      }
    }

    self.start_fetch(false);
  }

  /// Force a network refresh, even if data exists or a fetch is pending.
  pub fn refetch(&mut self) {
    if !self.options.enabled {
      return;
    }
    // Drop the pending receiver; an earlier fetch may still land in the
    // cache, but never in this query's state.
    self.receiver = None;
    self.start_fetch(true);
  }

  /// Poll for results from a pending fetch and for TTL expiry.
  ///
  /// Returns `true` if the state changed. Call this in your event loop tick
  /// handler.
  pub fn poll(&mut self) -> bool {
    let mut changed = false;

    if self.refetch.take() {
      self.refetch();
      changed = true;
    }

    if let Some(receiver) = &mut self.receiver {
      match receiver.try_recv() {
        Ok(outcome) => {
          self.apply(Some(outcome));
          changed = true;
        }
        Err(mpsc::error::TryRecvError::Empty) => {}
        Err(mpsc::error::TryRecvError::Disconnected) => {
          self.apply(None);
          changed = true;
        }
      }
    }

    self.check_staleness() || changed
  }

  /// Wait for the outstanding fetch, if any, to finish and apply it.
  pub async fn settle(&mut self) {
    if self.refetch.take() {
      self.refetch();
    }
    if let Some(receiver) = &mut self.receiver {
      let outcome = receiver.recv().await;
      self.apply(outcome);
    }
    self.check_staleness();
  }

  fn serve_from_memory(&mut self, key: &str) -> bool {
    let entry = match self.client.memory.get(key) {
      Some(entry) => entry,
      None => return false,
    };

    let freshness = entry.freshness(self.client.clock.now(), self.options.stale_window);
    if freshness == Freshness::Expired {
      self.client.memory.remove(key);
      return false;
    }

    match serde_json::from_value::<T>(entry.data) {
      Ok(data) => {
        self.result.data = Some(data);
        self.result.loading = false;
        self.result.is_stale = freshness == Freshness::Stale;
        self.written_at = Some(entry.written_at);
        freshness == Freshness::Fresh
      }
      Err(e) => {
        warn!(key, error = %e, "Cached value does not match query type");
        self.client.memory.remove(key);
        false
      }
    }
  }

  fn serve_from_persistent(&mut self, key: &str) {
    if let Some(hit) = self
      .client
      .persistent
      .get::<T>(key, self.options.stale_window)
    {
      debug!(key, is_stale = hit.is_stale, "Rehydrated query from persistent cache");
      self.result.data = Some(hit.data);
      self.result.is_stale = hit.is_stale;
      self.written_at = Some(hit.written_at);
    }
  }

  fn start_fetch(&mut self, explicit: bool) {
    let (tx, rx) = mpsc::unbounded_channel();
    self.receiver = Some(rx);
    self.result.loading = explicit || self.result.data.is_none();

    let fetcher = Arc::clone(&self.fetcher);
    let client = Arc::clone(&self.client);
    let alive = Arc::clone(&self.alive);
    let current = Arc::clone(&self.generation);
    let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
    let key = self.key.clone();
    let options = self.options;

    tokio::spawn(async move {
      let result = with_retry(options.retry, || fetcher()).await;
      if !alive.load(Ordering::SeqCst) {
        debug!(key = key.as_deref(), "Query dropped before fetch finished");
        return;
      }
      if current.load(Ordering::SeqCst) != generation {
        debug!(key = key.as_deref(), generation, "Superseded fetch discarded");
        return;
      }

      let outcome = result.map(|data| {
        let written_at = match &key {
          Some(key) => match serde_json::to_value(&data) {
            Ok(value) => client.write_back(key, value, options.ttl, options.persist),
            Err(e) => {
              error!(key = key.as_str(), error = %e, "Failed to serialize query result");
              client.clock.now()
            }
          },
          None => client.clock.now(),
        };
        (data, written_at)
      });

      // Ignore send errors - receiver may be gone already
      let _ = tx.send(outcome);
    });
  }

  fn apply(&mut self, outcome: Option<Outcome<T>>) {
    self.receiver = None;
    self.result.loading = false;
    match outcome {
      Some(Ok((data, written_at))) => {
        self.result.data = Some(data);
        self.result.error = None;
        self.result.is_stale = false;
        self.written_at = Some(written_at);
      }
      Some(Err(err)) => {
        // Keep whatever data we had; a failed refresh never blanks the view.
        warn!(key = self.key.as_deref(), error = %err, "Query failed");
        self.result.error = Some(err.to_string());
      }
      None => {
        self.result.error = Some("Query was cancelled".to_string());
      }
    }
  }

  /// Flip `is_stale` once the data outlives its TTL. Never refetches.
  fn check_staleness(&mut self) -> bool {
    if self.result.is_stale || self.result.data.is_none() {
      return false;
    }
    let written_at = match self.written_at {
      Some(at) => at,
      None => return false,
    };
    let entry = CacheEntry::new((), written_at, self.options.ttl);
    if self.client.clock.now() > entry.stale_at() {
      self.result.is_stale = true;
      return true;
    }
    false
  }
}

impl<T> Drop for Query<T> {
  fn drop(&mut self) {
    self.alive.store(false, Ordering::SeqCst);
  }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Query<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Query")
      .field("key", &self.key)
      .field("result", &self.result)
      .field("written_at", &self.written_at)
      .field("options", &self.options)
      .finish_non_exhaustive()
  }
}

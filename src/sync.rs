//! Background synchronization.
//!
//! A sync cycle drains the mutation queue first, then refreshes each
//! configured data source into the persistent cache, so reads never lag
//! behind this device's own pending writes. Cycles run on a timer and on
//! every reconnect.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{PersistentCache, DEFAULT_TTL};
use crate::network::NetworkMonitor;
use crate::query::{fetcher, Fetcher};
use crate::queue::{MutationExecutor, MutationQueue, QueueReport};

pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Shortest timer interval accepted by `start`.
const MIN_SYNC_INTERVAL: Duration = Duration::from_secs(1);

/// A remote read refreshed on every sync cycle.
#[derive(Clone)]
pub struct SyncDataSource {
  pub key: String,
  pub ttl: Duration,
  pub fetcher: Fetcher<Value>,
}

impl SyncDataSource {
  pub fn new<F, Fut>(key: impl Into<String>, fetch: F) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, crate::error::SyncError>> + Send + 'static,
  {
    Self {
      key: key.into(),
      ttl: DEFAULT_TTL,
      fetcher: fetcher(fetch),
    }
  }

  pub fn with_ttl(mut self, ttl: Duration) -> Self {
    self.ttl = ttl;
    self
  }
}

impl std::fmt::Debug for SyncDataSource {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("SyncDataSource")
      .field("key", &self.key)
      .field("ttl", &self.ttl)
      .finish_non_exhaustive()
  }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncStatus {
  /// Completed cycles since start-up
  pub runs: u64,
  pub last_run_at: Option<DateTime<Utc>>,
  pub last_duration_ms: Option<u64>,
  /// Most recent per-source failure, cleared by a clean cycle
  pub last_error: Option<String>,
  pub pending_mutations: usize,
  pub dead_letters: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
  Offline,
  AlreadyRunning,
  Completed(SyncReport),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
  pub queue: QueueReport,
  pub refreshed: Vec<String>,
  /// (source key, error message)
  pub failed: Vec<(String, String)>,
}

pub struct SyncOrchestrator {
  queue: Arc<MutationQueue>,
  cache: Arc<PersistentCache>,
  network: Arc<NetworkMonitor>,
  running: AtomicBool,
  status: Mutex<SyncStatus>,
  timer: Mutex<Option<JoinHandle<()>>>,
}

impl SyncOrchestrator {
  pub fn new(
    queue: Arc<MutationQueue>,
    cache: Arc<PersistentCache>,
    network: Arc<NetworkMonitor>,
  ) -> Self {
    Self {
      queue,
      cache,
      network,
      running: AtomicBool::new(false),
      status: Mutex::new(SyncStatus::default()),
      timer: Mutex::new(None),
    }
  }

  pub fn status(&self) -> SyncStatus {
    let mut status = lock(&self.status).clone();
    status.pending_mutations = self.queue.len();
    status.dead_letters = self.queue.dead_letters().len();
    status
  }

  pub fn is_running(&self) -> bool {
    self.running.load(Ordering::SeqCst)
  }

  /// Run one full cycle: replay queued mutations, then refresh sources.
  pub async fn run_sync(
    &self,
    sources: &[SyncDataSource],
    executor: &dyn MutationExecutor,
  ) -> SyncOutcome {
    if !self.network.is_connected() {
      debug!("Background sync skipped: offline");
      return SyncOutcome::Offline;
    }

    if self
      .running
      .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
      .is_err()
    {
      debug!("Background sync skipped: already running");
      return SyncOutcome::AlreadyRunning;
    }
    let _guard = RunningGuard(&self.running);

    let started = Instant::now();
    info!(sources = sources.len(), "Background sync started");

    let mut report = SyncReport {
      queue: self.queue.process_queue(executor).await,
      ..SyncReport::default()
    };

    self.refresh_sources(sources, &mut report).await;

    let duration = started.elapsed();
    info!(
      duration_ms = duration.as_millis() as u64,
      refreshed = report.refreshed.len(),
      failed = report.failed.len(),
      "Background sync completed"
    );

    {
      let mut status = lock(&self.status);
      status.runs += 1;
      status.last_run_at = Some(Utc::now());
      status.last_duration_ms = Some(duration.as_millis() as u64);
      status.last_error = report
        .failed
        .last()
        .map(|(key, err)| format!("{}: {}", key, err));
    }

    SyncOutcome::Completed(report)
  }

  async fn refresh_sources(&self, sources: &[SyncDataSource], report: &mut SyncReport) {
    if !self.network.is_connected() {
      return;
    }

    for source in sources {
      match (source.fetcher)().await {
        Ok(Value::Null) => {
          debug!(key = %source.key, "Background sync: source returned no data");
        }
        Ok(data) => {
          self.cache.set(&source.key, &data, source.ttl);
          debug!(key = %source.key, "Background sync: refreshed");
          report.refreshed.push(source.key.clone());
        }
        Err(err) => {
          warn!(key = %source.key, error = %err, "Background sync: failed to refresh");
          report.failed.push((source.key.clone(), err.to_string()));
        }
      }
    }
  }

  /// Run a cycle now, then every `interval`, and on every reconnect.
  ///
  /// Any timer from a previous `start` is stopped first. Must be called
  /// from within a tokio runtime.
  pub fn start(
    self: &Arc<Self>,
    sources: Vec<SyncDataSource>,
    executor: Arc<dyn MutationExecutor>,
    interval: Duration,
  ) {
    self.stop();

    let interval = interval.max(MIN_SYNC_INTERVAL);
    let sources: Arc<[SyncDataSource]> = sources.into();

    let weak = Arc::downgrade(self);
    let timer_sources = Arc::clone(&sources);
    let timer_executor = Arc::clone(&executor);
    let handle = tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        let Some(this) = weak.upgrade() else {
          break;
        };
        this.run_sync(&timer_sources, timer_executor.as_ref()).await;
      }
    });
    *lock(&self.timer) = Some(handle);

    let runtime = tokio::runtime::Handle::current();
    let weak: Weak<Self> = Arc::downgrade(self);
    self.network.set_reconnect_hook(move || {
      let Some(this) = weak.upgrade() else {
        return;
      };
      let sources = Arc::clone(&sources);
      let executor = Arc::clone(&executor);
      info!("Network reconnected - triggering sync");
      runtime.spawn(async move {
        this.run_sync(&sources, executor.as_ref()).await;
      });
    });

    info!(interval_secs = interval.as_secs(), "Background sync started");
  }

  /// Stop the timer and reconnect trigger. A cycle already in flight
  /// finishes on its own.
  pub fn stop(&self) {
    if let Some(handle) = lock(&self.timer).take() {
      handle.abort();
      self.network.clear_reconnect_hook();
      info!("Background sync stopped");
    }
  }

  pub fn is_started(&self) -> bool {
    lock(&self.timer).is_some()
  }
}

impl Drop for SyncOrchestrator {
  fn drop(&mut self) {
    if let Some(handle) = lock(&self.timer).take() {
      handle.abort();
    }
  }
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::SeqCst);
  }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(|e| e.into_inner())
}

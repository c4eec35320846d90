//! Durable FIFO of writes made while offline.
//!
//! The queue is the single record of writes the backend has not confirmed.
//! It is persisted as one blob on every change and replayed strictly in
//! enqueue order, one mutation at a time.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cache::KeyValueStorage;
use crate::clock::{Clock, SystemClock};
use crate::error::SyncError;
use crate::network::NetworkMonitor;

pub const QUEUE_STORAGE_KEY: &str = "offline_mutation_queue";
pub const DEAD_LETTER_STORAGE_KEY: &str = "offline_mutation_dead_letters";

/// Failed replays allowed before a mutation is moved to the dead-letter list.
pub const MAX_RETRIES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
  Create,
  Update,
  Delete,
}

impl fmt::Display for MutationKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      MutationKind::Create => write!(f, "create"),
      MutationKind::Update => write!(f, "update"),
      MutationKind::Delete => write!(f, "delete"),
    }
  }
}

impl FromStr for MutationKind {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_lowercase().as_str() {
      "create" | "insert" => Ok(MutationKind::Create),
      "update" => Ok(MutationKind::Update),
      "delete" => Ok(MutationKind::Delete),
      other => Err(format!(
        "unknown mutation kind '{}' (expected create, update or delete)",
        other
      )),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineMutation {
  pub id: String,
  pub kind: MutationKind,
  /// Remote resource (table) the write targets
  pub resource: String,
  pub payload: Map<String, Value>,
  pub created_at: DateTime<Utc>,
  pub retry_count: u32,
  pub last_error: Option<String>,
}

/// Applies one queued mutation to the backend.
#[async_trait]
pub trait MutationExecutor: Send + Sync {
  async fn execute(&self, mutation: &OfflineMutation) -> Result<(), SyncError>;
}

/// Adapts a closure into a `MutationExecutor`.
pub struct FnExecutor<F>(F);

pub fn executor_fn<F, Fut>(f: F) -> FnExecutor<F>
where
  F: Fn(OfflineMutation) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<(), SyncError>> + Send + 'static,
{
  FnExecutor(f)
}

#[async_trait]
impl<F, Fut> MutationExecutor for FnExecutor<F>
where
  F: Fn(OfflineMutation) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<(), SyncError>> + Send + 'static,
{
  async fn execute(&self, mutation: &OfflineMutation) -> Result<(), SyncError> {
    (self.0)(mutation.clone()).await
  }
}

/// Why a `process_queue` call did no work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
  AlreadySyncing,
  Offline,
  Empty,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueReport {
  pub attempted: usize,
  pub succeeded: usize,
  /// Failed this pass but still queued for another attempt
  pub retained: usize,
  pub dead_lettered: usize,
  pub skipped: Option<SkipReason>,
}

impl QueueReport {
  fn skipped(reason: SkipReason) -> Self {
    Self {
      skipped: Some(reason),
      ..Self::default()
    }
  }
}

pub struct MutationQueue {
  storage: Arc<dyn KeyValueStorage>,
  network: Arc<NetworkMonitor>,
  clock: Arc<dyn Clock>,
  queue: Mutex<Vec<OfflineMutation>>,
  dead_letters: Mutex<Vec<OfflineMutation>>,
  is_syncing: AtomicBool,
  max_retries: u32,
}

impl MutationQueue {
  pub fn new(storage: Arc<dyn KeyValueStorage>, network: Arc<NetworkMonitor>) -> Self {
    Self {
      storage,
      network,
      clock: Arc::new(SystemClock),
      queue: Mutex::new(Vec::new()),
      dead_letters: Mutex::new(Vec::new()),
      is_syncing: AtomicBool::new(false),
      max_retries: MAX_RETRIES,
    }
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn with_max_retries(mut self, max_retries: u32) -> Self {
    self.max_retries = max_retries.max(1);
    self
  }

  /// Append a mutation and persist the queue. Never touches the network.
  pub fn enqueue(
    &self,
    kind: MutationKind,
    resource: &str,
    payload: Map<String, Value>,
  ) -> OfflineMutation {
    let mutation = OfflineMutation {
      id: Uuid::new_v4().to_string(),
      kind,
      resource: resource.to_string(),
      payload,
      created_at: self.clock.now(),
      retry_count: 0,
      last_error: None,
    };

    {
      let mut queue = lock(&self.queue);
      queue.push(mutation.clone());
      self.persist(QUEUE_STORAGE_KEY, &queue);
    }

    info!(kind = %kind, resource, id = %mutation.id, "Mutation queued for offline sync");
    mutation
  }

  /// Remove one mutation by id. Returns whether it was present.
  pub fn dequeue(&self, id: &str) -> bool {
    let mut queue = lock(&self.queue);
    let before = queue.len();
    queue.retain(|m| m.id != id);
    let removed = queue.len() != before;
    if removed {
      self.persist(QUEUE_STORAGE_KEY, &queue);
    }
    removed
  }

  /// Replay every queued mutation through `executor`, oldest first.
  ///
  /// Skipped when another pass is running, when offline, or when there is
  /// nothing queued. Mutations that fail keep their place with an
  /// incremented `retry_count`; once that reaches the retry cap they move to
  /// the dead-letter list.
  pub async fn process_queue(&self, executor: &dyn MutationExecutor) -> QueueReport {
    if self
      .is_syncing
      .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
      .is_err()
    {
      return QueueReport::skipped(SkipReason::AlreadySyncing);
    }
    let _guard = SyncingGuard(&self.is_syncing);

    if !self.network.is_connected() {
      return QueueReport::skipped(SkipReason::Offline);
    }

    let snapshot = lock(&self.queue).clone();
    if snapshot.is_empty() {
      return QueueReport::skipped(SkipReason::Empty);
    }

    info!(count = snapshot.len(), "Processing queued mutation(s)");

    let mut report = QueueReport {
      attempted: snapshot.len(),
      ..QueueReport::default()
    };
    let mut failed = Vec::new();

    for mutation in &snapshot {
      match executor.execute(mutation).await {
        Ok(()) => {
          report.succeeded += 1;
          info!(id = %mutation.id, kind = %mutation.kind, resource = %mutation.resource, "Mutation synced");
        }
        Err(err) => {
          error!(id = %mutation.id, error = %err, "Mutation sync failed");
          failed.push(OfflineMutation {
            retry_count: mutation.retry_count + 1,
            last_error: Some(err.to_string()),
            ..mutation.clone()
          });
        }
      }
    }

    let (retained, exhausted): (Vec<_>, Vec<_>) = failed
      .into_iter()
      .partition(|m| m.retry_count < self.max_retries);

    {
      let mut queue = lock(&self.queue);
      let snapshot_ids: HashSet<&str> = snapshot.iter().map(|m| m.id.as_str()).collect();
      let current_ids: HashSet<String> = queue.iter().map(|m| m.id.clone()).collect();

      // Failures keep their place ahead of anything enqueued during the pass;
      // entries dequeued meanwhile stay gone.
      let mut next: Vec<OfflineMutation> = retained
        .into_iter()
        .filter(|m| current_ids.contains(&m.id))
        .collect();
      next.extend(
        queue
          .iter()
          .filter(|m| !snapshot_ids.contains(m.id.as_str()))
          .cloned(),
      );

      report.retained = next
        .iter()
        .filter(|m| snapshot_ids.contains(m.id.as_str()))
        .count();
      *queue = next;
      self.persist(QUEUE_STORAGE_KEY, &queue);
    }

    if !exhausted.is_empty() {
      report.dead_lettered = exhausted.len();
      for m in &exhausted {
        error!(
          id = %m.id,
          kind = %m.kind,
          resource = %m.resource,
          retries = m.retry_count,
          last_error = m.last_error.as_deref().unwrap_or(""),
          "Mutation exceeded retry cap, moved to dead letters"
        );
      }
      let mut dead = lock(&self.dead_letters);
      dead.extend(exhausted);
      self.persist(DEAD_LETTER_STORAGE_KEY, &dead);
    }

    if report.retained > 0 {
      warn!(count = report.retained, "Mutation(s) still pending after sync attempt");
    }

    report
  }

  /// Load persisted state written before a previous shutdown. Anything
  /// enqueued since start-up is kept after the restored entries.
  pub fn rehydrate(&self) {
    let restored: Vec<OfflineMutation> = self.load(QUEUE_STORAGE_KEY);
    let restored_dead: Vec<OfflineMutation> = self.load(DEAD_LETTER_STORAGE_KEY);

    {
      let mut queue = lock(&self.queue);
      let restored_ids: HashSet<String> = restored.iter().map(|m| m.id.clone()).collect();
      let mut merged = restored;
      merged.extend(queue.drain(..).filter(|m| !restored_ids.contains(&m.id)));
      info!(count = merged.len(), "Rehydrated queued mutation(s)");
      *queue = merged;
    }

    *lock(&self.dead_letters) = restored_dead;
  }

  /// Empty the queue and erase its persisted copy.
  pub fn clear(&self) {
    lock(&self.queue).clear();
    if let Err(e) = self.storage.remove(QUEUE_STORAGE_KEY) {
      error!(error = %e, "Failed to clear mutation queue storage");
    }
  }

  pub fn pending(&self) -> Vec<OfflineMutation> {
    lock(&self.queue).clone()
  }

  pub fn len(&self) -> usize {
    lock(&self.queue).len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn is_syncing(&self) -> bool {
    self.is_syncing.load(Ordering::SeqCst)
  }

  pub fn dead_letters(&self) -> Vec<OfflineMutation> {
    lock(&self.dead_letters).clone()
  }

  /// Move a dead-lettered mutation back to the end of the queue with a
  /// fresh retry budget.
  pub fn requeue_dead_letter(&self, id: &str) -> bool {
    let mutation = {
      let mut dead = lock(&self.dead_letters);
      let index = match dead.iter().position(|m| m.id == id) {
        Some(index) => index,
        None => return false,
      };
      let mutation = dead.remove(index);
      self.persist(DEAD_LETTER_STORAGE_KEY, &dead);
      mutation
    };

    let mut queue = lock(&self.queue);
    queue.push(OfflineMutation {
      retry_count: 0,
      ..mutation
    });
    self.persist(QUEUE_STORAGE_KEY, &queue);
    info!(id, "Requeued dead-lettered mutation");
    true
  }

  pub fn clear_dead_letters(&self) {
    lock(&self.dead_letters).clear();
    if let Err(e) = self.storage.remove(DEAD_LETTER_STORAGE_KEY) {
      error!(error = %e, "Failed to clear dead-letter storage");
    }
  }

  fn persist(&self, key: &str, mutations: &[OfflineMutation]) {
    let result = serde_json::to_string(mutations)
      .map_err(SyncError::from)
      .and_then(|raw| self.storage.set(key, &raw).map_err(SyncError::from));
    if let Err(e) = result {
      error!(key, error = %e, "Failed to persist mutation queue");
    }
  }

  fn load(&self, key: &str) -> Vec<OfflineMutation> {
    let result = self
      .storage
      .get(key)
      .map_err(SyncError::from)
      .and_then(|raw| match raw {
        Some(raw) => serde_json::from_str(&raw).map_err(SyncError::from),
        None => Ok(Vec::new()),
      });
    match result {
      Ok(mutations) => mutations,
      Err(e) => {
        error!(key, error = %e, "Failed to rehydrate mutation queue");
        Vec::new()
      }
    }
  }
}

/// Clears the syncing flag however the pass ends.
struct SyncingGuard<'a>(&'a AtomicBool);

impl Drop for SyncingGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::SeqCst);
  }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::MemoryStorage;
  use crate::network::NetworkStatus;
  use serde_json::json;
  use std::time::Duration;

  fn payload(value: Value) -> Map<String, Value> {
    match value {
      Value::Object(map) => map,
      _ => panic!("payload must be an object"),
    }
  }

  fn setup() -> (Arc<MutationQueue>, Arc<MemoryStorage>, Arc<NetworkMonitor>) {
    let storage = Arc::new(MemoryStorage::new());
    let network = Arc::new(NetworkMonitor::new());
    let queue = Arc::new(MutationQueue::new(storage.clone(), network.clone()));
    (queue, storage, network)
  }

  fn recording_executor() -> (
    FnExecutor<impl Fn(OfflineMutation) -> futures::future::Ready<Result<(), SyncError>>>,
    Arc<Mutex<Vec<OfflineMutation>>>,
  ) {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let sink = calls.clone();
    let executor = executor_fn(move |m: OfflineMutation| {
      sink.lock().unwrap().push(m);
      futures::future::ready(Ok(()))
    });
    (executor, calls)
  }

  fn failing_executor() -> FnExecutor<impl Fn(OfflineMutation) -> futures::future::Ready<Result<(), SyncError>>> {
    executor_fn(|_m: OfflineMutation| futures::future::ready(Err(SyncError::Server("500".into()))))
  }

  #[tokio::test]
  async fn test_replay_is_fifo() {
    let (queue, _storage, _network) = setup();
    let a = queue.enqueue(MutationKind::Create, "spots", payload(json!({"name": "A"})));
    let b = queue.enqueue(MutationKind::Update, "spots", payload(json!({"id": 1, "name": "B"})));

    let (executor, calls) = recording_executor();
    let report = queue.process_queue(&executor).await;

    let ids: Vec<String> = calls.lock().unwrap().iter().map(|m| m.id.clone()).collect();
    assert_eq!(ids, vec![a.id, b.id]);
    assert_eq!(report.succeeded, 2);
    assert!(queue.is_empty());
  }

  #[tokio::test]
  async fn test_enqueue_persists_whole_queue() {
    let (queue, storage, _network) = setup();
    queue.enqueue(MutationKind::Create, "spots", payload(json!({"name": "X"})));
    queue.enqueue(MutationKind::Delete, "spots", payload(json!({"id": 3})));

    let raw = storage.get(QUEUE_STORAGE_KEY).unwrap().unwrap();
    let stored: Vec<OfflineMutation> = serde_json::from_str(&raw).unwrap();
    assert_eq!(stored, queue.pending());
    assert_eq!(stored[0].retry_count, 0);
    assert_eq!(stored[0].last_error, None);
  }

  #[tokio::test]
  async fn test_retry_cap_moves_to_dead_letters() {
    let (queue, _storage, _network) = setup();
    let m = queue.enqueue(MutationKind::Create, "spots", payload(json!({"name": "X"})));
    let executor = failing_executor();

    for pass in 1..=4 {
      let report = queue.process_queue(&executor).await;
      assert_eq!(report.retained, 1);
      let pending = queue.pending();
      assert_eq!(pending.len(), 1);
      assert_eq!(pending[0].retry_count, pass);
      assert_eq!(pending[0].last_error.as_deref(), Some("Server error: 500"));
    }

    let report = queue.process_queue(&executor).await;
    assert_eq!(report.dead_lettered, 1);
    assert!(queue.is_empty());

    let dead = queue.dead_letters();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, m.id);
    assert_eq!(dead[0].retry_count, MAX_RETRIES);
  }

  #[tokio::test]
  async fn test_requeue_dead_letter_resets_budget() {
    let queue = MutationQueue::new(Arc::new(MemoryStorage::new()), Arc::new(NetworkMonitor::new()))
      .with_max_retries(1);
    let m = queue.enqueue(MutationKind::Delete, "crews", payload(json!({"id": 9})));
    queue.process_queue(&failing_executor()).await;
    assert_eq!(queue.dead_letters().len(), 1);

    assert!(queue.requeue_dead_letter(&m.id));
    assert!(queue.dead_letters().is_empty());
    let pending = queue.pending();
    assert_eq!(pending[0].retry_count, 0);

    assert!(!queue.requeue_dead_letter("missing"));
  }

  #[tokio::test]
  async fn test_offline_pass_is_skipped() {
    let (queue, _storage, network) = setup();
    network.update(NetworkStatus::offline());
    queue.enqueue(MutationKind::Create, "spots", payload(json!({"name": "X"})));

    let (executor, calls) = recording_executor();
    let report = queue.process_queue(&executor).await;
    assert_eq!(report.skipped, Some(SkipReason::Offline));
    assert!(calls.lock().unwrap().is_empty());
    assert_eq!(queue.len(), 1);
  }

  #[tokio::test]
  async fn test_empty_queue_is_skipped() {
    let (queue, _storage, _network) = setup();
    let (executor, _calls) = recording_executor();
    let report = queue.process_queue(&executor).await;
    assert_eq!(report.skipped, Some(SkipReason::Empty));
  }

  #[tokio::test(start_paused = true)]
  async fn test_reentrant_call_is_noop() {
    let (queue, _storage, _network) = setup();
    queue.enqueue(MutationKind::Create, "spots", payload(json!({"name": "X"})));

    let calls = Arc::new(Mutex::new(0u32));
    let counter = calls.clone();
    let slow = executor_fn(move |_m: OfflineMutation| {
      let counter = counter.clone();
      async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        *counter.lock().unwrap() += 1;
        Ok(())
      }
    });

    let (first, second) = tokio::join!(queue.process_queue(&slow), queue.process_queue(&slow));
    assert_eq!(first.succeeded, 1);
    assert_eq!(second.skipped, Some(SkipReason::AlreadySyncing));
    assert_eq!(*calls.lock().unwrap(), 1);
    assert!(!queue.is_syncing());
  }

  #[tokio::test]
  async fn test_enqueue_during_pass_is_kept() {
    let (queue, _storage, _network) = setup();
    queue.enqueue(MutationKind::Create, "spots", payload(json!({"name": "first"})));

    let inner = queue.clone();
    let executor = executor_fn(move |_m: OfflineMutation| {
      inner.enqueue(MutationKind::Create, "spots", payload(json!({"name": "late"})));
      futures::future::ready(Ok(()))
    });
    queue.process_queue(&executor).await;

    let pending = queue.pending();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].payload["name"], "late");
  }

  #[tokio::test]
  async fn test_rehydrate_restores_previous_session() {
    let storage = Arc::new(MemoryStorage::new());
    let network = Arc::new(NetworkMonitor::new());

    let before = MutationQueue::new(storage.clone(), network.clone());
    let a = before.enqueue(MutationKind::Create, "spots", payload(json!({"name": "A"})));
    let b = before.enqueue(MutationKind::Update, "spots", payload(json!({"id": 1})));
    drop(before);

    let after = MutationQueue::new(storage, network);
    assert!(after.is_empty());
    after.rehydrate();
    let ids: Vec<String> = after.pending().into_iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![a.id, b.id]);
  }

  #[tokio::test]
  async fn test_dequeue_and_clear() {
    let (queue, storage, _network) = setup();
    let a = queue.enqueue(MutationKind::Create, "spots", payload(json!({"name": "A"})));
    queue.enqueue(MutationKind::Create, "spots", payload(json!({"name": "B"})));

    assert!(queue.dequeue(&a.id));
    assert!(!queue.dequeue(&a.id));
    assert_eq!(queue.len(), 1);

    queue.clear();
    assert!(queue.is_empty());
    assert_eq!(storage.get(QUEUE_STORAGE_KEY).unwrap(), None);
  }

  #[test]
  fn test_kind_parsing() {
    assert_eq!("Create".parse::<MutationKind>(), Ok(MutationKind::Create));
    assert_eq!("delete".parse::<MutationKind>(), Ok(MutationKind::Delete));
    assert!("upsert".parse::<MutationKind>().is_err());
    assert_eq!(MutationKind::Update.to_string(), "update");
  }
}

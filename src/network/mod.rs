//! Connectivity observer.
//!
//! `NetworkMonitor` holds the current `NetworkStatus`, fans every change out
//! to subscribers, and fires a single reconnect hook on offline -> online
//! edges. It never retries or backs off anything itself.

mod probe;

pub use probe::HttpProbe;

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkStatus {
  pub is_connected: bool,
  /// `None` when reachability could not be determined
  pub is_internet_reachable: Option<bool>,
  pub connection_type: Option<String>,
}

impl NetworkStatus {
  pub fn online(connection_type: impl Into<String>) -> Self {
    Self {
      is_connected: true,
      is_internet_reachable: Some(true),
      connection_type: Some(connection_type.into()),
    }
  }

  pub fn offline() -> Self {
    Self {
      is_connected: false,
      is_internet_reachable: Some(false),
      connection_type: None,
    }
  }
}

impl Default for NetworkStatus {
  /// Assume connectivity until told otherwise.
  fn default() -> Self {
    Self {
      is_connected: true,
      is_internet_reachable: Some(true),
      connection_type: None,
    }
  }
}

type Listener = Arc<dyn Fn(&NetworkStatus) + Send + Sync>;
type ReconnectHook = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
pub struct NetworkMonitor {
  status: RwLock<NetworkStatus>,
  listeners: Mutex<Vec<(u64, Listener)>>,
  next_listener_id: AtomicU64,
  reconnect_hook: Mutex<Option<ReconnectHook>>,
}

impl NetworkMonitor {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_status(status: NetworkStatus) -> Self {
    Self {
      status: RwLock::new(status),
      ..Self::default()
    }
  }

  pub fn current_status(&self) -> NetworkStatus {
    self.status.read().unwrap_or_else(|e| e.into_inner()).clone()
  }

  pub fn is_connected(&self) -> bool {
    self
      .status
      .read()
      .unwrap_or_else(|e| e.into_inner())
      .is_connected
  }

  /// Register a listener for every status change. The listener stays
  /// registered until the returned `Subscription` is dropped.
  #[must_use = "dropping the subscription unsubscribes immediately"]
  pub fn subscribe<F>(self: &Arc<Self>, listener: F) -> Subscription
  where
    F: Fn(&NetworkStatus) + Send + Sync + 'static,
  {
    let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
    self
      .listeners
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .push((id, Arc::new(listener)));
    Subscription {
      monitor: Arc::downgrade(self),
      id,
    }
  }

  /// Install the hook run on every offline -> online transition,
  /// replacing any previous one.
  pub fn set_reconnect_hook<F>(&self, hook: F)
  where
    F: Fn() + Send + Sync + 'static,
  {
    *self.reconnect_hook.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(hook));
  }

  pub fn clear_reconnect_hook(&self) {
    *self.reconnect_hook.lock().unwrap_or_else(|e| e.into_inner()) = None;
  }

  /// Record a new status from the connectivity source.
  pub fn update(&self, status: NetworkStatus) {
    let was_connected = {
      let mut current = self.status.write().unwrap_or_else(|e| e.into_inner());
      let was_connected = current.is_connected;
      *current = status.clone();
      was_connected
    };

    let connection_type = status.connection_type.as_deref().unwrap_or("unknown");
    if status.is_connected {
      info!(connection_type, "Connection changed: connected");
    } else {
      warn!(connection_type, "Connection changed: disconnected");
    }

    // Call out without holding the lock so listeners may subscribe or read status.
    let listeners: Vec<Listener> = self
      .listeners
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .iter()
      .map(|(_, l)| Arc::clone(l))
      .collect();
    for listener in listeners {
      listener(&status);
    }

    if !was_connected && status.is_connected {
      let hook = self
        .reconnect_hook
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clone();
      if let Some(hook) = hook {
        info!("Network reconnected");
        hook();
      }
    }
  }

  fn unsubscribe(&self, id: u64) {
    self
      .listeners
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .retain(|(lid, _)| *lid != id);
  }

  pub fn listener_count(&self) -> usize {
    self.listeners.lock().unwrap_or_else(|e| e.into_inner()).len()
  }
}

/// Handle returned by `NetworkMonitor::subscribe`.
pub struct Subscription {
  monitor: Weak<NetworkMonitor>,
  id: u64,
}

impl Subscription {
  pub fn unsubscribe(self) {
    // Drop does the work
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    if let Some(monitor) = self.monitor.upgrade() {
      monitor.unsubscribe(self.id);
    }
  }
}

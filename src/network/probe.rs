//! HTTP reachability probe feeding `NetworkMonitor`.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;
use url::Url;

use super::{NetworkMonitor, NetworkStatus};
use crate::error::SyncError;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECTION_TYPE: &str = "http";

/// Periodically requests a URL and reports connectivity to a monitor.
///
/// Any HTTP response, including error statuses, counts as connected: the
/// server answered. Only transport failures count as disconnected.
#[derive(Clone)]
pub struct HttpProbe {
  client: reqwest::Client,
  target: Url,
  interval: Duration,
}

impl HttpProbe {
  pub fn new(target: Url, interval: Duration) -> Result<Self, SyncError> {
    Self::with_timeout(target, interval, PROBE_TIMEOUT)
  }

  /// Like `new`, with a per-request timeout other than the default 5s.
  pub fn with_timeout(target: Url, interval: Duration, timeout: Duration) -> Result<Self, SyncError> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| SyncError::Network(format!("Failed to create probe client: {}", e)))?;
    Ok(Self {
      client,
      target,
      interval,
    })
  }

  /// Probe once.
  pub async fn check(&self) -> NetworkStatus {
    match self.client.head(self.target.clone()).send().await {
      Ok(response) => {
        debug!(url = %self.target, status = response.status().as_u16(), "Probe answered");
        NetworkStatus::online(CONNECTION_TYPE)
      }
      Err(e) => {
        debug!(url = %self.target, error = %e, "Probe failed");
        NetworkStatus {
          is_connected: false,
          is_internet_reachable: if e.is_timeout() { None } else { Some(false) },
          connection_type: None,
        }
      }
    }
  }

  /// Probe once and push the result to `monitor` if it differs from the
  /// current status.
  pub async fn refresh(&self, monitor: &NetworkMonitor) {
    let status = self.check().await;
    if status != monitor.current_status() {
      monitor.update(status);
    }
  }

  /// Run the probe on its interval until the returned task is aborted.
  pub fn spawn(self, monitor: Arc<NetworkMonitor>) -> JoinHandle<()> {
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(self.interval);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        self.refresh(&monitor).await;
      }
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_unreachable_target_reports_offline() {
    // Port 9 on localhost (discard) is closed on any sane test host.
    let target = Url::parse("http://127.0.0.1:9/").unwrap();
    let probe = HttpProbe::new(target, Duration::from_secs(60)).unwrap();
    let monitor = NetworkMonitor::new();

    probe.refresh(&monitor).await;
    assert!(!monitor.is_connected());
  }

  #[tokio::test]
  async fn test_silent_target_times_out() {
    // Accepts connections but never answers
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target = Url::parse(&format!("http://{}/", listener.local_addr().unwrap())).unwrap();
    let _server = tokio::spawn(async move {
      let mut held = Vec::new();
      while let Ok((socket, _)) = listener.accept().await {
        held.push(socket);
      }
    });

    let probe =
      HttpProbe::with_timeout(target, Duration::from_secs(60), Duration::from_millis(100)).unwrap();
    let status = tokio::time::timeout(Duration::from_secs(5), probe.check())
      .await
      .expect("probe should give up on its own timeout");

    assert!(!status.is_connected);
    assert_eq!(status.is_internet_reachable, None);
  }
}

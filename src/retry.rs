//! Retry with exponential backoff for classified errors.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Retries after the first attempt; total attempts are `retries + 1`.
  pub retries: u32,
  /// Delay before the first retry. Doubles on every subsequent retry.
  pub base_delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      retries: 3,
      base_delay: Duration::from_millis(1000),
    }
  }
}

impl RetryPolicy {
  pub fn new(retries: u32, base_delay: Duration) -> Self {
    Self {
      retries,
      base_delay,
    }
  }

  /// No retries at all.
  pub fn none() -> Self {
    Self::new(0, Duration::ZERO)
  }

  /// Delay before retry number `attempt` (0-based): `base_delay * 2^attempt`.
  pub fn delay_for(&self, attempt: u32) -> Duration {
    let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
    self.base_delay.saturating_mul(factor)
  }
}

/// Run `operation` until it succeeds, fails with a non-retriable error, or
/// the retry budget is spent. The last error is returned on exhaustion.
pub async fn with_retry<T, F, Fut>(policy: RetryPolicy, mut operation: F) -> Result<T, SyncError>
where
  F: FnMut() -> Fut,
  Fut: Future<Output = Result<T, SyncError>>,
{
  let mut attempt = 0;
  loop {
    match operation().await {
      Ok(value) => return Ok(value),
      Err(err) if !err.is_retriable() => return Err(err),
      Err(err) if attempt >= policy.retries => return Err(err),
      Err(err) => {
        let delay = policy.delay_for(attempt);
        warn!(
          attempt = attempt + 1,
          retries = policy.retries,
          delay_ms = delay.as_millis() as u64,
          error = %err,
          "Request failed, retrying"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
      }
    }
  }
}

//! Wall-clock source for cache timestamps.

use chrono::{DateTime, Utc};
use std::sync::Mutex;
use std::time::Duration;

pub trait Clock: Send + Sync {
  fn now(&self) -> DateTime<Utc>;
}

/// The real system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }
}

/// A clock that only moves when told to. Used to step through TTL windows.
#[derive(Debug)]
pub struct ManualClock {
  now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
  pub fn new(start: DateTime<Utc>) -> Self {
    Self {
      now: Mutex::new(start),
    }
  }

  pub fn advance(&self, by: Duration) {
    let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
    *now += chrono::Duration::from_std(by).unwrap_or(chrono::Duration::MAX);
  }
}

impl Default for ManualClock {
  fn default() -> Self {
    Self::new(Utc::now())
  }
}

impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    *self.now.lock().unwrap_or_else(|e| e.into_inner())
  }
}

/// Elapsed time between `since` and `now`, clamped to zero on clock skew.
pub fn age(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
  (now - since).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_manual_clock_advances() {
    let clock = ManualClock::default();
    let start = clock.now();
    clock.advance(Duration::from_millis(1500));
    assert_eq!(age(start, clock.now()), Duration::from_millis(1500));
  }

  #[test]
  fn test_age_clamps_negative() {
    let now = Utc::now();
    let future = now + chrono::Duration::seconds(10);
    assert_eq!(age(future, now), Duration::ZERO);
  }
}

//! Cache entry types shared by both cache tiers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::clock;

/// Smallest TTL an entry may carry; a zero TTL is raised to this.
pub const MIN_TTL: Duration = Duration::from_millis(1);

/// A cached payload plus the metadata needed to judge its freshness.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheEntry<T> {
  pub data: T,
  pub written_at: DateTime<Utc>,
  #[serde(rename = "ttl_ms", with = "duration_ms")]
  pub ttl: Duration,
}

/// Where an entry sits relative to its TTL and stale window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
  /// age <= ttl
  Fresh,
  /// ttl < age <= ttl + stale_window
  Stale,
  /// age > ttl + stale_window
  Expired,
}

impl<T> CacheEntry<T> {
  pub fn new(data: T, written_at: DateTime<Utc>, ttl: Duration) -> Self {
    Self {
      data,
      written_at,
      ttl: ttl.max(MIN_TTL),
    }
  }

  pub fn freshness(&self, now: DateTime<Utc>, stale_window: Duration) -> Freshness {
    let age = clock::age(self.written_at, now);
    if age <= self.ttl {
      Freshness::Fresh
    } else if age <= self.ttl.saturating_add(stale_window) {
      Freshness::Stale
    } else {
      Freshness::Expired
    }
  }

  /// Instant at which this entry stops being fresh.
  pub fn stale_at(&self) -> DateTime<Utc> {
    self.written_at + chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX)
  }
}

/// A successful cache read.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheHit<T> {
  pub data: T,
  pub is_stale: bool,
  pub written_at: DateTime<Utc>,
}

mod duration_ms {
  use serde::{Deserialize, Deserializer, Serializer};
  use std::time::Duration;

  pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis().min(u64::MAX as u128) as u64)
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
    Ok(Duration::from_millis(u64::deserialize(d)?))
  }
}

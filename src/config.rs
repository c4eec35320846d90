use color_eyre::{
  eyre::{eyre, WrapErr},
  Result,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::cache::DEFAULT_TTL;
use crate::query::{QueryOptions, DEFAULT_STALE_WINDOW};
use crate::queue::MAX_RETRIES;
use crate::retry::RetryPolicy;
use crate::sync::DEFAULT_SYNC_INTERVAL;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub backend: BackendConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub query: QueryConfig,
  /// Reads refreshed on every background sync cycle
  #[serde(default)]
  pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
  pub url: Url,
  #[serde(default = "default_schema_path")]
  pub schema_path: String,
}

fn default_schema_path() -> String {
  "/rest/v1".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  pub interval_secs: u64,
  /// Connectivity probe cadence
  pub probe_interval_secs: u64,
  pub max_mutation_retries: u32,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      interval_secs: DEFAULT_SYNC_INTERVAL.as_secs(),
      probe_interval_secs: 15,
      max_mutation_retries: MAX_RETRIES,
    }
  }
}

impl SyncConfig {
  pub fn interval(&self) -> Duration {
    Duration::from_secs(self.interval_secs)
  }

  pub fn probe_interval(&self) -> Duration {
    Duration::from_secs(self.probe_interval_secs.max(1))
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Database location (defaults to <data_dir>/spotsync/cache.db)
  pub path: Option<PathBuf>,
  /// Without persistence nothing survives a restart
  pub persist: bool,
  pub ttl_secs: u64,
  pub stale_window_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      path: None,
      persist: true,
      ttl_secs: DEFAULT_TTL.as_secs(),
      stale_window_secs: DEFAULT_STALE_WINDOW.as_secs(),
    }
  }
}

impl CacheConfig {
  pub fn ttl(&self) -> Duration {
    Duration::from_secs(self.ttl_secs)
  }

  pub fn stale_window(&self) -> Duration {
    Duration::from_secs(self.stale_window_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
  pub retries: u32,
  pub base_delay_ms: u64,
}

impl Default for QueryConfig {
  fn default() -> Self {
    let policy = RetryPolicy::default();
    Self {
      retries: policy.retries,
      base_delay_ms: policy.base_delay.as_millis() as u64,
    }
  }
}

impl QueryConfig {
  pub fn retry_policy(&self) -> RetryPolicy {
    RetryPolicy::new(self.retries, Duration::from_millis(self.base_delay_ms))
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
  pub table: String,
  #[serde(default = "default_source_query")]
  pub query: String,
  /// Cache key (defaults to one derived from table and query)
  pub key: Option<String>,
  pub ttl_secs: Option<u64>,
}

fn default_source_query() -> String {
  "select=*".to_string()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./spotsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/spotsync/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = match explicit_path {
      Some(p) if p.exists() => p.to_path_buf(),
      Some(p) => return Err(eyre!("Config file not found: {}", p.display())),
      None => Self::candidate_paths()
        .into_iter()
        .find(|p| p.exists())
        .ok_or_else(|| {
          eyre!("No configuration file found. Create one at ~/.config/spotsync/config.yaml")
        })?,
    };
    Self::load_from_path(&path)
  }

  /// Implicit locations, most specific first.
  fn candidate_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("spotsync.yaml")];
    if let Some(config_dir) = dirs::config_dir() {
      paths.push(config_dir.join("spotsync").join("config.yaml"));
    }
    paths
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    std::fs::read_to_string(path)
      .wrap_err("Failed to read")
      .and_then(|contents| Self::parse(&contents))
      .wrap_err_with(|| format!("Config file {}", path.display()))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    serde_yaml::from_str(contents).wrap_err("Invalid configuration")
  }

  /// Defaults applied to every query built from this config.
  pub fn query_options(&self) -> QueryOptions {
    QueryOptions {
      ttl: self.cache.ttl(),
      stale_window: self.cache.stale_window(),
      retry: self.query.retry_policy(),
      ..QueryOptions::default()
    }
  }

  /// Get the backend API key from environment variables.
  ///
  /// Checks SPOTSYNC_API_KEY first, then SUPABASE_ANON_KEY as fallback.
  pub fn get_api_key() -> Result<String> {
    std::env::var("SPOTSYNC_API_KEY")
      .or_else(|_| std::env::var("SUPABASE_ANON_KEY"))
      .map_err(|_| {
        eyre!("API key not found. Set SPOTSYNC_API_KEY or SUPABASE_ANON_KEY environment variable.")
      })
  }

  /// Signed-in user's token, if any. Checks SPOTSYNC_ACCESS_TOKEN.
  pub fn get_access_token() -> Option<String> {
    std::env::var("SPOTSYNC_ACCESS_TOKEN")
      .ok()
      .filter(|t| !t.is_empty())
  }
}

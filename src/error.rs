//! Error taxonomy shared by the cache, queue and sync layers.

use thiserror::Error;

/// Maximum length for response bodies carried in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// PostgREST code for an expired or invalid JWT
const PGRST_JWT_EXPIRED: &str = "PGRST301";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
  /// Transport failure or transient condition (timeouts, rate limits)
  #[error("Network error: {0}")]
  Network(String),

  #[error("Authentication failed: {0}")]
  Auth(String),

  #[error("Validation failed: {0}")]
  Validation(String),

  /// 5xx-equivalent backend failure
  #[error("Server error: {0}")]
  Server(String),

  /// Durable storage failure. Never surfaced past the cache or queue.
  #[error("Storage error: {0}")]
  Storage(String),
}

impl SyncError {
  /// Whether retrying the same request could possibly succeed.
  pub fn is_retriable(&self) -> bool {
    matches!(self, SyncError::Network(_) | SyncError::Server(_))
  }

  /// Classify an HTTP response status and body.
  pub fn from_status(status: u16, body: &str) -> Self {
    let truncated = truncate_body(body);
    if body.contains(PGRST_JWT_EXPIRED) {
      return SyncError::Auth(truncated);
    }
    match status {
      401 | 403 => SyncError::Auth(truncated),
      408 | 429 => SyncError::Network(format!("Status {}: {}", status, truncated)),
      500..=599 => SyncError::Server(format!("Status {}: {}", status, truncated)),
      _ => SyncError::Validation(format!("Status {}: {}", status, truncated)),
    }
  }

  /// Short machine-readable name of the error class, for log fields.
  pub fn kind(&self) -> &'static str {
    match self {
      SyncError::Network(_) => "network",
      SyncError::Auth(_) => "auth",
      SyncError::Validation(_) => "validation",
      SyncError::Server(_) => "server",
      SyncError::Storage(_) => "storage",
    }
  }
}

impl From<reqwest::Error> for SyncError {
  fn from(err: reqwest::Error) -> Self {
    match err.status() {
      Some(status) => SyncError::from_status(status.as_u16(), &err.to_string()),
      None if err.is_decode() => SyncError::Validation(format!("Invalid response: {}", err)),
      None => SyncError::Network(err.to_string()),
    }
  }
}

impl From<serde_json::Error> for SyncError {
  fn from(err: serde_json::Error) -> Self {
    SyncError::Storage(format!("Serialization failed: {}", err))
  }
}

impl From<color_eyre::Report> for SyncError {
  fn from(err: color_eyre::Report) -> Self {
    SyncError::Storage(err.to_string())
  }
}

fn truncate_body(body: &str) -> String {
  if body.len() <= MAX_ERROR_BODY_LENGTH {
    return body.to_string();
  }
  let mut end = MAX_ERROR_BODY_LENGTH;
  while !body.is_char_boundary(end) {
    end -= 1;
  }
  format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_status_classification() {
    assert!(matches!(SyncError::from_status(401, ""), SyncError::Auth(_)));
    assert!(matches!(SyncError::from_status(403, ""), SyncError::Auth(_)));
    assert!(matches!(
      SyncError::from_status(422, "bad"),
      SyncError::Validation(_)
    ));
    assert!(matches!(SyncError::from_status(503, ""), SyncError::Server(_)));
    assert!(matches!(SyncError::from_status(429, ""), SyncError::Network(_)));
  }

  #[test]
  fn test_jwt_expired_code_is_auth() {
    let body = r#"{"code":"PGRST301","message":"JWT expired"}"#;
    assert!(matches!(SyncError::from_status(400, body), SyncError::Auth(_)));
  }

  #[test]
  fn test_retriable_classes() {
    assert!(SyncError::Network("x".into()).is_retriable());
    assert!(SyncError::Server("x".into()).is_retriable());
    assert!(!SyncError::Auth("x".into()).is_retriable());
    assert!(!SyncError::Validation("x".into()).is_retriable());
    assert!(!SyncError::Storage("x".into()).is_retriable());
  }

  #[test]
  fn test_long_body_is_truncated() {
    let body = "x".repeat(2000);
    let err = SyncError::from_status(500, &body);
    let msg = err.to_string();
    assert!(msg.contains("truncated, 2000 total bytes"));
    assert!(msg.len() < 700);
  }
}

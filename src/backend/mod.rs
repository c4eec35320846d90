//! PostgREST backend: read fetchers for background sync and the executor
//! that replays queued mutations.

mod client;

pub use client::RestBackend;

use sha2::{Digest, Sha256};

/// Cache key for a table read: `select:<table>:<first 16 hex chars of sha256(query)>`.
pub fn source_key(table: &str, query: &str) -> String {
  let digest = hex::encode(Sha256::digest(query.as_bytes()));
  format!("select:{}:{}", table, &digest[..16])
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_source_key_is_stable() {
    let a = source_key("spots", "select=*");
    assert_eq!(a, source_key("spots", "select=*"));
    assert!(a.starts_with("select:spots:"));
    assert_eq!(a.len(), "select:spots:".len() + 16);
    assert_ne!(a, source_key("spots", "select=id"));
  }
}

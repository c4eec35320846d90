use async_trait::async_trait;
use reqwest::{header, Client, Method};
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::source_key;
use crate::error::SyncError;
use crate::queue::{MutationExecutor, MutationKind, OfflineMutation};
use crate::retry::{with_retry, RetryPolicy};
use crate::sync::SyncDataSource;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Column used to match rows for update and delete replays
const MATCH_COLUMN: &str = "id";

/// PostgREST client.
///
/// Direct calls run through `with_retry`, so transient failures are
/// retried with backoff and everything else is classified into a
/// `SyncError` on the first attempt. Replayed mutations are sent once per
/// queue pass; the queue's own retry count is their only budget. Clone is
/// cheap.
#[derive(Clone)]
pub struct RestBackend {
  client: Client,
  root: Url,
  base: Url,
  api_key: String,
  access_token: Option<String>,
  retry: RetryPolicy,
}

impl RestBackend {
  pub fn new(root: Url, schema_path: &str, api_key: impl Into<String>) -> Result<Self, SyncError> {
    let client = Client::builder()
      .timeout(REQUEST_TIMEOUT)
      .build()
      .map_err(|e| SyncError::Network(format!("Failed to create HTTP client: {}", e)))?;

    let schema_path = format!("{}/", schema_path.trim_end_matches('/'));
    let base = root
      .join(&schema_path)
      .map_err(|e| SyncError::Validation(format!("Invalid schema path {}: {}", schema_path, e)))?;

    Ok(Self {
      client,
      root,
      base,
      api_key: api_key.into(),
      access_token: None,
      retry: RetryPolicy::default(),
    })
  }

  pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
    self.access_token = Some(token.into());
    self
  }

  pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
    self.retry = retry;
    self
  }

  /// Server root, used as the connectivity probe target.
  pub fn root(&self) -> &Url {
    &self.root
  }

  /// `GET /<table>?<query>`
  pub async fn select(&self, table: &str, query: &str) -> Result<Value, SyncError> {
    let url = self.table_url(table, Some(query), None)?;
    self.request(Method::GET, url, None).await
  }

  /// `POST /<table>`, returning the inserted rows.
  pub async fn insert(&self, table: &str, rows: &Value) -> Result<Value, SyncError> {
    let url = self.table_url(table, None, None)?;
    self.request(Method::POST, url, Some(rows)).await
  }

  /// `PATCH /<table>?<col>=eq.<value>...`, returning the updated rows.
  pub async fn update(
    &self,
    table: &str,
    patch: &Value,
    matches: &Map<String, Value>,
  ) -> Result<Value, SyncError> {
    let url = self.table_url(table, None, Some(matches))?;
    self.request(Method::PATCH, url, Some(patch)).await
  }

  /// `DELETE /<table>?<col>=eq.<value>...`, returning the deleted rows.
  pub async fn delete(&self, table: &str, matches: &Map<String, Value>) -> Result<Value, SyncError> {
    let url = self.table_url(table, None, Some(matches))?;
    self.request(Method::DELETE, url, None).await
  }

  /// `POST /rpc/<function>`
  pub async fn rpc(&self, function: &str, params: &Value) -> Result<Value, SyncError> {
    let url = self.endpoint(&format!("rpc/{}", function))?;
    self.request(Method::POST, url, Some(params)).await
  }

  /// A background sync source that selects from `table`. Without an
  /// explicit key, one is derived from the table and query.
  pub fn table_source(
    &self,
    key: Option<&str>,
    table: &str,
    query: &str,
    ttl: Duration,
  ) -> SyncDataSource {
    let key = key
      .map(str::to_string)
      .unwrap_or_else(|| source_key(table, query));
    let backend = self.clone();
    let table = table.to_string();
    let query = query.to_string();
    SyncDataSource::new(key, move || {
      let backend = backend.clone();
      let table = table.clone();
      let query = query.clone();
      async move { backend.select(&table, &query).await }
    })
    .with_ttl(ttl)
  }

  fn endpoint(&self, path: &str) -> Result<Url, SyncError> {
    self
      .base
      .join(path)
      .map_err(|e| SyncError::Validation(format!("Invalid endpoint {}: {}", path, e)))
  }

  fn table_url(
    &self,
    table: &str,
    query: Option<&str>,
    matches: Option<&Map<String, Value>>,
  ) -> Result<Url, SyncError> {
    let mut url = self.endpoint(table)?;
    if let Some(query) = query.filter(|q| !q.is_empty()) {
      url.set_query(Some(query.trim_start_matches('?')));
    }
    if let Some(matches) = matches {
      let mut pairs = url.query_pairs_mut();
      for (column, value) in matches {
        pairs.append_pair(column, &format!("eq.{}", filter_value(value)));
      }
    }
    Ok(url)
  }

  fn headers(&self) -> Result<header::HeaderMap, SyncError> {
    let invalid = |e: header::InvalidHeaderValue| SyncError::Auth(format!("Invalid credential: {}", e));

    let mut headers = header::HeaderMap::new();
    headers.insert("apikey", header::HeaderValue::from_str(&self.api_key).map_err(invalid)?);
    let bearer = self.access_token.as_deref().unwrap_or(&self.api_key);
    headers.insert(
      header::AUTHORIZATION,
      header::HeaderValue::from_str(&format!("Bearer {}", bearer)).map_err(invalid)?,
    );
    headers.insert(
      "prefer",
      header::HeaderValue::from_static("return=representation"),
    );
    Ok(headers)
  }

  async fn request(&self, method: Method, url: Url, body: Option<&Value>) -> Result<Value, SyncError> {
    let headers = self.headers()?;
    with_retry(self.retry, || {
      let method = method.clone();
      let url = url.clone();
      let mut request = self
        .client
        .request(method.clone(), url.clone())
        .headers(headers.clone());
      if let Some(body) = body {
        request = request.json(body);
      }
      async move {
        debug!(method = %method, url = %url, "Backend request");
        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
          return Err(SyncError::from_status(status.as_u16(), &text));
        }
        parse_body(&text)
      }
    })
    .await
  }
}

#[async_trait]
impl MutationExecutor for RestBackend {
  async fn execute(&self, mutation: &OfflineMutation) -> Result<(), SyncError> {
    let once = self.clone().with_retry(RetryPolicy::none());
    match mutation.kind {
      MutationKind::Create => {
        once
          .insert(&mutation.resource, &Value::Object(mutation.payload.clone()))
          .await?;
      }
      MutationKind::Update => {
        let (matches, patch) = split_match(&mutation.payload)?;
        once
          .update(&mutation.resource, &Value::Object(patch), &matches)
          .await?;
      }
      MutationKind::Delete => {
        let (matches, _) = split_match(&mutation.payload)?;
        once.delete(&mutation.resource, &matches).await?;
      }
    }
    Ok(())
  }
}

/// Split a payload into the `id` match and the remaining fields.
fn split_match(
  payload: &Map<String, Value>,
) -> Result<(Map<String, Value>, Map<String, Value>), SyncError> {
  let mut patch = payload.clone();
  let id = patch
    .remove(MATCH_COLUMN)
    .filter(|v| !v.is_null())
    .ok_or_else(|| SyncError::Validation(format!("Payload has no \"{}\" field", MATCH_COLUMN)))?;

  let mut matches = Map::new();
  matches.insert(MATCH_COLUMN.to_string(), id);
  Ok((matches, patch))
}

fn filter_value(value: &Value) -> String {
  match value {
    Value::String(s) => s.clone(),
    other => other.to_string(),
  }
}

fn parse_body(text: &str) -> Result<Value, SyncError> {
  if text.trim().is_empty() {
    return Ok(Value::Null);
  }
  serde_json::from_str(text).map_err(|e| SyncError::Validation(format!("Invalid response: {}", e)))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::MemoryStorage;
  use crate::network::NetworkMonitor;
  use crate::queue::MutationQueue;
  use serde_json::json;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Arc;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};
  use tokio::net::{TcpListener, TcpStream};

  /// Local server that answers 503 to everything and counts POSTs.
  async fn unavailable_server() -> (Url, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let posts = Arc::new(AtomicUsize::new(0));
    let counter = posts.clone();
    tokio::spawn(async move {
      while let Ok((mut socket, _)) = listener.accept().await {
        let counter = counter.clone();
        tokio::spawn(async move {
          if read_request(&mut socket).await.starts_with("POST ") {
            counter.fetch_add(1, Ordering::SeqCst);
          }
          let _ = socket
            .write_all(
              b"HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
            )
            .await;
          let _ = socket.shutdown().await;
        });
      }
    });
    (Url::parse(&format!("http://{}", addr)).unwrap(), posts)
  }

  async fn read_request(socket: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
      let n = socket.read(&mut chunk).await.unwrap_or(0);
      if n == 0 {
        break;
      }
      buf.extend_from_slice(&chunk[..n]);
      let text = String::from_utf8_lossy(&buf);
      if let Some(end) = text.find("\r\n\r\n") {
        let length = text[..end]
          .lines()
          .filter_map(|line| line.split_once(':'))
          .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
          .and_then(|(_, value)| value.trim().parse::<usize>().ok())
          .unwrap_or(0);
        if buf.len() >= end + 4 + length {
          break;
        }
      }
    }
    String::from_utf8_lossy(&buf).into_owned()
  }

  fn backend() -> RestBackend {
    let root = Url::parse("https://demo.supabase.co").unwrap();
    RestBackend::new(root, "/rest/v1", "anon-key").unwrap()
  }

  fn object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
  }

  #[test]
  fn test_table_url_with_query() {
    let url = backend()
      .table_url("spots", Some("select=*&order=created_at.desc"), None)
      .unwrap();
    assert_eq!(
      url.as_str(),
      "https://demo.supabase.co/rest/v1/spots?select=*&order=created_at.desc"
    );
  }

  #[test]
  fn test_table_url_with_match_filters() {
    let matches = object(json!({"id": "abc-123"}));
    let url = backend().table_url("spots", None, Some(&matches)).unwrap();
    assert_eq!(url.as_str(), "https://demo.supabase.co/rest/v1/spots?id=eq.abc-123");

    let matches = object(json!({"id": 42}));
    let url = backend().table_url("spots", None, Some(&matches)).unwrap();
    assert_eq!(url.query(), Some("id=eq.42"));
  }

  #[test]
  fn test_schema_path_without_slashes() {
    let root = Url::parse("https://demo.supabase.co/").unwrap();
    let backend = RestBackend::new(root, "rest/v1", "k").unwrap();
    assert_eq!(
      backend.endpoint("rpc/nearby_spots").unwrap().as_str(),
      "https://demo.supabase.co/rest/v1/rpc/nearby_spots"
    );
  }

  #[test]
  fn test_headers_prefer_access_token() {
    let headers = backend().with_access_token("user-jwt").headers().unwrap();
    assert_eq!(headers["apikey"], "anon-key");
    assert_eq!(headers[header::AUTHORIZATION], "Bearer user-jwt");

    let headers = backend().headers().unwrap();
    assert_eq!(headers[header::AUTHORIZATION], "Bearer anon-key");
  }

  #[test]
  fn test_split_match() {
    let (matches, patch) = split_match(&object(json!({"id": 7, "name": "Y"}))).unwrap();
    assert_eq!(Value::Object(matches), json!({"id": 7}));
    assert_eq!(Value::Object(patch), json!({"name": "Y"}));
  }

  #[tokio::test]
  async fn test_update_without_id_is_validation_error() {
    let mutation = OfflineMutation {
      id: "m1".into(),
      kind: MutationKind::Update,
      resource: "spots".into(),
      payload: object(json!({"name": "Y"})),
      created_at: chrono::Utc::now(),
      retry_count: 0,
      last_error: None,
    };
    let err = backend().execute(&mutation).await.unwrap_err();
    assert!(matches!(err, SyncError::Validation(_)));
  }

  #[tokio::test]
  async fn test_direct_insert_retries_server_errors() {
    let (root, posts) = unavailable_server().await;
    let backend = RestBackend::new(root, "/rest/v1", "k")
      .unwrap()
      .with_retry(RetryPolicy::new(3, Duration::from_millis(1)));

    let err = backend.insert("spots", &json!({"name": "X"})).await.unwrap_err();
    assert!(matches!(err, SyncError::Server(_)));
    assert_eq!(posts.load(Ordering::SeqCst), 4);
  }

  #[tokio::test]
  async fn test_replayed_create_is_sent_once_per_pass() {
    let (root, posts) = unavailable_server().await;
    let backend = RestBackend::new(root, "/rest/v1", "k")
      .unwrap()
      .with_retry(RetryPolicy::new(3, Duration::from_millis(1)));
    let queue = MutationQueue::new(
      Arc::new(MemoryStorage::new()),
      Arc::new(NetworkMonitor::new()),
    );
    queue.enqueue(MutationKind::Create, "spots", object(json!({"name": "X"})));

    let report = queue.process_queue(&backend).await;
    assert_eq!(report.attempted, 1);
    assert_eq!(report.retained, 1);
    assert_eq!(posts.load(Ordering::SeqCst), 1);

    let pending = queue.pending();
    assert_eq!(pending[0].retry_count, 1);
    assert!(pending[0].last_error.as_deref().unwrap_or("").contains("503"));

    queue.process_queue(&backend).await;
    assert_eq!(posts.load(Ordering::SeqCst), 2);
  }

  #[test]
  fn test_parse_empty_body() {
    assert_eq!(parse_body("").unwrap(), Value::Null);
    assert_eq!(parse_body("[{\"id\":1}]").unwrap(), json!([{"id": 1}]));
    assert!(matches!(parse_body("<html>"), Err(SyncError::Validation(_))));
  }

  #[test]
  fn test_table_source_default_key() {
    let source = backend().table_source(None, "spots", "select=*", Duration::from_secs(60));
    assert_eq!(source.key, source_key("spots", "select=*"));
    assert_eq!(source.ttl, Duration::from_secs(60));

    let source = backend().table_source(Some("spots"), "spots", "select=*", Duration::from_secs(60));
    assert_eq!(source.key, "spots");
  }
}

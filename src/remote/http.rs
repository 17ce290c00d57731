//! REST client for a PostgREST-style backend.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::{RequestBuilder, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use super::{PullFilter, RemoteAuthority, RemoteError, SchemaMapper};
use crate::store::{Operation, Record, TableKind};

/// Remote authority reached over HTTP.
#[derive(Clone)]
pub struct HttpRemote {
  client: reqwest::Client,
  base: Url,
  api_key: Option<String>,
  mapper: Arc<dyn SchemaMapper>,
}

impl HttpRemote {
  pub fn new(
    base_url: &str,
    api_key: Option<String>,
    timeout: Duration,
    mapper: Arc<dyn SchemaMapper>,
  ) -> Result<Self> {
    // Url::join drops the last segment unless the base ends with a slash
    let normalized = format!("{}/", base_url.trim().trim_end_matches('/'));
    let base =
      Url::parse(&normalized).map_err(|e| eyre!("Invalid remote URL {}: {}", base_url, e))?;

    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base,
      api_key,
      mapper,
    })
  }

  fn endpoint(&self, table: TableKind) -> Result<Url, RemoteError> {
    self
      .base
      .join(table.spec().remote_path)
      .map_err(|e| RemoteError::Rejected(format!("bad endpoint for {}: {}", table, e)))
  }

  fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
    match &self.api_key {
      Some(key) => request.header("apikey", key).bearer_auth(key),
      None => request,
    }
  }

  async fn send(&self, request: RequestBuilder) -> Result<reqwest::Response, RemoteError> {
    let response = self
      .authorize(request)
      .header("Accept", "application/json")
      .send()
      .await
      .map_err(classify_transport)?;

    let status = response.status();
    if status.is_success() {
      return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(classify_status(status, &body))
  }
}

#[async_trait]
impl RemoteAuthority for HttpRemote {
  async fn push(
    &self,
    table: TableKind,
    operation: Operation,
    record: &Record,
  ) -> Result<Record, RemoteError> {
    let url = self.endpoint(table)?;
    let selector = [("id", format!("eq.{}", record.id))];
    let body = self.mapper.to_remote(table, record);

    let request = match operation {
      Operation::Create => self
        .client
        .post(url)
        .header("Prefer", "return=representation")
        .json(&body),
      Operation::Update => {
        let mut body = body;
        if let Value::Object(map) = &mut body {
          map.remove("id");
        }
        self
          .client
          .patch(url)
          .query(&selector)
          .header("Prefer", "return=representation")
          .json(&body)
      }
      Operation::Delete => self.client.delete(url).query(&selector),
    };

    let response = self.send(request).await?;
    tracing::debug!(%table, %operation, id = %record.id, "remote accepted write");

    if operation == Operation::Delete {
      let mut gone = record.clone();
      gone.synced = true;
      return Ok(gone);
    }

    let rows: Vec<Value> = response
      .json()
      .await
      .map_err(|e| RemoteError::Transient(format!("unreadable response: {}", e)))?;
    let row = rows
      .into_iter()
      .next()
      .ok_or_else(|| RemoteError::Rejected(format!("{} {} matched no row", table, record.id)))?;
    self.mapper.from_remote(table, row)
  }

  async fn pull(
    &self,
    table: TableKind,
    filter: Option<&PullFilter>,
  ) -> Result<Vec<Record>, RemoteError> {
    let url = self.endpoint(table)?;
    let mut request = self.client.get(url).query(&[("select", "*")]);
    if let Some(filter) = filter {
      request = request.query(&filter.params);
    }

    let rows: Vec<Value> = self
      .send(request)
      .await?
      .json()
      .await
      .map_err(|e| RemoteError::Transient(format!("unreadable snapshot: {}", e)))?;

    rows
      .into_iter()
      .map(|row| self.mapper.from_remote(table, row))
      .collect()
  }
}

fn classify_transport(err: reqwest::Error) -> RemoteError {
  if err.is_connect() {
    RemoteError::Unreachable(err.to_string())
  } else {
    RemoteError::Transient(err.to_string())
  }
}

fn classify_status(status: StatusCode, body: &str) -> RemoteError {
  let message = if body.trim().is_empty() {
    format!("HTTP {}", status.as_u16())
  } else {
    format!("{} ({})", body.trim(), status.as_u16())
  };

  if status.is_server_error()
    || status == StatusCode::REQUEST_TIMEOUT
    || status == StatusCode::TOO_MANY_REQUESTS
  {
    RemoteError::Transient(message)
  } else {
    RemoteError::Rejected(message)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::remote::FieldMapper;

  #[test]
  fn test_status_classification() {
    assert!(matches!(
      classify_status(StatusCode::BAD_GATEWAY, ""),
      RemoteError::Transient(_)
    ));
    assert!(matches!(
      classify_status(StatusCode::TOO_MANY_REQUESTS, ""),
      RemoteError::Transient(_)
    ));
    assert_eq!(
      classify_status(StatusCode::CONFLICT, "duplicate key"),
      RemoteError::Rejected("duplicate key (409)".to_string())
    );
  }

  #[test]
  fn test_endpoint_keeps_base_path() {
    let remote = HttpRemote::new(
      "https://pos.example.com/rest/v1",
      None,
      Duration::from_secs(5),
      Arc::new(FieldMapper::default()),
    )
    .unwrap();

    let url = remote.endpoint(TableKind::OrderItems).unwrap();
    assert_eq!(url.as_str(), "https://pos.example.com/rest/v1/order_items");
  }

  #[test]
  fn test_rejects_malformed_base() {
    let result = HttpRemote::new(
      "not a url",
      None,
      Duration::from_secs(5),
      Arc::new(FieldMapper::default()),
    );
    assert!(result.is_err());
  }

  #[tokio::test]
  async fn test_refused_connection_is_unreachable() {
    // Port 9 (discard) on localhost is closed in test environments
    let remote = HttpRemote::new(
      "http://127.0.0.1:9",
      None,
      Duration::from_secs(2),
      Arc::new(FieldMapper::default()),
    )
    .unwrap();

    let err = remote.pull(TableKind::Tables, None).await.unwrap_err();
    assert!(matches!(err, RemoteError::Unreachable(_)));
  }
}

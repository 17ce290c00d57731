//! Network side of the proxy.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::header::CONTENT_TYPE;
use std::time::Duration;

use super::traits::{Payload, ProxyRequest};

/// Performs the real network request for an intercepted read.
///
/// An `Err` means the network could not be used at all; HTTP error statuses
/// come back as an `Ok` payload.
#[async_trait]
pub trait Fetcher: Send + Sync {
  async fn fetch(&self, request: &ProxyRequest) -> Result<Payload>;
}

pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  pub fn new(timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;
    Ok(Self { client })
  }
}

#[async_trait]
impl Fetcher for HttpFetcher {
  async fn fetch(&self, request: &ProxyRequest) -> Result<Payload> {
    let response = self
      .client
      .request(request.method.clone(), request.url.clone())
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", request.url, e))?;

    let status = response.status().as_u16();
    let content_type = response
      .headers()
      .get(CONTENT_TYPE)
      .and_then(|v| v.to_str().ok())
      .map(str::to_string);
    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read body of {}: {}", request.url, e))?;

    Ok(Payload {
      status,
      content_type,
      body: body.to_vec(),
    })
  }
}

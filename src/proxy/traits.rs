//! Core types for the response cache.

use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use url::Url;

/// Resource class, which decides the caching policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheClass {
  AdminDocument,
  PublicDocument,
  ApiData,
  Image,
  StaticAsset,
}

impl CacheClass {
  pub const ALL: [CacheClass; 5] = [
    CacheClass::AdminDocument,
    CacheClass::PublicDocument,
    CacheClass::ApiData,
    CacheClass::Image,
    CacheClass::StaticAsset,
  ];

  pub fn as_str(self) -> &'static str {
    match self {
      CacheClass::AdminDocument => "admin_document",
      CacheClass::PublicDocument => "public_document",
      CacheClass::ApiData => "api_data",
      CacheClass::Image => "image",
      CacheClass::StaticAsset => "static_asset",
    }
  }
}

impl fmt::Display for CacheClass {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for CacheClass {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let wanted = s.replace('-', "_");
    CacheClass::ALL
      .into_iter()
      .find(|c| c.as_str() == wanted)
      .ok_or_else(|| format!("unknown cache class: {}", s))
  }
}

/// What the requester intends to do with the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Destination {
  /// Top-level navigation
  Document,
  Image,
  Script,
  Style,
  Font,
  /// fetch()/XHR and anything else
  #[default]
  Other,
}

/// An outbound read the proxy may intercept.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
  pub method: Method,
  pub url: Url,
  pub destination: Destination,
}

impl ProxyRequest {
  pub fn get(url: Url, destination: Destination) -> Self {
    Self {
      method: Method::GET,
      url,
      destination,
    }
  }

  /// Cache key: the URL without its fragment.
  pub fn cache_key(&self) -> String {
    let mut url = self.url.clone();
    url.set_fragment(None);
    url.into()
  }
}

/// Status, content type and body of a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
  pub status: u16,
  pub content_type: Option<String>,
  pub body: Vec<u8>,
}

impl Payload {
  pub fn new(status: u16, content_type: Option<&str>, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      content_type: content_type.map(str::to_string),
      body: body.into(),
    }
  }

  pub fn json(status: u16, value: &Value) -> Self {
    Self::new(status, Some("application/json"), value.to_string())
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Script, stylesheet or font, judged by content type.
  pub fn is_static_asset(&self) -> bool {
    let Some(content_type) = &self.content_type else {
      return false;
    };
    let mime = content_type
      .split(';')
      .next()
      .unwrap_or_default()
      .trim()
      .to_ascii_lowercase();
    mime.contains("javascript")
      || mime == "text/css"
      || mime.starts_with("font/")
      || mime.starts_with("application/font")
      || mime == "application/vnd.ms-fontobject"
  }
}

/// Response served by the proxy, with where it came from.
#[derive(Debug, Clone)]
pub struct ProxyResponse {
  pub payload: Payload,
  pub source: CacheSource,
  /// When the payload was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl ProxyResponse {
  pub fn from_network(payload: Payload) -> Self {
    Self {
      payload,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  pub fn from_cache(payload: Payload, cached_at: DateTime<Utc>) -> Self {
    Self {
      payload,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
    }
  }

  /// A cached fallback page standing in for the requested one.
  pub fn offline(payload: Payload, cached_at: DateTime<Utc>) -> Self {
    Self {
      payload,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }

  pub fn synthesized(payload: Payload) -> Self {
    Self {
      payload,
      source: CacheSource::Synthesized,
      cached_at: None,
    }
  }
}

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh from the network
  Network,
  /// The cached copy of the requested resource
  Cache,
  /// Network unavailable, serving a cached fallback page
  Offline,
  /// Nothing usable anywhere; built locally
  Synthesized,
}

/// Entry counts per class for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStatus {
  pub generation: String,
  pub entries: BTreeMap<CacheClass, usize>,
  /// Entries still held for generations other than the current one
  pub stale_entries: usize,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_class_parsing_accepts_both_spellings() {
    assert_eq!("api-data".parse::<CacheClass>().unwrap(), CacheClass::ApiData);
    assert_eq!(
      "static_asset".parse::<CacheClass>().unwrap(),
      CacheClass::StaticAsset
    );
    assert!("fonts".parse::<CacheClass>().is_err());
  }

  #[test]
  fn test_cache_key_drops_fragment() {
    let request = ProxyRequest::get(
      Url::parse("https://pos.example.com/menu?lang=en#specials").unwrap(),
      Destination::Document,
    );
    assert_eq!(request.cache_key(), "https://pos.example.com/menu?lang=en");
  }

  #[test]
  fn test_static_asset_content_types() {
    assert!(Payload::new(200, Some("text/javascript; charset=utf-8"), "").is_static_asset());
    assert!(Payload::new(200, Some("text/css"), "").is_static_asset());
    assert!(Payload::new(200, Some("font/woff2"), "").is_static_asset());
    assert!(!Payload::new(200, Some("text/html"), "").is_static_asset());
    assert!(!Payload::new(200, None, "").is_static_asset());
  }
}

//! Request classification.

use reqwest::Method;

use super::traits::{CacheClass, Destination, ProxyRequest};

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "avif", "svg", "ico"];
const ASSET_EXTENSIONS: &[&str] = &["js", "mjs", "css", "woff", "woff2", "ttf", "otf", "eot"];

/// Routing rules and limits for the caching proxy.
#[derive(Debug, Clone)]
pub struct ProxySettings {
  /// Path prefixes served by the data API
  pub api_prefixes: Vec<String>,
  /// API path prefixes whose responses may be cached
  pub api_allow_list: Vec<String>,
  /// Documents under this prefix belong to the admin area
  pub admin_prefix: String,
  /// Admin route that falls back to the login document when offline
  pub admin_entry: String,
  pub login_page: String,
  pub offline_page: String,
  pub max_entries_per_class: usize,
  /// Absolute URLs fetched on install
  pub precache: Vec<String>,
}

impl Default for ProxySettings {
  fn default() -> Self {
    Self {
      api_prefixes: vec!["/rest/v1/".to_string(), "/api/".to_string()],
      api_allow_list: vec![
        "/rest/v1/categories".to_string(),
        "/rest/v1/menu_items".to_string(),
        "/rest/v1/tables".to_string(),
      ],
      admin_prefix: "/admin".to_string(),
      admin_entry: "/admin".to_string(),
      login_page: "/login".to_string(),
      offline_page: "/offline.html".to_string(),
      max_entries_per_class: 200,
      precache: Vec::new(),
    }
  }
}

impl ProxySettings {
  /// Class of a request, or `None` when the proxy should stay out of the way.
  pub fn classify(&self, request: &ProxyRequest) -> Option<CacheClass> {
    if request.method != Method::GET {
      return None;
    }
    let path = request.url.path();

    if request.destination == Destination::Document {
      return Some(if self.is_admin(path) {
        CacheClass::AdminDocument
      } else {
        CacheClass::PublicDocument
      });
    }
    if self.api_prefixes.iter().any(|p| path.starts_with(p.as_str())) {
      return Some(CacheClass::ApiData);
    }

    let extension = extension(path);
    match request.destination {
      Destination::Image => Some(CacheClass::Image),
      Destination::Script | Destination::Style | Destination::Font => Some(CacheClass::StaticAsset),
      _ if extension.as_deref().is_some_and(|e| IMAGE_EXTENSIONS.contains(&e)) => {
        Some(CacheClass::Image)
      }
      _ if extension.as_deref().is_some_and(|e| ASSET_EXTENSIONS.contains(&e)) => {
        Some(CacheClass::StaticAsset)
      }
      _ => None,
    }
  }

  pub fn allows_api(&self, path: &str) -> bool {
    self
      .api_allow_list
      .iter()
      .any(|p| path.starts_with(p.as_str()))
  }

  /// Whether `path` is the admin landing route, with or without a trailing slash.
  pub fn is_admin_entry(&self, path: &str) -> bool {
    path.trim_end_matches('/') == self.admin_entry.trim_end_matches('/')
  }

  fn is_admin(&self, path: &str) -> bool {
    let prefix = self.admin_prefix.trim_end_matches('/');
    path == prefix || path.starts_with(&format!("{}/", prefix))
  }
}

fn extension(path: &str) -> Option<String> {
  let file = path.rsplit('/').next()?;
  let (_, ext) = file.rsplit_once('.')?;
  Some(ext.to_ascii_lowercase())
}

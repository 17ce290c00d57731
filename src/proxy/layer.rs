//! Proxy layer that applies a caching policy per resource class.

use color_eyre::Result;
use futures::future::join_all;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use super::fetch::Fetcher;
use super::route::ProxySettings;
use super::storage::CacheStorage;
use super::traits::{CacheClass, CacheStatus, Destination, Payload, ProxyRequest, ProxyResponse};

const OFFLINE_HTML: &str = "<!doctype html><html><head><meta charset=\"utf-8\"><title>Offline</title></head>\
<body><h1>You are offline</h1><p>This page is not available offline yet.</p></body></html>";

const PLACEHOLDER_SVG: &str = "<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"200\" height=\"200\" viewBox=\"0 0 200 200\">\
<rect width=\"200\" height=\"200\" fill=\"#e5e7eb\"/>\
<text x=\"100\" y=\"105\" font-family=\"sans-serif\" font-size=\"14\" fill=\"#6b7280\" text-anchor=\"middle\">Image unavailable</text></svg>";

/// Caching proxy that sits between the app shell and the network.
///
/// Documents and API reads go network-first, images and static assets
/// cache-first. Whatever happens, an intercepted read gets an answer.
pub struct CachingProxy {
  storage: Arc<dyn CacheStorage>,
  fetcher: Arc<dyn Fetcher>,
  settings: ProxySettings,
}

impl CachingProxy {
  pub fn new(storage: Arc<dyn CacheStorage>, fetcher: Arc<dyn Fetcher>, settings: ProxySettings) -> Self {
    Self {
      storage,
      fetcher,
      settings,
    }
  }

  pub fn generation(&self) -> &str {
    self.storage.generation()
  }

  /// Serve an outbound read. `None` means bypass: let the request through untouched.
  pub async fn handle(&self, request: &ProxyRequest) -> Result<Option<ProxyResponse>> {
    let Some(class) = self.settings.classify(request) else {
      return Ok(None);
    };

    let response = match class {
      CacheClass::AdminDocument | CacheClass::PublicDocument => {
        self.network_first_document(request, class).await?
      }
      CacheClass::ApiData => self.network_first_api(request).await?,
      CacheClass::Image => self.cache_first_image(request).await?,
      CacheClass::StaticAsset => self.cache_first_asset(request).await?,
    };
    debug!(%class, url = %request.url, source = ?response.source, "served");
    Ok(Some(response))
  }

  /// Fetch and store everything the shell needs to open offline.
  pub async fn install(&self) -> Result<usize> {
    let mut urls: Vec<&String> = self.settings.precache.iter().collect();
    urls.dedup();
    let requests: Vec<ProxyRequest> = urls
      .into_iter()
      .filter_map(|raw| match Url::parse(raw) {
        Ok(url) => Some(ProxyRequest::get(url, precache_destination(raw))),
        Err(e) => {
          warn!(url = %raw, "skipping precache entry: {}", e);
          None
        }
      })
      .collect();

    let fetched = join_all(requests.iter().map(|r| self.fetcher.fetch(r))).await;

    let mut stored = 0;
    for (request, result) in requests.iter().zip(fetched) {
      let Some(class) = self.settings.classify(request) else {
        continue;
      };
      match result {
        Ok(payload) if payload.is_success() => {
          self.remember(class, &request.cache_key(), &payload);
          stored += 1;
        }
        Ok(payload) => warn!(url = %request.url, status = payload.status, "precache fetch refused"),
        Err(e) => warn!(url = %request.url, "precache fetch failed: {}", e),
      }
    }
    info!(stored, generation = %self.generation(), "precache complete");
    Ok(stored)
  }

  /// Switch to this build's generation, dropping older ones.
  pub fn activate(&self) -> Result<usize> {
    self.storage.activate()
  }

  pub fn purge(&self, class: Option<CacheClass>) -> Result<usize> {
    let removed = self.storage.purge(class)?;
    info!(class = ?class, removed, "cache purged");
    Ok(removed)
  }

  pub fn evict(&self, class: CacheClass, key: &str) -> Result<bool> {
    self.storage.evict(class, key)
  }

  pub fn status(&self) -> Result<CacheStatus> {
    self.storage.status()
  }

  async fn network_first_document(
    &self,
    request: &ProxyRequest,
    class: CacheClass,
  ) -> Result<ProxyResponse> {
    let key = request.cache_key();
    match self.fetcher.fetch(request).await {
      Ok(payload) => {
        if payload.is_success() {
          self.remember(class, &key, &payload);
        }
        return Ok(ProxyResponse::from_network(payload));
      }
      Err(e) => debug!(url = %request.url, "document fetch failed: {}", e),
    }

    if let Some(entry) = self.storage.get(class, &key)? {
      return Ok(ProxyResponse::from_cache(entry.payload, entry.cached_at));
    }

    if class == CacheClass::AdminDocument && self.settings.is_admin_entry(request.url.path()) {
      if let Some(response) = self.cached_page(&request.url, &self.settings.login_page)? {
        return Ok(response);
      }
    }
    if let Some(response) = self.cached_page(&request.url, &self.settings.offline_page)? {
      return Ok(response);
    }
    Ok(ProxyResponse::synthesized(Payload::new(
      503,
      Some("text/html; charset=utf-8"),
      OFFLINE_HTML,
    )))
  }

  async fn network_first_api(&self, request: &ProxyRequest) -> Result<ProxyResponse> {
    let key = request.cache_key();
    match self.fetcher.fetch(request).await {
      Ok(payload) => {
        if payload.is_success() && self.settings.allows_api(request.url.path()) {
          self.remember(CacheClass::ApiData, &key, &payload);
        }
        return Ok(ProxyResponse::from_network(payload));
      }
      Err(e) => debug!(url = %request.url, "api fetch failed: {}", e),
    }

    if let Some(entry) = self.storage.get(CacheClass::ApiData, &key)? {
      return Ok(ProxyResponse::from_cache(entry.payload, entry.cached_at));
    }
    Ok(ProxyResponse::synthesized(Payload::json(
      200,
      &json!({"data": [], "offline": true}),
    )))
  }

  async fn cache_first_image(&self, request: &ProxyRequest) -> Result<ProxyResponse> {
    let key = request.cache_key();
    if let Some(entry) = self.storage.get(CacheClass::Image, &key)? {
      return Ok(ProxyResponse::from_cache(entry.payload, entry.cached_at));
    }

    match self.fetcher.fetch(request).await {
      Ok(payload) => {
        if payload.is_success() {
          self.remember(CacheClass::Image, &key, &payload);
        }
        Ok(ProxyResponse::from_network(payload))
      }
      Err(e) => {
        debug!(url = %request.url, "image fetch failed: {}", e);
        Ok(ProxyResponse::synthesized(Payload::new(
          200,
          Some("image/svg+xml"),
          PLACEHOLDER_SVG,
        )))
      }
    }
  }

  async fn cache_first_asset(&self, request: &ProxyRequest) -> Result<ProxyResponse> {
    let key = request.cache_key();
    if let Some(entry) = self.storage.get(CacheClass::StaticAsset, &key)? {
      return Ok(ProxyResponse::from_cache(entry.payload, entry.cached_at));
    }

    // No fallback for code or styles; the error reaches the caller
    let payload = self.fetcher.fetch(request).await?;
    if payload.is_success() && payload.is_static_asset() {
      self.remember(CacheClass::StaticAsset, &key, &payload);
    }
    Ok(ProxyResponse::from_network(payload))
  }

  /// A cached document at `path` on the same origin, served in place of the request.
  fn cached_page(&self, base: &Url, path: &str) -> Result<Option<ProxyResponse>> {
    let Ok(url) = base.join(path) else {
      return Ok(None);
    };
    let key = ProxyRequest::get(url, Destination::Document).cache_key();
    for class in [CacheClass::PublicDocument, CacheClass::AdminDocument] {
      if let Some(entry) = self.storage.get(class, &key)? {
        return Ok(Some(ProxyResponse::offline(entry.payload, entry.cached_at)));
      }
    }
    Ok(None)
  }

  /// Store a response and keep the class bounded. Cache failures never fail the read.
  fn remember(&self, class: CacheClass, key: &str, payload: &Payload) {
    let result = self
      .storage
      .put(class, key, payload)
      .and_then(|_| self.storage.trim(class, self.settings.max_entries_per_class));
    match result {
      Ok(trimmed) if trimmed > 0 => debug!(%class, trimmed, "cache trimmed"),
      Ok(_) => {}
      Err(e) => warn!(%class, key, "could not cache response: {}", e),
    }
  }
}

/// Precache entries are documents unless their extension says otherwise.
fn precache_destination(url: &str) -> Destination {
  let path = url.split(['?', '#']).next().unwrap_or_default();
  let file = path.rsplit('/').next().unwrap_or_default();
  match file.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase()) {
    Some(ext) if matches!(ext.as_str(), "js" | "mjs" | "css" | "woff" | "woff2" | "ttf" | "otf") => {
      Destination::Other
    }
    Some(ext) if matches!(ext.as_str(), "png" | "jpg" | "jpeg" | "gif" | "webp" | "svg" | "ico") => {
      Destination::Image
    }
    _ => Destination::Document,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::db::Database;
  use crate::proxy::fetch::scripted::ScriptedFetcher;
  use crate::proxy::storage::SqliteStorage;
  use crate::proxy::CacheSource;
  use reqwest::Method;

  struct Harness {
    db: Arc<Database>,
    fetcher: Arc<ScriptedFetcher>,
    proxy: CachingProxy,
  }

  fn harness(settings: ProxySettings) -> Harness {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let fetcher = Arc::new(ScriptedFetcher::new());
    let storage = Arc::new(SqliteStorage::new(db.clone(), "gen-1"));
    let proxy = CachingProxy::new(storage, fetcher.clone(), settings);
    Harness { db, fetcher, proxy }
  }

  fn get(url: &str, destination: Destination) -> ProxyRequest {
    ProxyRequest::get(Url::parse(url).unwrap(), destination)
  }

  fn html(body: &str) -> Payload {
    Payload::new(200, Some("text/html"), body)
  }

  async fn serve(h: &Harness, request: &ProxyRequest) -> ProxyResponse {
    h.proxy.handle(request).await.unwrap().unwrap()
  }

  #[tokio::test]
  async fn test_document_falls_back_to_cached_copy() {
    let h = harness(ProxySettings::default());
    h.fetcher.respond("https://pos.test/menu", html("menu v1"));
    let request = get("https://pos.test/menu", Destination::Document);

    let online = serve(&h, &request).await;
    assert_eq!(online.source, CacheSource::Network);

    h.fetcher.set_offline(true);
    let offline = serve(&h, &request).await;
    assert_eq!(offline.source, CacheSource::Cache);
    assert_eq!(offline.payload.body, b"menu v1".to_vec());
  }

  #[tokio::test]
  async fn test_uncached_document_gets_offline_page_or_login() {
    let settings = ProxySettings {
      precache: vec![
        "https://pos.test/offline.html".to_string(),
        "https://pos.test/login".to_string(),
      ],
      ..ProxySettings::default()
    };
    let h = harness(settings);
    h.fetcher.respond("https://pos.test/offline.html", html("offline"));
    h.fetcher.respond("https://pos.test/login", html("login"));
    assert_eq!(h.proxy.install().await.unwrap(), 2);

    h.fetcher.set_offline(true);
    let admin = serve(&h, &get("https://pos.test/admin", Destination::Document)).await;
    assert_eq!(admin.source, CacheSource::Offline);
    assert_eq!(admin.payload.body, b"login".to_vec());
    let admin_slash = serve(&h, &get("https://pos.test/admin/", Destination::Document)).await;
    assert_eq!(admin_slash.payload.body, b"login".to_vec());

    let report = serve(&h, &get("https://pos.test/admin/reports", Destination::Document)).await;
    assert_eq!(report.payload.body, b"offline".to_vec());

    let public = serve(&h, &get("https://pos.test/specials", Destination::Document)).await;
    assert_eq!(public.source, CacheSource::Offline);
    assert_eq!(public.payload.body, b"offline".to_vec());
  }

  #[tokio::test]
  async fn test_document_without_any_cache_is_synthesized() {
    let h = harness(ProxySettings::default());
    h.fetcher.set_offline(true);
    let response = serve(&h, &get("https://pos.test/", Destination::Document)).await;
    assert_eq!(response.source, CacheSource::Synthesized);
    assert_eq!(response.payload.status, 503);
  }

  #[tokio::test]
  async fn test_api_caches_only_allow_listed_paths() {
    let h = harness(ProxySettings::default());
    let menu = "https://pos.test/rest/v1/menu_items?select=*";
    let orders = "https://pos.test/rest/v1/orders?select=*";
    h.fetcher.respond(menu, Payload::json(200, &json!([{"id": "m1"}])));
    h.fetcher.respond(orders, Payload::json(200, &json!([{"id": "o1"}])));

    serve(&h, &get(menu, Destination::Other)).await;
    serve(&h, &get(orders, Destination::Other)).await;

    h.fetcher.set_offline(true);
    let cached = serve(&h, &get(menu, Destination::Other)).await;
    assert_eq!(cached.source, CacheSource::Cache);

    let synthesized = serve(&h, &get(orders, Destination::Other)).await;
    assert_eq!(synthesized.source, CacheSource::Synthesized);
    let body: serde_json::Value = serde_json::from_slice(&synthesized.payload.body).unwrap();
    assert_eq!(body, json!({"data": [], "offline": true}));
  }

  #[tokio::test]
  async fn test_image_is_cache_first_with_placeholder() {
    let h = harness(ProxySettings::default());
    let url = "https://cdn.test/pho.png";
    h.fetcher.respond(url, Payload::new(200, Some("image/png"), vec![1u8, 2, 3]));

    serve(&h, &get(url, Destination::Image)).await;
    let again = serve(&h, &get(url, Destination::Image)).await;
    assert_eq!(again.source, CacheSource::Cache);
    assert_eq!(h.fetcher.calls(), 1);

    h.fetcher.set_offline(true);
    let missing = serve(&h, &get("https://cdn.test/ramen.png", Destination::Image)).await;
    assert_eq!(missing.source, CacheSource::Synthesized);
    assert_eq!(missing.payload.content_type.as_deref(), Some("image/svg+xml"));
  }

  #[tokio::test]
  async fn test_static_asset_cached_only_for_asset_content_types() {
    let h = harness(ProxySettings::default());
    let script = "https://pos.test/app.js";
    let fake = "https://pos.test/chunk.js";
    h.fetcher.respond(script, Payload::new(200, Some("application/javascript"), "x"));
    // A misrouted HTML fallback must not be cached as a script
    h.fetcher.respond(fake, html("<html>"));

    serve(&h, &get(script, Destination::Script)).await;
    serve(&h, &get(fake, Destination::Script)).await;

    h.fetcher.set_offline(true);
    let cached = serve(&h, &get(script, Destination::Script)).await;
    assert_eq!(cached.source, CacheSource::Cache);
    assert!(h.proxy.handle(&get(fake, Destination::Script)).await.is_err());
  }

  #[tokio::test]
  async fn test_non_get_is_bypassed() {
    let h = harness(ProxySettings::default());
    let mut request = get("https://pos.test/rest/v1/orders", Destination::Other);
    request.method = Method::POST;
    assert!(h.proxy.handle(&request).await.unwrap().is_none());
    assert_eq!(h.fetcher.calls(), 0);
  }

  #[tokio::test]
  async fn test_activation_purges_previous_generation() {
    let h = harness(ProxySettings::default());
    let old = SqliteStorage::new(h.db.clone(), "gen-0");
    old.put(CacheClass::Image, "https://cdn.test/a.png", &html("old")).unwrap();

    h.fetcher.respond("https://cdn.test/a.png", Payload::new(200, Some("image/png"), "new"));
    let response = serve(&h, &get("https://cdn.test/a.png", Destination::Image)).await;
    assert_eq!(response.source, CacheSource::Network);
    assert_eq!(h.proxy.status().unwrap().stale_entries, 1);

    assert_eq!(h.proxy.activate().unwrap(), 1);
    let status = h.proxy.status().unwrap();
    assert_eq!(status.stale_entries, 0);
    assert_eq!(status.entries.get(&CacheClass::Image), Some(&1));
  }

  #[tokio::test]
  async fn test_class_stays_bounded() {
    let h = harness(ProxySettings {
      max_entries_per_class: 2,
      ..ProxySettings::default()
    });
    for name in ["a", "b", "c"] {
      let url = format!("https://cdn.test/{}.png", name);
      h.fetcher.respond(&url, Payload::new(200, Some("image/png"), name));
      serve(&h, &get(&url, Destination::Image)).await;
    }
    let status = h.proxy.status().unwrap();
    assert_eq!(status.entries.get(&CacheClass::Image), Some(&2));
  }
}

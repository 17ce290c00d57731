use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::proxy::ProxySettings;
use crate::store::TableKind;
use crate::sync::SyncSettings;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub remote: RemoteConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub retention: RetentionConfig,
  /// Per-table field renames, local name to remote name
  #[serde(default)]
  pub mapping: BTreeMap<TableKind, BTreeMap<String, String>>,
  /// SQLite file (defaults to the user data directory)
  pub database_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
  /// Base URL of the REST endpoint, e.g. https://xyz.supabase.co/rest/v1
  pub url: String,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  pub interval_secs: u64,
  pub batch_size: usize,
  pub max_attempts: u32,
  /// While offline, attempt a run every this many ticks
  pub offline_probe_ticks: u32,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      interval_secs: 5,
      batch_size: 25,
      max_attempts: 5,
      offline_probe_ticks: 6,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub enabled: bool,
  /// Deployment identifier mixed into the cache generation tag
  pub build_id: Option<String>,
  /// Activate the new generation as soon as it is installed
  pub auto_activate: bool,
  /// Origin that relative precache entries resolve against
  pub origin: Option<String>,
  pub api_prefixes: Vec<String>,
  pub api_allow_list: Vec<String>,
  pub admin_prefix: String,
  pub admin_entry: String,
  pub login_page: String,
  pub offline_page: String,
  pub max_entries_per_class: usize,
  pub precache: Vec<String>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    let routes = ProxySettings::default();
    Self {
      enabled: true,
      build_id: None,
      auto_activate: true,
      origin: None,
      api_prefixes: routes.api_prefixes,
      api_allow_list: routes.api_allow_list,
      admin_prefix: routes.admin_prefix,
      admin_entry: routes.admin_entry,
      login_page: routes.login_page,
      offline_page: routes.offline_page,
      max_entries_per_class: routes.max_entries_per_class,
      precache: vec!["/".to_string()],
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
  /// Closed orders kept locally once confirmed
  pub max_completed_orders: usize,
}

impl Default for RetentionConfig {
  fn default() -> Self {
    Self {
      max_completed_orders: 500,
    }
  }
}

fn default_timeout_secs() -> u64 {
  15
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./tillsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/tillsync/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/tillsync/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("tillsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("tillsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    if config.sync.batch_size == 0 {
      return Err(eyre!("sync.batch_size must be at least 1"));
    }
    Ok(config)
  }

  /// Get the backend API key from environment variables.
  ///
  /// Checks TILLSYNC_API_KEY first, then SUPABASE_ANON_KEY as fallback.
  /// A missing key is allowed for backends without auth.
  pub fn api_key() -> Option<String> {
    std::env::var("TILLSYNC_API_KEY")
      .or_else(|_| std::env::var("SUPABASE_ANON_KEY"))
      .ok()
      .filter(|k| !k.trim().is_empty())
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.remote.timeout_secs)
  }

  pub fn tick_interval(&self) -> Duration {
    Duration::from_secs(self.sync.interval_secs.max(1))
  }

  pub fn sync_settings(&self) -> SyncSettings {
    SyncSettings {
      batch_size: self.sync.batch_size,
      max_attempts: self.sync.max_attempts.max(1),
    }
  }

  pub fn renames(&self) -> HashMap<TableKind, Vec<(String, String)>> {
    self
      .mapping
      .iter()
      .map(|(table, pairs)| {
        let pairs = pairs
          .iter()
          .map(|(local, remote)| (local.clone(), remote.clone()))
          .collect();
        (*table, pairs)
      })
      .collect()
  }

  /// Proxy routing with precache entries resolved against the origin.
  pub fn proxy_settings(&self) -> ProxySettings {
    let origin = self.cache.origin.as_deref().and_then(|o| url::Url::parse(o).ok());
    let precache = self
      .cache
      .precache
      .iter()
      .filter_map(|entry| match url::Url::parse(entry) {
        Ok(url) => Some(url.to_string()),
        Err(_) => origin.as_ref().and_then(|o| o.join(entry).ok()).map(String::from),
      })
      .collect();

    ProxySettings {
      api_prefixes: self.cache.api_prefixes.clone(),
      api_allow_list: self.cache.api_allow_list.clone(),
      admin_prefix: self.cache.admin_prefix.clone(),
      admin_entry: self.cache.admin_entry.clone(),
      login_page: self.cache.login_page.clone(),
      offline_page: self.cache.offline_page.clone(),
      max_entries_per_class: self.cache.max_entries_per_class.max(1),
      precache,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  #[test]
  fn test_minimal_config_uses_defaults() {
    let config = Config::parse("remote:\n  url: https://pos.example.com/rest/v1\n").unwrap();
    assert_eq!(config.remote.timeout_secs, 15);
    assert_eq!(config.sync.interval_secs, 5);
    assert_eq!(config.retention.max_completed_orders, 500);
    assert!(config.cache.enabled);
    assert!(config.database_path.is_none());
  }

  #[test]
  fn test_full_config() {
    let yaml = r#"
remote:
  url: https://pos.example.com/rest/v1
  timeout_secs: 3
sync:
  interval_secs: 10
  max_attempts: 8
cache:
  build_id: "2024.06.01"
  origin: https://pos.example.com
  precache: ["/", "/offline.html", "https://cdn.example.com/logo.svg"]
mapping:
  staff:
    name: full_name
database_path: /tmp/pos.db
"#;
    let config = Config::parse(yaml).unwrap();
    assert_eq!(config.sync.batch_size, 25);
    assert_eq!(config.sync_settings().max_attempts, 8);
    assert_eq!(config.request_timeout(), Duration::from_secs(3));

    let renames = config.renames();
    assert_eq!(
      renames.get(&TableKind::Staff),
      Some(&vec![("name".to_string(), "full_name".to_string())])
    );

    assert_eq!(
      config.proxy_settings().precache,
      vec![
        "https://pos.example.com/".to_string(),
        "https://pos.example.com/offline.html".to_string(),
        "https://cdn.example.com/logo.svg".to_string(),
      ]
    );
  }

  #[test]
  fn test_rejects_unknown_table_in_mapping() {
    let yaml = "remote:\n  url: https://x\nmapping:\n  receipts:\n    a: b\n";
    assert!(Config::parse(yaml).is_err());
  }

  #[test]
  fn test_missing_explicit_path_is_an_error() {
    let result = Config::load(Some(Path::new("/definitely/not/here.yaml")));
    assert!(result.is_err());
  }
}

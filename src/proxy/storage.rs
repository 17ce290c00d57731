//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use super::traits::{CacheClass, CacheStatus, Payload};
use crate::db::Database;
use crate::store::record::{format_timestamp, now, parse_timestamp};

/// Meta key holding the generation that was last activated.
const ACTIVE_GENERATION_KEY: &str = "cache_generation";

/// Tag that namespaces every entry written by this build.
pub fn generation_tag(version: &str, build_id: Option<&str>) -> String {
  let mut hasher = Sha256::new();
  hasher.update(version.as_bytes());
  hasher.update(b":");
  hasher.update(build_id.unwrap_or_default().as_bytes());
  hex::encode(hasher.finalize())[..16].to_string()
}

/// A cached response.
#[derive(Debug, Clone)]
pub struct CachedEntry {
  pub payload: Payload,
  /// When the entry was stored
  pub cached_at: DateTime<Utc>,
}

/// Trait for cache storage backends. Reads and writes only ever touch the
/// backend's own generation.
pub trait CacheStorage: Send + Sync {
  fn generation(&self) -> &str;

  fn get(&self, class: CacheClass, key: &str) -> Result<Option<CachedEntry>>;

  fn put(&self, class: CacheClass, key: &str, payload: &Payload) -> Result<()>;

  fn evict(&self, class: CacheClass, key: &str) -> Result<bool>;

  /// Drop the oldest entries of `class` beyond `max_entries`.
  fn trim(&self, class: CacheClass, max_entries: usize) -> Result<usize>;

  /// Clear one class, or every class when `None`.
  fn purge(&self, class: Option<CacheClass>) -> Result<usize>;

  /// Make this generation the active one, dropping every other generation.
  fn activate(&self) -> Result<usize>;

  fn status(&self) -> Result<CacheStatus>;
}

/// Storage implementation that doesn't cache anything.
/// Used when caching is disabled - all operations are no-ops.
pub struct NoopStorage {
  generation: String,
}

impl NoopStorage {
  pub fn new(generation: impl Into<String>) -> Self {
    Self {
      generation: generation.into(),
    }
  }
}

impl CacheStorage for NoopStorage {
  fn generation(&self) -> &str {
    &self.generation
  }

  fn get(&self, _class: CacheClass, _key: &str) -> Result<Option<CachedEntry>> {
    Ok(None) // Always miss
  }

  fn put(&self, _class: CacheClass, _key: &str, _payload: &Payload) -> Result<()> {
    Ok(()) // Discard
  }

  fn evict(&self, _class: CacheClass, _key: &str) -> Result<bool> {
    Ok(false)
  }

  fn trim(&self, _class: CacheClass, _max_entries: usize) -> Result<usize> {
    Ok(0)
  }

  fn purge(&self, _class: Option<CacheClass>) -> Result<usize> {
    Ok(0)
  }

  fn activate(&self) -> Result<usize> {
    Ok(0)
  }

  fn status(&self) -> Result<CacheStatus> {
    Ok(CacheStatus {
      generation: self.generation.clone(),
      ..CacheStatus::default()
    })
  }
}

/// SQLite-based cache storage, sharing the store's database.
pub struct SqliteStorage {
  db: Arc<Database>,
  generation: String,
}

impl SqliteStorage {
  pub fn new(db: Arc<Database>, generation: impl Into<String>) -> Self {
    Self {
      db,
      generation: generation.into(),
    }
  }

  /// Generation recorded by the last `activate`, if any.
  pub fn active_generation(&self) -> Result<Option<String>> {
    self.db.meta(ACTIVE_GENERATION_KEY)
  }
}

impl CacheStorage for SqliteStorage {
  fn generation(&self) -> &str {
    &self.generation
  }

  fn get(&self, class: CacheClass, key: &str) -> Result<Option<CachedEntry>> {
    let row = self.db.with_conn(|conn| {
      conn
        .query_row(
          "SELECT status, content_type, body, stored_at FROM cache_entries
           WHERE generation = ? AND cache_class = ? AND cache_key = ?",
          params![self.generation, class.as_str(), key],
          |row| {
            Ok((
              row.get::<_, u16>(0)?,
              row.get::<_, Option<String>>(1)?,
              row.get::<_, Vec<u8>>(2)?,
              row.get::<_, String>(3)?,
            ))
          },
        )
        .optional()
        .map_err(|e| eyre!("Failed to read cache entry {}: {}", key, e))
    })?;

    let Some((status, content_type, body, stored_at)) = row else {
      return Ok(None);
    };
    let cached_at = parse_timestamp(&stored_at)
      .ok_or_else(|| eyre!("Corrupt cache timestamp for {}", key))?;

    Ok(Some(CachedEntry {
      payload: Payload {
        status,
        content_type,
        body,
      },
      cached_at,
    }))
  }

  fn put(&self, class: CacheClass, key: &str, payload: &Payload) -> Result<()> {
    self.db.with_conn(|conn| {
      conn
        .execute(
          "INSERT OR REPLACE INTO cache_entries
             (generation, cache_class, cache_key, status, content_type, body, stored_at)
           VALUES (?, ?, ?, ?, ?, ?, ?)",
          params![
            self.generation,
            class.as_str(),
            key,
            payload.status,
            payload.content_type,
            payload.body,
            format_timestamp(&now())
          ],
        )
        .map_err(|e| eyre!("Failed to cache {}: {}", key, e))?;
      Ok(())
    })
  }

  fn evict(&self, class: CacheClass, key: &str) -> Result<bool> {
    let rows = self.db.with_conn(|conn| {
      conn
        .execute(
          "DELETE FROM cache_entries WHERE generation = ? AND cache_class = ? AND cache_key = ?",
          params![self.generation, class.as_str(), key],
        )
        .map_err(|e| eyre!("Failed to evict {}: {}", key, e))
    })?;
    Ok(rows > 0)
  }

  fn trim(&self, class: CacheClass, max_entries: usize) -> Result<usize> {
    self.db.with_conn(|conn| {
      conn
        .execute(
          "DELETE FROM cache_entries
           WHERE generation = ?1 AND cache_class = ?2 AND cache_key IN (
             SELECT cache_key FROM cache_entries
             WHERE generation = ?1 AND cache_class = ?2
             ORDER BY stored_at DESC, rowid DESC
             LIMIT -1 OFFSET ?3
           )",
          params![self.generation, class.as_str(), max_entries as i64],
        )
        .map_err(|e| eyre!("Failed to trim {} cache: {}", class, e))
    })
  }

  fn purge(&self, class: Option<CacheClass>) -> Result<usize> {
    self.db.with_conn(|conn| {
      let rows = match class {
        Some(class) => conn.execute(
          "DELETE FROM cache_entries WHERE generation = ? AND cache_class = ?",
          params![self.generation, class.as_str()],
        ),
        None => conn.execute(
          "DELETE FROM cache_entries WHERE generation = ?",
          params![self.generation],
        ),
      };
      rows.map_err(|e| eyre!("Failed to purge cache: {}", e))
    })
  }

  fn activate(&self) -> Result<usize> {
    let removed = self.db.transaction(|tx| {
      let removed = tx
        .execute(
          "DELETE FROM cache_entries WHERE generation != ?",
          params![self.generation],
        )
        .map_err(|e| eyre!("Failed to drop old cache generations: {}", e))?;
      tx.execute(
        "INSERT OR REPLACE INTO meta (key, value) VALUES (?, ?)",
        params![ACTIVE_GENERATION_KEY, self.generation],
      )
      .map_err(|e| eyre!("Failed to record cache generation: {}", e))?;
      Ok(removed)
    })?;

    tracing::info!(generation = %self.generation, removed, "cache generation activated");
    Ok(removed)
  }

  fn status(&self) -> Result<CacheStatus> {
    self.db.with_conn(|conn| {
      let mut status = CacheStatus {
        generation: self.generation.clone(),
        ..CacheStatus::default()
      };

      let mut stmt = conn
        .prepare(
          "SELECT cache_class, COUNT(*) FROM cache_entries
           WHERE generation = ? GROUP BY cache_class",
        )
        .map_err(|e| eyre!("Failed to prepare cache status: {}", e))?;
      let counts = stmt
        .query_map(params![self.generation], |row| {
          Ok((row.get::<_, String>(0)?, row.get::<_, usize>(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
      for (class, count) in counts {
        let class: CacheClass = class.parse().map_err(|e: String| eyre!(e))?;
        status.entries.insert(class, count);
      }

      status.stale_entries = conn.query_row(
        "SELECT COUNT(*) FROM cache_entries WHERE generation != ?",
        params![self.generation],
        |row| row.get(0),
      )?;
      Ok(status)
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn storage(db: &Arc<Database>, generation: &str) -> SqliteStorage {
    SqliteStorage::new(db.clone(), generation)
  }

  fn page(body: &str) -> Payload {
    Payload::new(200, Some("text/html"), body)
  }

  #[test]
  fn test_generation_tag_is_stable_and_build_specific() {
    let a = generation_tag("0.1.0", Some("abc"));
    assert_eq!(a, generation_tag("0.1.0", Some("abc")));
    assert_ne!(a, generation_tag("0.1.0", Some("abd")));
    assert_eq!(a.len(), 16);
  }

  #[test]
  fn test_entries_are_namespaced_by_generation() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let old = storage(&db, "gen-old");
    let new = storage(&db, "gen-new");

    old.put(CacheClass::PublicDocument, "https://pos.test/", &page("old")).unwrap();
    assert!(new.get(CacheClass::PublicDocument, "https://pos.test/").unwrap().is_none());

    new.put(CacheClass::PublicDocument, "https://pos.test/", &page("new")).unwrap();
    let removed = new.activate().unwrap();
    assert_eq!(removed, 1);
    assert!(old.get(CacheClass::PublicDocument, "https://pos.test/").unwrap().is_none());
    assert_eq!(new.active_generation().unwrap().as_deref(), Some("gen-new"));

    let entry = new.get(CacheClass::PublicDocument, "https://pos.test/").unwrap().unwrap();
    assert_eq!(entry.payload.body, b"new".to_vec());
  }

  #[test]
  fn test_trim_keeps_newest_entries() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let cache = storage(&db, "g");
    for i in 0..5 {
      cache
        .put(CacheClass::Image, &format!("https://cdn.test/{}.png", i), &page("x"))
        .unwrap();
    }
    cache.put(CacheClass::StaticAsset, "https://pos.test/app.js", &page("js")).unwrap();

    assert_eq!(cache.trim(CacheClass::Image, 3).unwrap(), 2);
    assert!(cache.get(CacheClass::Image, "https://cdn.test/0.png").unwrap().is_none());
    assert!(cache.get(CacheClass::Image, "https://cdn.test/4.png").unwrap().is_some());

    let status = cache.status().unwrap();
    assert_eq!(status.entries.get(&CacheClass::Image), Some(&3));
    assert_eq!(status.entries.get(&CacheClass::StaticAsset), Some(&1));
  }

  #[test]
  fn test_purge_and_evict() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let cache = storage(&db, "g");
    cache.put(CacheClass::ApiData, "a", &page("1")).unwrap();
    cache.put(CacheClass::ApiData, "b", &page("2")).unwrap();
    cache.put(CacheClass::Image, "c", &page("3")).unwrap();

    assert!(cache.evict(CacheClass::ApiData, "a").unwrap());
    assert!(!cache.evict(CacheClass::ApiData, "a").unwrap());
    assert_eq!(cache.purge(Some(CacheClass::ApiData)).unwrap(), 1);
    assert_eq!(cache.purge(None).unwrap(), 1);
    assert!(cache.status().unwrap().entries.is_empty());
  }
}

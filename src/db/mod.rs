pub mod schema;

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Shared SQLite handle for the local mirror, the queue and the cache.
///
/// Every store operation goes through the single mutex, so statements and
/// transactions issued by different components never interleave.
pub struct Database {
  conn: Mutex<Connection>,
}

impl Database {
  /// Open or create the database at the given path (or the default location).
  pub fn open(path: Option<&Path>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

    let db = Self {
      conn: Mutex::new(conn),
    };
    db.configure()?;
    db.run_migrations()?;

    tracing::debug!(path = %path.display(), "local database opened");
    Ok(db)
  }

  /// Open an in-memory database (tests and dry runs).
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;

    let db = Self {
      conn: Mutex::new(conn),
    };
    db.configure()?;
    db.run_migrations()?;
    Ok(db)
  }

  /// Get the default database path
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("tillsync").join("pos.db"))
  }

  fn configure(&self) -> Result<()> {
    let conn = self.lock()?;
    // journal_mode answers with a row, so it cannot go through execute_batch
    conn
      .query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))
      .map_err(|e| eyre!("Failed to enable WAL: {}", e))?;
    conn
      .execute_batch("PRAGMA synchronous = NORMAL; PRAGMA foreign_keys = ON;")
      .map_err(|e| eyre!("Failed to configure database: {}", e))?;
    Ok(())
  }

  /// Run database migrations
  fn run_migrations(&self) -> Result<()> {
    self
      .lock()?
      .execute_batch(schema::SCHEMA)
      .map_err(|e| eyre!("Failed to run migrations: {}", e))?;
    Ok(())
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Run a closure against the connection while holding the lock.
  pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
    let conn = self.lock()?;
    f(&conn)
  }

  /// Run a closure inside one transaction. Any error rolls everything back.
  pub fn transaction<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;
    let out = f(&tx)?;
    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(out)
  }

  /// Read a value from the key/value meta table.
  pub fn meta(&self, key: &str) -> Result<Option<String>> {
    self.with_conn(|conn| {
      conn
        .query_row("SELECT value FROM meta WHERE key = ?", params![key], |row| {
          row.get(0)
        })
        .optional()
        .map_err(|e| eyre!("Failed to read meta {}: {}", key, e))
    })
  }

  /// Write a value to the key/value meta table.
  pub fn set_meta(&self, key: &str, value: &str) -> Result<()> {
    self.with_conn(|conn| {
      conn
        .execute(
          "INSERT OR REPLACE INTO meta (key, value) VALUES (?, ?)",
          params![key, value],
        )
        .map_err(|e| eyre!("Failed to write meta {}: {}", key, e))?;
      Ok(())
    })
  }
}

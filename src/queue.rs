//! Durable, ordered log of writes the remote has not acknowledged yet.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::db::Database;
use crate::store::record::{format_timestamp, now, parse_timestamp};
use crate::store::{Operation, TableKind};

/// Replay state of a queued write. Acknowledged items are deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
  Pending,
  InFlight,
  /// Gave up or rejected; needs manual attention
  Failed,
}

impl QueueStatus {
  pub fn as_str(self) -> &'static str {
    match self {
      QueueStatus::Pending => "pending",
      QueueStatus::InFlight => "in_flight",
      QueueStatus::Failed => "failed",
    }
  }

  fn parse(s: &str) -> Result<Self> {
    match s {
      "pending" => Ok(QueueStatus::Pending),
      "in_flight" => Ok(QueueStatus::InFlight),
      "failed" => Ok(QueueStatus::Failed),
      other => Err(eyre!("Unknown queue status: {}", other)),
    }
  }
}

impl fmt::Display for QueueStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// One pending or in-flight mutation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueItem {
  pub sequence: i64,
  pub table: TableKind,
  pub record_id: String,
  pub operation: Operation,
  /// Full record for creates, changed fields for updates, `{id}` for deletes
  pub payload: Map<String, Value>,
  pub attempts: u32,
  pub status: QueueStatus,
  pub last_error: Option<String>,
  pub enqueued_at: DateTime<Utc>,
}

const ITEM_COLUMNS: &str =
  "sequence, tbl, record_id, operation, payload, attempts, status, last_error, enqueued_at";

#[derive(Clone)]
pub struct MutationQueue {
  db: Arc<Database>,
}

impl MutationQueue {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }

  /// Append a write. Sequences come from AUTOINCREMENT and are never reused.
  pub fn enqueue(
    &self,
    table: TableKind,
    operation: Operation,
    record_id: &str,
    payload: &Map<String, Value>,
  ) -> Result<i64> {
    self
      .db
      .with_conn(|conn| enqueue_in(conn, table, operation, record_id, payload))
  }

  /// Lowest-sequence replayable items.
  pub fn peek_batch(&self, max_n: usize) -> Result<Vec<QueueItem>> {
    self.peek_batch_after(0, max_n)
  }

  /// Like `peek_batch`, starting after `after` so a drain can walk the queue
  /// without revisiting items it already handled in this run.
  ///
  /// Items whose `(table, id)` has an earlier failed or in-flight entry are
  /// held back. Once `max_n` is reached the batch still takes every later item
  /// for a key it already contains, so one record's writes never straddle two
  /// batches.
  pub fn peek_batch_after(&self, after: i64, max_n: usize) -> Result<Vec<QueueItem>> {
    let candidates = self.db.with_conn(|conn| {
      let sql = format!(
        "SELECT {} FROM mutation_queue q
         WHERE q.status = 'pending' AND q.sequence > ?
           AND NOT EXISTS (
             SELECT 1 FROM mutation_queue b
             WHERE b.tbl = q.tbl AND b.record_id = q.record_id
               AND b.sequence < q.sequence AND b.status != 'pending'
           )
         ORDER BY q.sequence",
        ITEM_COLUMNS
      );
      query_items(conn, &sql, params![after])
    })?;

    let mut batch: Vec<QueueItem> = Vec::new();
    let mut keys: HashSet<(TableKind, String)> = HashSet::new();
    for item in candidates {
      let key = (item.table, item.record_id.clone());
      if batch.len() < max_n || keys.contains(&key) {
        keys.insert(key);
        batch.push(item);
      }
    }
    Ok(batch)
  }

  pub fn get(&self, sequence: i64) -> Result<Option<QueueItem>> {
    self.db.with_conn(|conn| {
      let sql = format!("SELECT {} FROM mutation_queue WHERE sequence = ?", ITEM_COLUMNS);
      Ok(query_items(conn, &sql, params![sequence])?.into_iter().next())
    })
  }

  /// Flag an item as being pushed. The returned guard reverts it to pending
  /// unless `complete` is called, so a cancelled push leaves the item as it was.
  pub fn begin(&self, sequence: i64) -> Result<InFlight<'_>> {
    self.set_status(sequence, QueueStatus::InFlight)?;
    Ok(InFlight {
      queue: self,
      sequence,
      armed: true,
    })
  }

  /// Remove an acknowledged item.
  pub fn mark_done(&self, sequence: i64) -> Result<()> {
    self.db.with_conn(|conn| mark_done_in(conn, sequence))
  }

  /// Park an item for manual attention.
  pub fn mark_failed(&self, sequence: i64, reason: &str) -> Result<()> {
    self.db.with_conn(|conn| {
      conn
        .execute(
          "UPDATE mutation_queue SET status = 'failed', attempts = attempts + 1, last_error = ?
           WHERE sequence = ?",
          params![reason, sequence],
        )
        .map_err(|e| eyre!("Failed to mark item {} failed: {}", sequence, e))?;
      Ok(())
    })?;
    tracing::warn!(sequence, reason, "queue item marked failed");
    Ok(())
  }

  /// Count a failed attempt. Past `max_attempts` the item becomes failed,
  /// otherwise it goes back to pending for the next run.
  pub fn record_attempt_failure(
    &self,
    sequence: i64,
    reason: &str,
    max_attempts: u32,
  ) -> Result<QueueStatus> {
    let status = self.db.with_conn(|conn| {
      conn
        .execute(
          "UPDATE mutation_queue
           SET attempts = attempts + 1,
               last_error = ?1,
               status = CASE WHEN attempts + 1 >= ?2 THEN 'failed' ELSE 'pending' END
           WHERE sequence = ?3",
          params![reason, max_attempts, sequence],
        )
        .map_err(|e| eyre!("Failed to record attempt for item {}: {}", sequence, e))?;
      let status: Option<String> = conn
        .query_row(
          "SELECT status FROM mutation_queue WHERE sequence = ?",
          params![sequence],
          |row| row.get(0),
        )
        .optional()?;
      status
        .map(|s| QueueStatus::parse(&s))
        .transpose()?
        .ok_or_else(|| eyre!("Queue item {} vanished", sequence))
    })?;

    if status == QueueStatus::Failed {
      tracing::warn!(sequence, reason, "queue item exhausted its attempts");
    }
    Ok(status)
  }

  /// Items left in-flight by a crash go back to pending.
  pub fn recover_in_flight(&self) -> Result<usize> {
    let n = self.db.with_conn(|conn| {
      conn
        .execute(
          "UPDATE mutation_queue SET status = 'pending' WHERE status = 'in_flight'",
          [],
        )
        .map_err(|e| eyre!("Failed to recover in-flight items: {}", e))
    })?;
    if n > 0 {
      tracing::info!(count = n, "recovered interrupted queue items");
    }
    Ok(n)
  }

  /// Items still waiting to reach the remote (pending or in flight).
  pub fn count(&self) -> Result<usize> {
    self.count_where("status != 'failed'")
  }

  pub fn failed_count(&self) -> Result<usize> {
    self.count_where("status = 'failed'")
  }

  pub fn failed_items(&self) -> Result<Vec<QueueItem>> {
    self.db.with_conn(|conn| {
      let sql = format!(
        "SELECT {} FROM mutation_queue WHERE status = 'failed' ORDER BY sequence",
        ITEM_COLUMNS
      );
      query_items(conn, &sql, [])
    })
  }

  /// Give a failed item a fresh set of attempts.
  pub fn retry(&self, sequence: i64) -> Result<bool> {
    let rows = self.db.with_conn(|conn| {
      conn
        .execute(
          "UPDATE mutation_queue SET status = 'pending', attempts = 0
           WHERE sequence = ? AND status = 'failed'",
          params![sequence],
        )
        .map_err(|e| eyre!("Failed to retry item {}: {}", sequence, e))
    })?;
    Ok(rows > 0)
  }

  /// Drop a failed item for good, returning it.
  pub fn discard(&self, sequence: i64) -> Result<Option<QueueItem>> {
    let item = self.get(sequence)?;
    match item {
      Some(item) if item.status == QueueStatus::Failed => {
        self.mark_done(sequence)?;
        tracing::info!(sequence, table = %item.table, id = %item.record_id, "failed item discarded");
        Ok(Some(item))
      }
      _ => Ok(None),
    }
  }

  /// Ids of `table` with any unacknowledged write, failed ones included.
  pub fn outstanding_ids(&self, table: TableKind) -> Result<HashSet<String>> {
    self.db.with_conn(|conn| outstanding_ids_in(conn, table))
  }

  pub fn has_outstanding(&self, table: TableKind, record_id: &str) -> Result<bool> {
    self.db.with_conn(|conn| has_outstanding_in(conn, table, record_id, i64::MAX))
  }

  /// Whether `(table, id)` has an unacknowledged write older than `sequence`.
  pub fn has_outstanding_before(
    &self,
    table: TableKind,
    record_id: &str,
    sequence: i64,
  ) -> Result<bool> {
    self
      .db
      .with_conn(|conn| has_outstanding_in(conn, table, record_id, sequence))
  }

  fn set_status(&self, sequence: i64, status: QueueStatus) -> Result<()> {
    self.db.with_conn(|conn| {
      conn
        .execute(
          "UPDATE mutation_queue SET status = ? WHERE sequence = ?",
          params![status.as_str(), sequence],
        )
        .map_err(|e| eyre!("Failed to set item {} {}: {}", sequence, status, e))?;
      Ok(())
    })
  }

  fn count_where(&self, predicate: &str) -> Result<usize> {
    self.db.with_conn(|conn| {
      conn
        .query_row(
          &format!("SELECT COUNT(*) FROM mutation_queue WHERE {}", predicate),
          [],
          |row| row.get(0),
        )
        .map_err(|e| eyre!("Failed to count queue: {}", e))
    })
  }
}

/// In-flight marker for one queue item. Dropping it without `complete`
/// puts the item back to pending.
pub struct InFlight<'a> {
  queue: &'a MutationQueue,
  sequence: i64,
  armed: bool,
}

impl InFlight<'_> {
  /// The item's fate has been recorded elsewhere; keep its status as is.
  pub fn complete(mut self) {
    self.armed = false;
  }
}

impl Drop for InFlight<'_> {
  fn drop(&mut self) {
    if self.armed {
      if let Err(e) = self.queue.set_status(self.sequence, QueueStatus::Pending) {
        tracing::warn!(sequence = self.sequence, "could not revert in-flight item: {}", e);
      }
    }
  }
}

pub fn enqueue_in(
  conn: &Connection,
  table: TableKind,
  operation: Operation,
  record_id: &str,
  payload: &Map<String, Value>,
) -> Result<i64> {
  let mut payload = payload.clone();
  payload.insert("id".to_string(), Value::String(record_id.to_string()));
  let payload = serde_json::to_string(&payload)
    .map_err(|e| eyre!("Failed to serialize queue payload: {}", e))?;

  conn
    .execute(
      "INSERT INTO mutation_queue (tbl, record_id, operation, payload, enqueued_at)
       VALUES (?, ?, ?, ?, ?)",
      params![
        table.as_str(),
        record_id,
        operation.as_str(),
        payload,
        format_timestamp(&now())
      ],
    )
    .map_err(|e| eyre!("Failed to enqueue {} {}: {}", operation, table, e))?;

  let sequence = conn.last_insert_rowid();
  tracing::debug!(sequence, %table, id = record_id, %operation, "write queued");
  Ok(sequence)
}

pub fn mark_done_in(conn: &Connection, sequence: i64) -> Result<()> {
  conn
    .execute(
      "DELETE FROM mutation_queue WHERE sequence = ?",
      params![sequence],
    )
    .map_err(|e| eyre!("Failed to remove item {}: {}", sequence, e))?;
  Ok(())
}

/// Point queued writes at a server-assigned id: the record's own items and
/// any dependent payload fields that referenced the provisional id.
pub fn remap_id_in(conn: &Connection, table: TableKind, old_id: &str, new_id: &str) -> Result<usize> {
  let mut touched = conn
    .execute(
      "UPDATE mutation_queue SET record_id = ?1, payload = json_set(payload, '$.id', ?1)
       WHERE tbl = ?2 AND record_id = ?3",
      params![new_id, table.as_str(), old_id],
    )
    .map_err(|e| eyre!("Failed to remap queued {} {}: {}", table, old_id, e))?;

  for (dependent, field) in table.dependents() {
    let path = format!("$.{}", field);
    touched += conn
      .execute(
        "UPDATE mutation_queue SET payload = json_set(payload, ?1, ?2)
         WHERE tbl = ?3 AND json_extract(payload, ?1) = ?4",
        params![path, new_id, dependent.as_str(), old_id],
      )
      .map_err(|e| eyre!("Failed to remap queued {}.{}: {}", dependent, field, e))?;
  }
  Ok(touched)
}

pub fn outstanding_ids_in(conn: &Connection, table: TableKind) -> Result<HashSet<String>> {
  let mut stmt = conn
    .prepare("SELECT DISTINCT record_id FROM mutation_queue WHERE tbl = ?")
    .map_err(|e| eyre!("Failed to prepare query: {}", e))?;
  let ids = stmt
    .query_map(params![table.as_str()], |row| row.get(0))?
    .collect::<rusqlite::Result<HashSet<String>>>()?;
  Ok(ids)
}

pub fn has_outstanding_in(
  conn: &Connection,
  table: TableKind,
  record_id: &str,
  before: i64,
) -> Result<bool> {
  let n: i64 = conn
    .query_row(
      "SELECT COUNT(*) FROM mutation_queue WHERE tbl = ? AND record_id = ? AND sequence < ?",
      params![table.as_str(), record_id, before],
      |row| row.get(0),
    )
    .map_err(|e| eyre!("Failed to check queue for {} {}: {}", table, record_id, e))?;
  Ok(n > 0)
}

fn query_items(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> Result<Vec<QueueItem>> {
  let mut stmt = conn
    .prepare(sql)
    .map_err(|e| eyre!("Failed to prepare queue query: {}", e))?;

  let rows = stmt
    .query_map(params, |row| {
      Ok((
        row.get::<_, i64>(0)?,
        row.get::<_, String>(1)?,
        row.get::<_, String>(2)?,
        row.get::<_, String>(3)?,
        row.get::<_, String>(4)?,
        row.get::<_, u32>(5)?,
        row.get::<_, String>(6)?,
        row.get::<_, Option<String>>(7)?,
        row.get::<_, String>(8)?,
      ))
    })
    .map_err(|e| eyre!("Failed to query queue: {}", e))?
    .collect::<rusqlite::Result<Vec<_>>>()?;

  rows
    .into_iter()
    .map(
      |(sequence, tbl, record_id, operation, payload, attempts, status, last_error, enqueued_at)| {
        Ok(QueueItem {
          sequence,
          table: tbl.parse().map_err(|e: String| eyre!(e))?,
          record_id,
          operation: operation.parse().map_err(|e: String| eyre!(e))?,
          payload: serde_json::from_str(&payload)
            .map_err(|e| eyre!("Corrupt payload for item {}: {}", sequence, e))?,
          attempts,
          status: QueueStatus::parse(&status)?,
          last_error,
          enqueued_at: parse_timestamp(&enqueued_at)
            .ok_or_else(|| eyre!("Corrupt timestamp for item {}", sequence))?,
        })
      },
    )
    .collect()
}

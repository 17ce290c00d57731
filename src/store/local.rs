//! SQLite-backed mirror of the remote tables.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

use super::record::{format_timestamp, parse_timestamp, Record};
use super::table::TableKind;
use crate::db::Database;

/// Order statuses whose rows may be swept once confirmed.
const CLOSED_ORDER_STATUSES: [&str; 3] = ["completed", "paid", "cancelled"];

/// Sort key for `LocalStore::query`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderBy {
  Id,
  UpdatedAt,
  Field(String),
}

/// Ordering applied to query results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
  pub by: OrderBy,
  pub descending: bool,
}

impl Order {
  pub fn newest_first() -> Self {
    Self {
      by: OrderBy::UpdatedAt,
      descending: true,
    }
  }

  pub fn by_field(name: impl Into<String>) -> Self {
    Self {
      by: OrderBy::Field(name.into()),
      descending: false,
    }
  }

  pub fn descending(mut self) -> Self {
    self.descending = true;
    self
  }
}

impl Default for Order {
  fn default() -> Self {
    Self {
      by: OrderBy::Id,
      descending: false,
    }
  }
}

/// What a retention sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
  pub orders_removed: usize,
  pub items_removed: usize,
}

/// Local store: idempotent upserts keyed by `(table, id)`.
#[derive(Clone)]
pub struct LocalStore {
  db: Arc<Database>,
}

impl LocalStore {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }

  pub fn get(&self, table: TableKind, id: &str) -> Result<Option<Record>> {
    self.db.with_conn(|conn| get_in(conn, table, id))
  }

  pub fn put(&self, record: &Record) -> Result<()> {
    self.db.with_conn(|conn| put_in(conn, record))
  }

  /// Upsert a batch of records in one transaction.
  pub fn bulk_put(&self, table: TableKind, records: &[Record]) -> Result<usize> {
    self.bulk_put_deferring(table, records, &HashSet::new())
  }

  /// Upsert a pulled snapshot, skipping ids that still have unconfirmed local writes.
  pub fn bulk_put_deferring(
    &self,
    table: TableKind,
    records: &[Record],
    deferred: &HashSet<String>,
  ) -> Result<usize> {
    self
      .db
      .transaction(|tx| bulk_put_in(tx, table, records, deferred))
  }

  /// Records of `table` matching `predicate`, sorted by `order`.
  pub fn query<P>(&self, table: TableKind, predicate: P, order: &Order) -> Result<Vec<Record>>
  where
    P: Fn(&Record) -> bool,
  {
    let mut records: Vec<Record> = self
      .db
      .with_conn(|conn| all_in(conn, table))?
      .into_iter()
      .filter(|r| predicate(r))
      .collect();

    records.sort_by(|a, b| {
      let ord = match &order.by {
        OrderBy::Id => a.id.cmp(&b.id),
        OrderBy::UpdatedAt => a.updated_at.cmp(&b.updated_at),
        OrderBy::Field(name) => compare_values(a.field(name), b.field(name)),
      };
      if order.descending {
        ord.reverse()
      } else {
        ord
      }
    });

    Ok(records)
  }

  pub fn delete(&self, table: TableKind, id: &str) -> Result<bool> {
    self.db.with_conn(|conn| delete_in(conn, table, id))
  }

  pub fn count(&self, table: TableKind) -> Result<usize> {
    self.db.with_conn(|conn| {
      conn
        .query_row(
          "SELECT COUNT(*) FROM records WHERE tbl = ?",
          params![table.as_str()],
          |row| row.get(0),
        )
        .map_err(|e| eyre!("Failed to count {}: {}", table, e))
    })
  }

  /// Drop the oldest confirmed closed orders beyond `keep`, with their items.
  pub fn sweep_retention(&self, keep: usize) -> Result<SweepReport> {
    self.db.transaction(|tx| {
      let candidates: Vec<String> = {
        let mut stmt = tx
          .prepare(
            "SELECT id FROM records
             WHERE tbl = 'orders' AND synced = 1
               AND json_extract(fields, '$.status') IN (?, ?, ?)
             ORDER BY updated_at DESC
             LIMIT -1 OFFSET ?",
          )
          .map_err(|e| eyre!("Failed to prepare sweep query: {}", e))?;
        let ids = stmt
          .query_map(
            params![
              CLOSED_ORDER_STATUSES[0],
              CLOSED_ORDER_STATUSES[1],
              CLOSED_ORDER_STATUSES[2],
              keep as i64
            ],
            |row| row.get(0),
          )
          .map_err(|e| eyre!("Failed to run sweep query: {}", e))?
          .collect::<rusqlite::Result<Vec<String>>>()?;
        ids
      };

      let mut report = SweepReport::default();
      for order_id in candidates {
        let unsynced_items: i64 = tx.query_row(
          "SELECT COUNT(*) FROM records
           WHERE tbl = 'order_items' AND synced = 0
             AND json_extract(fields, '$.order_id') = ?",
          params![order_id],
          |row| row.get(0),
        )?;
        if unsynced_items > 0 {
          continue;
        }

        report.items_removed += tx.execute(
          "DELETE FROM records
           WHERE tbl = 'order_items' AND json_extract(fields, '$.order_id') = ?",
          params![order_id],
        )?;
        report.orders_removed += delete_in(tx, TableKind::Orders, &order_id)? as usize;
      }

      if report.orders_removed > 0 {
        tracing::info!(
          orders = report.orders_removed,
          items = report.items_removed,
          "retention sweep removed closed orders"
        );
      }
      Ok(report)
    })
  }
}

/// Fetch one record on an existing connection or transaction.
pub fn get_in(conn: &Connection, table: TableKind, id: &str) -> Result<Option<Record>> {
  conn
    .query_row(
      "SELECT id, fields, synced, updated_at FROM records WHERE tbl = ? AND id = ?",
      params![table.as_str(), id],
      RawRow::read,
    )
    .optional()
    .map_err(|e| eyre!("Failed to read {} {}: {}", table, id, e))?
    .map(|raw| raw.into_record(table))
    .transpose()
}

/// Upsert one record on an existing connection or transaction.
pub fn put_in(conn: &Connection, record: &Record) -> Result<()> {
  let fields = serde_json::to_string(&record.fields)
    .map_err(|e| eyre!("Failed to serialize {} {}: {}", record.table, record.id, e))?;

  conn
    .execute(
      "INSERT INTO records (tbl, id, fields, synced, updated_at) VALUES (?, ?, ?, ?, ?)
       ON CONFLICT(tbl, id) DO UPDATE SET
         fields = excluded.fields,
         synced = excluded.synced,
         updated_at = excluded.updated_at",
      params![
        record.table.as_str(),
        record.id,
        fields,
        record.synced,
        format_timestamp(&record.updated_at)
      ],
    )
    .map_err(|e| eyre!("Failed to store {} {}: {}", record.table, record.id, e))?;

  Ok(())
}

/// Upsert the records of `table` except those in `deferred`. Returns how many were written.
pub fn bulk_put_in(
  conn: &Connection,
  table: TableKind,
  records: &[Record],
  deferred: &HashSet<String>,
) -> Result<usize> {
  let mut written = 0;
  for record in records.iter().filter(|r| r.table == table) {
    if deferred.contains(&record.id) {
      tracing::debug!(%table, id = %record.id, "pull deferred for pending local write");
      continue;
    }
    put_in(conn, record)?;
    written += 1;
  }
  Ok(written)
}

pub fn delete_in(conn: &Connection, table: TableKind, id: &str) -> Result<bool> {
  let rows = conn
    .execute(
      "DELETE FROM records WHERE tbl = ? AND id = ?",
      params![table.as_str(), id],
    )
    .map_err(|e| eyre!("Failed to delete {} {}: {}", table, id, e))?;
  Ok(rows > 0)
}

/// Replace a provisional id with the server-assigned one, rewriting every
/// referencing field in dependent tables. Returns the number of dependents touched.
pub fn remap_id_in(conn: &Connection, table: TableKind, old_id: &str, new_id: &str) -> Result<usize> {
  conn.execute(
    "DELETE FROM records WHERE tbl = ? AND id = ?",
    params![table.as_str(), new_id],
  )?;
  conn
    .execute(
      "UPDATE records SET id = ? WHERE tbl = ? AND id = ?",
      params![new_id, table.as_str(), old_id],
    )
    .map_err(|e| eyre!("Failed to remap {} {}: {}", table, old_id, e))?;

  let mut touched = 0;
  for (dependent, field) in table.dependents() {
    let path = format!("$.{}", field);
    touched += conn
      .execute(
        "UPDATE records SET fields = json_set(fields, ?1, ?2)
         WHERE tbl = ?3 AND json_extract(fields, ?1) = ?4",
        params![path, new_id, dependent.as_str(), old_id],
      )
      .map_err(|e| eyre!("Failed to rewrite {}.{}: {}", dependent, field, e))?;
  }
  Ok(touched)
}

fn all_in(conn: &Connection, table: TableKind) -> Result<Vec<Record>> {
  let mut stmt = conn
    .prepare("SELECT id, fields, synced, updated_at FROM records WHERE tbl = ?")
    .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

  let rows = stmt
    .query_map(params![table.as_str()], RawRow::read)
    .map_err(|e| eyre!("Failed to query {}: {}", table, e))?
    .collect::<rusqlite::Result<Vec<_>>>()?;

  rows
    .into_iter()
    .map(|raw| raw.into_record(table))
    .collect()
}

struct RawRow {
  id: String,
  fields: String,
  synced: bool,
  updated_at: String,
}

impl RawRow {
  fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id: row.get(0)?,
      fields: row.get(1)?,
      synced: row.get(2)?,
      updated_at: row.get(3)?,
    })
  }

  fn into_record(self, table: TableKind) -> Result<Record> {
    let fields: Map<String, Value> = serde_json::from_str(&self.fields)
      .map_err(|e| eyre!("Corrupt fields for {} {}: {}", table, self.id, e))?;
    let updated_at = parse_timestamp(&self.updated_at)
      .ok_or_else(|| eyre!("Corrupt timestamp for {} {}", table, self.id))?;
    Ok(Record {
      table,
      id: self.id,
      fields,
      synced: self.synced,
      updated_at,
    })
  }
}

/// Total order over optional JSON values: missing/null first, then
/// booleans, numbers, strings; anything else compares by its JSON text.
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
  fn rank(v: Option<&Value>) -> u8 {
    match v {
      None | Some(Value::Null) => 0,
      Some(Value::Bool(_)) => 1,
      Some(Value::Number(_)) => 2,
      Some(Value::String(_)) => 3,
      Some(_) => 4,
    }
  }

  match (a, b) {
    (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
    (Some(Value::Number(x)), Some(Value::Number(y))) => {
      let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
      x.partial_cmp(&y).unwrap_or(Ordering::Equal)
    }
    (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
    (Some(x), Some(y)) if rank(a) == rank(b) && rank(a) == 4 => x.to_string().cmp(&y.to_string()),
    _ => rank(a).cmp(&rank(b)),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;
  use serde_json::json;

  fn setup() -> LocalStore {
    LocalStore::new(Arc::new(Database::open_in_memory().unwrap()))
  }

  fn record(table: TableKind, value: Value) -> Record {
    Record::from_value(table, value)
  }

  #[test]
  fn test_put_and_get() {
    let store = setup();
    let table = record(TableKind::Tables, json!({"id": "t1", "status": "free"}));
    store.put(&table).unwrap();

    let fetched = store.get(TableKind::Tables, "t1").unwrap().unwrap();
    assert_eq!(fetched, table);
    assert!(store.get(TableKind::Orders, "t1").unwrap().is_none());
  }

  #[test]
  fn test_bulk_put_is_idempotent() {
    let store = setup();
    let mut items = vec![
      record(TableKind::MenuItems, json!({"id": "m1", "name": "Soup", "price": 120})),
      record(TableKind::MenuItems, json!({"id": "m2", "name": "Tea", "price": 40})),
    ];
    for item in &mut items {
      item.synced = true;
    }

    store.bulk_put(TableKind::MenuItems, &items).unwrap();
    let first = store
      .query(TableKind::MenuItems, |_| true, &Order::default())
      .unwrap();

    store.bulk_put(TableKind::MenuItems, &items).unwrap();
    let second = store
      .query(TableKind::MenuItems, |_| true, &Order::default())
      .unwrap();

    assert_eq!(first, second);
    assert_eq!(second.len(), 2);
  }

  #[test]
  fn test_bulk_put_deferring_skips_pending_ids() {
    let store = setup();
    let local = record(TableKind::Tables, json!({"id": "t1", "status": "occupied"}));
    store.put(&local).unwrap();

    let pulled = vec![
      record(TableKind::Tables, json!({"id": "t1", "status": "free"})),
      record(TableKind::Tables, json!({"id": "t2", "status": "free"})),
    ];
    let deferred: HashSet<String> = ["t1".to_string()].into();
    let written = store
      .bulk_put_deferring(TableKind::Tables, &pulled, &deferred)
      .unwrap();

    assert_eq!(written, 1);
    let t1 = store.get(TableKind::Tables, "t1").unwrap().unwrap();
    assert_eq!(t1.field_str("status"), Some("occupied"));
    assert!(store.get(TableKind::Tables, "t2").unwrap().is_some());
  }

  #[test]
  fn test_query_filters_and_orders() {
    let store = setup();
    for (id, price) in [("a", 300), ("b", 100), ("c", 200)] {
      store
        .put(&record(TableKind::MenuItems, json!({"id": id, "price": price})))
        .unwrap();
    }

    let cheap = store
      .query(
        TableKind::MenuItems,
        |r| r.field("price").and_then(Value::as_i64).unwrap_or(0) < 250,
        &Order::by_field("price"),
      )
      .unwrap();
    let ids: Vec<_> = cheap.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["b", "c"]);

    let desc = store
      .query(TableKind::MenuItems, |_| true, &Order::by_field("price").descending())
      .unwrap();
    assert_eq!(desc[0].id, "a");
  }

  #[test]
  fn test_delete() {
    let store = setup();
    store
      .put(&record(TableKind::Shifts, json!({"id": "s1"})))
      .unwrap();
    assert!(store.delete(TableKind::Shifts, "s1").unwrap());
    assert!(!store.delete(TableKind::Shifts, "s1").unwrap());
    assert_eq!(store.count(TableKind::Shifts).unwrap(), 0);
  }

  #[test]
  fn test_remap_rewrites_dependents() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let store = LocalStore::new(db.clone());
    store
      .put(&record(TableKind::Orders, json!({"id": "local-1", "total": 500})))
      .unwrap();
    store
      .put(&record(
        TableKind::OrderItems,
        json!({"id": "i1", "order_id": "local-1", "qty": 1}),
      ))
      .unwrap();
    store
      .put(&record(
        TableKind::OrderItems,
        json!({"id": "i2", "order_id": "other", "qty": 2}),
      ))
      .unwrap();

    let touched = db
      .transaction(|tx| remap_id_in(tx, TableKind::Orders, "local-1", "srv-9"))
      .unwrap();

    assert_eq!(touched, 1);
    assert!(store.get(TableKind::Orders, "local-1").unwrap().is_none());
    assert!(store.get(TableKind::Orders, "srv-9").unwrap().is_some());
    let i1 = store.get(TableKind::OrderItems, "i1").unwrap().unwrap();
    assert_eq!(i1.field_str("order_id"), Some("srv-9"));
    let i2 = store.get(TableKind::OrderItems, "i2").unwrap().unwrap();
    assert_eq!(i2.field_str("order_id"), Some("other"));
  }

  #[test]
  fn test_sweep_keeps_newest_and_unsynced() {
    let store = setup();
    let base = parse_timestamp("2024-03-01T12:00:00Z").unwrap();
    for n in 0..4 {
      let mut order = record(
        TableKind::Orders,
        json!({"id": format!("o{}", n), "status": "paid"}),
      );
      order.synced = true;
      order.updated_at = base + chrono::Duration::minutes(n);
      store.put(&order).unwrap();

      let mut item = record(
        TableKind::OrderItems,
        json!({"id": format!("i{}", n), "order_id": format!("o{}", n)}),
      );
      // o0 still has an unconfirmed item and must survive
      item.synced = n != 0;
      store.put(&item).unwrap();
    }
    let mut open = record(TableKind::Orders, json!({"id": "open", "status": "pending"}));
    open.synced = true;
    open.updated_at = base - chrono::Duration::days(30);
    store.put(&open).unwrap();

    let report = store.sweep_retention(2).unwrap();

    assert_eq!(
      report,
      SweepReport {
        orders_removed: 1,
        items_removed: 1
      }
    );
    assert!(store.get(TableKind::Orders, "o1").unwrap().is_none());
    assert!(store.get(TableKind::Orders, "o0").unwrap().is_some());
    assert!(store.get(TableKind::Orders, "open").unwrap().is_some());
    assert_eq!(store.count(TableKind::Orders).unwrap(), 4);
  }
}

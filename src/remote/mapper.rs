//! Translation between local record shape and remote row shape.

use serde_json::{Map, Value};
use std::collections::HashMap;

use super::RemoteError;
use crate::store::record::{is_provisional, now, parse_timestamp};
use crate::store::{Record, TableKind};

/// Pure, deterministic mapping between local and remote shapes.
pub trait SchemaMapper: Send + Sync {
  /// Body sent to the remote for this record.
  fn to_remote(&self, table: TableKind, record: &Record) -> Value;

  /// Local record for a row returned by the remote.
  fn from_remote(&self, table: TableKind, row: Value) -> Result<Record, RemoteError>;
}

/// Field renames per table plus relation flattening.
///
/// Renames are `(local, remote)` pairs. A row that expands a relation
/// (`"category": {"id": ...}`) instead of carrying `category_id` gets the
/// foreign key filled from the nested object.
#[derive(Debug, Clone, Default)]
pub struct FieldMapper {
  renames: HashMap<TableKind, Vec<(String, String)>>,
}

impl FieldMapper {
  pub fn new(renames: HashMap<TableKind, Vec<(String, String)>>) -> Self {
    Self { renames }
  }

  fn pairs(&self, table: TableKind) -> &[(String, String)] {
    self.renames.get(&table).map(Vec::as_slice).unwrap_or(&[])
  }
}

impl SchemaMapper for FieldMapper {
  fn to_remote(&self, table: TableKind, record: &Record) -> Value {
    let mut out = Map::new();
    // Provisional ids never leave the device; the server assigns its own
    if !is_provisional(&record.id) {
      out.insert("id".to_string(), Value::String(record.id.clone()));
    }
    for (key, value) in &record.fields {
      let remote_key = self
        .pairs(table)
        .iter()
        .find(|(local, _)| local == key)
        .map(|(_, remote)| remote.clone())
        .unwrap_or_else(|| key.clone());
      out.insert(remote_key, value.clone());
    }
    Value::Object(out)
  }

  fn from_remote(&self, table: TableKind, row: Value) -> Result<Record, RemoteError> {
    let Value::Object(mut row) = row else {
      return Err(RemoteError::Rejected(format!(
        "{} row is not an object",
        table
      )));
    };

    for (local, remote) in self.pairs(table) {
      if let Some(value) = row.remove(remote) {
        row.insert(local.clone(), value);
      }
    }

    for reference in table.spec().references {
      let relation = reference.field.trim_end_matches("_id");
      if row.contains_key(reference.field) {
        continue;
      }
      if let Some(Value::Object(nested)) = row.remove(relation) {
        if let Some(id) = nested.get("id") {
          row.insert(reference.field.to_string(), id.clone());
        }
      }
    }

    let id = match row.remove("id") {
      Some(Value::String(id)) if !id.is_empty() => id,
      Some(Value::Number(n)) => n.to_string(),
      _ => return Err(RemoteError::Rejected(format!("{} row without id", table))),
    };
    let updated_at = row
      .get("updated_at")
      .and_then(Value::as_str)
      .and_then(parse_timestamp)
      .unwrap_or_else(now);

    Ok(Record {
      table,
      id,
      fields: row,
      synced: true,
      updated_at,
    })
  }
}

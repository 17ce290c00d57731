use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use super::table::TableKind;

/// Prefix of ids minted locally before the remote assigns a real one.
pub const PROVISIONAL_PREFIX: &str = "local-";

/// A row mirrored from the remote backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
  pub table: TableKind,
  pub id: String,
  /// Column values, excluding `id`
  pub fields: Map<String, Value>,
  /// Confirmed by the remote authority
  pub synced: bool,
  pub updated_at: DateTime<Utc>,
}

impl Record {
  pub fn new(table: TableKind, id: impl Into<String>, fields: Map<String, Value>) -> Self {
    Self {
      table,
      id: id.into(),
      fields,
      synced: false,
      updated_at: now(),
    }
  }

  /// Build a record from a JSON object, minting a provisional id when it has none.
  pub fn from_value(table: TableKind, value: Value) -> Self {
    let mut fields = match value {
      Value::Object(map) => map,
      _ => Map::new(),
    };
    let id = match fields.remove("id") {
      Some(Value::String(id)) if !id.is_empty() => id,
      Some(Value::Number(n)) => n.to_string(),
      _ => provisional_id(),
    };
    Self::new(table, id, fields)
  }

  pub fn field(&self, name: &str) -> Option<&Value> {
    self.fields.get(name)
  }

  pub fn field_str(&self, name: &str) -> Option<&str> {
    self.fields.get(name).and_then(Value::as_str)
  }

  /// Overlay a partial record onto this one.
  pub fn merge(&mut self, patch: &Map<String, Value>) {
    for (key, value) in patch {
      if key != "id" {
        self.fields.insert(key.clone(), value.clone());
      }
    }
  }

}

/// Mint a fresh client-side id.
pub fn provisional_id() -> String {
  format!("{}{}", PROVISIONAL_PREFIX, uuid::Uuid::now_v7())
}

pub fn is_provisional(id: &str) -> bool {
  id.starts_with(PROVISIONAL_PREFIX)
}

/// Current time at the precision the store keeps.
pub fn now() -> DateTime<Utc> {
  Utc::now().trunc_subsecs(6)
}

/// Fixed-width RFC 3339 so timestamps sort lexically in SQLite.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
  ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc).trunc_subsecs(6))
    .ok()
}

/// Kind of write replayed against the remote authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
  Create,
  Update,
  Delete,
}

impl Operation {
  pub fn as_str(self) -> &'static str {
    match self {
      Operation::Create => "create",
      Operation::Update => "update",
      Operation::Delete => "delete",
    }
  }
}

impl fmt::Display for Operation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Operation {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "create" => Ok(Operation::Create),
      "update" => Ok(Operation::Update),
      "delete" => Ok(Operation::Delete),
      other => Err(format!("unknown operation: {}", other)),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_from_value_keeps_server_id() {
    let record = Record::from_value(TableKind::Tables, json!({"id": "t1", "status": "free"}));
    assert_eq!(record.id, "t1");
    assert!(!record.fields.contains_key("id"));
    assert_eq!(record.field_str("status"), Some("free"));
  }

  #[test]
  fn test_from_value_mints_provisional_id() {
    let record = Record::from_value(TableKind::Orders, json!({"total": 500}));
    assert!(is_provisional(&record.id));
  }

  #[test]
  fn test_numeric_ids_become_strings() {
    let record = Record::from_value(TableKind::Staff, json!({"id": 42}));
    assert_eq!(record.id, "42");
  }

  #[test]
  fn test_merge_ignores_id() {
    let mut record = Record::from_value(TableKind::Tables, json!({"id": "t1", "status": "free"}));
    let patch = json!({"id": "other", "status": "occupied"});
    record.merge(patch.as_object().unwrap());
    assert_eq!(record.id, "t1");
    assert_eq!(record.field_str("status"), Some("occupied"));
  }

  #[test]
  fn test_timestamp_format_sorts_lexically() {
    let a = parse_timestamp("2024-01-01T09:00:00Z").unwrap();
    let b = parse_timestamp("2024-01-01T10:00:00.5Z").unwrap();
    assert!(format_timestamp(&a) < format_timestamp(&b));
  }
}

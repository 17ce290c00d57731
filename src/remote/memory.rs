//! In-process remote authority used by the engine and app tests.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::{PullFilter, RemoteAuthority, RemoteError};
use crate::store::record::is_provisional;
use crate::store::{Operation, Record, TableKind};

#[derive(Default)]
pub struct InMemoryRemote {
  rows: Mutex<HashMap<TableKind, BTreeMap<String, Map<String, Value>>>>,
  next_id: AtomicU64,
  offline: AtomicBool,
  rejected: Mutex<HashSet<(TableKind, String)>>,
  transient: Mutex<HashMap<(TableKind, String), u32>>,
  log: Mutex<Vec<(TableKind, Operation, String)>>,
  pulls: AtomicU64,
  latency: Mutex<Option<Duration>>,
}

impl InMemoryRemote {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  /// Every call sleeps this long first, so concurrent callers interleave.
  pub fn set_latency(&self, latency: Duration) {
    *self.latency.lock().unwrap() = Some(latency);
  }

  async fn delay(&self) {
    let latency = *self.latency.lock().unwrap();
    if let Some(latency) = latency {
      tokio::time::sleep(latency).await;
    }
  }

  /// Seed a row as if another client had written it.
  pub fn insert(&self, table: TableKind, row: Value) {
    let record = Record::from_value(table, row);
    self
      .rows
      .lock()
      .unwrap()
      .entry(table)
      .or_default()
      .insert(record.id, record.fields);
  }

  pub fn row(&self, table: TableKind, id: &str) -> Option<Map<String, Value>> {
    self
      .rows
      .lock()
      .unwrap()
      .get(&table)
      .and_then(|t| t.get(id).cloned())
  }

  pub fn len(&self, table: TableKind) -> usize {
    self
      .rows
      .lock()
      .unwrap()
      .get(&table)
      .map_or(0, BTreeMap::len)
  }

  /// Every push for this record is refused.
  pub fn reject(&self, table: TableKind, id: &str) {
    self.rejected.lock().unwrap().insert((table, id.to_string()));
  }

  /// The next `times` pushes for this record fail transiently.
  pub fn fail_transiently(&self, table: TableKind, id: &str, times: u32) {
    self
      .transient
      .lock()
      .unwrap()
      .insert((table, id.to_string()), times);
  }

  pub fn pushes(&self) -> Vec<(TableKind, Operation, String)> {
    self.log.lock().unwrap().clone()
  }

  pub fn pull_count(&self) -> u64 {
    self.pulls.load(Ordering::SeqCst)
  }

  fn check_references(&self, table: TableKind, fields: &Map<String, Value>) -> Result<(), RemoteError> {
    let rows = self.rows.lock().unwrap();
    for reference in table.spec().references {
      if let Some(Value::String(target)) = fields.get(reference.field) {
        let exists = rows
          .get(&reference.target)
          .is_some_and(|t| t.contains_key(target));
        if !exists {
          return Err(RemoteError::Rejected(format!(
            "{}.{} references missing {} {}",
            table, reference.field, reference.target, target
          )));
        }
      }
    }
    Ok(())
  }
}

#[async_trait]
impl RemoteAuthority for InMemoryRemote {
  async fn push(
    &self,
    table: TableKind,
    operation: Operation,
    record: &Record,
  ) -> Result<Record, RemoteError> {
    self.delay().await;
    if self.offline.load(Ordering::SeqCst) {
      return Err(RemoteError::Unreachable("offline".to_string()));
    }
    let key = (table, record.id.clone());
    if self.rejected.lock().unwrap().contains(&key) {
      return Err(RemoteError::Rejected("validation failed".to_string()));
    }
    {
      let mut transient = self.transient.lock().unwrap();
      if let Some(left) = transient.get_mut(&key) {
        if *left > 0 {
          *left -= 1;
          return Err(RemoteError::Transient("503".to_string()));
        }
      }
    }
    self.check_references(table, &record.fields)?;

    self
      .log
      .lock()
      .unwrap()
      .push((table, operation, record.id.clone()));

    let mut rows = self.rows.lock().unwrap();
    let rows = rows.entry(table).or_default();
    let id = match operation {
      Operation::Create if is_provisional(&record.id) => {
        format!("srv-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
      }
      _ => record.id.clone(),
    };

    match operation {
      Operation::Create => {
        rows.insert(id.clone(), record.fields.clone());
      }
      Operation::Update => {
        let row = rows.entry(id.clone()).or_default();
        for (k, v) in &record.fields {
          row.insert(k.clone(), v.clone());
        }
      }
      Operation::Delete => {
        rows.remove(&id);
      }
    }

    let mut stored = Record::new(table, id.clone(), rows.get(&id).cloned().unwrap_or_default());
    stored.synced = true;
    Ok(stored)
  }

  async fn pull(
    &self,
    table: TableKind,
    filter: Option<&PullFilter>,
  ) -> Result<Vec<Record>, RemoteError> {
    self.delay().await;
    if self.offline.load(Ordering::SeqCst) {
      return Err(RemoteError::Unreachable("offline".to_string()));
    }
    self.pulls.fetch_add(1, Ordering::SeqCst);

    let rows = self.rows.lock().unwrap();
    let records = rows
      .get(&table)
      .map(|t| {
        t.iter()
          .filter(|(_, fields)| matches_filter(fields, filter))
          .map(|(id, fields)| {
            let mut record = Record::new(table, id.clone(), fields.clone());
            record.synced = true;
            record
          })
          .collect()
      })
      .unwrap_or_default();
    Ok(records)
  }
}

/// Understands the `eq.true` style filters the registry declares.
fn matches_filter(fields: &Map<String, Value>, filter: Option<&PullFilter>) -> bool {
  let Some(filter) = filter else {
    return true;
  };
  filter.params.iter().all(|(column, condition)| {
    match condition.strip_prefix("eq.") {
      Some(expected) => match fields.get(column) {
        Some(Value::Bool(b)) => b.to_string() == expected,
        Some(Value::String(s)) => s == expected,
        Some(other) => other.to_string() == expected,
        None => false,
      },
      None => true,
    }
  })
}

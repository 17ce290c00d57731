//! Application context and the API the UI layer talks to.

use color_eyre::Result;
use rusqlite::Connection;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::db::Database;
use crate::error::SyncError;
use crate::event::{Connectivity, EventBus, SyncEvent};
use crate::proxy::{
  generation_tag, CacheStatus, CacheStorage, CachingProxy, Fetcher, HttpFetcher, NoopStorage,
  SqliteStorage,
};
use crate::queue::{self, MutationQueue, QueueItem};
use crate::remote::{FieldMapper, HttpRemote, RemoteAuthority, RemoteError};
use crate::store::record::{is_provisional, now, provisional_id};
use crate::store::{local, LocalStore, Operation, Order, Record, SweepReport, TableKind};
use crate::sync::{DownloadReport, SyncEngine, SyncSession};

/// What a UI write turned into.
#[derive(Debug, Clone)]
pub struct WriteOutcome {
  /// The record as now stored locally (`None` after a delete)
  pub record: Option<Record>,
  /// Queue sequence when the write was deferred to the next sync run
  pub queued: Option<i64>,
}

/// Explicitly constructed context shared by the engine, proxy and controller.
pub struct App {
  config: Config,
  db: Arc<Database>,
  store: LocalStore,
  queue: MutationQueue,
  remote: Arc<dyn RemoteAuthority>,
  engine: Arc<SyncEngine>,
  proxy: Arc<CachingProxy>,
  connectivity: Arc<Connectivity>,
  events: EventBus,
}

impl App {
  pub fn new(
    config: Config,
    db: Arc<Database>,
    remote: Arc<dyn RemoteAuthority>,
    fetcher: Arc<dyn Fetcher>,
  ) -> Self {
    let events = EventBus::default();
    let connectivity = Arc::new(Connectivity::new(true, events.clone()));
    let engine = Arc::new(SyncEngine::new(
      db.clone(),
      remote.clone(),
      config.sync_settings(),
      connectivity.clone(),
      events.clone(),
    ));

    let generation = generation_tag(env!("CARGO_PKG_VERSION"), config.cache.build_id.as_deref());
    let storage: Arc<dyn CacheStorage> = if config.cache.enabled {
      Arc::new(SqliteStorage::new(db.clone(), generation))
    } else {
      Arc::new(NoopStorage::new(generation))
    };
    let proxy = Arc::new(CachingProxy::new(storage, fetcher, config.proxy_settings()));

    Self {
      store: LocalStore::new(db.clone()),
      queue: MutationQueue::new(db.clone()),
      config,
      db,
      remote,
      engine,
      proxy,
      connectivity,
      events,
    }
  }

  /// Wire up the production stack described by `config`.
  pub fn open(config: Config) -> Result<Self> {
    let db = Arc::new(Database::open(config.database_path.as_deref())?);
    let mapper = Arc::new(FieldMapper::new(config.renames()));
    let remote = Arc::new(HttpRemote::new(
      &config.remote.url,
      Config::api_key(),
      config.request_timeout(),
      mapper,
    )?);
    let fetcher = Arc::new(HttpFetcher::new(config.request_timeout())?);
    info!(remote = %config.remote.url, "application context ready");
    Ok(Self::new(config, db, remote, fetcher))
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn engine(&self) -> Arc<SyncEngine> {
    self.engine.clone()
  }

  pub fn proxy(&self) -> Arc<CachingProxy> {
    self.proxy.clone()
  }

  pub fn queue(&self) -> &MutationQueue {
    &self.queue
  }

  /// Apply a write from the UI.
  ///
  /// Online, with nothing queued ahead of it, the write goes straight to the
  /// remote and the confirmed row is stored. Otherwise it is applied locally
  /// and queued in one transaction.
  pub async fn enqueue_or_apply(
    &self,
    table: TableKind,
    operation: Operation,
    payload: Value,
  ) -> Result<WriteOutcome, SyncError> {
    let Value::Object(mut patch) = payload else {
      return Err(SyncError::InvalidPayload(format!(
        "{} {} payload must be an object",
        operation, table
      )));
    };
    let id = match patch.remove("id") {
      Some(Value::String(id)) if !id.is_empty() => id,
      Some(Value::Number(n)) => n.to_string(),
      _ if operation == Operation::Create => provisional_id(),
      _ => {
        return Err(SyncError::InvalidPayload(format!(
          "{} {} needs an id",
          operation, table
        )))
      }
    };

    if self.is_online() && self.can_push_directly(table, &id, &patch)? {
      let request = Record::new(table, id.clone(), patch.clone());
      match self.remote.push(table, operation, &request).await {
        Ok(confirmed) => {
          let record = self.apply_confirmed(operation, &id, confirmed)?;
          debug!(%table, %operation, id = %id, "write confirmed directly");
          return Ok(WriteOutcome {
            record,
            queued: None,
          });
        }
        Err(RemoteError::Rejected(reason)) => return Err(SyncError::RemoteRejected(reason)),
        Err(RemoteError::Unreachable(reason)) => {
          self.connectivity.set(false);
          debug!(%table, "remote unreachable, queueing write: {}", reason);
        }
        Err(RemoteError::Transient(reason)) => {
          warn!(%table, "direct write failed, queueing: {}", reason);
        }
      }
    }

    // The current row is read in the same transaction as the queue append
    let (record, queued) = self
      .db
      .transaction(|tx| {
        let sequence = queue::enqueue_in(tx, table, operation, &id, &patch)?;
        let record = optimistic_in(tx, table, operation, &id, &patch)?;
        match &record {
          Some(record) => local::put_in(tx, record)?,
          None => {
            local::delete_in(tx, table, &id)?;
          }
        }
        Ok((record, sequence))
      })
      .map_err(SyncError::store)?;

    Ok(WriteOutcome {
      record,
      queued: Some(queued),
    })
  }

  pub fn get(&self, table: TableKind, id: &str) -> Result<Option<Record>, SyncError> {
    self.store.get(table, id).map_err(SyncError::store)
  }

  pub fn query<P>(&self, table: TableKind, predicate: P, order: &Order) -> Result<Vec<Record>, SyncError>
  where
    P: Fn(&Record) -> bool,
  {
    self
      .store
      .query(table, predicate, order)
      .map_err(SyncError::store)
  }

  /// Writes still waiting to reach the remote. Failed items are counted separately.
  pub fn pending_count(&self) -> Result<usize, SyncError> {
    self.queue.count().map_err(SyncError::store)
  }

  pub fn failed_count(&self) -> Result<usize, SyncError> {
    self.queue.failed_count().map_err(SyncError::store)
  }

  pub fn failed_items(&self) -> Result<Vec<QueueItem>, SyncError> {
    self.queue.failed_items().map_err(SyncError::store)
  }

  pub fn retry_failed(&self, sequence: i64) -> Result<bool, SyncError> {
    let retried = self.queue.retry(sequence).map_err(SyncError::store)?;
    if retried {
      info!(sequence, "failed item requeued");
    }
    Ok(retried)
  }

  /// Drop a failed item. A never-confirmed record it created goes with it.
  pub fn discard_failed(&self, sequence: i64) -> Result<Option<QueueItem>, SyncError> {
    let Some(item) = self.queue.discard(sequence).map_err(SyncError::store)? else {
      return Ok(None);
    };
    if item.operation == Operation::Create
      && is_provisional(&item.record_id)
      && !self
        .queue
        .has_outstanding(item.table, &item.record_id)
        .map_err(SyncError::store)?
    {
      self
        .store
        .delete(item.table, &item.record_id)
        .map_err(SyncError::store)?;
    }
    Ok(Some(item))
  }

  pub fn is_online(&self) -> bool {
    self.connectivity.is_online()
  }

  /// Report a connectivity change from the host. Returns true if it changed.
  pub fn set_online(&self, online: bool) -> bool {
    self.connectivity.set(online)
  }

  pub fn is_ready(&self) -> Result<bool, SyncError> {
    self.engine.is_ready()
  }

  pub async fn download_essential_data(&self, force: bool) -> Result<DownloadReport, SyncError> {
    self.engine.download_essential_data(force).await
  }

  /// Reconcile now. `None` when a run was already active and will repeat.
  pub async fn force_sync(&self) -> Option<Result<SyncSession, SyncError>> {
    self.engine.trigger().await
  }

  pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
    self.events.subscribe()
  }

  /// Current cache status, also announced to subscribers.
  pub fn cache_status(&self) -> Result<CacheStatus> {
    let status = self.proxy.status()?;
    self.events.publish(SyncEvent::CacheStatus(status.clone()));
    Ok(status)
  }

  pub fn sweep_retention(&self) -> Result<SweepReport, SyncError> {
    self
      .store
      .sweep_retention(self.config.retention.max_completed_orders)
      .map_err(SyncError::store)
  }

  /// Direct pushes must not overtake queued writes for the record or for
  /// anything it references.
  fn can_push_directly(
    &self,
    table: TableKind,
    id: &str,
    patch: &Map<String, Value>,
  ) -> Result<bool, SyncError> {
    if self.queue.has_outstanding(table, id).map_err(SyncError::store)? {
      return Ok(false);
    }
    for reference in table.spec().references {
      if let Some(Value::String(target)) = patch.get(reference.field) {
        if is_provisional(target)
          || self
            .queue
            .has_outstanding(reference.target, target)
            .map_err(SyncError::store)?
        {
          return Ok(false);
        }
      }
    }
    Ok(true)
  }

  fn apply_confirmed(
    &self,
    operation: Operation,
    id: &str,
    confirmed: Record,
  ) -> Result<Option<Record>, SyncError> {
    let table = confirmed.table;
    self
      .db
      .transaction(|tx| {
        if operation == Operation::Delete {
          local::delete_in(tx, table, id)?;
          return Ok(None);
        }
        // A write queued while the push was in flight keeps the row unconfirmed
        if queue::has_outstanding_in(tx, table, id, i64::MAX)? {
          return local::get_in(tx, table, id);
        }
        let mut record = local::get_in(tx, table, id)?.unwrap_or_else(|| confirmed.clone());
        record.id = confirmed.id.clone();
        record.merge(&confirmed.fields);
        record.synced = true;
        record.updated_at = confirmed.updated_at;
        local::put_in(tx, &record)?;
        Ok(Some(record))
      })
      .map_err(SyncError::store)
  }
}

/// The row a write leaves behind locally, built from the current stored row.
fn optimistic_in(
  conn: &Connection,
  table: TableKind,
  operation: Operation,
  id: &str,
  patch: &Map<String, Value>,
) -> Result<Option<Record>> {
  let record = match operation {
    Operation::Create => Record::new(table, id, patch.clone()),
    Operation::Update => {
      let mut record =
        local::get_in(conn, table, id)?.unwrap_or_else(|| Record::new(table, id, Map::new()));
      record.merge(patch);
      record.synced = false;
      record.updated_at = now();
      record
    }
    Operation::Delete => return Ok(None),
  };
  Ok(Some(record))
}

//! Drains the mutation queue to the remote authority, then refreshes the
//! local store from remote snapshots.

use color_eyre::Result;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::session::{DownloadReport, SyncPhase, SyncSession};
use crate::db::Database;
use crate::error::SyncError;
use crate::event::{Connectivity, EventBus, SyncEvent};
use crate::queue::{self, MutationQueue, QueueItem};
use crate::remote::{PullFilter, RemoteAuthority, RemoteError};
use crate::store::{local, LocalStore, Operation, Record, TableKind};

#[derive(Debug, Clone, Copy)]
pub struct SyncSettings {
  /// Queue items peeked per batch
  pub batch_size: usize,
  /// Transient failures tolerated before an item is parked as failed
  pub max_attempts: u32,
}

impl Default for SyncSettings {
  fn default() -> Self {
    Self {
      batch_size: 25,
      max_attempts: 5,
    }
  }
}

#[derive(Default)]
struct RunState {
  active: bool,
  rerun: bool,
}

/// Marks the engine busy for the lifetime of one `trigger` call.
struct ActiveRun<'a> {
  state: &'a Mutex<RunState>,
  armed: bool,
}

impl ActiveRun<'_> {
  /// Consume a pending rerun request, or release the engine if there is none.
  fn should_repeat(&mut self, last_ok: bool) -> bool {
    let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
    if state.rerun && last_ok {
      state.rerun = false;
      return true;
    }
    state.active = false;
    state.rerun = false;
    self.armed = false;
    false
  }
}

impl Drop for ActiveRun<'_> {
  fn drop(&mut self) {
    if self.armed {
      let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
      state.active = false;
      state.rerun = false;
    }
  }
}

/// Sync engine. One reconciliation run at a time; triggers that arrive
/// mid-run collapse into a single follow-up run.
pub struct SyncEngine {
  db: Arc<Database>,
  store: LocalStore,
  queue: MutationQueue,
  remote: Arc<dyn RemoteAuthority>,
  settings: SyncSettings,
  connectivity: Arc<Connectivity>,
  events: EventBus,
  runs: Mutex<RunState>,
  /// Serializes runs and bootstrap downloads
  exclusive: tokio::sync::Mutex<()>,
  phase: watch::Sender<SyncPhase>,
}

impl SyncEngine {
  pub fn new(
    db: Arc<Database>,
    remote: Arc<dyn RemoteAuthority>,
    settings: SyncSettings,
    connectivity: Arc<Connectivity>,
    events: EventBus,
  ) -> Self {
    let (phase, _) = watch::channel(SyncPhase::Idle);
    Self {
      store: LocalStore::new(db.clone()),
      queue: MutationQueue::new(db.clone()),
      db,
      remote,
      settings,
      connectivity,
      events,
      runs: Mutex::new(RunState::default()),
      exclusive: tokio::sync::Mutex::new(()),
      phase,
    }
  }

  pub fn phase(&self) -> SyncPhase {
    *self.phase.borrow()
  }

  pub fn watch_phase(&self) -> watch::Receiver<SyncPhase> {
    self.phase.subscribe()
  }

  /// Start a reconciliation run.
  ///
  /// Returns `None` when a run is already active; that run repeats once
  /// after it finishes instead.
  pub async fn trigger(&self) -> Option<Result<SyncSession, SyncError>> {
    {
      let mut state = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
      if state.active {
        state.rerun = true;
        debug!("sync already running, trigger coalesced");
        return None;
      }
      state.active = true;
    }

    let mut active = ActiveRun {
      state: &self.runs,
      armed: true,
    };
    loop {
      let result = self.run().await;
      if !active.should_repeat(result.is_ok()) {
        return Some(result);
      }
      debug!("repeating run for triggers received meanwhile");
    }
  }

  /// True once every essential table holds at least one row.
  pub fn is_ready(&self) -> Result<bool, SyncError> {
    for table in TableKind::essential() {
      if self.store.count(table).map_err(SyncError::store)? == 0 {
        return Ok(false);
      }
    }
    Ok(true)
  }

  /// Bootstrap the store from remote snapshots.
  ///
  /// Without `force` this is a no-op once the store is ready. Unconfirmed
  /// local rows are overwritten here; queued writes still replay afterwards.
  pub async fn download_essential_data(&self, force: bool) -> Result<DownloadReport, SyncError> {
    let _exclusive = self.exclusive.lock().await;
    let mut report = DownloadReport::default();

    if !force && self.is_ready()? {
      for table in TableKind::essential() {
        let count = self.store.count(table).map_err(SyncError::store)?;
        report.counts.insert(table, count);
      }
      report.success = true;
      debug!("essential data already present");
      return Ok(report);
    }

    info!(force, "downloading reference data");
    self.phase.send_replace(SyncPhase::Pulling);
    for table in TableKind::ALL {
      match self.pull_table(table, false).await {
        Ok(count) => {
          report.counts.insert(table, count);
        }
        Err(SyncError::LocalStore(reason)) => {
          self.phase.send_replace(SyncPhase::Idle);
          return Err(SyncError::LocalStore(reason));
        }
        Err(SyncError::Unreachable(reason)) => {
          self.connectivity.set(false);
          warn!(%table, "download stopped, remote unreachable: {}", reason);
          report.errors.push((table, reason));
          break;
        }
        Err(err) => {
          warn!(%table, "download failed: {}", err);
          report.errors.push((table, err.to_string()));
        }
      }
    }
    self.phase.send_replace(SyncPhase::Idle);

    report.success = TableKind::essential().all(|table| report.counts.contains_key(&table));
    if report.success {
      info!(rows = report.counts.values().sum::<usize>(), "reference data downloaded");
    }
    Ok(report)
  }

  async fn run(&self) -> Result<SyncSession, SyncError> {
    let _exclusive = self.exclusive.lock().await;
    let mut session = SyncSession::start();
    debug!("sync run started");

    self.phase.send_replace(SyncPhase::Draining);
    if let Err(err) = self.drain(&mut session).await {
      return Err(self.abort(session, err));
    }

    self.phase.send_replace(SyncPhase::Pulling);
    for table in TableKind::ALL {
      match self.pull_table(table, true).await {
        Ok(count) => {
          session.pulled_counts.insert(table, count);
        }
        Err(err @ (SyncError::Unreachable(_) | SyncError::LocalStore(_))) => {
          return Err(self.abort(session, err));
        }
        Err(err) => {
          warn!(%table, "pull failed: {}", err);
          session.pull_errors.push((table, err.to_string()));
        }
      }
    }

    session.finish(false);
    self.phase.send_replace(SyncPhase::Idle);
    self.connectivity.set(true);
    info!(
      pushed = session.total_pushed(),
      pulled = session.total_pulled(),
      deferred = session.deferred,
      errors = session.errors.len(),
      outcome = ?session.outcome,
      "sync run finished"
    );
    self.events.publish(SyncEvent::SyncComplete(session.clone()));
    Ok(session)
  }

  /// End a run early. Acknowledged items stay acknowledged.
  fn abort(&self, mut session: SyncSession, err: SyncError) -> SyncError {
    session.finish(true);
    self.phase.send_replace(SyncPhase::Failed);
    if matches!(err, SyncError::Unreachable(_)) {
      self.connectivity.set(false);
    }
    warn!(pushed = session.total_pushed(), "sync run aborted: {}", err);
    self.events.publish(SyncEvent::SyncError {
      message: err.to_string(),
      session: Some(session),
    });
    err
  }

  async fn drain(&self, session: &mut SyncSession) -> Result<(), SyncError> {
    let mut cursor = 0;
    // Keys with a held-back write this run; later writes for them must wait
    let mut blocked: HashSet<(TableKind, String)> = HashSet::new();

    loop {
      let batch = self
        .queue
        .peek_batch_after(cursor, self.settings.batch_size)
        .map_err(SyncError::store)?;
      let Some(last) = batch.last() else {
        break;
      };
      cursor = last.sequence;
      debug!(items = batch.len(), "draining batch");

      for peeked in batch {
        // Earlier pushes may have remapped ids in this item since the peek
        let Some(item) = self.queue.get(peeked.sequence).map_err(SyncError::store)? else {
          continue;
        };
        let key = (item.table, item.record_id.clone());
        if blocked.contains(&key) {
          session.deferred += 1;
          continue;
        }
        if let Some((target, id)) = self.pending_dependency(&item)? {
          debug!(sequence = item.sequence, %target, %id, "waiting on referenced record");
          session.deferred += 1;
          blocked.insert(key);
          continue;
        }
        if !self.push_item(&item, session).await? {
          blocked.insert(key);
        }
      }
    }
    Ok(())
  }

  /// A referenced record that still has an older unacknowledged write.
  fn pending_dependency(&self, item: &QueueItem) -> Result<Option<(TableKind, String)>, SyncError> {
    if item.operation == Operation::Delete {
      return Ok(None);
    }
    for reference in item.table.spec().references {
      let Some(Value::String(target_id)) = item.payload.get(reference.field) else {
        continue;
      };
      let waiting = self
        .queue
        .has_outstanding_before(reference.target, target_id, item.sequence)
        .map_err(SyncError::store)?;
      if waiting {
        return Ok(Some((reference.target, target_id.clone())));
      }
    }
    Ok(None)
  }

  /// Push one item. `Ok(false)` means it stays queued (retry later or failed).
  async fn push_item(&self, item: &QueueItem, session: &mut SyncSession) -> Result<bool, SyncError> {
    let mut fields = item.payload.clone();
    fields.remove("id");
    let record = Record::new(item.table, item.record_id.clone(), fields);

    let in_flight = self.queue.begin(item.sequence).map_err(SyncError::store)?;
    match self.remote.push(item.table, item.operation, &record).await {
      Ok(confirmed) => {
        self.acknowledge(item, &confirmed).map_err(SyncError::store)?;
        in_flight.complete();
        session.record_push(item.table);
        Ok(true)
      }
      Err(RemoteError::Unreachable(reason)) => {
        // The guard puts the item back to pending
        drop(in_flight);
        Err(SyncError::Unreachable(reason))
      }
      Err(RemoteError::Transient(reason)) => {
        let status = self
          .queue
          .record_attempt_failure(item.sequence, &reason, self.settings.max_attempts)
          .map_err(SyncError::store)?;
        in_flight.complete();
        debug!(sequence = item.sequence, %status, "push failed transiently: {}", reason);
        session.errors.push((item.sequence, reason));
        Ok(false)
      }
      Err(RemoteError::Rejected(reason)) => {
        self
          .queue
          .mark_failed(item.sequence, &reason)
          .map_err(SyncError::store)?;
        in_flight.complete();
        session.errors.push((item.sequence, reason));
        Ok(false)
      }
    }
  }

  /// Record a confirmed write: drop the item, swap in the server id, and
  /// refresh the local row unless newer local writes are still queued.
  fn acknowledge(&self, item: &QueueItem, confirmed: &Record) -> Result<()> {
    self.db.transaction(|tx| {
      queue::mark_done_in(tx, item.sequence)?;

      let mut id = item.record_id.clone();
      if item.operation == Operation::Create && confirmed.id != item.record_id {
        let rewritten = local::remap_id_in(tx, item.table, &item.record_id, &confirmed.id)?;
        queue::remap_id_in(tx, item.table, &item.record_id, &confirmed.id)?;
        debug!(
          table = %item.table,
          from = %item.record_id,
          to = %confirmed.id,
          rewritten,
          "provisional id replaced"
        );
        id = confirmed.id.clone();
      }

      if item.operation == Operation::Delete
        || queue::has_outstanding_in(tx, item.table, &id, i64::MAX)?
      {
        return Ok(());
      }

      let mut record = local::get_in(tx, item.table, &id)?.unwrap_or_else(|| confirmed.clone());
      record.merge(&confirmed.fields);
      record.synced = true;
      record.updated_at = confirmed.updated_at;
      local::put_in(tx, &record)
    })
  }

  async fn pull_table(&self, table: TableKind, honor_pending: bool) -> Result<usize, SyncError> {
    let filter = PullFilter::active(table.spec());
    let records = self.remote.pull(table, filter.as_ref()).await?;

    // The pending set and the upserts share a transaction so a write
    // committed mid-pull is never overwritten by the snapshot
    let written = self
      .db
      .transaction(|tx| {
        let pending = if honor_pending {
          queue::outstanding_ids_in(tx, table)?
        } else {
          HashSet::new()
        };
        local::bulk_put_in(tx, table, &records, &pending)
      })
      .map_err(SyncError::store)?;

    debug!(%table, fetched = records.len(), written, "snapshot applied");
    self.events.publish(SyncEvent::Progress {
      phase: SyncPhase::Pulling,
      table,
      count: written,
    });
    Ok(written)
  }
}

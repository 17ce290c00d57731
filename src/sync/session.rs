use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::store::record::now;
use crate::store::TableKind;

/// Where the engine is within a reconciliation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
  Idle,
  Draining,
  Pulling,
  /// Connectivity was lost mid-run; progress so far is kept
  Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
  Success,
  /// Finished, but some items failed or had to wait
  Partial,
  Failed,
}

/// Diagnostics for one reconciliation run. Never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct SyncSession {
  pub started_at: DateTime<Utc>,
  pub finished_at: Option<DateTime<Utc>>,
  pub pushed_counts: BTreeMap<TableKind, usize>,
  pub pulled_counts: BTreeMap<TableKind, usize>,
  /// Items held back this run (dependency pending or earlier write blocked)
  pub deferred: usize,
  /// `(sequence, reason)` for every item that failed this run
  pub errors: Vec<(i64, String)>,
  /// Tables whose snapshot could not be fetched this run
  pub pull_errors: Vec<(TableKind, String)>,
  pub outcome: SyncOutcome,
}

impl SyncSession {
  pub fn start() -> Self {
    Self {
      started_at: now(),
      finished_at: None,
      pushed_counts: BTreeMap::new(),
      pulled_counts: BTreeMap::new(),
      deferred: 0,
      errors: Vec::new(),
      pull_errors: Vec::new(),
      outcome: SyncOutcome::Success,
    }
  }

  pub fn record_push(&mut self, table: TableKind) {
    *self.pushed_counts.entry(table).or_default() += 1;
  }

  pub fn total_pushed(&self) -> usize {
    self.pushed_counts.values().sum()
  }

  pub fn total_pulled(&self) -> usize {
    self.pulled_counts.values().sum()
  }

  /// Close the session. `aborted` marks a run cut short by lost connectivity.
  pub fn finish(&mut self, aborted: bool) {
    self.finished_at = Some(now());
    self.outcome = if aborted {
      SyncOutcome::Failed
    } else if self.errors.is_empty() && self.pull_errors.is_empty() && self.deferred == 0 {
      SyncOutcome::Success
    } else {
      SyncOutcome::Partial
    };
  }
}

/// Result of `download_essential_data`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DownloadReport {
  pub counts: BTreeMap<TableKind, usize>,
  pub errors: Vec<(TableKind, String)>,
  pub success: bool,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_outcome_classification() {
    let mut clean = SyncSession::start();
    clean.record_push(TableKind::Orders);
    clean.finish(false);
    assert_eq!(clean.outcome, SyncOutcome::Success);
    assert_eq!(clean.total_pushed(), 1);

    let mut partial = SyncSession::start();
    partial.errors.push((3, "rejected".to_string()));
    partial.finish(false);
    assert_eq!(partial.outcome, SyncOutcome::Partial);

    let mut aborted = SyncSession::start();
    aborted.finish(true);
    assert_eq!(aborted.outcome, SyncOutcome::Failed);
    assert!(aborted.finished_at.is_some());
  }
}

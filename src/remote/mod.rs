//! Boundary to the remote authority that owns the canonical rows.

mod http;
mod mapper;
#[cfg(test)]
pub mod memory;

pub use http::HttpRemote;
pub use mapper::{FieldMapper, SchemaMapper};

use async_trait::async_trait;
use thiserror::Error;

use crate::store::{Operation, Record, TableKind, TableSpec};

/// How a remote call failed, which decides what happens to the queued write.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
  /// No route to the server at all (DNS, refused connection, offline)
  #[error("unreachable: {0}")]
  Unreachable(String),
  /// Worth retrying later (timeouts, 5xx, throttling)
  #[error("transient: {0}")]
  Transient(String),
  /// The server refused the write and will keep refusing it
  #[error("rejected: {0}")]
  Rejected(String),
}

/// Column filters applied to a snapshot pull, PostgREST style (`column=op.value`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullFilter {
  pub params: Vec<(String, String)>,
}

impl PullFilter {
  /// The table's active-rows filter, if it declares one.
  pub fn active(spec: &TableSpec) -> Option<Self> {
    spec.active_filter.map(|(column, condition)| Self {
      params: vec![(column.to_string(), condition.to_string())],
    })
  }
}

/// Request/response API per table.
#[async_trait]
pub trait RemoteAuthority: Send + Sync {
  /// Apply one write. Returns the row as the server now holds it
  /// (with the server-assigned id on create).
  async fn push(
    &self,
    table: TableKind,
    operation: Operation,
    record: &Record,
  ) -> Result<Record, RemoteError>;

  /// Fetch the current snapshot of a table.
  async fn pull(
    &self,
    table: TableKind,
    filter: Option<&PullFilter>,
  ) -> Result<Vec<Record>, RemoteError>;
}

//! Error taxonomy for the sync core.

use thiserror::Error;

use crate::remote::RemoteError;

/// Errors surfaced by the sync engine and the UI-facing write path.
#[derive(Debug, Error)]
pub enum SyncError {
  /// Network hiccup or server-side transient failure. The item stays queued.
  #[error("transient network error: {0}")]
  TransientNetwork(String),

  /// The remote authority refused the write (validation, constraint, auth).
  #[error("remote rejected the write: {0}")]
  RemoteRejected(String),

  /// The embedded store failed. Fatal to the current operation only.
  #[error("local store error: {0}")]
  LocalStore(String),

  /// The remote authority could not be reached at all.
  #[error("remote authority unreachable: {0}")]
  Unreachable(String),

  #[error("invalid payload: {0}")]
  InvalidPayload(String),
}

impl SyncError {
  /// Wrap a store-level report as a `LocalStore` error.
  pub fn store(err: impl std::fmt::Display) -> Self {
    Self::LocalStore(err.to_string())
  }
}

impl From<RemoteError> for SyncError {
  fn from(err: RemoteError) -> Self {
    match err {
      RemoteError::Unreachable(msg) => Self::Unreachable(msg),
      RemoteError::Transient(msg) => Self::TransientNetwork(msg),
      RemoteError::Rejected(msg) => Self::RemoteRejected(msg),
    }
  }
}

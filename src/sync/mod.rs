//! Reconciliation between the local store and the remote authority.

mod engine;
mod session;

pub use engine::{SyncEngine, SyncSettings};
pub use session::{DownloadReport, SyncOutcome, SyncPhase, SyncSession};

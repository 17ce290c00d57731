//! Local mirror of the remote tables.

pub mod local;
pub mod record;
pub mod table;

pub use local::{LocalStore, Order, OrderBy, SweepReport};
pub use record::{Operation, Record};
pub use table::{Reference, TableKind, TableSpec};

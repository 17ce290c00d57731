//! Local-first sync core for a restaurant point-of-sale.
//!
//! Writes land in a local SQLite mirror and a durable mutation queue, a
//! background engine reconciles both with the remote backend, and a caching
//! proxy keeps the UI shell and reference data readable while offline.

pub mod app;
pub mod config;
pub mod db;
pub mod error;
pub mod event;
pub mod lifecycle;
pub mod proxy;
pub mod queue;
pub mod remote;
pub mod store;
pub mod sync;

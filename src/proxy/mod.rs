//! Caching proxy for outbound resource reads.
//!
//! Every intercepted GET is classified (admin/public document, API data,
//! image, static asset) and served by that class's policy. Entries live in
//! the shared SQLite database, namespaced by a per-build generation tag so a
//! new deployment can drop everything older in one step.

mod fetch;
mod layer;
mod route;
mod storage;
mod traits;

pub use fetch::{Fetcher, HttpFetcher};
pub use layer::CachingProxy;
pub use route::ProxySettings;
pub use storage::{generation_tag, CacheStorage, NoopStorage, SqliteStorage};
pub use traits::{CacheClass, CacheSource, CacheStatus, Destination, Payload, ProxyRequest, ProxyResponse};

#[cfg(test)]
pub use fetch::scripted::ScriptedFetcher;

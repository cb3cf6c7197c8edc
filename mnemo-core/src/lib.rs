//! mnemo-core - Storage layer for Mnemo
//!
//! This crate holds everything below the tier managers:
//!
//! - **db**: WAL SQLite store (single writer, pooled readers, checkpoint/backup/restore)
//! - **index**: FTS5 lexical index and exact-scan vector index, written in the record's transaction
//! - **cache**: TTL + LRU cache with a broadcast invalidation bus
//! - **store**: async facade running store calls on the blocking pool
//! - **types**: record kinds, inputs and filters
//! - **cancel**: cooperative cancellation token
//! - **lease**: worker slots held across blocking store calls

pub mod cache;
pub mod cancel;
pub mod db;
pub mod error;
pub mod index;
pub mod lease;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use cache::{CacheStats, InvalidationBus, TtlCache};
pub use cancel::CancelToken;
pub use db::{CheckpointReport, Database, StoreOptions};
pub use error::{Error, ErrorKind, Result};
pub use index::{IndexReport, ScoredId};
pub use lease::WorkLease;
pub use store::{RecordStore, Store};

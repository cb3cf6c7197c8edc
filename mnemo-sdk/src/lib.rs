//! Mnemo SDK - memory for conversational assistants
//!
//! All functionality is reachable through the [`Mnemo`] context object:
//!
//! # Core Modules (from mnemo-core)
//!
//! - **types** - record kinds, inputs and filters
//! - **db** - WAL SQLite store, checkpoint, backup and restore
//! - **index** - lexical and vector indexes
//! - **cache** - TTL + LRU cache with an invalidation bus
//!
//! # SDK Modules
//!
//! - **memory** - tier managers, consolidation and hybrid recall
//! - **controller** - worker pool, rate limits, backpressure and job states
//! - **config** - TOML-loadable configuration
//!
//! # Example
//!
//! ```rust,no_run
//! use mnemo_sdk::{CallOptions, Mnemo, MnemoConfig, NewEpisode};
//! use std::time::Duration;
//!
//! async fn example() -> anyhow::Result<()> {
//!     let mnemo = Mnemo::open(MnemoConfig::new("/var/lib/mnemo")).await?;
//!     let options = CallOptions::default().with_timeout(Duration::from_secs(2));
//!
//!     mnemo
//!         .observe_episode(
//!             NewEpisode {
//!                 user_id: "user-123".into(),
//!                 kind: "interaction".into(),
//!                 valence: 0.4,
//!                 intensity: 0.7,
//!                 tags: vec!["travel".into()],
//!                 note: "asked for a window seat".into(),
//!             },
//!             &options,
//!         )
//!         .await?;
//!
//!     let model = mnemo.get_mental_model("user-123", &options).await?;
//!     println!("{} beliefs", model.len());
//!
//!     mnemo.shutdown().await?;
//!     Ok(())
//! }
//! ```

// ─────────────────────────────────────────────────────────────────────────────
// Re-export core modules from mnemo-core
// ─────────────────────────────────────────────────────────────────────────────

/// Record kinds, inputs and filters
pub use mnemo_core::types;

/// Direct store access
pub use mnemo_core::db;

/// Lexical and vector indexes
pub use mnemo_core::index;

/// TTL + LRU cache
pub use mnemo_core::cache;

/// Error types from core
pub use mnemo_core::error as core_error;

// ─────────────────────────────────────────────────────────────────────────────
// SDK-specific modules
// ─────────────────────────────────────────────────────────────────────────────

pub mod config;
pub mod controller;
pub mod memory;
pub mod utils;

mod error;
mod sdk;

// Re-export main SDK types
pub use config::{ConfigValidationError, MnemoConfig};
pub use error::{SDKError, SDKResult};
pub use sdk::{Mnemo, MnemoStats};

pub use controller::{CallOptions, ConcurrencyController, JobHandle, JobState, OperationClass};
pub use memory::{
    ConsolidationOutcome, ConsolidationReport, HierarchicalMemory, MentalModelUpdate, ObservedEpisode, RecallHit,
    RecallResponse, RememberInput, RetrievalMode,
};
pub use mnemo_core::types::{
    Episode, Fact, LongTermRecord, MemoryRecord, MentalModel, MentalModelEntry, NewEpisode, NewMessage,
    NewProcedure, Procedure, Record, RecordKind, Role, SemanticConcept,
};
pub use mnemo_core::{CancelToken, ErrorKind};

//! Main SDK Entry Point
//!
//! [`Mnemo`] is the one context object: it owns the store, the coordinator,
//! the caches and the concurrency controller. Every inbound operation is
//! scoped by user id and runs through the controller under its class.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use mnemo_core::db::records::Tombstone;
use mnemo_core::types::{
    Fact, LongTermRecord, MemoryRecord, MentalModel, NewEpisode, NewMessage, NewProcedure, Procedure, Record,
};
use mnemo_core::{
    CheckpointReport, IndexReport, InvalidationBus, RecordStore, Store, StoreOptions, TtlCache,
};

use crate::controller::{CallOptions, ConcurrencyController, ControllerStats, OperationClass};
use crate::memory::{
    ConsolidationOutcome, HierarchicalMemory, MemoryStats, MentalModelUpdate, ObservedEpisode, RecallResponse,
    RememberInput, build_embedder,
};
use crate::{MnemoConfig, SDKError, SDKResult};

#[derive(Debug, Clone, Serialize)]
pub struct MnemoStats {
    pub memory: MemoryStats,
    pub controller: ControllerStats,
}

/// Mnemo - Main entry point
///
/// # Example
///
/// ```rust,no_run
/// use mnemo_sdk::{CallOptions, Mnemo, MnemoConfig, RememberInput};
///
/// async fn example() -> anyhow::Result<()> {
///     let mnemo = Mnemo::open(MnemoConfig::new("/var/lib/mnemo")).await?;
///     let options = CallOptions::default();
///
///     mnemo
///         .remember(RememberInput::new("user-123", "Warsaw is the capital of Poland"), &options)
///         .await?;
///     let hits = mnemo.recall("user-123", "capital of Poland", 5, &options).await?;
///     println!("{} hits", hits.hits.len());
///
///     mnemo.shutdown().await?;
///     Ok(())
/// }
/// ```
pub struct Mnemo {
    config: MnemoConfig,
    store: Store,
    memory: HierarchicalMemory,
    controller: ConcurrencyController,
    /// Caller-facing cache for opportunistic reads.
    cache: TtlCache<serde_json::Value>,
    bus: InvalidationBus,
}

impl Mnemo {
    /// Open the store under `config.storage_root` and start background tasks.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Configuration validation fails
    /// - The store is corrupt or was created with another embedding dimension
    pub async fn open(config: MnemoConfig) -> SDKResult<Self> {
        let bus = InvalidationBus::new(config.cache.bus_capacity);
        Self::open_with_bus(config, bus).await
    }

    /// Open with caches linked to `bus`, so invalidations reach every
    /// instance sharing it.
    pub async fn open_with_bus(config: MnemoConfig, bus: InvalidationBus) -> SDKResult<Self> {
        // Validate configuration
        config.validate()?;

        let embedder = build_embedder(&config.embedding)?;
        let store = Store::open(
            &config.storage_root,
            StoreOptions {
                busy_timeout: config.busy_timeout(),
                pool_size: config.reader_pool_size(),
                embedding_model: embedder.model().to_string(),
                embedding_dimension: embedder.dimensions(),
            },
        )
        .await?;

        let read_cache = Arc::new(TtlCache::linked(config.cache.capacity, &bus));
        let cache = TtlCache::linked(config.cache.capacity, &bus);
        let controller = ConcurrencyController::new(&config.controller)?;

        let mut memory = HierarchicalMemory::new(store.clone(), embedder, config.clone(), read_cache);
        if config.memory.auto_consolidate {
            memory.start_background_consolidation();
        }

        tracing::info!(
            storage_root = %config.storage_root.display(),
            workers = config.controller.workers,
            threshold = config.memory.consolidation_threshold,
            "Mnemo opened"
        );

        Ok(Self {
            config,
            store,
            memory,
            controller,
            cache,
            bus,
        })
    }

    /// Stop background consolidation and checkpoint the WAL.
    pub async fn shutdown(mut self) -> SDKResult<()> {
        self.memory.stop_background_consolidation().await;
        if self.config.store.checkpoint_on_shutdown {
            let report = self.store.checkpoint().await?;
            tracing::info!(checkpointed_frames = report.checkpointed_frames, "Mnemo shut down");
        }
        Ok(())
    }

    /// Get the configuration
    pub fn config(&self) -> &MnemoConfig {
        &self.config
    }

    /// Get the hierarchical memory coordinator
    pub fn memory(&self) -> &HierarchicalMemory {
        &self.memory
    }

    pub fn controller(&self) -> &ConcurrencyController {
        &self.controller
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn invalidation_bus(&self) -> &InvalidationBus {
        &self.bus
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Facts and recall
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn remember(&self, input: RememberInput, options: &CallOptions) -> SDKResult<Fact> {
        self.controller
            .run(OperationClass::Write, options, |cancel| self.memory.remember(input, Some(cancel)))
            .await
    }

    /// Ranked recall. A `limit` of 0 uses `retrieval.default_limit`.
    pub async fn recall(
        &self,
        user_id: &str,
        query: &str,
        limit: usize,
        options: &CallOptions,
    ) -> SDKResult<RecallResponse> {
        let limit = if limit == 0 { self.config.retrieval.default_limit } else { limit };
        self.controller
            .run(OperationClass::Search, options, |_| self.memory.recall(user_id, query, limit))
            .await
    }

    pub async fn get_by_id(&self, user_id: &str, id: &str, options: &CallOptions) -> SDKResult<Record> {
        self.controller
            .run(OperationClass::Search, options, |_| self.memory.get_by_id(user_id, id))
            .await
    }

    pub async fn forget(&self, user_id: &str, id: &str, options: &CallOptions) -> SDKResult<Tombstone> {
        self.controller
            .run(OperationClass::Write, options, |cancel| self.memory.forget(user_id, id, Some(cancel)))
            .await
    }

    /// Tombstone a global fact. Operator path; no user owns global facts.
    pub async fn forget_global(&self, id: &str, options: &CallOptions) -> SDKResult<Tombstone> {
        self.controller
            .run(OperationClass::Write, options, |cancel| self.memory.forget_global(id, Some(cancel)))
            .await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Conversation
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn append_message(&self, message: NewMessage, options: &CallOptions) -> SDKResult<MemoryRecord> {
        self.controller
            .run(OperationClass::Write, options, |cancel| {
                self.memory.append_message(message, Some(cancel))
            })
            .await
    }

    pub async fn conversation_context(
        &self,
        user_id: &str,
        conversation_id: Option<&str>,
        limit: usize,
        options: &CallOptions,
    ) -> SDKResult<Vec<MemoryRecord>> {
        self.controller
            .run(OperationClass::Search, options, |_| {
                self.memory.conversation_context(user_id, conversation_id, limit)
            })
            .await
    }

    pub async fn promote_message(
        &self,
        user_id: &str,
        message_id: &str,
        options: &CallOptions,
    ) -> SDKResult<LongTermRecord> {
        self.controller
            .run(OperationClass::Write, options, |cancel| {
                self.memory.promote_message(user_id, message_id, Some(cancel))
            })
            .await
    }

    pub async fn learn(
        &self,
        user_id: &str,
        summary: &str,
        details: &str,
        options: &CallOptions,
    ) -> SDKResult<LongTermRecord> {
        self.controller
            .run(OperationClass::Write, options, |cancel| {
                self.memory.learn(user_id, summary, details, Some(cancel))
            })
            .await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Episodes and consolidation
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn observe_episode(&self, episode: NewEpisode, options: &CallOptions) -> SDKResult<ObservedEpisode> {
        self.controller
            .run(OperationClass::Write, options, |cancel| {
                self.memory.observe_episode(episode, Some(cancel))
            })
            .await
    }

    pub async fn consolidate_now(&self, options: &CallOptions) -> SDKResult<ConsolidationOutcome> {
        self.controller
            .run(OperationClass::Consolidate, options, |cancel| {
                self.memory.consolidate_now(Some(cancel))
            })
            .await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Mental models and procedures
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn get_mental_model(&self, user_id: &str, options: &CallOptions) -> SDKResult<MentalModel> {
        self.controller
            .run(OperationClass::Search, options, |_| self.memory.get_mental_model(user_id))
            .await
    }

    pub async fn update_mental_model(
        &self,
        user_id: &str,
        key: &str,
        value: serde_json::Value,
        confidence: f64,
        force: bool,
        options: &CallOptions,
    ) -> SDKResult<MentalModelUpdate> {
        self.controller
            .run(OperationClass::Write, options, |cancel| {
                self.memory
                    .update_mental_model(user_id, key, value, confidence, force, Some(cancel))
            })
            .await
    }

    pub async fn register_procedure(&self, procedure: NewProcedure, options: &CallOptions) -> SDKResult<Procedure> {
        self.controller
            .run(OperationClass::Write, options, |cancel| {
                self.memory.register_procedure(procedure, Some(cancel))
            })
            .await
    }

    /// Record one invocation outcome of `name`.
    pub async fn tune_procedure(
        &self,
        user_id: &str,
        name: &str,
        success: bool,
        options: &CallOptions,
    ) -> SDKResult<Procedure> {
        self.controller
            .run(OperationClass::Write, options, |cancel| {
                self.memory.tune_procedure(user_id, name, success, Some(cancel))
            })
            .await
    }

    pub async fn match_procedures(&self, user_id: &str, input: &str, options: &CallOptions) -> SDKResult<Vec<Procedure>> {
        self.controller
            .run(OperationClass::Search, options, |_| self.memory.match_procedures(user_id, input))
            .await
    }

    pub async fn list_procedures(&self, user_id: &str, options: &CallOptions) -> SDKResult<Vec<Procedure>> {
        self.controller
            .run(OperationClass::Search, options, |_| self.memory.list_procedures(user_id))
            .await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Caller cache
    // ─────────────────────────────────────────────────────────────────────────

    /// Hit only while less than `ttl` has passed since the put.
    pub fn cache_get(&self, key: &str, ttl: Duration) -> Option<serde_json::Value> {
        self.cache.get(key, ttl)
    }

    pub fn cache_put(&self, key: impl Into<String>, value: serde_json::Value) {
        self.cache.put(key, value);
    }

    pub fn cache_invalidate(&self, key: &str) {
        self.cache.invalidate(key);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Maintenance
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn checkpoint(&self, options: &CallOptions) -> SDKResult<CheckpointReport> {
        self.controller
            .run(OperationClass::Write, options, |_| async { self.store.checkpoint().await.map_err(SDKError::from) })
            .await
    }

    /// Checkpoint, then snapshot into `backups/`.
    pub async fn backup(&self, options: &CallOptions) -> SDKResult<PathBuf> {
        let path = self
            .controller
            .run(OperationClass::Write, options, |_| async { self.store.backup().await.map_err(SDKError::from) })
            .await?;
        tracing::info!(path = %path.display(), "Backup written");
        Ok(path)
    }

    pub async fn list_backups(&self) -> SDKResult<Vec<PathBuf>> {
        Ok(self.store.list_backups().await?)
    }

    /// Replace the live store with `snapshot` and drop every cached read.
    pub async fn restore(&self, snapshot: &Path, options: &CallOptions) -> SDKResult<CheckpointReport> {
        let report = self
            .controller
            .run(OperationClass::Write, options, |_| async {
                self.store.restore(snapshot).await.map_err(SDKError::from)
            })
            .await?;
        self.memory.clear_cache();
        self.cache.clear();
        tracing::info!(snapshot = %snapshot.display(), "Store restored");
        Ok(report)
    }

    pub async fn stats(&self, user_id: &str, options: &CallOptions) -> SDKResult<MnemoStats> {
        let memory = self
            .controller
            .run(OperationClass::Search, options, |_| self.memory.stats(user_id))
            .await?;
        Ok(MnemoStats {
            memory,
            controller: self.controller.stats(),
        })
    }

    pub async fn verify_index(&self, options: &CallOptions) -> SDKResult<IndexReport> {
        self.controller
            .run(OperationClass::Search, options, |_| self.memory.verify_index())
            .await
    }

    pub async fn integrity_check(&self) -> SDKResult<()> {
        Ok(self.store.integrity_check().await?)
    }
}

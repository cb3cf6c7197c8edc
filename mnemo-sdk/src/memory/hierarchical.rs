//! Hierarchical Memory System
//!
//! Single entry point over the tier managers:
//! - Fans writes out to the right tier and invalidates cached reads they shadow
//! - Answers recall with the hybrid lexical + semantic ranking
//! - Owns the consolidation trigger and its background task
//!
//! It persists nothing itself; every durable byte goes through the tiers.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use mnemo_core::db::records::Tombstone;
use mnemo_core::types::{
    Episode, Fact, LongTermRecord, MemoryRecord, MentalModel, NewConcept, NewEpisode, NewMessage, NewProcedure,
    Procedure, Record, SemanticConcept, StoreStats,
};
use mnemo_core::{CacheStats, CancelToken, IndexReport, Store, TtlCache};

use super::consolidation::{ConsolidationState, Consolidator};
use super::embeddings::Embedder;
use super::retrieval::HybridRetriever;
use super::tiers::{
    ConversationMemory, EpisodicMemory, FactMemory, MentalModelMemory, ProceduralMemory, SemanticMemory,
};
use super::types::{ConsolidationOutcome, MentalModelUpdate, RecallResponse, RememberInput};
use crate::config::MnemoConfig;
use crate::utils::validate_user_id;
use crate::SDKResult;

const NUDGE_CAPACITY: usize = 256;

/// Values the coordinator caches in front of re-computable reads.
#[derive(Debug, Clone)]
pub enum CachedRead {
    Recall(RecallResponse),
    MentalModel(MentalModel),
}

pub fn recall_key(user_id: &str, limit: usize, query: &str) -> String {
    format!("recall:{}:{}:{}", user_id, limit, query)
}

pub fn mental_model_key(user_id: &str) -> String {
    format!("mental_model:{}", user_id)
}

/// Drops cached reads shadowed by a write.
///
/// Reads snapshot the cache generation before touching the store and only
/// populate the cache if no invalidation, local or from a linked instance,
/// was applied in between.
#[derive(Clone)]
struct Invalidator {
    cache: Arc<TtlCache<CachedRead>>,
}

impl Invalidator {
    fn recall_for(&self, user_id: &str) {
        self.cache.invalidate_prefix(&format!("recall:{}:", user_id));
    }

    fn all_recall(&self) {
        self.cache.invalidate_prefix("recall:");
    }

    fn mental_model(&self, user_id: &str) {
        self.cache.invalidate(&mental_model_key(user_id));
    }

    fn after_consolidation(&self, outcome: &ConsolidationOutcome) {
        if let Some(report) = outcome.report() {
            for user_id in report.users() {
                self.recall_for(&user_id);
            }
        }
    }
}

/// An appended episode and whatever consolidation it triggered inline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedEpisode {
    pub episode: Episode,
    /// `None` when the trigger was handed to the background task.
    pub consolidation: Option<ConsolidationOutcome>,
}

/// Snapshot for operators.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    pub user_id: String,
    pub store: StoreStats,
    pub cache: CacheStats,
    pub consolidation_state: ConsolidationState,
    pub background_consolidation: bool,
}

struct BackgroundTask {
    nudge_tx: mpsc::Sender<String>,
    shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

/// High-level hierarchical memory interface
pub struct HierarchicalMemory {
    store: Store,
    config: MnemoConfig,
    episodic: EpisodicMemory,
    semantic: SemanticMemory,
    procedural: ProceduralMemory,
    mental_model: MentalModelMemory,
    conversation: ConversationMemory,
    facts: FactMemory,
    retriever: HybridRetriever,
    consolidator: Arc<Consolidator>,
    invalidator: Invalidator,
    background: Option<BackgroundTask>,
}

impl HierarchicalMemory {
    /// Create a new hierarchical memory system
    pub fn new(
        store: Store,
        embedder: Arc<dyn Embedder>,
        config: MnemoConfig,
        cache: Arc<TtlCache<CachedRead>>,
    ) -> Self {
        let memory = &config.memory;
        let episodic = EpisodicMemory::new(store.clone());
        let semantic = SemanticMemory::new(store.clone(), embedder.clone());
        let consolidator = Arc::new(Consolidator::new(
            episodic.clone(),
            semantic.clone(),
            embedder.clone(),
            memory.consolidation_threshold,
            memory.min_group_size,
        ));

        Self {
            procedural: ProceduralMemory::new(store.clone(), memory.procedure_half_life),
            mental_model: MentalModelMemory::new(store.clone()),
            conversation: ConversationMemory::new(store.clone(), embedder.clone(), memory),
            facts: FactMemory::new(store.clone(), embedder.clone()),
            retriever: HybridRetriever::new(store.clone(), embedder, config.retrieval.clone()),
            invalidator: Invalidator { cache },
            store,
            episodic,
            semantic,
            consolidator,
            config,
            background: None,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn episodic(&self) -> &EpisodicMemory {
        &self.episodic
    }

    pub fn semantic(&self) -> &SemanticMemory {
        &self.semantic
    }

    pub fn procedural(&self) -> &ProceduralMemory {
        &self.procedural
    }

    pub fn mental_models(&self) -> &MentalModelMemory {
        &self.mental_model
    }

    pub fn conversation(&self) -> &ConversationMemory {
        &self.conversation
    }

    pub fn facts(&self) -> &FactMemory {
        &self.facts
    }

    pub fn consolidation_state(&self) -> ConsolidationState {
        self.consolidator.state()
    }

    fn cache_ttl(&self) -> Duration {
        self.config.cache_ttl()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Facts and recall
    // ─────────────────────────────────────────────────────────────────────────

    /// Store a fact and drop the recall results it could change.
    #[tracing::instrument(skip_all, fields(user_id = %input.user_id, global = input.global))]
    pub async fn remember(&self, input: RememberInput, cancel: Option<CancelToken>) -> SDKResult<Fact> {
        validate_user_id(&input.user_id)?;
        let fact = self.facts.add(input, cancel).await?;
        match &fact.user_id {
            Some(user_id) => self.invalidator.recall_for(user_id),
            None => self.invalidator.all_recall(),
        }
        Ok(fact)
    }

    /// Hybrid recall, served from cache while the cached answer is fresh.
    #[tracing::instrument(skip(self))]
    pub async fn recall(&self, user_id: &str, query: &str, limit: usize) -> SDKResult<RecallResponse> {
        validate_user_id(user_id)?;
        let key = recall_key(user_id, limit, query);
        if let Some(CachedRead::Recall(cached)) = self.invalidator.cache.get(&key, self.cache_ttl()) {
            return Ok(cached);
        }

        let seen = self.invalidator.cache.generation();
        let response = self.retriever.search(user_id, query, limit).await?;
        self.invalidator
            .cache
            .put_if_generation(key, CachedRead::Recall(response.clone()), seen);
        Ok(response)
    }

    /// Any record visible to `user_id`; tombstones come back flagged deleted.
    pub async fn get_by_id(&self, user_id: &str, id: &str) -> SDKResult<Record> {
        validate_user_id(user_id)?;
        self.facts.get_by_id(user_id, id).await
    }

    /// Tombstone a fact, long-term record or concept owned by `user_id`.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn forget(&self, user_id: &str, id: &str, cancel: Option<CancelToken>) -> SDKResult<Tombstone> {
        validate_user_id(user_id)?;
        let tombstone = self.facts.soft_delete(Some(user_id), id, cancel).await?;
        self.invalidator.recall_for(user_id);
        Ok(tombstone)
    }

    /// Tombstone a global fact.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn forget_global(&self, id: &str, cancel: Option<CancelToken>) -> SDKResult<Tombstone> {
        let tombstone = self.facts.soft_delete(None, id, cancel).await?;
        self.invalidator.all_recall();
        Ok(tombstone)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Conversation
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn append_message(&self, message: NewMessage, cancel: Option<CancelToken>) -> SDKResult<MemoryRecord> {
        validate_user_id(&message.user_id)?;
        self.conversation.append(message, cancel).await
    }

    pub async fn conversation_context(
        &self,
        user_id: &str,
        conversation_id: Option<&str>,
        limit: usize,
    ) -> SDKResult<Vec<MemoryRecord>> {
        validate_user_id(user_id)?;
        self.conversation.context(user_id, conversation_id, limit).await
    }

    pub async fn promote_message(
        &self,
        user_id: &str,
        message_id: &str,
        cancel: Option<CancelToken>,
    ) -> SDKResult<LongTermRecord> {
        validate_user_id(user_id)?;
        let record = self.conversation.promote(user_id, message_id, cancel).await?;
        self.invalidator.recall_for(user_id);
        Ok(record)
    }

    pub async fn learn(
        &self,
        user_id: &str,
        summary: &str,
        details: &str,
        cancel: Option<CancelToken>,
    ) -> SDKResult<LongTermRecord> {
        validate_user_id(user_id)?;
        let record = self.conversation.learn(user_id, summary, details, cancel).await?;
        self.invalidator.recall_for(user_id);
        Ok(record)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Episodes and consolidation
    // ─────────────────────────────────────────────────────────────────────────

    /// Append an episode and fire the consolidation trigger.
    ///
    /// With the background task running the trigger is a nudge; otherwise
    /// the pass runs inline before this call returns.
    #[tracing::instrument(skip_all, fields(user_id = %episode.user_id))]
    pub async fn observe_episode(&self, episode: NewEpisode, cancel: Option<CancelToken>) -> SDKResult<ObservedEpisode> {
        validate_user_id(&episode.user_id)?;
        let episode = self.episodic.add(episode, cancel.clone()).await?;

        if let Some(background) = &self.background {
            if background.nudge_tx.try_send(episode.user_id.clone()).is_err() {
                tracing::debug!("Consolidation nudge dropped; the periodic sweep will pick it up");
            }
            return Ok(ObservedEpisode {
                episode,
                consolidation: None,
            });
        }

        let outcome = self.consolidator.maybe_consolidate(&episode.user_id, cancel).await?;
        self.invalidator.after_consolidation(&outcome);
        Ok(ObservedEpisode {
            episode,
            consolidation: Some(outcome),
        })
    }

    pub async fn recent_episodes(&self, user_id: &str, limit: usize) -> SDKResult<Vec<Episode>> {
        validate_user_id(user_id)?;
        self.episodic.get_recent(user_id, limit).await
    }

    /// Consolidate every user's pending episodes now.
    #[tracing::instrument(skip_all)]
    pub async fn consolidate_now(&self, cancel: Option<CancelToken>) -> SDKResult<ConsolidationOutcome> {
        let outcome = self.consolidator.consolidate_now(cancel).await?;
        self.invalidator.after_consolidation(&outcome);
        Ok(outcome)
    }

    /// Add a hand-written concept from episodes that are still pending.
    pub async fn add_concept(&self, concept: NewConcept, cancel: Option<CancelToken>) -> SDKResult<SemanticConcept> {
        validate_user_id(&concept.user_id)?;
        let user_id = concept.user_id.clone();
        let stored = self.semantic.add_concept(concept, cancel).await?;
        self.invalidator.recall_for(&user_id);
        Ok(stored)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Mental models
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn get_mental_model(&self, user_id: &str) -> SDKResult<MentalModel> {
        validate_user_id(user_id)?;
        let key = mental_model_key(user_id);
        if let Some(CachedRead::MentalModel(model)) = self.invalidator.cache.get(&key, self.cache_ttl()) {
            return Ok(model);
        }

        let seen = self.invalidator.cache.generation();
        let model = self.mental_model.get(user_id).await?;
        self.invalidator
            .cache
            .put_if_generation(key, CachedRead::MentalModel(model.clone()), seen);
        Ok(model)
    }

    pub async fn update_mental_model(
        &self,
        user_id: &str,
        key: &str,
        value: serde_json::Value,
        confidence: f64,
        force: bool,
        cancel: Option<CancelToken>,
    ) -> SDKResult<MentalModelUpdate> {
        validate_user_id(user_id)?;
        let update = self
            .mental_model
            .update(user_id, key, value, confidence, force, cancel)
            .await?;
        if update.applied {
            self.invalidator.mental_model(user_id);
        }
        Ok(update)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Procedures
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn register_procedure(&self, procedure: NewProcedure, cancel: Option<CancelToken>) -> SDKResult<Procedure> {
        validate_user_id(&procedure.user_id)?;
        self.procedural.register(procedure, cancel).await
    }

    pub async fn tune_procedure(
        &self,
        user_id: &str,
        name: &str,
        success: bool,
        cancel: Option<CancelToken>,
    ) -> SDKResult<Procedure> {
        validate_user_id(user_id)?;
        self.procedural.record_outcome(user_id, name, success, cancel).await
    }

    pub async fn match_procedures(&self, user_id: &str, input: &str) -> SDKResult<Vec<Procedure>> {
        validate_user_id(user_id)?;
        self.procedural.match_trigger(user_id, input).await
    }

    pub async fn list_procedures(&self, user_id: &str) -> SDKResult<Vec<Procedure>> {
        validate_user_id(user_id)?;
        self.procedural.list(user_id).await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Maintenance
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn stats(&self, user_id: &str) -> SDKResult<MemoryStats> {
        validate_user_id(user_id)?;
        Ok(MemoryStats {
            user_id: user_id.to_string(),
            store: self.store.stats(user_id).await?,
            cache: self.invalidator.cache.stats(),
            consolidation_state: self.consolidator.state(),
            background_consolidation: self.background.is_some(),
        })
    }

    pub async fn verify_index(&self) -> SDKResult<IndexReport> {
        Ok(self.store.verify_index().await?)
    }

    /// Drop every cached read, e.g. after a restore.
    pub fn clear_cache(&self) {
        self.invalidator.cache.clear();
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Background consolidation
    // ─────────────────────────────────────────────────────────────────────────

    pub fn is_background_running(&self) -> bool {
        self.background.is_some()
    }

    /// Start background consolidation task
    ///
    /// The task sweeps every user with pending episodes each
    /// `consolidation_interval` seconds and reacts to nudges from
    /// [`Self::observe_episode`] immediately.
    pub fn start_background_consolidation(&mut self) {
        if self.background.is_some() {
            return; // Already running
        }

        let (nudge_tx, mut nudge_rx) = mpsc::channel::<String>(NUDGE_CAPACITY);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let consolidator = self.consolidator.clone();
        let episodic = self.episodic.clone();
        let invalidator = self.invalidator.clone();
        let interval_secs = self.config.memory.consolidation_interval;

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    Some(user_id) = nudge_rx.recv() => {
                        match consolidator.maybe_consolidate(&user_id, None).await {
                            Ok(outcome) => invalidator.after_consolidation(&outcome),
                            Err(e) => tracing::warn!(user_id = %user_id, error = %e, "Background consolidation failed"),
                        }
                    }
                    _ = interval.tick() => {
                        let users = match episodic.users_with_pending().await {
                            Ok(users) => users,
                            Err(e) => {
                                tracing::warn!(error = %e, "Consolidation sweep could not list users");
                                continue;
                            }
                        };
                        for user_id in users {
                            match consolidator.maybe_consolidate(&user_id, None).await {
                                Ok(outcome) => invalidator.after_consolidation(&outcome),
                                Err(e) => tracing::warn!(user_id = %user_id, error = %e, "Background consolidation failed"),
                            }
                        }
                    }
                }
            }
            tracing::debug!("Background consolidation stopped");
        });

        tracing::info!(interval_seconds = interval_secs, "Background consolidation started");
        self.background = Some(BackgroundTask {
            nudge_tx,
            shutdown_tx,
            handle,
        });
    }

    /// Stop background consolidation task and wait for an in-flight pass.
    pub async fn stop_background_consolidation(&mut self) {
        if let Some(background) = self.background.take() {
            let _ = background.shutdown_tx.send(()).await;
            if let Err(e) = background.handle.await {
                tracing::warn!(error = %e, "Background consolidation task ended abnormally");
            }
        }
    }
}

impl Drop for HierarchicalMemory {
    fn drop(&mut self) {
        if let Some(background) = self.background.take() {
            background.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::tiers::test_support::{TEST_DIMENSION, embedder, open_store};
    use mnemo_core::InvalidationBus;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;
    use tokio::sync::Notify;

    /// Parks the first embedding of `query` until released.
    struct GatedEmbedder {
        inner: Arc<dyn Embedder>,
        query: String,
        armed: AtomicBool,
        reached: Notify,
        release: Notify,
    }

    impl GatedEmbedder {
        fn new(query: &str) -> Self {
            Self {
                inner: embedder(),
                query: query.to_string(),
                armed: AtomicBool::new(true),
                reached: Notify::new(),
                release: Notify::new(),
            }
        }
    }

    #[async_trait::async_trait]
    impl Embedder for GatedEmbedder {
        fn model(&self) -> &str {
            self.inner.model()
        }

        fn dimensions(&self) -> usize {
            self.inner.dimensions()
        }

        async fn embed(&self, text: &str) -> SDKResult<Vec<f32>> {
            if text == self.query && self.armed.swap(false, Ordering::SeqCst) {
                self.reached.notify_one();
                self.release.notified().await;
            }
            self.inner.embed(text).await
        }
    }

    async fn setup_test_memory(threshold: usize) -> (TempDir, HierarchicalMemory) {
        let (dir, store) = open_store().await;
        let mut config = MnemoConfig::new(dir.path()).with_consolidation_threshold(threshold);
        config.embedding.dimension = TEST_DIMENSION;
        let cache = Arc::new(TtlCache::new(config.cache.capacity));
        (dir, HierarchicalMemory::new(store, embedder(), config, cache))
    }

    fn episode(user: &str, note: &str) -> NewEpisode {
        NewEpisode {
            user_id: user.into(),
            kind: "interaction".into(),
            valence: 0.1,
            intensity: 0.5,
            tags: vec!["travel".into()],
            note: note.into(),
        }
    }

    #[tokio::test]
    async fn test_recall_is_cached_and_invalidated() {
        let (_dir, memory) = setup_test_memory(20).await;
        memory
            .remember(RememberInput::new("u1", "Warsaw is the capital of Poland"), None)
            .await
            .unwrap();

        let first = memory.recall("u1", "capital", 5).await.unwrap();
        assert_eq!(first.hits.len(), 1);
        memory.recall("u1", "capital", 5).await.unwrap();
        assert_eq!(memory.invalidator.cache.stats().hits, 1);

        memory
            .remember(RememberInput::new("u1", "Prague is the capital of Czechia"), None)
            .await
            .unwrap();
        let after = memory.recall("u1", "capital", 5).await.unwrap();
        assert_eq!(after.hits.len(), 2);
    }

    #[tokio::test]
    async fn test_write_during_linked_recall_is_not_cached() {
        let (dir, store) = open_store().await;
        let mut config = MnemoConfig::new(dir.path());
        config.embedding.dimension = TEST_DIMENSION;
        let bus = InvalidationBus::new(64);
        let gate = Arc::new(GatedEmbedder::new("capital"));

        let writer = HierarchicalMemory::new(
            store.clone(),
            embedder(),
            config.clone(),
            Arc::new(TtlCache::linked(config.cache.capacity, &bus)),
        );
        let reader = Arc::new(HierarchicalMemory::new(
            store,
            gate.clone(),
            config.clone(),
            Arc::new(TtlCache::linked(config.cache.capacity, &bus)),
        ));

        writer
            .remember(RememberInput::new("u1", "Warsaw is the capital of Poland"), None)
            .await
            .unwrap();

        let pending = tokio::spawn({
            let reader = reader.clone();
            async move { reader.recall("u1", "capital", 5).await }
        });
        gate.reached.notified().await;
        writer
            .remember(RememberInput::new("u1", "Prague is the capital of Czechia"), None)
            .await
            .unwrap();
        gate.release.notify_one();
        pending.await.unwrap().unwrap();

        // The answer read across the write was not kept.
        let after = reader.recall("u1", "capital", 5).await.unwrap();
        assert_eq!(after.hits.len(), 2);
        let stats = reader.invalidator.cache.stats();
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 2);
    }

    #[tokio::test]
    async fn test_global_fact_invalidates_every_user() {
        let (_dir, memory) = setup_test_memory(20).await;
        assert!(memory.recall("u2", "boils", 5).await.unwrap().is_empty());

        memory
            .remember(RememberInput::new("ops", "water boils at 100C").global(), None)
            .await
            .unwrap();
        assert_eq!(memory.recall("u2", "boils", 5).await.unwrap().hits.len(), 1);
    }

    #[tokio::test]
    async fn test_inline_trigger_fires_at_threshold() {
        let (_dir, memory) = setup_test_memory(3).await;
        let first = memory.observe_episode(episode("u1", "a"), None).await.unwrap();
        assert!(matches!(
            first.consolidation,
            Some(ConsolidationOutcome::Skipped { pending: 1, threshold: 3 })
        ));

        memory.observe_episode(episode("u1", "b"), None).await.unwrap();
        let third = memory.observe_episode(episode("u1", "c"), None).await.unwrap();
        let report = third.consolidation.unwrap().report().cloned().unwrap();
        assert_eq!(report.runs.len(), 1);
        assert_eq!(report.episodes_consolidated, 3);
        assert_eq!(memory.episodic().count_pending("u1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_mental_model_cache_follows_updates() {
        let (_dir, memory) = setup_test_memory(20).await;
        memory
            .update_mental_model("u1", "tone", serde_json::json!("casual"), 0.6, false, None)
            .await
            .unwrap();
        assert_eq!(memory.get_mental_model("u1").await.unwrap().len(), 1);

        memory
            .update_mental_model("u1", "language", serde_json::json!("en"), 0.9, false, None)
            .await
            .unwrap();
        assert_eq!(memory.get_mental_model("u1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_background_task_consolidates_on_nudge() {
        let (_dir, mut memory) = setup_test_memory(2).await;
        memory.start_background_consolidation();
        assert!(memory.is_background_running());

        let observed = memory.observe_episode(episode("u1", "a"), None).await.unwrap();
        assert!(observed.consolidation.is_none());
        memory.observe_episode(episode("u1", "b"), None).await.unwrap();

        let mut pending = 2;
        for _ in 0..100 {
            pending = memory.episodic().count_pending("u1").await.unwrap();
            if pending == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(pending, 0);

        memory.stop_background_consolidation().await;
        assert!(!memory.is_background_running());
    }

    #[tokio::test]
    async fn test_rejects_bad_user_id() {
        let (_dir, memory) = setup_test_memory(20).await;
        let err = memory.recall("", "anything", 5).await.unwrap_err();
        assert_eq!(err.kind(), mnemo_core::ErrorKind::Invalid);
    }
}

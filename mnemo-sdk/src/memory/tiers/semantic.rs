//! Semantic tier.
//!
//! Concepts only come into existence through a consolidation commit: even a
//! concept added by hand is written as a one-concept pass that marks its
//! source episodes consolidated.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use mnemo_core::db::consolidation::{self, ConsolidationBatch, ConsolidationRun};
use mnemo_core::db::records;
use mnemo_core::index::vector;
use mnemo_core::types::{NewConcept, Order, Record, RecordFilter, RecordKind, SemanticConcept};
use mnemo_core::{CancelToken, Store};

use crate::memory::embeddings::Embedder;
use crate::{SDKError, SDKResult};

/// A concept near a query vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelatedConcept {
    pub concept: SemanticConcept,
    /// Cosine similarity in [-1, 1].
    pub similarity: f64,
}

#[derive(Clone)]
pub struct SemanticMemory {
    store: Store,
    embedder: Arc<dyn Embedder>,
}

impl SemanticMemory {
    pub fn new(store: Store, embedder: Arc<dyn Embedder>) -> Self {
        Self { store, embedder }
    }

    /// Add one concept built from `source_episode_ids`.
    ///
    /// Fails with `Invalid` if any source episode is already consolidated;
    /// nothing is written in that case.
    pub async fn add_concept(&self, concept: NewConcept, cancel: Option<CancelToken>) -> SDKResult<SemanticConcept> {
        concept.validate()?;
        let batch = ConsolidationBatch {
            user_id: concept.user_id.clone(),
            episode_ids: concept.source_episode_ids.clone(),
            concepts: vec![concept],
            started_at: Utc::now(),
        };
        let run = self.commit(batch, cancel).await?;

        let concept_id = run
            .concept_ids
            .first()
            .cloned()
            .ok_or_else(|| SDKError::invalid_operation("consolidation stored no concept"))?;
        self.get(&concept_id).await
    }

    /// Commit a whole consolidation pass as one transaction.
    pub async fn commit(&self, batch: ConsolidationBatch, cancel: Option<CancelToken>) -> SDKResult<ConsolidationRun> {
        let dimension = self.store.dimension();
        let run = self
            .store
            .write(cancel, move |tx| consolidation::commit(tx, dimension, &batch, Utc::now()))
            .await?;
        tracing::info!(
            user_id = %run.user_id,
            consolidation_id = %run.id,
            episodes = run.episode_count,
            concepts = run.concept_count,
            "Consolidation pass committed"
        );
        Ok(run)
    }

    pub async fn get(&self, id: &str) -> SDKResult<SemanticConcept> {
        let id = id.to_string();
        let record = self.store.read(move |conn| records::get(conn, &id)).await?;
        match record {
            Record::Concept(concept) => Ok(concept),
            other => Err(SDKError::not_found("concept", other.id())),
        }
    }

    /// Live concepts nearest to `embedding`, most similar first.
    pub async fn find_related(&self, user_id: &str, embedding: Vec<f32>, limit: usize) -> SDKResult<Vec<RelatedConcept>> {
        let user_id = user_id.to_string();
        let dimension = self.store.dimension();
        let related = self
            .store
            .read(move |conn| {
                // Exact scan: ranking every vector costs the same as ranking the top few.
                let hits = vector::search(conn, &user_id, dimension, &embedding, usize::MAX)?;
                let mut related = Vec::with_capacity(limit);
                for hit in hits {
                    if related.len() == limit {
                        break;
                    }
                    if let Record::Concept(concept) = records::get(conn, &hit.id)? {
                        related.push(RelatedConcept {
                            concept,
                            similarity: hit.score,
                        });
                    }
                }
                Ok(related)
            })
            .await?;
        Ok(related)
    }

    /// Embed `text` and return related concepts.
    pub async fn find_related_text(&self, user_id: &str, text: &str, limit: usize) -> SDKResult<Vec<RelatedConcept>> {
        let embedding = self.embedder.embed(text).await?;
        self.find_related(user_id, embedding, limit).await
    }

    /// Newest live concepts of a user.
    pub async fn list(&self, user_id: &str, limit: usize) -> SDKResult<Vec<SemanticConcept>> {
        let mut filter = RecordFilter::for_user(user_id).kinds(&[RecordKind::Concept]);
        filter.include_global = false;
        let concepts = self
            .store
            .read(move |conn| records::query(conn, &filter, limit, Order::NewestFirst))
            .await?
            .into_iter()
            .filter_map(|record| match record {
                Record::Concept(concept) => Some(concept),
                _ => None,
            })
            .collect();
        Ok(concepts)
    }

    pub async fn last_run(&self, user_id: &str) -> SDKResult<Option<ConsolidationRun>> {
        let user_id = user_id.to_string();
        Ok(self
            .store
            .read(move |conn| consolidation::last_run(conn, &user_id))
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::tiers::EpisodicMemory;
    use crate::memory::tiers::test_support::{embedder, open_store};
    use mnemo_core::types::NewEpisode;

    async fn seed_episodes(tier: &EpisodicMemory, n: usize) -> Vec<String> {
        let mut ids = Vec::new();
        for i in 0..n {
            let episode = tier
                .add(
                    NewEpisode {
                        user_id: "u1".into(),
                        kind: "interaction".into(),
                        valence: 0.0,
                        intensity: 0.5,
                        tags: vec!["cooking".into()],
                        note: format!("baked bread {}", i),
                    },
                    None,
                )
                .await
                .unwrap();
            ids.push(episode.id);
        }
        ids
    }

    #[tokio::test]
    async fn test_add_concept_marks_sources() {
        let (_dir, store) = open_store().await;
        let episodic = EpisodicMemory::new(store.clone());
        let semantic = SemanticMemory::new(store, embedder());
        let ids = seed_episodes(&episodic, 3).await;

        let embedding = embedder().embed("user bakes bread").await.unwrap();
        let concept = semantic
            .add_concept(
                NewConcept {
                    user_id: "u1".into(),
                    summary: "user bakes bread".into(),
                    embedding: Some(embedding),
                    confidence: 0.8,
                    source_episode_ids: ids[..2].to_vec(),
                },
                None,
            )
            .await
            .unwrap();

        assert_eq!(concept.source_episode_ids.len(), 2);
        assert!(episodic.get(&ids[0]).await.unwrap().is_consolidated());
        assert!(!episodic.get(&ids[2]).await.unwrap().is_consolidated());
        assert_eq!(episodic.count_pending("u1").await.unwrap(), 1);

        let last = semantic.last_run("u1").await.unwrap().unwrap();
        assert_eq!(last.concept_ids, vec![concept.id.clone()]);
    }

    #[tokio::test]
    async fn test_add_concept_twice_for_same_episode_fails() {
        let (_dir, store) = open_store().await;
        let episodic = EpisodicMemory::new(store.clone());
        let semantic = SemanticMemory::new(store, embedder());
        let ids = seed_episodes(&episodic, 1).await;

        let concept = NewConcept {
            user_id: "u1".into(),
            summary: "bread".into(),
            embedding: None,
            confidence: 0.5,
            source_episode_ids: ids.clone(),
        };
        semantic.add_concept(concept.clone(), None).await.unwrap();
        let err = semantic.add_concept(concept, None).await.unwrap_err();
        assert_eq!(err.kind(), mnemo_core::ErrorKind::Invalid);
        assert_eq!(semantic.list("u1", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_find_related_only_returns_concepts() {
        let (_dir, store) = open_store().await;
        let episodic = EpisodicMemory::new(store.clone());
        let semantic = SemanticMemory::new(store.clone(), embedder());
        let ids = seed_episodes(&episodic, 2).await;

        let embedding = embedder().embed("user bakes sourdough bread").await.unwrap();
        semantic
            .add_concept(
                NewConcept {
                    user_id: "u1".into(),
                    summary: "user bakes sourdough bread".into(),
                    embedding: Some(embedding),
                    confidence: 0.9,
                    source_episode_ids: ids,
                },
                None,
            )
            .await
            .unwrap();

        let related = semantic.find_related_text("u1", "sourdough bread", 5).await.unwrap();
        assert_eq!(related.len(), 1);
        assert!(related[0].similarity > 0.3);

        assert!(semantic.find_related_text("u2", "sourdough bread", 5).await.unwrap().is_empty());
    }
}

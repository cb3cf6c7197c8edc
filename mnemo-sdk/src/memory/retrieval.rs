//! Hybrid retrieval.
//!
//! Lexical and semantic candidates are normalized onto [0, 1] and blended:
//!
//! ```text
//! lexical  = 1 - rank / n            (rank is 0-based within n lexical hits)
//! semantic = (cosine + 1) / 2
//! score    = w_lex * lexical + w_sem * semantic
//! ```
//!
//! A record missing from one list contributes 0 for that half. Results are
//! ordered by score, then by most recent creation time, then by id.

use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use mnemo_core::db::records;
use mnemo_core::{Error as CoreError, ScoredId, Store};

use super::embeddings::{Embedder, normalize_similarity};
use super::types::{RecallHit, RecallResponse, RetrievalMode};
use crate::config::RetrievalConfig;
use crate::SDKResult;

/// Blend weights for the two halves.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlendWeights {
    pub lexical: f64,
    pub semantic: f64,
}

impl Default for BlendWeights {
    fn default() -> Self {
        Self {
            lexical: 0.5,
            semantic: 0.5,
        }
    }
}

/// A merged candidate before hydration.
#[derive(Debug, Clone, PartialEq)]
pub struct BlendedId {
    pub id: String,
    pub score: f64,
    pub lexical: Option<f64>,
    pub semantic: Option<f64>,
    pub created_at: DateTime<Utc>,
}

fn by_score_then_recency(a: &BlendedId, b: &BlendedId) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.created_at.cmp(&a.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

/// Merge ranked lexical hits and cosine hits into one list of at most `limit`.
pub fn blend(lexical: &[ScoredId], semantic: &[ScoredId], weights: BlendWeights, limit: usize) -> Vec<BlendedId> {
    let mut merged: HashMap<&str, BlendedId> = HashMap::new();

    let n = lexical.len() as f64;
    for (rank, hit) in lexical.iter().enumerate() {
        let norm = 1.0 - rank as f64 / n;
        let entry = merged.entry(hit.id.as_str()).or_insert_with(|| BlendedId {
            id: hit.id.clone(),
            score: 0.0,
            lexical: None,
            semantic: None,
            created_at: hit.created_at,
        });
        entry.lexical = Some(entry.lexical.map_or(norm, |seen| seen.max(norm)));
    }

    for hit in semantic {
        let norm = normalize_similarity(hit.score);
        let entry = merged.entry(hit.id.as_str()).or_insert_with(|| BlendedId {
            id: hit.id.clone(),
            score: 0.0,
            lexical: None,
            semantic: None,
            created_at: hit.created_at,
        });
        entry.semantic = Some(entry.semantic.map_or(norm, |seen| seen.max(norm)));
    }

    let mut blended: Vec<BlendedId> = merged
        .into_values()
        .map(|mut candidate| {
            candidate.score = weights.lexical * candidate.lexical.unwrap_or(0.0)
                + weights.semantic * candidate.semantic.unwrap_or(0.0);
            candidate
        })
        .collect();

    blended.sort_by(by_score_then_recency);
    blended.truncate(limit);
    blended
}

/// Runs both searches for a user and hydrates the merged ranking.
#[derive(Clone)]
pub struct HybridRetriever {
    store: Store,
    embedder: Arc<dyn Embedder>,
    config: RetrievalConfig,
}

impl HybridRetriever {
    pub fn new(store: Store, embedder: Arc<dyn Embedder>, config: RetrievalConfig) -> Self {
        Self {
            store,
            embedder,
            config,
        }
    }

    pub fn weights(&self) -> BlendWeights {
        BlendWeights {
            lexical: self.config.lexical_weight,
            semantic: self.config.semantic_weight,
        }
    }

    pub async fn search(&self, user_id: &str, query: &str, limit: usize) -> SDKResult<RecallResponse> {
        if limit == 0 || query.trim().is_empty() {
            return Ok(RecallResponse {
                hits: Vec::new(),
                mode: RetrievalMode::Hybrid,
            });
        }
        let candidates = limit.saturating_mul(self.config.candidate_multiplier.max(1));

        let lexical = self.store.search_lexical(user_id, query, candidates).await?;

        let (semantic, mode) = match self.semantic_candidates(user_id, query, candidates).await {
            Ok(hits) => (hits, RetrievalMode::Hybrid),
            Err(e) if self.config.lexical_fallback => {
                tracing::warn!(user_id, error = %e, "Semantic search unavailable, using lexical results only");
                (Vec::new(), RetrievalMode::LexicalOnly)
            }
            Err(e) => return Err(e),
        };

        let weights = match mode {
            RetrievalMode::Hybrid => self.weights(),
            RetrievalMode::LexicalOnly => BlendWeights {
                lexical: 1.0,
                semantic: 0.0,
            },
        };
        let ranked = blend(&lexical, &semantic, weights, candidates);

        let hits = self.hydrate(user_id, ranked, limit).await?;
        tracing::debug!(
            user_id,
            lexical = lexical.len(),
            semantic = semantic.len(),
            returned = hits.len(),
            mode = mode.as_str(),
            "Hybrid recall"
        );
        Ok(RecallResponse { hits, mode })
    }

    async fn semantic_candidates(&self, user_id: &str, query: &str, limit: usize) -> SDKResult<Vec<ScoredId>> {
        let vector = self.embedder.embed(query).await?;
        // A query with no hashable features carries no semantic signal.
        if vector.iter().all(|v| *v == 0.0) {
            return Ok(Vec::new());
        }
        Ok(self.store.search_semantic(user_id, vector, limit).await?)
    }

    async fn hydrate(&self, user_id: &str, ranked: Vec<BlendedId>, limit: usize) -> SDKResult<Vec<RecallHit>> {
        let user_id = user_id.to_string();
        let hits = self
            .store
            .read(move |conn| {
                let mut hits = Vec::with_capacity(limit);
                for candidate in ranked {
                    if hits.len() == limit {
                        break;
                    }
                    let record = match records::get(conn, &candidate.id) {
                        Ok(record) => record,
                        Err(CoreError::NotFound { .. }) => continue,
                        Err(e) => return Err(e),
                    };
                    // Tombstoned between search and hydration.
                    if record.is_deleted() || !record.visible_to(&user_id) {
                        continue;
                    }
                    hits.push(RecallHit {
                        record,
                        score: candidate.score,
                        lexical: candidate.lexical,
                        semantic: candidate.semantic,
                    });
                }
                Ok(hits)
            })
            .await?;
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn hit(id: &str, score: f64, secs: i64) -> ScoredId {
        ScoredId {
            id: id.into(),
            score,
            created_at: Utc.timestamp_opt(secs, 0).unwrap(),
        }
    }

    #[test]
    fn test_lexical_rank_normalization() {
        let lexical = vec![hit("a", 9.0, 1), hit("b", 5.0, 1), hit("c", 1.0, 1), hit("d", 0.5, 1)];
        let out = blend(&lexical, &[], BlendWeights { lexical: 1.0, semantic: 0.0 }, 10);
        let scores: Vec<f64> = out.iter().map(|b| b.score).collect();
        assert_eq!(scores, vec![1.0, 0.75, 0.5, 0.25]);
        assert!(out.iter().all(|b| b.semantic.is_none()));
    }

    #[test]
    fn test_record_in_both_lists_outranks_single_list() {
        let lexical = vec![hit("lex-only", 9.0, 10), hit("both", 8.0, 1)];
        let semantic = vec![hit("both", 0.9, 1), hit("sem-only", 0.95, 10)];
        let out = blend(&lexical, &semantic, BlendWeights::default(), 10);

        assert_eq!(out[0].id, "both");
        assert!((out[0].score - (0.5 * 0.5 + 0.5 * 0.95)).abs() < 1e-9);
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn test_duplicate_ids_keep_best() {
        let semantic = vec![hit("a", -1.0, 1), hit("a", 1.0, 1)];
        let out = blend(&[], &semantic, BlendWeights::default(), 10);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].semantic, Some(1.0));
    }

    #[test]
    fn test_ties_break_by_recency_then_id() {
        let semantic = vec![hit("old", 0.2, 1), hit("new", 0.2, 5), hit("b-new", 0.2, 5)];
        let out = blend(&[], &semantic, BlendWeights::default(), 2);
        let ids: Vec<&str> = out.iter().map(|b| b.id.as_str()).collect();
        assert_eq!(ids, vec!["b-new", "new"]);
    }

    #[test]
    fn test_weights_shift_ranking() {
        let lexical = vec![hit("lex", 9.0, 1)];
        let semantic = vec![hit("sem", 1.0, 1)];

        let lexical_heavy = blend(&lexical, &semantic, BlendWeights { lexical: 0.9, semantic: 0.1 }, 2);
        assert_eq!(lexical_heavy[0].id, "lex");

        let semantic_heavy = blend(&lexical, &semantic, BlendWeights { lexical: 0.1, semantic: 0.9 }, 2);
        assert_eq!(semantic_heavy[0].id, "sem");
    }
}

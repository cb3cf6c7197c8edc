//! Episode consolidation.
//!
//! A pass reads the oldest batch of unconsolidated episodes for one user,
//! summarizes it into zero or more concepts and commits concepts and episode
//! markers as one transaction. Markers are inserted conditionally, so an
//! episode can never feed two passes.
//!
//! Only one pass runs at a time. Automatic triggers that find a pass in
//! progress return [`ConsolidationOutcome::AlreadyRunning`]; the manual
//! [`Consolidator::consolidate_now`] waits its turn instead.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Instant;
use tokio::sync::{Mutex, MutexGuard};

use mnemo_core::CancelToken;
use mnemo_core::db::consolidation::{ConsolidationBatch, ConsolidationRun};
use mnemo_core::types::{Episode, NewConcept};

use super::embeddings::Embedder;
use super::tiers::{EpisodicMemory, SemanticMemory};
use super::types::{ConsolidationOutcome, ConsolidationReport};
use crate::SDKResult;
use crate::utils::normalized_hash;

// ─────────────────────────────────────────────────────────────────────────────
// Summarizer
// ─────────────────────────────────────────────────────────────────────────────

/// A concept before it has an embedding or an id.
#[derive(Debug, Clone, PartialEq)]
pub struct DraftConcept {
    pub summary: String,
    pub confidence: f64,
    pub source_episode_ids: Vec<String>,
}

/// Groups a batch by each episode's dominant tag (the batch-wide most
/// frequent of its own tags), falling back to the episode kind. Groups of
/// at least `min_group_size` become one concept each.
#[derive(Debug, Clone)]
pub struct Summarizer {
    min_group_size: usize,
}

impl Summarizer {
    pub fn new(min_group_size: usize) -> Self {
        Self {
            min_group_size: min_group_size.max(1),
        }
    }

    fn group_key(episode: &Episode, tag_counts: &BTreeMap<String, usize>) -> String {
        episode
            .tags
            .iter()
            .map(|tag| tag.trim().to_lowercase())
            .filter(|tag| !tag.is_empty())
            .max_by(|a, b| {
                let (ca, cb) = (tag_counts.get(a).copied().unwrap_or(0), tag_counts.get(b).copied().unwrap_or(0));
                // Highest count wins; ties go to the alphabetically first tag.
                ca.cmp(&cb).then_with(|| b.cmp(a))
            })
            .unwrap_or_else(|| episode.kind.trim().to_lowercase())
    }

    pub fn summarize(&self, episodes: &[Episode]) -> Vec<DraftConcept> {
        if episodes.is_empty() {
            return Vec::new();
        }

        let mut tag_counts: BTreeMap<String, usize> = BTreeMap::new();
        for episode in episodes {
            let unique: HashSet<String> = episode
                .tags
                .iter()
                .map(|tag| tag.trim().to_lowercase())
                .filter(|tag| !tag.is_empty())
                .collect();
            for tag in unique {
                *tag_counts.entry(tag).or_default() += 1;
            }
        }

        let mut groups: BTreeMap<String, Vec<&Episode>> = BTreeMap::new();
        for episode in episodes {
            groups
                .entry(Self::group_key(episode, &tag_counts))
                .or_default()
                .push(episode);
        }

        let total = episodes.len() as f64;
        groups
            .into_iter()
            .filter(|(_, members)| members.len() >= self.min_group_size)
            .map(|(label, members)| {
                let mean_intensity = members.iter().map(|e| e.intensity).sum::<f64>() / members.len() as f64;
                let share = members.len() as f64 / total;
                let mean_valence = members.iter().map(|e| e.valence).sum::<f64>() / members.len() as f64;

                let mut seen = HashSet::new();
                let notes: Vec<&str> = members
                    .iter()
                    .map(|e| e.note.trim())
                    .filter(|note| !note.is_empty() && seen.insert(normalized_hash(note)))
                    .collect();

                let tone = if mean_valence > 0.2 {
                    "positive"
                } else if mean_valence < -0.2 {
                    "negative"
                } else {
                    "neutral"
                };
                let summary = if notes.is_empty() {
                    format!("{} ({} episodes, {})", label, members.len(), tone)
                } else {
                    format!("{} ({} episodes, {}): {}", label, members.len(), tone, notes.join("; "))
                };

                DraftConcept {
                    summary,
                    confidence: (mean_intensity * share).clamp(0.0, 1.0),
                    source_episode_ids: members.iter().map(|e| e.id.clone()).collect(),
                }
            })
            .collect()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// State machine
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsolidationState {
    Idle,
    Running,
}

const IDLE: u8 = 0;
const RUNNING: u8 = 1;

/// Holds the pass lock and flips the state back to idle on drop.
struct RunGuard<'a> {
    _lock: MutexGuard<'a, ()>,
    state: &'a AtomicU8,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.state.store(IDLE, Ordering::SeqCst);
    }
}

pub struct Consolidator {
    episodic: EpisodicMemory,
    semantic: SemanticMemory,
    embedder: Arc<dyn Embedder>,
    summarizer: Summarizer,
    threshold: usize,
    lock: Mutex<()>,
    state: AtomicU8,
}

impl Consolidator {
    pub fn new(
        episodic: EpisodicMemory,
        semantic: SemanticMemory,
        embedder: Arc<dyn Embedder>,
        threshold: usize,
        min_group_size: usize,
    ) -> Self {
        Self {
            episodic,
            semantic,
            embedder,
            summarizer: Summarizer::new(min_group_size),
            threshold: threshold.max(1),
            lock: Mutex::new(()),
            state: AtomicU8::new(IDLE),
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn state(&self) -> ConsolidationState {
        match self.state.load(Ordering::SeqCst) {
            RUNNING => ConsolidationState::Running,
            _ => ConsolidationState::Idle,
        }
    }

    fn enter<'a>(&'a self, lock: MutexGuard<'a, ()>) -> RunGuard<'a> {
        self.state.store(RUNNING, Ordering::SeqCst);
        RunGuard {
            _lock: lock,
            state: &self.state,
        }
    }

    /// Run passes for `user_id` while at least `threshold` episodes are pending.
    pub async fn maybe_consolidate(&self, user_id: &str, cancel: Option<CancelToken>) -> SDKResult<ConsolidationOutcome> {
        let pending = self.episodic.count_pending(user_id).await?;
        if (pending as usize) < self.threshold {
            return Ok(ConsolidationOutcome::Skipped {
                pending,
                threshold: self.threshold,
            });
        }

        let Ok(lock) = self.lock.try_lock() else {
            tracing::debug!(user_id, "Consolidation already running");
            return Ok(ConsolidationOutcome::AlreadyRunning);
        };
        let _guard = self.enter(lock);

        let start = Instant::now();
        let mut report = ConsolidationReport::default();
        loop {
            // Re-count under the lock; another pass may have just finished.
            let pending = self.episodic.count_pending(user_id).await?;
            if (pending as usize) < self.threshold {
                break;
            }
            let run = self.pass(user_id, cancel.clone()).await?;
            report.push(run);
        }
        report.duration_ms = start.elapsed().as_millis() as u64;
        Ok(ConsolidationOutcome::Completed(report))
    }

    /// Drain every user's pending episodes in batches of at most `threshold`.
    /// Waits for a running pass instead of skipping.
    pub async fn consolidate_now(&self, cancel: Option<CancelToken>) -> SDKResult<ConsolidationOutcome> {
        let lock = self.lock.lock().await;
        let _guard = self.enter(lock);

        let start = Instant::now();
        let mut report = ConsolidationReport::default();
        for user_id in self.episodic.users_with_pending().await? {
            let mut user_report = ConsolidationReport::default();
            while self.episodic.count_pending(&user_id).await? > 0 {
                let run = self.pass(&user_id, cancel.clone()).await?;
                user_report.push(run);
            }
            report.merge(user_report);
        }
        report.duration_ms = start.elapsed().as_millis() as u64;

        tracing::info!(
            runs = report.runs.len(),
            episodes = report.episodes_consolidated,
            concepts = report.concepts_created,
            duration_ms = report.duration_ms,
            "Manual consolidation finished"
        );
        Ok(ConsolidationOutcome::Completed(report))
    }

    /// One pass over the oldest pending batch. Caller holds the lock.
    async fn pass(&self, user_id: &str, cancel: Option<CancelToken>) -> SDKResult<ConsolidationRun> {
        let started_at = Utc::now();
        let batch = self.episodic.oldest_pending(user_id, self.threshold).await?;
        let drafts = self.summarizer.summarize(&batch);

        let summaries: Vec<String> = drafts.iter().map(|d| d.summary.clone()).collect();
        let embeddings = self.embedder.embed_batch(&summaries).await?;

        let concepts = drafts
            .into_iter()
            .zip(embeddings)
            .map(|(draft, embedding)| NewConcept {
                user_id: user_id.to_string(),
                summary: draft.summary,
                embedding: Some(embedding),
                confidence: draft.confidence,
                source_episode_ids: draft.source_episode_ids,
            })
            .collect();

        self.semantic
            .commit(
                ConsolidationBatch {
                    user_id: user_id.to_string(),
                    episode_ids: batch.iter().map(|e| e.id.clone()).collect(),
                    concepts,
                    started_at,
                },
                cancel,
            )
            .await
    }
}

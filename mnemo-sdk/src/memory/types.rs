//! Memory Type Definitions
//!
//! Inputs and results of the coordinator. Stored record types live in
//! `mnemo_core::types` and are re-exported from the crate root.

use mnemo_core::db::consolidation::ConsolidationRun;
use mnemo_core::types::{MentalModelEntry, NewFact, Record};
use serde::{Deserialize, Serialize};

/// Input for `remember`: a fact owned by one user or, when `global`, by nobody.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RememberInput {
    pub user_id: String,
    pub text: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    /// Store as an explicitly global fact visible to every user.
    #[serde(default)]
    pub global: bool,
}

fn default_confidence() -> f64 {
    1.0
}

impl RememberInput {
    pub fn new(user_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            text: text.into(),
            tags: Vec::new(),
            confidence: default_confidence(),
            global: false,
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn global(mut self) -> Self {
        self.global = true;
        self
    }

    pub(crate) fn into_new_fact(self, embedding: Option<Vec<f32>>) -> NewFact {
        NewFact {
            user_id: (!self.global).then_some(self.user_id),
            text: self.text,
            tags: self.tags,
            confidence: self.confidence,
            embedding,
        }
    }
}

/// How a recall response was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalMode {
    /// Lexical and semantic lists blended.
    Hybrid,
    /// Semantic search was unavailable and degraded mode is enabled.
    LexicalOnly,
}

impl RetrievalMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hybrid => "hybrid",
            Self::LexicalOnly => "lexical_only",
        }
    }
}

/// One ranked recall result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecallHit {
    pub record: Record,
    /// Blended score in [0, 1].
    pub score: f64,
    /// Normalized lexical rank, if the record matched lexically.
    pub lexical: Option<f64>,
    /// Normalized cosine similarity, if the record has an embedding.
    pub semantic: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecallResponse {
    pub hits: Vec<RecallHit>,
    pub mode: RetrievalMode,
}

impl RecallResponse {
    pub fn ids(&self) -> Vec<&str> {
        self.hits.iter().map(|hit| hit.record.id()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }
}

/// Totals of one or more committed consolidation passes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationReport {
    pub runs: Vec<ConsolidationRun>,
    pub episodes_consolidated: usize,
    pub concepts_created: usize,
    pub duration_ms: u64,
}

impl ConsolidationReport {
    pub(crate) fn push(&mut self, run: ConsolidationRun) {
        self.episodes_consolidated += run.episode_count as usize;
        self.concepts_created += run.concept_count as usize;
        self.runs.push(run);
    }

    pub(crate) fn merge(&mut self, other: ConsolidationReport) {
        for run in other.runs {
            self.push(run);
        }
    }

    /// Users whose recall results changed.
    pub fn users(&self) -> Vec<String> {
        let mut users: Vec<String> = self.runs.iter().map(|run| run.user_id.clone()).collect();
        users.sort();
        users.dedup();
        users
    }
}

/// Result of a consolidation trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConsolidationOutcome {
    /// Below threshold; nothing ran.
    Skipped { pending: i64, threshold: usize },
    /// Another pass holds the consolidation lock.
    AlreadyRunning,
    Completed(ConsolidationReport),
}

impl ConsolidationOutcome {
    pub fn report(&self) -> Option<&ConsolidationReport> {
        match self {
            Self::Completed(report) => Some(report),
            _ => None,
        }
    }
}

/// Result of a gated mental-model update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MentalModelUpdate {
    /// False when the stored confidence was higher and `force` was not set.
    pub applied: bool,
    /// Entry as stored after the call.
    pub entry: MentalModelEntry,
    pub previous_confidence: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remember_input_global() {
        let fact = RememberInput::new("u1", "water boils at 100C")
            .global()
            .with_tags(["physics"])
            .into_new_fact(None);
        assert!(fact.user_id.is_none());
        assert_eq!(fact.tags, vec!["physics".to_string()]);
        assert_eq!(fact.confidence, 1.0);
    }

    #[test]
    fn test_remember_input_defaults_from_json() {
        let input: RememberInput =
            serde_json::from_str(r#"{"user_id":"u1","text":"hello"}"#).unwrap();
        assert_eq!(input.confidence, 1.0);
        assert!(!input.global);
        assert!(input.tags.is_empty());
    }

    #[test]
    fn test_outcome_serialization() {
        let json = serde_json::to_value(ConsolidationOutcome::AlreadyRunning).unwrap();
        assert_eq!(json["status"], "already_running");

        let json = serde_json::to_value(ConsolidationOutcome::Skipped {
            pending: 3,
            threshold: 20,
        })
        .unwrap();
        assert_eq!(json["pending"], 3);
    }
}

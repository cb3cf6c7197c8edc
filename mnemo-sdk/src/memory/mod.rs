//! Hierarchical Memory System
//!
//! Tiers, each with its own update rule:
//! - Conversation: recent turns kept in a window, promoted to long-term records on demand
//! - Facts: user-owned or global statements, tombstoned on delete
//! - Episodic: append-only timeline of interactions
//! - Semantic: concepts distilled from episodes by consolidation
//! - Procedural: named skills with a recency-weighted success rate
//! - Mental model: per-user beliefs gated by confidence
//!
//! # Architecture
//!
//! Episodes flow upward through consolidation:
//! 1. New episodes are appended as pending
//! 2. Once a user has `consolidation_threshold` pending episodes, the oldest
//!    batch is summarized into concepts
//! 3. Concepts and the episodes' consolidated markers commit together
//!
//! Recall blends lexical rank and embedding similarity across facts,
//! long-term records and concepts.

mod consolidation;
pub mod embeddings;
mod hierarchical;
mod retrieval;
pub mod tiers;
mod types;

#[cfg(test)]
mod integration_tests;

pub use consolidation::{ConsolidationState, Consolidator, DraftConcept, Summarizer};
pub use embeddings::{CachingEmbedder, EMBEDDING_DIMENSIONS, Embedder, HashingEmbedder, build_embedder};
pub use hierarchical::{
    CachedRead, HierarchicalMemory, MemoryStats, ObservedEpisode, mental_model_key, recall_key,
};
pub use retrieval::{BlendWeights, BlendedId, HybridRetriever, blend};
pub use types::{
    ConsolidationOutcome, ConsolidationReport, MentalModelUpdate, RecallHit, RecallResponse, RememberInput,
    RetrievalMode,
};

//! Tier managers.
//!
//! Each tier owns the update rules for one kind of memory and delegates
//! durability to the shared [`mnemo_core::Store`]. Store errors pass through
//! unchanged.

mod conversation;
mod episodic;
mod facts;
mod mental_model;
mod procedural;
mod semantic;

pub use conversation::ConversationMemory;
pub use episodic::EpisodicMemory;
pub use facts::FactMemory;
pub use mental_model::MentalModelMemory;
pub use procedural::{ProceduralMemory, decay_factor, next_outcome};
pub use semantic::{RelatedConcept, SemanticMemory};

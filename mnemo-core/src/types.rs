//! Record types for the memory store.
//!
//! Every identifiable record shares one base row (`records`) and one
//! kind-specific row; the types here are the decoded, joined view.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Kind of a stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Message,
    LongTerm,
    Fact,
    Episode,
    Concept,
    Procedure,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::LongTerm => "long_term",
            Self::Fact => "fact",
            Self::Episode => "episode",
            Self::Concept => "concept",
            Self::Procedure => "procedure",
        }
    }

    /// Kinds that take part in recall.
    pub fn searchable() -> &'static [RecordKind] {
        &[Self::Fact, Self::LongTerm, Self::Concept]
    }

    /// Append-only kinds can never be soft-deleted.
    pub fn is_append_only(&self) -> bool {
        matches!(self, Self::Episode)
    }
}

impl FromStr for RecordKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "message" => Ok(Self::Message),
            "long_term" => Ok(Self::LongTerm),
            "fact" => Ok(Self::Fact),
            "episode" => Ok(Self::Episode),
            "concept" => Ok(Self::Concept),
            "procedure" => Ok(Self::Procedure),
            other => Err(Error::invalid(format!("unknown record kind: {}", other))),
        }
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Speaker of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
            Self::Tool => "tool",
        }
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            "tool" => Ok(Self::Tool),
            other => Err(Error::invalid(format!("unknown role: {}", other))),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Stored records
// ─────────────────────────────────────────────────────────────────────────────

/// Short-term conversation turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub user_id: String,
    pub conversation_id: Option<String>,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Long-term record, learned directly or promoted from a conversation turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LongTermRecord {
    pub id: String,
    pub user_id: String,
    pub summary: String,
    pub details: String,
    pub embedding: Option<Vec<f32>>,
    pub source_message_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    pub id: String,
    /// `None` marks an explicitly global fact visible to every user.
    pub user_id: Option<String>,
    pub text: String,
    pub tags: Vec<String>,
    pub confidence: f64,
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Fact {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn is_global(&self) -> bool {
        self.user_id.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub id: String,
    pub user_id: String,
    /// Per-user sequence number, strictly increasing.
    pub seq: i64,
    pub kind: String,
    pub valence: f64,
    pub intensity: f64,
    pub tags: Vec<String>,
    pub note: String,
    pub created_at: DateTime<Utc>,
    pub consolidated_at: Option<DateTime<Utc>>,
    pub consolidation_id: Option<String>,
}

impl Episode {
    pub fn is_consolidated(&self) -> bool {
        self.consolidated_at.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticConcept {
    pub id: String,
    pub user_id: String,
    pub summary: String,
    pub embedding: Option<Vec<f32>>,
    pub confidence: f64,
    pub source_episode_ids: Vec<String>,
    pub consolidation_id: String,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Procedure {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub trigger_pattern: String,
    pub steps: Vec<String>,
    pub success_rate: f64,
    pub usage_count: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub weighted_success: f64,
    pub weight_total: f64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MentalModelEntry {
    pub key: String,
    pub value: serde_json::Value,
    pub confidence: f64,
    pub updated_at: DateTime<Utc>,
}

/// A user's key → (value, confidence) map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MentalModel {
    pub user_id: String,
    pub entries: BTreeMap<String, MentalModelEntry>,
}

impl MentalModel {
    pub fn get(&self, key: &str) -> Option<&MentalModelEntry> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Any stored record, as returned by the generic store contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Record {
    Message(MemoryRecord),
    LongTerm(LongTermRecord),
    Fact(Fact),
    Episode(Episode),
    Concept(SemanticConcept),
    Procedure(Procedure),
}

impl Record {
    pub fn id(&self) -> &str {
        match self {
            Self::Message(r) => &r.id,
            Self::LongTerm(r) => &r.id,
            Self::Fact(r) => &r.id,
            Self::Episode(r) => &r.id,
            Self::Concept(r) => &r.id,
            Self::Procedure(r) => &r.id,
        }
    }

    pub fn kind(&self) -> RecordKind {
        match self {
            Self::Message(_) => RecordKind::Message,
            Self::LongTerm(_) => RecordKind::LongTerm,
            Self::Fact(_) => RecordKind::Fact,
            Self::Episode(_) => RecordKind::Episode,
            Self::Concept(_) => RecordKind::Concept,
            Self::Procedure(_) => RecordKind::Procedure,
        }
    }

    /// Owning user, `None` for global facts.
    pub fn user_id(&self) -> Option<&str> {
        match self {
            Self::Message(r) => Some(&r.user_id),
            Self::LongTerm(r) => Some(&r.user_id),
            Self::Fact(r) => r.user_id.as_deref(),
            Self::Episode(r) => Some(&r.user_id),
            Self::Concept(r) => Some(&r.user_id),
            Self::Procedure(r) => Some(&r.user_id),
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            Self::Message(r) => r.created_at,
            Self::LongTerm(r) => r.created_at,
            Self::Fact(r) => r.created_at,
            Self::Episode(r) => r.created_at,
            Self::Concept(r) => r.created_at,
            Self::Procedure(r) => r.created_at,
        }
    }

    pub fn is_deleted(&self) -> bool {
        match self {
            Self::LongTerm(r) => r.deleted_at.is_some(),
            Self::Fact(r) => r.deleted_at.is_some(),
            Self::Concept(r) => r.deleted_at.is_some(),
            _ => false,
        }
    }

    /// Primary text of the record.
    pub fn text(&self) -> &str {
        match self {
            Self::Message(r) => &r.content,
            Self::LongTerm(r) => &r.summary,
            Self::Fact(r) => &r.text,
            Self::Episode(r) => &r.note,
            Self::Concept(r) => &r.summary,
            Self::Procedure(r) => &r.name,
        }
    }

    /// True if `user_id` may read this record.
    pub fn visible_to(&self, user_id: &str) -> bool {
        self.user_id().is_none_or(|owner| owner == user_id)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Inputs
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub user_id: String,
    pub conversation_id: Option<String>,
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct NewLongTerm {
    pub user_id: String,
    pub summary: String,
    pub details: String,
    pub embedding: Option<Vec<f32>>,
    pub source_message_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewFact {
    pub user_id: Option<String>,
    pub text: String,
    pub tags: Vec<String>,
    pub confidence: f64,
    pub embedding: Option<Vec<f32>>,
}

#[derive(Debug, Clone)]
pub struct NewEpisode {
    pub user_id: String,
    pub kind: String,
    pub valence: f64,
    pub intensity: f64,
    pub tags: Vec<String>,
    pub note: String,
}

#[derive(Debug, Clone)]
pub struct NewConcept {
    pub user_id: String,
    pub summary: String,
    pub embedding: Option<Vec<f32>>,
    pub confidence: f64,
    pub source_episode_ids: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct NewProcedure {
    pub user_id: String,
    pub name: String,
    pub trigger_pattern: String,
    pub steps: Vec<String>,
}

/// Input for the generic `put` contract.
#[derive(Debug, Clone)]
pub enum NewRecord {
    Message(NewMessage),
    LongTerm(NewLongTerm),
    Fact(NewFact),
    Episode(NewEpisode),
    Procedure(NewProcedure),
}

fn require_text(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::invalid(format!("{} must not be empty", field)));
    }
    Ok(())
}

fn require_unit(field: &str, value: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(Error::invalid(format!("{} must be within [0, 1], got {}", field, value)));
    }
    Ok(())
}

pub(crate) fn require_finite(embedding: Option<&[f32]>) -> Result<()> {
    if let Some(vector) = embedding {
        if vector.is_empty() {
            return Err(Error::invalid("embedding must not be empty"));
        }
        if vector.iter().any(|v| !v.is_finite()) {
            return Err(Error::invalid("embedding contains non-finite values"));
        }
    }
    Ok(())
}

impl NewMessage {
    pub fn validate(&self) -> Result<()> {
        require_text("user_id", &self.user_id)?;
        require_text("content", &self.content)
    }
}

impl NewLongTerm {
    pub fn validate(&self) -> Result<()> {
        require_text("user_id", &self.user_id)?;
        require_text("summary", &self.summary)?;
        require_finite(self.embedding.as_deref())
    }
}

impl NewFact {
    pub fn validate(&self) -> Result<()> {
        if let Some(user_id) = &self.user_id {
            require_text("user_id", user_id)?;
        }
        require_text("text", &self.text)?;
        require_unit("confidence", self.confidence)?;
        require_finite(self.embedding.as_deref())
    }
}

impl NewEpisode {
    pub fn validate(&self) -> Result<()> {
        require_text("user_id", &self.user_id)?;
        require_text("kind", &self.kind)?;
        if !(-1.0..=1.0).contains(&self.valence) {
            return Err(Error::invalid(format!(
                "valence must be within [-1, 1], got {}",
                self.valence
            )));
        }
        require_unit("intensity", self.intensity)
    }
}

impl NewConcept {
    pub fn validate(&self) -> Result<()> {
        require_text("user_id", &self.user_id)?;
        require_text("summary", &self.summary)?;
        require_unit("confidence", self.confidence)?;
        if self.source_episode_ids.is_empty() {
            return Err(Error::invalid("a concept needs at least one source episode"));
        }
        require_finite(self.embedding.as_deref())
    }
}

impl NewProcedure {
    pub fn validate(&self) -> Result<()> {
        require_text("user_id", &self.user_id)?;
        require_text("name", &self.name)?;
        require_text("trigger_pattern", &self.trigger_pattern)
    }
}

impl NewRecord {
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::Message(_) => RecordKind::Message,
            Self::LongTerm(_) => RecordKind::LongTerm,
            Self::Fact(_) => RecordKind::Fact,
            Self::Episode(_) => RecordKind::Episode,
            Self::Procedure(_) => RecordKind::Procedure,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Message(r) => r.validate(),
            Self::LongTerm(r) => r.validate(),
            Self::Fact(r) => r.validate(),
            Self::Episode(r) => r.validate(),
            Self::Procedure(r) => r.validate(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Queries
// ─────────────────────────────────────────────────────────────────────────────

/// Sort order for store queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Order {
    #[default]
    NewestFirst,
    OldestFirst,
}

/// Filter for the generic `query` contract.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    /// Restrict to this user (global facts are added when `include_global` is set).
    pub user_id: Option<String>,
    pub include_global: bool,
    /// Empty means every kind.
    pub kinds: Vec<RecordKind>,
    pub include_deleted: bool,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl RecordFilter {
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            include_global: true,
            ..Default::default()
        }
    }

    pub fn kinds(mut self, kinds: &[RecordKind]) -> Self {
        self.kinds = kinds.to_vec();
        self
    }

    pub fn with_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }
}

/// Per-user store statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreStats {
    pub count_by_kind: BTreeMap<String, i64>,
    pub tombstones: i64,
    pub pending_episodes: i64,
    pub consolidation_runs: i64,
    pub last_consolidation_at: Option<DateTime<Utc>>,
    pub mental_model_keys: i64,
}

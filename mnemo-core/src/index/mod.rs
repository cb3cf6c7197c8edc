//! Lexical and embedding index over searchable records.
//!
//! Both halves live in the store file and are written through the same
//! transaction as the record they describe, so a rolled-back write leaves no
//! index entry behind and a tombstone never stays searchable.

pub mod lexical;
pub mod vector;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredId {
    pub id: String,
    /// Lexical: negated bm25, higher is better. Semantic: cosine in [-1, 1].
    pub score: f64,
    pub created_at: DateTime<Utc>,
}

/// Outcome of [`verify`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexReport {
    /// Index entries pointing at a missing or tombstoned record.
    pub orphaned: Vec<String>,
    /// Live searchable records with no lexical entry.
    pub missing: Vec<String>,
    pub lexical_entries: i64,
    pub vector_entries: i64,
}

impl IndexReport {
    pub fn is_clean(&self) -> bool {
        self.orphaned.is_empty() && self.missing.is_empty()
    }
}

/// Index `id` lexically and, when an embedding is given, semantically.
pub fn index(
    conn: &Connection,
    dimension: usize,
    id: &str,
    body: &str,
    tags: &[String],
    embedding: Option<&[f32]>,
) -> Result<()> {
    lexical::upsert(conn, id, body, tags)?;
    if let Some(vector) = embedding {
        vector::upsert(conn, dimension, id, vector)?;
    }
    Ok(())
}

/// Drop every index entry for `id`.
pub fn remove(conn: &Connection, id: &str) -> Result<()> {
    lexical::remove(conn, id)?;
    vector::remove(conn, id)
}

/// Cross-check index entries against the records table.
pub fn verify(conn: &Connection) -> Result<IndexReport> {
    let mut stmt = conn.prepare(
        "SELECT f.record_id FROM memory_fts f
         LEFT JOIN records r ON r.id = f.record_id
         WHERE r.id IS NULL OR r.deleted_at IS NOT NULL
         UNION
         SELECT v.record_id FROM memory_vectors v
         JOIN records r ON r.id = v.record_id
         WHERE r.deleted_at IS NOT NULL
         ORDER BY 1",
    )?;
    let orphaned = stmt
        .query_map([], |row| row.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;

    let mut stmt = conn.prepare(
        "SELECT r.id FROM records r
         WHERE r.kind IN ('fact', 'long_term', 'concept') AND r.deleted_at IS NULL
           AND NOT EXISTS (SELECT 1 FROM memory_fts f WHERE f.record_id = r.id)
         ORDER BY r.id",
    )?;
    let missing = stmt
        .query_map([], |row| row.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;

    let lexical_entries = conn.query_row("SELECT COUNT(*) FROM memory_fts", [], |row| row.get(0))?;
    let vector_entries = conn.query_row("SELECT COUNT(*) FROM memory_vectors", [], |row| row.get(0))?;

    Ok(IndexReport {
        orphaned,
        missing,
        lexical_entries,
        vector_entries,
    })
}

//! Embedding vectors stored as little-endian f32 blobs.
//!
//! Search is an exact cosine scan over the caller's scope.

use rusqlite::{Connection, OptionalExtension, params};
use std::cmp::Ordering;

use super::ScoredId;
use crate::db::from_millis;
use crate::error::{Error, Result};
use crate::types::require_finite;

pub fn encode(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn decode(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in [-1, 1]; 0 when either vector has zero norm.
pub fn cosine(a: &[f32], b: &[f32]) -> f64 {
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0)
}

fn check_dimension(expected: usize, vector: &[f32]) -> Result<()> {
    if vector.len() != expected {
        return Err(Error::invalid(format!(
            "embedding dimension mismatch: expected {}, got {}",
            expected,
            vector.len()
        )));
    }
    require_finite(Some(vector))
}

pub fn upsert(conn: &Connection, dimension: usize, id: &str, vector: &[f32]) -> Result<()> {
    check_dimension(dimension, vector)?;
    conn.execute(
        "INSERT INTO memory_vectors (record_id, dim, vector) VALUES (?1, ?2, ?3)
         ON CONFLICT(record_id) DO UPDATE SET dim = excluded.dim, vector = excluded.vector",
        params![id, dimension as i64, encode(vector)],
    )?;
    Ok(())
}

pub fn remove(conn: &Connection, id: &str) -> Result<()> {
    conn.execute("DELETE FROM memory_vectors WHERE record_id = ?1", params![id])?;
    Ok(())
}

pub fn load(conn: &Connection, id: &str) -> Result<Option<Vec<f32>>> {
    let blob: Option<Vec<u8>> = conn
        .query_row(
            "SELECT vector FROM memory_vectors WHERE record_id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(blob.map(|b| decode(&b)))
}

/// Nearest vectors visible to `user_id`, highest cosine first; ties go to the
/// most recent record.
pub fn search(
    conn: &Connection,
    user_id: &str,
    dimension: usize,
    query: &[f32],
    limit: usize,
) -> Result<Vec<ScoredId>> {
    check_dimension(dimension, query)?;
    if limit == 0 {
        return Ok(Vec::new());
    }

    let mut stmt = conn.prepare_cached(
        "SELECT v.record_id, v.dim, v.vector, r.created_at
         FROM memory_vectors v
         JOIN records r ON r.id = v.record_id
         WHERE (r.user_id = ?1 OR r.user_id IS NULL) AND r.deleted_at IS NULL",
    )?;
    let rows = stmt
        .query_map(params![user_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Vec<u8>>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut hits = Vec::with_capacity(rows.len());
    for (id, dim, blob, created_at) in rows {
        if dim as usize != dimension {
            return Err(Error::Corrupt(format!(
                "vector for {} has dimension {}, index expects {}",
                id, dim, dimension
            )));
        }
        hits.push(ScoredId {
            score: cosine(query, &decode(&blob)),
            created_at: from_millis(created_at),
            id,
        });
    }

    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.created_at.cmp(&a.created_at))
            .then_with(|| a.id.cmp(&b.id))
    });
    hits.truncate(limit);
    Ok(hits)
}

//! FTS5 full-text index ranked by bm25.

use rusqlite::{Connection, params};

use super::ScoredId;
use crate::db::from_millis;
use crate::error::Result;

pub fn upsert(conn: &Connection, id: &str, body: &str, tags: &[String]) -> Result<()> {
    remove(conn, id)?;
    conn.execute(
        "INSERT INTO memory_fts (record_id, body, tags) VALUES (?1, ?2, ?3)",
        params![id, body, tags.join(" ")],
    )?;
    Ok(())
}

pub fn remove(conn: &Connection, id: &str) -> Result<()> {
    conn.execute("DELETE FROM memory_fts WHERE record_id = ?1", params![id])?;
    Ok(())
}

/// Turn free text into an FTS5 expression of quoted terms joined by OR.
///
/// Returns `None` when the input holds no searchable term.
pub fn sanitize_query(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|term| !term.is_empty())
        .map(|term| format!("\"{}\"", term.to_lowercase()))
        .collect();

    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

/// Best lexical matches visible to `user_id` (own records plus global facts).
pub fn search(conn: &Connection, user_id: &str, query: &str, limit: usize) -> Result<Vec<ScoredId>> {
    let Some(expression) = sanitize_query(query) else {
        return Ok(Vec::new());
    };
    if limit == 0 {
        return Ok(Vec::new());
    }

    let mut stmt = conn.prepare_cached(
        "SELECT f.record_id, bm25(memory_fts) AS rank, r.created_at
         FROM memory_fts f
         JOIN records r ON r.id = f.record_id
         WHERE memory_fts MATCH ?1
           AND (r.user_id = ?2 OR r.user_id IS NULL)
           AND r.deleted_at IS NULL
         ORDER BY rank ASC, r.created_at DESC, f.record_id ASC
         LIMIT ?3",
    )?;
    let hits = stmt
        .query_map(params![expression, user_id, limit as i64], |row| {
            let rank: f64 = row.get(1)?;
            Ok(ScoredId {
                id: row.get(0)?,
                score: -rank,
                created_at: from_millis(row.get(2)?),
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(hits)
}

//! Short-term conversation turns.
//!
//! Turns are the only records ever erased: pruning keeps the newest
//! `window` turns per user and drops anything older than the TTL cutoff.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use std::str::FromStr;

use super::{from_millis, to_millis};
use crate::error::Result;
use crate::types::{MemoryRecord, Role};

fn map_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, String, Option<String>, String, String, i64)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?))
}

/// Latest `limit` turns in chronological order.
pub fn context(
    conn: &Connection,
    user_id: &str,
    conversation_id: Option<&str>,
    limit: usize,
) -> Result<Vec<MemoryRecord>> {
    let mut stmt = conn.prepare_cached(
        "SELECT r.id, r.user_id, m.conversation_id, m.role, r.content, r.created_at
         FROM records r JOIN messages m ON m.id = r.id
         WHERE r.user_id = ?1 AND (?2 IS NULL OR m.conversation_id = ?2)
         ORDER BY r.created_at DESC, r.rowid DESC
         LIMIT ?3",
    )?;
    let rows = stmt
        .query_map(params![user_id, conversation_id, limit as i64], map_message)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut messages = rows
        .into_iter()
        .map(|(id, user_id, conversation_id, role, content, created_at)| {
            Ok(MemoryRecord {
                id,
                user_id,
                conversation_id,
                role: Role::from_str(&role)?,
                content,
                created_at: from_millis(created_at),
            })
        })
        .collect::<Result<Vec<_>>>()?;
    messages.reverse();
    Ok(messages)
}

/// Erase turns outside the context window or older than `cutoff`.
pub fn prune(conn: &Connection, user_id: &str, window: usize, cutoff: Option<DateTime<Utc>>) -> Result<usize> {
    let cutoff_ms = cutoff.map(to_millis).unwrap_or(i64::MIN);
    let removed = conn.execute(
        "DELETE FROM records
         WHERE kind = 'message' AND user_id = ?1
           AND (created_at < ?2 OR id NOT IN (
                SELECT id FROM records
                WHERE kind = 'message' AND user_id = ?1
                ORDER BY created_at DESC, rowid DESC
                LIMIT ?3))",
        params![user_id, cutoff_ms, window as i64],
    )?;
    if removed > 0 {
        tracing::debug!(user_id, removed, "Pruned conversation turns");
    }
    Ok(removed)
}

pub fn count(conn: &Connection, user_id: &str) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM records WHERE kind = 'message' AND user_id = ?1",
        params![user_id],
        |row| row.get(0),
    )?)
}

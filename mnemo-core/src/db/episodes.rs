//! Episode queries. Episodes are only ever inserted (see `records::insert`).

use rusqlite::{Connection, OptionalExtension, params};

use super::records::map_episode;
use crate::error::{Error, Result};
use crate::types::Episode;

const EPISODE_COLUMNS: &str = "e.id, e.user_id, e.seq, e.kind, e.valence, e.intensity, e.tags_json, e.note,
     r.created_at, c.consolidated_at, c.consolidation_id
     FROM episodes e
     JOIN records r ON r.id = e.id
     LEFT JOIN episode_consolidations c ON c.episode_id = e.id";

pub fn get(conn: &Connection, id: &str) -> Result<Episode> {
    let sql = format!("SELECT {} WHERE e.id = ?1", EPISODE_COLUMNS);
    conn.query_row(&sql, params![id], map_episode)
        .optional()?
        .ok_or_else(|| Error::not_found("episode", id))
}

/// Most recent episodes first.
pub fn recent(conn: &Connection, user_id: &str, limit: usize) -> Result<Vec<Episode>> {
    let sql = format!(
        "SELECT {} WHERE e.user_id = ?1 ORDER BY e.seq DESC LIMIT ?2",
        EPISODE_COLUMNS
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let episodes = stmt
        .query_map(params![user_id, limit as i64], map_episode)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(episodes)
}

/// Oldest `limit` episodes not yet consolidated, in sequence order.
pub fn oldest_pending(conn: &Connection, user_id: &str, limit: usize) -> Result<Vec<Episode>> {
    let sql = format!(
        "SELECT {} WHERE e.user_id = ?1 AND c.episode_id IS NULL ORDER BY e.seq ASC LIMIT ?2",
        EPISODE_COLUMNS
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let episodes = stmt
        .query_map(params![user_id, limit as i64], map_episode)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(episodes)
}

pub fn count(conn: &Connection, user_id: &str) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM episodes WHERE user_id = ?1",
        params![user_id],
        |row| row.get(0),
    )?)
}

pub fn count_pending(conn: &Connection, user_id: &str) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM episodes e
         WHERE e.user_id = ?1
           AND NOT EXISTS (SELECT 1 FROM episode_consolidations c WHERE c.episode_id = e.id)",
        params![user_id],
        |row| row.get(0),
    )?)
}

/// Users with at least one unconsolidated episode.
pub fn users_with_pending(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare_cached(
        "SELECT DISTINCT e.user_id FROM episodes e
         WHERE NOT EXISTS (SELECT 1 FROM episode_consolidations c WHERE c.episode_id = e.id)
         ORDER BY e.user_id",
    )?;
    let users = stmt
        .query_map([], |row| row.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(users)
}

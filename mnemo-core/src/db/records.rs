//! Generic record contract: put, get, query and soft delete.
//!
//! All functions take an open connection or transaction so callers can
//! compose several of them into one unit of work.

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::str::FromStr;

use super::{from_millis, json_column, tags_from_json, tags_to_json, to_millis};
use crate::error::{Error, Result};
use crate::index;
use crate::types::{
    Episode, Fact, LongTermRecord, MemoryRecord, NewConcept, NewEpisode, NewFact, NewLongTerm,
    NewMessage, NewProcedure, NewRecord, Order, Procedure, Record, RecordFilter, RecordKind, Role,
    SemanticConcept,
};

/// What `soft_delete` changed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Tombstone {
    pub id: String,
    pub kind: RecordKind,
    pub user_id: Option<String>,
    pub deleted_at: DateTime<Utc>,
    /// True when the record was already tombstoned before this call.
    pub already_deleted: bool,
}

/// SHA-256 of trimmed, lowercased content.
pub fn content_hash(content: &str) -> String {
    let normalized = content.trim().to_lowercase();
    hex::encode(Sha256::digest(normalized.as_bytes()))
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn insert_base(
    conn: &Connection,
    id: &str,
    user_id: Option<&str>,
    kind: RecordKind,
    content: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO records (id, user_id, kind, content, content_hash, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![id, user_id, kind.as_str(), content, content_hash(content), to_millis(now)],
    )?;
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Put
// ─────────────────────────────────────────────────────────────────────────────

/// Insert any record kind together with its index entries. Returns the new id.
pub fn insert(
    conn: &Connection,
    dimension: usize,
    record: &NewRecord,
    now: DateTime<Utc>,
) -> Result<String> {
    record.validate()?;
    match record {
        NewRecord::Message(m) => insert_message(conn, m, now),
        NewRecord::LongTerm(r) => insert_long_term(conn, dimension, r, now),
        NewRecord::Fact(f) => insert_fact(conn, dimension, f, now),
        NewRecord::Episode(e) => insert_episode(conn, e, now),
        NewRecord::Procedure(p) => insert_procedure(conn, p, now),
    }
}

fn insert_message(conn: &Connection, message: &NewMessage, now: DateTime<Utc>) -> Result<String> {
    let id = new_id();
    insert_base(conn, &id, Some(&message.user_id), RecordKind::Message, &message.content, now)?;
    conn.execute(
        "INSERT INTO messages (id, conversation_id, role) VALUES (?1, ?2, ?3)",
        params![id, message.conversation_id, message.role.as_str()],
    )?;
    Ok(id)
}

fn insert_long_term(
    conn: &Connection,
    dimension: usize,
    record: &NewLongTerm,
    now: DateTime<Utc>,
) -> Result<String> {
    let id = new_id();
    insert_base(conn, &id, Some(&record.user_id), RecordKind::LongTerm, &record.summary, now)?;
    conn.execute(
        "INSERT INTO long_term (id, summary, details, source_message_id) VALUES (?1, ?2, ?3, ?4)",
        params![id, record.summary, record.details, record.source_message_id],
    )?;

    let body = if record.details.trim().is_empty() {
        record.summary.clone()
    } else {
        format!("{}\n{}", record.summary, record.details)
    };
    index::index(conn, dimension, &id, &body, &[], record.embedding.as_deref())?;
    Ok(id)
}

fn insert_fact(conn: &Connection, dimension: usize, fact: &NewFact, now: DateTime<Utc>) -> Result<String> {
    let id = new_id();
    insert_base(conn, &id, fact.user_id.as_deref(), RecordKind::Fact, &fact.text, now)?;
    conn.execute(
        "INSERT INTO facts (id, tags_json, confidence) VALUES (?1, ?2, ?3)",
        params![id, tags_to_json(&fact.tags)?, fact.confidence],
    )?;
    index::index(conn, dimension, &id, &fact.text, &fact.tags, fact.embedding.as_deref())?;
    Ok(id)
}

fn insert_episode(conn: &Connection, episode: &NewEpisode, now: DateTime<Utc>) -> Result<String> {
    let id = new_id();
    let seq: i64 = conn.query_row(
        "SELECT COALESCE(MAX(seq), 0) + 1 FROM episodes WHERE user_id = ?1",
        params![episode.user_id],
        |row| row.get(0),
    )?;
    insert_base(conn, &id, Some(&episode.user_id), RecordKind::Episode, &episode.note, now)?;
    conn.execute(
        "INSERT INTO episodes (id, user_id, seq, kind, valence, intensity, tags_json, note)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            id,
            episode.user_id,
            seq,
            episode.kind,
            episode.valence,
            episode.intensity,
            tags_to_json(&episode.tags)?,
            episode.note,
        ],
    )?;
    Ok(id)
}

fn insert_procedure(conn: &Connection, procedure: &NewProcedure, now: DateTime<Utc>) -> Result<String> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM procedures WHERE user_id = ?1 AND name = ?2)",
        params![procedure.user_id, procedure.name],
        |row| row.get(0),
    )?;
    if exists {
        return Err(Error::invalid(format!(
            "procedure '{}' is already registered",
            procedure.name
        )));
    }

    let id = new_id();
    insert_base(conn, &id, Some(&procedure.user_id), RecordKind::Procedure, &procedure.name, now)?;
    conn.execute(
        "INSERT INTO procedures (id, user_id, name, trigger_pattern, steps_json)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            id,
            procedure.user_id,
            procedure.name,
            procedure.trigger_pattern,
            serde_json::to_string(&procedure.steps)?,
        ],
    )?;
    Ok(id)
}

/// Insert a concept produced by consolidation run `consolidation_id`.
pub fn insert_concept(
    conn: &Connection,
    dimension: usize,
    concept: &NewConcept,
    consolidation_id: &str,
    now: DateTime<Utc>,
) -> Result<String> {
    concept.validate()?;
    let id = new_id();
    insert_base(conn, &id, Some(&concept.user_id), RecordKind::Concept, &concept.summary, now)?;
    conn.execute(
        "INSERT INTO concepts (id, summary, confidence, consolidation_id) VALUES (?1, ?2, ?3, ?4)",
        params![id, concept.summary, concept.confidence, consolidation_id],
    )?;

    let mut stmt = conn.prepare_cached(
        "INSERT INTO concept_sources (concept_id, episode_id) VALUES (?1, ?2)",
    )?;
    for episode_id in &concept.source_episode_ids {
        stmt.execute(params![id, episode_id])?;
    }

    index::index(conn, dimension, &id, &concept.summary, &[], concept.embedding.as_deref())?;
    Ok(id)
}

/// Live record of `kind` owned by `user_id` with the same content hash.
pub fn find_by_hash(
    conn: &Connection,
    user_id: Option<&str>,
    kind: RecordKind,
    content: &str,
) -> Result<Option<String>> {
    let id = conn
        .query_row(
            "SELECT id FROM records
             WHERE user_id IS ?1 AND kind = ?2 AND content_hash = ?3 AND deleted_at IS NULL
             ORDER BY created_at DESC LIMIT 1",
            params![user_id, kind.as_str(), content_hash(content)],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id)
}

// ─────────────────────────────────────────────────────────────────────────────
// Get
// ─────────────────────────────────────────────────────────────────────────────

struct BaseRow {
    id: String,
    user_id: Option<String>,
    kind: String,
    content: String,
    created_at: i64,
    deleted_at: Option<i64>,
}

/// Fetch any record by id. Tombstoned records are returned, flagged deleted.
pub fn get(conn: &Connection, id: &str) -> Result<Record> {
    let base = conn
        .query_row(
            "SELECT id, user_id, kind, content, created_at, deleted_at FROM records WHERE id = ?1",
            params![id],
            |row| {
                Ok(BaseRow {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    kind: row.get(2)?,
                    content: row.get(3)?,
                    created_at: row.get(4)?,
                    deleted_at: row.get(5)?,
                })
            },
        )
        .optional()?
        .ok_or_else(|| Error::not_found("record", id))?;

    hydrate(conn, base)
}

fn owner(base: &BaseRow) -> Result<String> {
    base.user_id
        .clone()
        .ok_or_else(|| Error::Corrupt(format!("{} record {} has no owner", base.kind, base.id)))
}

fn hydrate(conn: &Connection, base: BaseRow) -> Result<Record> {
    let created_at = from_millis(base.created_at);
    let deleted_at = base.deleted_at.map(from_millis);

    let record = match RecordKind::from_str(&base.kind)? {
        RecordKind::Message => {
            let (conversation_id, role): (Option<String>, String) = conn.query_row(
                "SELECT conversation_id, role FROM messages WHERE id = ?1",
                params![base.id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            Record::Message(MemoryRecord {
                user_id: owner(&base)?,
                id: base.id,
                conversation_id,
                role: Role::from_str(&role)?,
                content: base.content,
                created_at,
            })
        }
        RecordKind::LongTerm => {
            let (summary, details, source_message_id): (String, String, Option<String>) = conn.query_row(
                "SELECT summary, details, source_message_id FROM long_term WHERE id = ?1",
                params![base.id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?;
            Record::LongTerm(LongTermRecord {
                user_id: owner(&base)?,
                embedding: index::vector::load(conn, &base.id)?,
                id: base.id,
                summary,
                details,
                source_message_id,
                created_at,
                deleted_at,
            })
        }
        RecordKind::Fact => {
            let (tags_json, confidence): (String, f64) = conn.query_row(
                "SELECT tags_json, confidence FROM facts WHERE id = ?1",
                params![base.id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            Record::Fact(Fact {
                embedding: index::vector::load(conn, &base.id)?,
                id: base.id,
                user_id: base.user_id,
                text: base.content,
                tags: tags_from_json(&tags_json)?,
                confidence,
                created_at,
                deleted_at,
            })
        }
        RecordKind::Episode => Record::Episode(super::episodes::get(conn, &base.id)?),
        RecordKind::Concept => {
            let (summary, confidence, consolidation_id): (String, f64, String) = conn.query_row(
                "SELECT summary, confidence, consolidation_id FROM concepts WHERE id = ?1",
                params![base.id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?;
            let mut stmt = conn.prepare_cached(
                "SELECT s.episode_id FROM concept_sources s
                 JOIN episodes e ON e.id = s.episode_id
                 WHERE s.concept_id = ?1 ORDER BY e.seq",
            )?;
            let source_episode_ids = stmt
                .query_map(params![base.id], |row| row.get(0))?
                .collect::<std::result::Result<Vec<String>, _>>()?;
            Record::Concept(SemanticConcept {
                user_id: owner(&base)?,
                embedding: index::vector::load(conn, &base.id)?,
                id: base.id,
                summary,
                confidence,
                source_episode_ids,
                consolidation_id,
                created_at,
                deleted_at,
            })
        }
        RecordKind::Procedure => Record::Procedure(super::procedures::get(conn, &base.id)?),
    };
    Ok(record)
}

/// Map a joined episode row; shared with the episode queries.
pub(crate) fn map_episode(row: &rusqlite::Row<'_>) -> rusqlite::Result<Episode> {
    Ok(Episode {
        id: row.get(0)?,
        user_id: row.get(1)?,
        seq: row.get(2)?,
        kind: row.get(3)?,
        valence: row.get(4)?,
        intensity: row.get(5)?,
        tags: json_column(row, 6)?,
        note: row.get(7)?,
        created_at: from_millis(row.get(8)?),
        consolidated_at: row.get::<_, Option<i64>>(9)?.map(from_millis),
        consolidation_id: row.get(10)?,
    })
}

/// Map a procedure row; shared with the procedure queries.
pub(crate) fn map_procedure(row: &rusqlite::Row<'_>) -> rusqlite::Result<Procedure> {
    Ok(Procedure {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        trigger_pattern: row.get(3)?,
        steps: json_column(row, 4)?,
        success_rate: row.get(5)?,
        usage_count: row.get(6)?,
        success_count: row.get(7)?,
        failure_count: row.get(8)?,
        weighted_success: row.get(9)?,
        weight_total: row.get(10)?,
        last_used_at: row.get::<_, Option<i64>>(11)?.map(from_millis),
        created_at: from_millis(row.get(12)?),
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Query
// ─────────────────────────────────────────────────────────────────────────────

/// Records matching `filter`, newest or oldest first. Tombstones are
/// excluded unless `filter.include_deleted` is set.
pub fn query(conn: &Connection, filter: &RecordFilter, limit: usize, order: Order) -> Result<Vec<Record>> {
    let mut sql = String::from("SELECT id, user_id, kind, content, created_at, deleted_at FROM records WHERE 1 = 1");
    let mut values: Vec<Value> = Vec::new();

    if let Some(user_id) = &filter.user_id {
        values.push(Value::Text(user_id.clone()));
        if filter.include_global {
            sql.push_str(&format!(" AND (user_id = ?{} OR user_id IS NULL)", values.len()));
        } else {
            sql.push_str(&format!(" AND user_id = ?{}", values.len()));
        }
    }

    if !filter.kinds.is_empty() {
        let mut placeholders = Vec::with_capacity(filter.kinds.len());
        for kind in &filter.kinds {
            values.push(Value::Text(kind.as_str().to_string()));
            placeholders.push(format!("?{}", values.len()));
        }
        sql.push_str(&format!(" AND kind IN ({})", placeholders.join(", ")));
    }

    if !filter.include_deleted {
        sql.push_str(" AND deleted_at IS NULL");
    }
    if let Some(since) = filter.since {
        values.push(Value::Integer(to_millis(since)));
        sql.push_str(&format!(" AND created_at >= ?{}", values.len()));
    }
    if let Some(until) = filter.until {
        values.push(Value::Integer(to_millis(until)));
        sql.push_str(&format!(" AND created_at < ?{}", values.len()));
    }

    sql.push_str(match order {
        Order::NewestFirst => " ORDER BY created_at DESC, rowid DESC",
        Order::OldestFirst => " ORDER BY created_at ASC, rowid ASC",
    });
    values.push(Value::Integer(limit as i64));
    sql.push_str(&format!(" LIMIT ?{}", values.len()));

    let mut stmt = conn.prepare(&sql)?;
    let bases = stmt
        .query_map(params_from_iter(values.iter()), |row| {
            Ok(BaseRow {
                id: row.get(0)?,
                user_id: row.get(1)?,
                kind: row.get(2)?,
                content: row.get(3)?,
                created_at: row.get(4)?,
                deleted_at: row.get(5)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    bases.into_iter().map(|base| hydrate(conn, base)).collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Soft delete
// ─────────────────────────────────────────────────────────────────────────────

/// Tombstone a record and drop its index entries in the same transaction.
///
/// Only facts, long-term records and concepts can be tombstoned; episodes are
/// append-only, conversation turns are pruned and procedures are retired by
/// their owner re-registering under a new name.
pub fn soft_delete(conn: &Connection, id: &str, now: DateTime<Utc>) -> Result<Tombstone> {
    let (kind, user_id, deleted_at): (String, Option<String>, Option<i64>) = conn
        .query_row(
            "SELECT kind, user_id, deleted_at FROM records WHERE id = ?1",
            params![id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?
        .ok_or_else(|| Error::not_found("record", id))?;
    let kind = RecordKind::from_str(&kind)?;

    match kind {
        RecordKind::Fact | RecordKind::LongTerm | RecordKind::Concept => {}
        RecordKind::Episode => return Err(Error::invalid("episodes are append-only")),
        other => return Err(Error::invalid(format!("{} records cannot be soft-deleted", other))),
    }

    if let Some(at) = deleted_at {
        return Ok(Tombstone {
            id: id.to_string(),
            kind,
            user_id,
            deleted_at: from_millis(at),
            already_deleted: true,
        });
    }

    conn.execute(
        "UPDATE records SET deleted_at = ?2 WHERE id = ?1",
        params![id, to_millis(now)],
    )?;
    index::remove(conn, id)?;

    Ok(Tombstone {
        id: id.to_string(),
        kind,
        user_id,
        deleted_at: now,
        already_deleted: false,
    })
}

//! Persistence for consolidation passes.
//!
//! A pass commits as one unit: the run row, its concepts (with sources and
//! index entries) and one marker per consumed episode. Markers are inserted
//! conditionally; if any episode already carries one the whole unit fails and
//! the caller's transaction rolls back.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};

use super::{from_millis, records, to_millis};
use crate::error::{Error, Result};
use crate::types::NewConcept;

/// Summary of one committed consolidation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationRun {
    pub id: String,
    pub user_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub episode_count: i64,
    pub concept_count: i64,
    pub concept_ids: Vec<String>,
}

/// Everything one pass writes.
#[derive(Debug, Clone)]
pub struct ConsolidationBatch {
    pub user_id: String,
    pub episode_ids: Vec<String>,
    pub concepts: Vec<NewConcept>,
    pub started_at: DateTime<Utc>,
}

/// Write a pass. Fails with `Invalid` if any episode is already consolidated.
pub fn commit(
    conn: &Connection,
    dimension: usize,
    batch: &ConsolidationBatch,
    now: DateTime<Utc>,
) -> Result<ConsolidationRun> {
    if batch.episode_ids.is_empty() {
        return Err(Error::invalid("consolidation batch has no episodes"));
    }

    let run_id = uuid::Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO consolidation_runs (id, user_id, started_at, finished_at, episode_count, concept_count)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            run_id,
            batch.user_id,
            to_millis(batch.started_at),
            to_millis(now),
            batch.episode_ids.len() as i64,
            batch.concepts.len() as i64,
        ],
    )?;

    let mut concept_ids = Vec::with_capacity(batch.concepts.len());
    for concept in &batch.concepts {
        if concept.user_id != batch.user_id {
            return Err(Error::invalid("concept owner differs from batch owner"));
        }
        concept_ids.push(records::insert_concept(conn, dimension, concept, &run_id, now)?);
    }

    let mut mark = conn.prepare_cached(
        "INSERT INTO episode_consolidations (episode_id, consolidation_id, consolidated_at)
         SELECT e.id, ?2, ?3 FROM episodes e
         WHERE e.id = ?1 AND e.user_id = ?4
           AND NOT EXISTS (SELECT 1 FROM episode_consolidations c WHERE c.episode_id = e.id)",
    )?;
    for episode_id in &batch.episode_ids {
        let marked = mark.execute(params![episode_id, run_id, to_millis(now), batch.user_id])?;
        if marked == 0 {
            return Err(Error::invalid(format!(
                "episode {} is already consolidated or not owned by {}",
                episode_id, batch.user_id
            )));
        }
    }

    Ok(ConsolidationRun {
        id: run_id,
        user_id: batch.user_id.clone(),
        started_at: batch.started_at,
        finished_at: now,
        episode_count: batch.episode_ids.len() as i64,
        concept_count: concept_ids.len() as i64,
        concept_ids,
    })
}

/// Most recent pass for `user_id`.
pub fn last_run(conn: &Connection, user_id: &str) -> Result<Option<ConsolidationRun>> {
    let run = conn
        .query_row(
            "SELECT id, user_id, started_at, finished_at, episode_count, concept_count
             FROM consolidation_runs WHERE user_id = ?1
             ORDER BY finished_at DESC, rowid DESC LIMIT 1",
            params![user_id],
            |row| {
                Ok(ConsolidationRun {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    started_at: from_millis(row.get(2)?),
                    finished_at: from_millis(row.get(3)?),
                    episode_count: row.get(4)?,
                    concept_count: row.get(5)?,
                    concept_ids: Vec::new(),
                })
            },
        )
        .optional()?;

    match run {
        Some(mut run) => {
            let mut stmt = conn.prepare_cached(
                "SELECT id FROM concepts WHERE consolidation_id = ?1 ORDER BY rowid",
            )?;
            run.concept_ids = stmt
                .query_map(params![run.id], |row| row.get(0))?
                .collect::<std::result::Result<Vec<String>, _>>()?;
            Ok(Some(run))
        }
        None => Ok(None),
    }
}

pub fn run_count(conn: &Connection, user_id: &str) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM consolidation_runs WHERE user_id = ?1",
        params![user_id],
        |row| row.get(0),
    )?)
}

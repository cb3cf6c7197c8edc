//! Procedure rows and their invocation log.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use super::records::map_procedure;
use super::to_millis;
use crate::error::{Error, Result};
use crate::types::Procedure;

const PROCEDURE_COLUMNS: &str = "p.id, p.user_id, p.name, p.trigger_pattern, p.steps_json,
     p.success_rate, p.usage_count, p.success_count, p.failure_count,
     p.weighted_success, p.weight_total, p.last_used_at, r.created_at
     FROM procedures p JOIN records r ON r.id = p.id";

/// New running totals for a procedure after one invocation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutcomeUpdate {
    pub success: bool,
    pub weighted_success: f64,
    pub weight_total: f64,
    pub success_rate: f64,
}

pub fn get(conn: &Connection, id: &str) -> Result<Procedure> {
    let sql = format!("SELECT {} WHERE p.id = ?1", PROCEDURE_COLUMNS);
    conn.query_row(&sql, params![id], map_procedure)
        .optional()?
        .ok_or_else(|| Error::not_found("procedure", id))
}

pub fn get_by_name(conn: &Connection, user_id: &str, name: &str) -> Result<Procedure> {
    let sql = format!("SELECT {} WHERE p.user_id = ?1 AND p.name = ?2", PROCEDURE_COLUMNS);
    conn.query_row(&sql, params![user_id, name], map_procedure)
        .optional()?
        .ok_or_else(|| Error::not_found("procedure", name))
}

/// All procedures of a user, best success rate first.
pub fn list(conn: &Connection, user_id: &str) -> Result<Vec<Procedure>> {
    let sql = format!(
        "SELECT {} WHERE p.user_id = ?1
         ORDER BY p.success_rate DESC, p.usage_count DESC, p.name ASC",
        PROCEDURE_COLUMNS
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let procedures = stmt
        .query_map(params![user_id], map_procedure)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(procedures)
}

/// Store new running totals and append the invocation to the log.
pub fn apply_outcome(
    conn: &Connection,
    id: &str,
    update: &OutcomeUpdate,
    now: DateTime<Utc>,
) -> Result<Procedure> {
    let changed = conn.execute(
        "UPDATE procedures SET
            weighted_success = ?2,
            weight_total = ?3,
            success_rate = ?4,
            usage_count = usage_count + 1,
            success_count = success_count + ?5,
            failure_count = failure_count + ?6,
            last_used_at = ?7
         WHERE id = ?1",
        params![
            id,
            update.weighted_success,
            update.weight_total,
            update.success_rate,
            update.success as i64,
            (!update.success) as i64,
            to_millis(now),
        ],
    )?;
    if changed == 0 {
        return Err(Error::not_found("procedure", id));
    }

    conn.execute(
        "INSERT INTO procedure_invocations (procedure_id, success, recorded_at) VALUES (?1, ?2, ?3)",
        params![id, update.success, to_millis(now)],
    )?;

    get(conn, id)
}

/// Logged outcomes for a procedure, oldest first.
pub fn invocations(conn: &Connection, id: &str) -> Result<Vec<bool>> {
    let mut stmt = conn.prepare_cached(
        "SELECT success FROM procedure_invocations WHERE procedure_id = ?1 ORDER BY id",
    )?;
    let outcomes = stmt
        .query_map(params![id], |row| row.get(0))?
        .collect::<std::result::Result<Vec<bool>, _>>()?;
    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::records;
    use crate::db::test_support::open_temp;
    use crate::types::{NewProcedure, NewRecord};

    #[test]
    fn test_apply_outcome_updates_counters_and_log() {
        let (_dir, db) = open_temp();
        let id = db
            .write(None, |tx| {
                records::insert(
                    tx,
                    4,
                    &NewRecord::Procedure(NewProcedure {
                        user_id: "u1".into(),
                        name: "restart".into(),
                        trigger_pattern: "(?i)restart".into(),
                        steps: vec!["stop".into(), "start".into()],
                    }),
                    Utc::now(),
                )
            })
            .unwrap();

        let update = OutcomeUpdate {
            success: false,
            weighted_success: 0.0,
            weight_total: 1.0,
            success_rate: 0.0,
        };
        let procedure = db.write(None, |tx| apply_outcome(tx, &id, &update, Utc::now())).unwrap();
        assert_eq!(procedure.usage_count, 1);
        assert_eq!(procedure.failure_count, 1);
        assert!(procedure.last_used_at.is_some());
        assert_eq!(procedure.steps, vec!["stop".to_string(), "start".to_string()]);

        assert_eq!(db.read(|conn| invocations(conn, &id)).unwrap(), vec![false]);
        assert_eq!(db.read(|conn| get_by_name(conn, "u1", "restart")).unwrap().id, id);
        assert!(db.read(|conn| get_by_name(conn, "u2", "restart")).unwrap_err().is_not_found());
    }
}

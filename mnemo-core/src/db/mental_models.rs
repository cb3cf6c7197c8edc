//! Per-user mental model entries.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use super::{from_millis, to_millis};
use crate::error::Result;
use crate::types::{MentalModel, MentalModelEntry};

fn map_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, String, f64, i64)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn decode(raw: (String, String, f64, i64)) -> Result<MentalModelEntry> {
    let (key, value_json, confidence, updated_at) = raw;
    Ok(MentalModelEntry {
        key,
        value: serde_json::from_str(&value_json)?,
        confidence,
        updated_at: from_millis(updated_at),
    })
}

pub fn load(conn: &Connection, user_id: &str) -> Result<MentalModel> {
    let mut stmt = conn.prepare_cached(
        "SELECT key, value_json, confidence, updated_at FROM mental_models
         WHERE user_id = ?1 ORDER BY key",
    )?;
    let rows = stmt
        .query_map(params![user_id], map_entry)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut model = MentalModel {
        user_id: user_id.to_string(),
        ..Default::default()
    };
    for raw in rows {
        let entry = decode(raw)?;
        model.entries.insert(entry.key.clone(), entry);
    }
    Ok(model)
}

pub fn get_entry(conn: &Connection, user_id: &str, key: &str) -> Result<Option<MentalModelEntry>> {
    let raw = conn
        .query_row(
            "SELECT key, value_json, confidence, updated_at FROM mental_models
             WHERE user_id = ?1 AND key = ?2",
            params![user_id, key],
            map_entry,
        )
        .optional()?;
    raw.map(decode).transpose()
}

/// Unconditional upsert; the confidence gate is applied by the caller.
pub fn put_entry(
    conn: &Connection,
    user_id: &str,
    key: &str,
    value: &serde_json::Value,
    confidence: f64,
    now: DateTime<Utc>,
) -> Result<MentalModelEntry> {
    conn.execute(
        "INSERT INTO mental_models (user_id, key, value_json, confidence, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(user_id, key) DO UPDATE SET
            value_json = excluded.value_json,
            confidence = excluded.confidence,
            updated_at = excluded.updated_at",
        params![user_id, key, serde_json::to_string(value)?, confidence, to_millis(now)],
    )?;
    Ok(MentalModelEntry {
        key: key.to_string(),
        value: value.clone(),
        confidence,
        updated_at: now,
    })
}

pub fn key_count(conn: &Connection, user_id: &str) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM mental_models WHERE user_id = ?1",
        params![user_id],
        |row| row.get(0),
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::open_temp;
    use serde_json::json;

    #[test]
    fn test_upsert_and_load() {
        let (_dir, db) = open_temp();
        db.write(None, |tx| {
            put_entry(tx, "u1", "tone", &json!("formal"), 0.4, Utc::now())?;
            put_entry(tx, "u1", "tone", &json!("casual"), 0.7, Utc::now())?;
            put_entry(tx, "u1", "langs", &json!(["pl", "en"]), 0.9, Utc::now())
        })
        .unwrap();

        let model = db.read(|conn| load(conn, "u1")).unwrap();
        assert_eq!(model.len(), 2);
        assert_eq!(model.get("tone").unwrap().value, json!("casual"));
        assert_eq!(db.read(|conn| key_count(conn, "u1")).unwrap(), 2);
        assert!(db.read(|conn| get_entry(conn, "u2", "tone")).unwrap().is_none());
    }
}

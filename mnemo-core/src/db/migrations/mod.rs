//! Memory store database migrations
//!
//! SQL migrations are embedded as strings and executed when the store opens.

use rusqlite::{Connection, OptionalExtension, params};

use crate::error::{Error, Result};

/// Memory tables SQL (001)
pub const MEMORY_TABLES_SQL: &str = include_str!("001_memory_tables.sql");

/// Schema version written by this build.
pub const SCHEMA_VERSION: i64 = 1;

/// Run all memory migrations
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current = schema_version(conn)?;
    if current > SCHEMA_VERSION {
        return Err(Error::invalid(format!(
            "store schema version {} is newer than supported version {}",
            current, SCHEMA_VERSION
        )));
    }

    conn.execute_batch(MEMORY_TABLES_SQL)?;
    conn.execute(
        "INSERT INTO store_meta (key, value) VALUES ('schema_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![SCHEMA_VERSION.to_string()],
    )?;

    if current < SCHEMA_VERSION {
        tracing::info!(from = current, to = SCHEMA_VERSION, "Applied store migrations");
    }
    Ok(())
}

/// Schema version recorded in the store, 0 for a fresh file.
pub fn schema_version(conn: &Connection) -> Result<i64> {
    let has_meta: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'store_meta')",
        [],
        |row| row.get(0),
    )?;
    if !has_meta {
        return Ok(0);
    }

    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM store_meta WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;

    Ok(value.and_then(|v| v.parse().ok()).unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();
        assert_eq!(schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_episode_rows_reject_updates() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn.execute_batch(
            "INSERT INTO records (id, user_id, kind, content, content_hash, created_at)
             VALUES ('e1', 'u1', 'episode', 'note', 'h', 1);
             INSERT INTO episodes (id, user_id, seq, kind, valence, intensity, tags_json, note)
             VALUES ('e1', 'u1', 1, 'chat', 0.0, 0.5, '[]', 'note');",
        )
        .unwrap();

        assert!(conn.execute("UPDATE episodes SET note = 'edited' WHERE id = 'e1'", []).is_err());
        assert!(conn.execute("DELETE FROM records WHERE id = 'e1'", []).is_err());
        assert!(conn.execute("UPDATE records SET deleted_at = 5 WHERE id = 'e1'", []).is_err());
    }
}

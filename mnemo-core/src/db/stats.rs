use rusqlite::{Connection, params};

use super::{consolidation, episodes, mental_models};
use crate::error::Result;
use crate::types::StoreStats;

/// Per-user counters. Global facts are counted under every user.
pub fn for_user(conn: &Connection, user_id: &str) -> Result<StoreStats> {
    let mut stats = StoreStats::default();

    let mut stmt = conn.prepare_cached(
        "SELECT kind, COUNT(*) FROM records
         WHERE (user_id = ?1 OR user_id IS NULL) AND deleted_at IS NULL
         GROUP BY kind",
    )?;
    let rows = stmt
        .query_map(params![user_id], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    stats.count_by_kind.extend(rows);

    stats.tombstones = conn.query_row(
        "SELECT COUNT(*) FROM records WHERE (user_id = ?1 OR user_id IS NULL) AND deleted_at IS NOT NULL",
        params![user_id],
        |row| row.get(0),
    )?;
    stats.pending_episodes = episodes::count_pending(conn, user_id)?;
    stats.consolidation_runs = consolidation::run_count(conn, user_id)?;
    stats.last_consolidation_at = consolidation::last_run(conn, user_id)?.map(|run| run.finished_at);
    stats.mental_model_keys = mental_models::key_count(conn, user_id)?;

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::records;
    use crate::db::test_support::open_temp;
    use crate::types::{NewFact, NewRecord};
    use chrono::Utc;

    #[test]
    fn test_stats_count_tombstones() {
        let (_dir, db) = open_temp();
        let id = db
            .write(None, |tx| {
                let fact = |text: &str| {
                    NewRecord::Fact(NewFact {
                        user_id: Some("u1".into()),
                        text: text.into(),
                        tags: vec![],
                        confidence: 1.0,
                        embedding: None,
                    })
                };
                records::insert(tx, 4, &fact("kept"), Utc::now())?;
                records::insert(tx, 4, &fact("dropped"), Utc::now())
            })
            .unwrap();
        db.write(None, |tx| records::soft_delete(tx, &id, Utc::now())).unwrap();

        let stats = db.read(|conn| for_user(conn, "u1")).unwrap();
        assert_eq!(stats.count_by_kind.get("fact"), Some(&1));
        assert_eq!(stats.tombstones, 1);
        assert_eq!(stats.pending_episodes, 0);
        assert!(stats.last_consolidation_at.is_none());
    }
}

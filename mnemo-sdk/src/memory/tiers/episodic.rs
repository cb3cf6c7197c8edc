//! Episodic tier: the append-only log of what happened to each user.

use chrono::Utc;
use mnemo_core::db::{episodes, records};
use mnemo_core::types::{Episode, NewEpisode, NewRecord};
use mnemo_core::{CancelToken, Store};

use crate::SDKResult;

#[derive(Debug, Clone)]
pub struct EpisodicMemory {
    store: Store,
}

impl EpisodicMemory {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Append an episode. Its per-user sequence number is assigned in the
    /// same transaction.
    pub async fn add(&self, episode: NewEpisode, cancel: Option<CancelToken>) -> SDKResult<Episode> {
        episode.validate()?;
        let dimension = self.store.dimension();
        let record = NewRecord::Episode(episode);

        let stored = self
            .store
            .write(cancel, move |tx| {
                let id = records::insert(tx, dimension, &record, Utc::now())?;
                episodes::get(tx, &id)
            })
            .await?;

        tracing::debug!(user_id = %stored.user_id, seq = stored.seq, kind = %stored.kind, "Episode recorded");
        Ok(stored)
    }

    pub async fn get(&self, id: &str) -> SDKResult<Episode> {
        let id = id.to_string();
        Ok(self.store.read(move |conn| episodes::get(conn, &id)).await?)
    }

    /// Latest episodes first.
    pub async fn get_recent(&self, user_id: &str, limit: usize) -> SDKResult<Vec<Episode>> {
        let user_id = user_id.to_string();
        Ok(self
            .store
            .read(move |conn| episodes::recent(conn, &user_id, limit))
            .await?)
    }

    pub async fn count(&self, user_id: &str) -> SDKResult<i64> {
        let user_id = user_id.to_string();
        Ok(self.store.read(move |conn| episodes::count(conn, &user_id)).await?)
    }

    pub async fn count_pending(&self, user_id: &str) -> SDKResult<i64> {
        let user_id = user_id.to_string();
        Ok(self
            .store
            .read(move |conn| episodes::count_pending(conn, &user_id))
            .await?)
    }

    /// Oldest unconsolidated episodes, in sequence order.
    pub async fn oldest_pending(&self, user_id: &str, limit: usize) -> SDKResult<Vec<Episode>> {
        let user_id = user_id.to_string();
        Ok(self
            .store
            .read(move |conn| episodes::oldest_pending(conn, &user_id, limit))
            .await?)
    }

    pub async fn users_with_pending(&self) -> SDKResult<Vec<String>> {
        Ok(self.store.read(episodes::users_with_pending).await?)
    }
}

//! Conversation tier: short-term turns and long-term records.
//!
//! Turns are kept inside a per-user window and a time-to-live; anything
//! worth keeping is promoted to a long-term record, which is indexed for
//! recall.

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;

use mnemo_core::db::{messages, records};
use mnemo_core::types::{LongTermRecord, MemoryRecord, NewLongTerm, NewMessage, NewRecord, Record, RecordKind};
use mnemo_core::{CancelToken, Store};

use crate::config::MemoryConfig;
use crate::memory::embeddings::Embedder;
use crate::{SDKError, SDKResult};

#[derive(Clone)]
pub struct ConversationMemory {
    store: Store,
    embedder: Arc<dyn Embedder>,
    window: usize,
    ttl_secs: u64,
    auto_prune: bool,
}

fn expect_message(record: Record) -> SDKResult<MemoryRecord> {
    match record {
        Record::Message(message) => Ok(message),
        other => Err(SDKError::not_found("message", other.id())),
    }
}

fn expect_long_term(record: Record) -> SDKResult<LongTermRecord> {
    match record {
        Record::LongTerm(long_term) => Ok(long_term),
        other => Err(SDKError::not_found("long_term", other.id())),
    }
}

impl ConversationMemory {
    pub fn new(store: Store, embedder: Arc<dyn Embedder>, config: &MemoryConfig) -> Self {
        Self {
            store,
            embedder,
            window: config.stm_window,
            ttl_secs: config.stm_ttl_secs,
            auto_prune: config.auto_prune,
        }
    }

    fn cutoff(&self) -> Option<chrono::DateTime<Utc>> {
        let ttl = i64::try_from(self.ttl_secs).ok()?;
        Utc::now().checked_sub_signed(ChronoDuration::seconds(ttl))
    }

    /// Append a turn, pruning the user's window in the same transaction.
    pub async fn append(&self, message: NewMessage, cancel: Option<CancelToken>) -> SDKResult<MemoryRecord> {
        message.validate()?;
        let dimension = self.store.dimension();
        let prune = self.auto_prune.then_some((self.window, self.cutoff()));
        let user_id = message.user_id.clone();
        let record = NewRecord::Message(message);

        let (stored, pruned) = self
            .store
            .write(cancel, move |tx| {
                let id = records::insert(tx, dimension, &record, Utc::now())?;
                let pruned = match prune {
                    Some((window, cutoff)) => messages::prune(tx, &user_id, window, cutoff)?,
                    None => 0,
                };
                Ok((records::get(tx, &id)?, pruned))
            })
            .await?;

        if pruned > 0 {
            tracing::debug!(pruned, "Pruned conversation turns");
        }
        expect_message(stored)
    }

    /// Latest `limit` turns in chronological order.
    pub async fn context(
        &self,
        user_id: &str,
        conversation_id: Option<&str>,
        limit: usize,
    ) -> SDKResult<Vec<MemoryRecord>> {
        let user_id = user_id.to_string();
        let conversation_id = conversation_id.map(str::to_string);
        Ok(self
            .store
            .read(move |conn| messages::context(conn, &user_id, conversation_id.as_deref(), limit))
            .await?)
    }

    /// Apply the window and TTL policies now.
    pub async fn prune(&self, user_id: &str, cancel: Option<CancelToken>) -> SDKResult<usize> {
        let user_id = user_id.to_string();
        let (window, cutoff) = (self.window, self.cutoff());
        let pruned = self
            .store
            .write(cancel, move |tx| messages::prune(tx, &user_id, window, cutoff))
            .await?;
        tracing::debug!(pruned, "Conversation pruned");
        Ok(pruned)
    }

    /// Copy a turn into long-term memory. Promoting the same text twice
    /// returns the existing record.
    pub async fn promote(
        &self,
        user_id: &str,
        message_id: &str,
        cancel: Option<CancelToken>,
    ) -> SDKResult<LongTermRecord> {
        let id = message_id.to_string();
        let message = expect_message(self.store.read(move |conn| records::get(conn, &id)).await?)?;
        if message.user_id != user_id {
            return Err(SDKError::not_found("message", message_id));
        }

        let embedding = self.embedder.embed(&message.content).await?;
        let dimension = self.store.dimension();
        let new_record = NewLongTerm {
            user_id: message.user_id.clone(),
            summary: message.content.clone(),
            details: String::new(),
            embedding: Some(embedding),
            source_message_id: Some(message.id.clone()),
        };

        let stored = self
            .store
            .write(cancel, move |tx| {
                let existing =
                    records::find_by_hash(tx, Some(&new_record.user_id), RecordKind::LongTerm, &new_record.summary)?;
                let id = match existing {
                    Some(id) => id,
                    None => records::insert(tx, dimension, &NewRecord::LongTerm(new_record), Utc::now())?,
                };
                records::get(tx, &id)
            })
            .await?;

        tracing::info!(message_id, "Promoted conversation turn to long-term memory");
        expect_long_term(stored)
    }

    /// Write a long-term record directly.
    pub async fn learn(
        &self,
        user_id: &str,
        summary: &str,
        details: &str,
        cancel: Option<CancelToken>,
    ) -> SDKResult<LongTermRecord> {
        let text = if details.trim().is_empty() {
            summary.to_string()
        } else {
            format!("{}\n{}", summary, details)
        };
        let embedding = self.embedder.embed(&text).await?;
        let record = NewRecord::LongTerm(NewLongTerm {
            user_id: user_id.to_string(),
            summary: summary.to_string(),
            details: details.to_string(),
            embedding: Some(embedding),
            source_message_id: None,
        });
        record.validate()?;

        let dimension = self.store.dimension();
        let stored = self
            .store
            .write(cancel, move |tx| {
                let id = records::insert(tx, dimension, &record, Utc::now())?;
                records::get(tx, &id)
            })
            .await?;
        expect_long_term(stored)
    }

    pub async fn count(&self, user_id: &str) -> SDKResult<i64> {
        let user_id = user_id.to_string();
        Ok(self.store.read(move |conn| messages::count(conn, &user_id)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::tiers::test_support::{embedder, open_store};
    use mnemo_core::types::Role;

    fn turn(user: &str, content: &str) -> NewMessage {
        NewMessage {
            user_id: user.into(),
            conversation_id: Some("c1".into()),
            role: Role::User,
            content: content.into(),
        }
    }

    fn tier(store: Store, window: usize) -> ConversationMemory {
        let config = MemoryConfig {
            stm_window: window,
            ..Default::default()
        };
        ConversationMemory::new(store, embedder(), &config)
    }

    #[tokio::test]
    async fn test_window_is_enforced_on_append() {
        let (_dir, store) = open_store().await;
        let tier = tier(store, 3);
        for i in 0..5 {
            tier.append(turn("u1", &format!("turn {}", i)), None).await.unwrap();
        }

        let context = tier.context("u1", None, 10).await.unwrap();
        let contents: Vec<&str> = context.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["turn 2", "turn 3", "turn 4"]);
        assert_eq!(tier.count("u1").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_promote_is_idempotent_and_owned() {
        let (_dir, store) = open_store().await;
        let tier = tier(store.clone(), 10);
        let message = tier.append(turn("u1", "I prefer window seats"), None).await.unwrap();

        let first = tier.promote("u1", &message.id, None).await.unwrap();
        let second = tier.promote("u1", &message.id, None).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.source_message_id.as_deref(), Some(message.id.as_str()));
        assert!(first.embedding.is_some());

        let err = tier.promote("u2", &message.id, None).await.unwrap_err();
        assert!(err.is_not_found());

        let hits = store.search_lexical("u1", "window seats", 5).await.unwrap();
        assert_eq!(hits[0].id, first.id);
    }

    #[tokio::test]
    async fn test_learn_indexes_details() {
        let (_dir, store) = open_store().await;
        let tier = tier(store.clone(), 10);
        let learned = tier
            .learn("u1", "Deploy checklist", "run migrations before switching traffic", None)
            .await
            .unwrap();

        let hits = store.search_lexical("u1", "migrations", 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, learned.id);
    }
}

//! Fact tier.
//!
//! Facts belong to one user or, when global, to nobody. Deleting a fact
//! leaves a tombstone: it drops out of recall but stays fetchable by id.

use chrono::Utc;
use std::sync::Arc;

use mnemo_core::db::records::{self, Tombstone};
use mnemo_core::types::{Fact, NewRecord, Order, Record, RecordFilter, RecordKind};
use mnemo_core::{CancelToken, Store};

use crate::memory::embeddings::Embedder;
use crate::memory::types::RememberInput;
use crate::{SDKError, SDKResult};

#[derive(Clone)]
pub struct FactMemory {
    store: Store,
    embedder: Arc<dyn Embedder>,
}

impl FactMemory {
    pub fn new(store: Store, embedder: Arc<dyn Embedder>) -> Self {
        Self { store, embedder }
    }

    /// Store a fact with its embedding and index entries.
    pub async fn add(&self, input: RememberInput, cancel: Option<CancelToken>) -> SDKResult<Fact> {
        let embedding = self.embedder.embed(&input.text).await?;
        let embedding = (!embedding.iter().all(|v| *v == 0.0)).then_some(embedding);
        let record = NewRecord::Fact(input.into_new_fact(embedding));
        record.validate()?;

        let dimension = self.store.dimension();
        let stored = self
            .store
            .write(cancel, move |tx| {
                let id = records::insert(tx, dimension, &record, Utc::now())?;
                records::get(tx, &id)
            })
            .await?;

        match stored {
            Record::Fact(fact) => {
                tracing::debug!(record_id = %fact.id, global = fact.is_global(), "Fact stored");
                Ok(fact)
            }
            other => Err(SDKError::not_found("fact", other.id())),
        }
    }

    /// Any record visible to `user_id`, tombstones included.
    pub async fn get_by_id(&self, user_id: &str, id: &str) -> SDKResult<Record> {
        let key = id.to_string();
        let record = self.store.read(move |conn| records::get(conn, &key)).await?;
        if !record.visible_to(user_id) {
            return Err(SDKError::not_found("record", id));
        }
        Ok(record)
    }

    /// Tombstone a record owned by `owner` (`None` for global facts).
    ///
    /// The ownership check and the tombstone share one transaction.
    pub async fn soft_delete(&self, owner: Option<&str>, id: &str, cancel: Option<CancelToken>) -> SDKResult<Tombstone> {
        let owner = owner.map(str::to_string);
        let key = id.to_string();
        let tombstone = self
            .store
            .write(cancel, move |tx| {
                let record = records::get(tx, &key)?;
                if record.user_id() != owner.as_deref() {
                    return Err(mnemo_core::Error::not_found("record", &key));
                }
                records::soft_delete(tx, &key, Utc::now())
            })
            .await?;

        if !tombstone.already_deleted {
            tracing::info!(record_id = %tombstone.id, kind = %tombstone.kind, "Record tombstoned");
        }
        Ok(tombstone)
    }

    /// Newest live facts visible to `user_id`.
    pub async fn list(&self, user_id: &str, limit: usize) -> SDKResult<Vec<Fact>> {
        let filter = RecordFilter::for_user(user_id).kinds(&[RecordKind::Fact]);
        let facts = self
            .store
            .read(move |conn| records::query(conn, &filter, limit, Order::NewestFirst))
            .await?
            .into_iter()
            .filter_map(|record| match record {
                Record::Fact(fact) => Some(fact),
                _ => None,
            })
            .collect();
        Ok(facts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::tiers::test_support::{embedder, open_store};

    #[tokio::test]
    async fn test_add_and_get() {
        let (_dir, store) = open_store().await;
        let tier = FactMemory::new(store, embedder());

        let fact = tier
            .add(RememberInput::new("u1", "Warsaw is the capital of Poland").with_tags(["geo"]), None)
            .await
            .unwrap();
        assert_eq!(fact.user_id.as_deref(), Some("u1"));
        assert!(fact.embedding.is_some());

        let record = tier.get_by_id("u1", &fact.id).await.unwrap();
        assert_eq!(record.text(), "Warsaw is the capital of Poland");

        let err = tier.get_by_id("u2", &fact.id).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_global_fact_visible_to_all() {
        let (_dir, store) = open_store().await;
        let tier = FactMemory::new(store, embedder());
        let fact = tier
            .add(RememberInput::new("ops", "water boils at 100C").global(), None)
            .await
            .unwrap();

        assert!(tier.get_by_id("anyone", &fact.id).await.is_ok());
        assert_eq!(tier.list("someone-else", 10).await.unwrap().len(), 1);

        // A user cannot tombstone a global fact.
        assert!(tier.soft_delete(Some("anyone"), &fact.id, None).await.is_err());
        assert!(tier.soft_delete(None, &fact.id, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_soft_delete_keeps_tombstone() {
        let (_dir, store) = open_store().await;
        let tier = FactMemory::new(store.clone(), embedder());
        let fact = tier.add(RememberInput::new("u1", "the cat is named Miso"), None).await.unwrap();

        let tombstone = tier.soft_delete(Some("u1"), &fact.id, None).await.unwrap();
        assert!(!tombstone.already_deleted);
        let again = tier.soft_delete(Some("u1"), &fact.id, None).await.unwrap();
        assert!(again.already_deleted);

        let record = tier.get_by_id("u1", &fact.id).await.unwrap();
        assert!(record.is_deleted());
        assert!(tier.list("u1", 10).await.unwrap().is_empty());
        assert!(store.search_lexical("u1", "Miso", 5).await.unwrap().is_empty());
        assert!(store.verify_index().await.unwrap().is_clean());
    }
}

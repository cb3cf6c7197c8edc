//! Async facade over [`Database`].
//!
//! Every call runs on the blocking pool so request tasks never stall the
//! executor while SQLite waits on a lock or the disk. A call made inside a
//! [`WorkLease`] scope keeps the lease until the blocking call returns.

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{Connection, Transaction};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cancel::CancelToken;
use crate::db::records::{self, Tombstone};
use crate::db::{CheckpointReport, Database, StoreOptions, VectorManifest, stats};
use crate::error::Result;
use crate::index::{self, IndexReport, ScoredId};
use crate::lease::WorkLease;
use crate::types::{NewRecord, Order, Record, RecordFilter, StoreStats};

/// Generic record contract shared by every tier.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn put(&self, record: NewRecord, cancel: Option<CancelToken>) -> Result<String>;

    /// Fetch by id; tombstones are returned flagged deleted.
    async fn get(&self, id: &str) -> Result<Record>;

    async fn query(&self, filter: RecordFilter, limit: usize, order: Order) -> Result<Vec<Record>>;

    async fn soft_delete(&self, id: &str, cancel: Option<CancelToken>) -> Result<Tombstone>;

    async fn checkpoint(&self) -> Result<CheckpointReport>;
}

/// Clonable handle to the shared store.
#[derive(Debug, Clone)]
pub struct Store {
    db: Arc<Database>,
}

impl Store {
    pub async fn open(root: impl AsRef<Path>, options: StoreOptions) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let db = tokio::task::spawn_blocking(move || Database::open(root, options)).await??;
        Ok(Self { db: Arc::new(db) })
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn root(&self) -> &Path {
        self.db.root()
    }

    pub fn dimension(&self) -> usize {
        self.db.dimension()
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
    {
        let db = self.db.clone();
        let lease = WorkLease::current();
        tokio::task::spawn_blocking(move || {
            let _lease = lease;
            f(&db)
        })
        .await?
    }

    /// Run a read closure on a pooled reader.
    pub async fn read<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        self.blocking(move |db| db.read(f)).await
    }

    /// Run a write closure as one transaction, rolled back if `cancel` fires first.
    pub async fn write<T, F>(&self, cancel: Option<CancelToken>, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Transaction<'_>) -> Result<T> + Send + 'static,
    {
        self.blocking(move |db| db.write(cancel.as_ref(), f)).await
    }

    pub async fn search_lexical(&self, user_id: &str, query: &str, limit: usize) -> Result<Vec<ScoredId>> {
        let (user_id, query) = (user_id.to_string(), query.to_string());
        self.read(move |conn| index::lexical::search(conn, &user_id, &query, limit))
            .await
    }

    pub async fn search_semantic(&self, user_id: &str, vector: Vec<f32>, limit: usize) -> Result<Vec<ScoredId>> {
        let user_id = user_id.to_string();
        let dimension = self.dimension();
        self.read(move |conn| index::vector::search(conn, &user_id, dimension, &vector, limit))
            .await
    }

    pub async fn verify_index(&self) -> Result<IndexReport> {
        self.read(index::verify).await
    }

    pub async fn stats(&self, user_id: &str) -> Result<StoreStats> {
        let user_id = user_id.to_string();
        self.read(move |conn| stats::for_user(conn, &user_id)).await
    }

    pub async fn backup(&self) -> Result<PathBuf> {
        self.blocking(|db| db.backup()).await
    }

    pub async fn restore(&self, snapshot: impl AsRef<Path>) -> Result<CheckpointReport> {
        let snapshot = snapshot.as_ref().to_path_buf();
        self.blocking(move |db| db.restore(snapshot)).await
    }

    pub async fn list_backups(&self) -> Result<Vec<PathBuf>> {
        self.blocking(|db| db.list_backups()).await
    }

    pub async fn integrity_check(&self) -> Result<()> {
        self.blocking(|db| db.integrity_check()).await
    }

    pub fn manifest(&self) -> Result<VectorManifest> {
        self.db.manifest()
    }
}

#[async_trait]
impl RecordStore for Store {
    async fn put(&self, record: NewRecord, cancel: Option<CancelToken>) -> Result<String> {
        record.validate()?;
        let dimension = self.dimension();
        let id = self
            .write(cancel, move |tx| records::insert(tx, dimension, &record, Utc::now()))
            .await?;
        tracing::debug!(record_id = %id, "Stored record");
        Ok(id)
    }

    async fn get(&self, id: &str) -> Result<Record> {
        let id = id.to_string();
        self.read(move |conn| records::get(conn, &id)).await
    }

    async fn query(&self, filter: RecordFilter, limit: usize, order: Order) -> Result<Vec<Record>> {
        self.read(move |conn| records::query(conn, &filter, limit, order))
            .await
    }

    async fn soft_delete(&self, id: &str, cancel: Option<CancelToken>) -> Result<Tombstone> {
        let id = id.to_string();
        self.write(cancel, move |tx| records::soft_delete(tx, &id, Utc::now()))
            .await
    }

    async fn checkpoint(&self) -> Result<CheckpointReport> {
        self.blocking(|db| db.checkpoint()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NewFact, RecordKind};
    use std::time::Duration;
    use tempfile::TempDir;

    async fn open() -> (TempDir, Store) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(
            dir.path(),
            StoreOptions {
                busy_timeout: Duration::from_secs(5),
                pool_size: 4,
                embedding_model: "test".into(),
                embedding_dimension: 4,
            },
        )
        .await
        .unwrap();
        (dir, store)
    }

    fn fact(text: &str) -> NewRecord {
        NewRecord::Fact(NewFact {
            user_id: Some("u1".into()),
            text: text.into(),
            tags: vec![],
            confidence: 0.5,
            embedding: None,
        })
    }

    #[tokio::test]
    async fn test_concurrent_puts_all_land() {
        let (_dir, store) = open().await;
        let mut handles = Vec::new();
        for i in 0..32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.put(fact(&format!("concurrent fact {}", i)), None).await
            }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().unwrap());
        }
        for id in &ids {
            assert_eq!(store.get(id).await.unwrap().kind(), RecordKind::Fact);
        }

        let all = store
            .query(RecordFilter::for_user("u1"), 100, Order::NewestFirst)
            .await
            .unwrap();
        assert_eq!(all.len(), 32);
        assert!(store.verify_index().await.unwrap().is_clean());
    }

    #[tokio::test]
    async fn test_cancelled_put_leaves_nothing() {
        let (_dir, store) = open().await;
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = store.put(fact("never"), Some(cancel)).await.unwrap_err();
        assert!(matches!(err, crate::Error::Cancelled));
        let all = store
            .query(RecordFilter::default().with_deleted(), 10, Order::NewestFirst)
            .await
            .unwrap();
        assert!(all.is_empty());
    }

    #[tokio::test]
    async fn test_through_trait_object() {
        let (_dir, store) = open().await;
        let store: Arc<dyn RecordStore> = Arc::new(store);
        let id = store.put(fact("via trait"), None).await.unwrap();
        store.soft_delete(&id, None).await.unwrap();
        assert!(store.get(&id).await.unwrap().is_deleted());
        store.checkpoint().await.unwrap();
    }
}

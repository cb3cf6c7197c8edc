//! Mental-model tier: per-user key → (value, confidence).
//!
//! A write replaces the stored value only when its confidence is at least
//! the stored confidence, unless forced.

use chrono::Utc;
use mnemo_core::db::mental_models;
use mnemo_core::types::{MentalModel, MentalModelEntry};
use mnemo_core::{CancelToken, Store};

use crate::SDKResult;
use crate::memory::types::MentalModelUpdate;
use crate::utils::{validate_confidence, validate_name};

#[derive(Debug, Clone)]
pub struct MentalModelMemory {
    store: Store,
}

impl MentalModelMemory {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn get(&self, user_id: &str) -> SDKResult<MentalModel> {
        let user_id = user_id.to_string();
        Ok(self.store.read(move |conn| mental_models::load(conn, &user_id)).await?)
    }

    pub async fn get_key(&self, user_id: &str, key: &str) -> SDKResult<Option<MentalModelEntry>> {
        let (user_id, key) = (user_id.to_string(), key.to_string());
        Ok(self
            .store
            .read(move |conn| mental_models::get_entry(conn, &user_id, &key))
            .await?)
    }

    /// Gated update. The comparison and the write share one transaction.
    pub async fn update(
        &self,
        user_id: &str,
        key: &str,
        value: serde_json::Value,
        confidence: f64,
        force: bool,
        cancel: Option<CancelToken>,
    ) -> SDKResult<MentalModelUpdate> {
        validate_name(key)?;
        validate_confidence(confidence)?;

        let (user_id, key) = (user_id.to_string(), key.to_string());
        let update = self
            .store
            .write(cancel, move |tx| {
                let current = mental_models::get_entry(tx, &user_id, &key)?;
                let previous_confidence = current.as_ref().map(|entry| entry.confidence);

                if let Some(entry) = current {
                    if !force && confidence < entry.confidence {
                        return Ok(MentalModelUpdate {
                            applied: false,
                            entry,
                            previous_confidence,
                        });
                    }
                }

                let entry = mental_models::put_entry(tx, &user_id, &key, &value, confidence, Utc::now())?;
                Ok(MentalModelUpdate {
                    applied: true,
                    entry,
                    previous_confidence,
                })
            })
            .await?;

        tracing::debug!(
            key = %update.entry.key,
            applied = update.applied,
            confidence,
            "Mental model update"
        );
        Ok(update)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::tiers::test_support::open_store;
    use serde_json::json;

    #[tokio::test]
    async fn test_confidence_gate() {
        let (_dir, store) = open_store().await;
        let tier = MentalModelMemory::new(store);

        let first = tier.update("u1", "language", json!("rust"), 0.7, false, None).await.unwrap();
        assert!(first.applied);
        assert_eq!(first.previous_confidence, None);

        let lower = tier.update("u1", "language", json!("go"), 0.5, false, None).await.unwrap();
        assert!(!lower.applied);
        assert_eq!(lower.entry.value, json!("rust"));

        // Equal confidence replaces.
        let equal = tier.update("u1", "language", json!("zig"), 0.7, false, None).await.unwrap();
        assert!(equal.applied);

        let forced = tier.update("u1", "language", json!("c"), 0.1, true, None).await.unwrap();
        assert!(forced.applied);
        assert_eq!(forced.previous_confidence, Some(0.7));

        let stored = tier.get_key("u1", "language").await.unwrap().unwrap();
        assert_eq!(stored.value, json!("c"));
        assert_eq!(stored.confidence, 0.1);
    }

    #[tokio::test]
    async fn test_models_are_per_user() {
        let (_dir, store) = open_store().await;
        let tier = MentalModelMemory::new(store);
        tier.update("u1", "tone", json!({"formal": true}), 0.9, false, None).await.unwrap();

        assert_eq!(tier.get("u1").await.unwrap().len(), 1);
        assert!(tier.get("u2").await.unwrap().is_empty());
        assert!(tier.get_key("u2", "tone").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rejects_bad_input() {
        let (_dir, store) = open_store().await;
        let tier = MentalModelMemory::new(store);
        assert!(tier.update("u1", "tone", json!(1), 1.5, false, None).await.is_err());
        assert!(tier.update("u1", "Bad Key", json!(1), 0.5, false, None).await.is_err());
    }
}

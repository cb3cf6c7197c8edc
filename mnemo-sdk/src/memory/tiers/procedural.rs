//! Procedural tier: named step lists with a recency-weighted success rate.
//!
//! Outcome `i` invocations ago carries weight `2^(-i / half_life)`, so
//!
//! ```text
//! success_rate = Σ wᵢ·oᵢ / Σ wᵢ
//! ```
//!
//! Both sums are stored and decayed once per invocation, which keeps the
//! update O(1) regardless of history length.

use chrono::Utc;
use regex::{Regex, RegexBuilder};

use mnemo_core::db::procedures::{self, OutcomeUpdate};
use mnemo_core::db::records;
use mnemo_core::types::{NewProcedure, NewRecord, Procedure};
use mnemo_core::{CancelToken, Store};

use crate::utils::validate_name;
use crate::{SDKError, SDKResult};

const MAX_PATTERN_SIZE: usize = 1 << 20;

/// Per-invocation decay of past outcomes.
pub fn decay_factor(half_life: f64) -> f64 {
    2f64.powf(-1.0 / half_life)
}

/// Running totals after folding one more outcome into `procedure`.
pub fn next_outcome(procedure: &Procedure, success: bool, half_life: f64) -> OutcomeUpdate {
    let decay = decay_factor(half_life);
    let outcome = if success { 1.0 } else { 0.0 };
    let weighted_success = procedure.weighted_success * decay + outcome;
    let weight_total = procedure.weight_total * decay + 1.0;
    OutcomeUpdate {
        success,
        weighted_success,
        weight_total,
        success_rate: weighted_success / weight_total,
    }
}

fn compile_trigger(pattern: &str) -> SDKResult<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .size_limit(MAX_PATTERN_SIZE)
        .build()
        .map_err(|e| SDKError::invalid_operation(format!("invalid trigger pattern: {}", e)))
}

#[derive(Debug, Clone)]
pub struct ProceduralMemory {
    store: Store,
    half_life: f64,
}

impl ProceduralMemory {
    pub fn new(store: Store, half_life: f64) -> Self {
        Self { store, half_life }
    }

    pub fn half_life(&self) -> f64 {
        self.half_life
    }

    /// Register a procedure. Names are unique per user.
    pub async fn register(&self, procedure: NewProcedure, cancel: Option<CancelToken>) -> SDKResult<Procedure> {
        validate_name(&procedure.name)?;
        compile_trigger(&procedure.trigger_pattern)?;
        procedure.validate()?;

        let dimension = self.store.dimension();
        let record = NewRecord::Procedure(procedure);
        let stored = self
            .store
            .write(cancel, move |tx| {
                let id = records::insert(tx, dimension, &record, Utc::now())?;
                procedures::get(tx, &id)
            })
            .await?;

        tracing::info!(user_id = %stored.user_id, procedure = %stored.name, "Procedure registered");
        Ok(stored)
    }

    /// Fold one invocation outcome into the named procedure.
    ///
    /// Read, update and log happen in one write transaction, so concurrent
    /// outcomes for the same procedure are applied one after the other.
    pub async fn record_outcome(
        &self,
        user_id: &str,
        name: &str,
        success: bool,
        cancel: Option<CancelToken>,
    ) -> SDKResult<Procedure> {
        let (user_id, name) = (user_id.to_string(), name.to_string());
        let half_life = self.half_life;
        let updated = self
            .store
            .write(cancel, move |tx| {
                let current = procedures::get_by_name(tx, &user_id, &name)?;
                let update = next_outcome(&current, success, half_life);
                procedures::apply_outcome(tx, &current.id, &update, Utc::now())
            })
            .await?;

        tracing::debug!(
            procedure = %updated.name,
            success,
            success_rate = updated.success_rate,
            usage_count = updated.usage_count,
            "Procedure outcome recorded"
        );
        Ok(updated)
    }

    pub async fn get(&self, user_id: &str, name: &str) -> SDKResult<Procedure> {
        let (user_id, name) = (user_id.to_string(), name.to_string());
        Ok(self
            .store
            .read(move |conn| procedures::get_by_name(conn, &user_id, &name))
            .await?)
    }

    /// All procedures of a user, best success rate first.
    pub async fn list(&self, user_id: &str) -> SDKResult<Vec<Procedure>> {
        let user_id = user_id.to_string();
        Ok(self.store.read(move |conn| procedures::list(conn, &user_id)).await?)
    }

    /// Procedures whose trigger matches `input`, best success rate first.
    pub async fn match_trigger(&self, user_id: &str, input: &str) -> SDKResult<Vec<Procedure>> {
        let mut matched = Vec::new();
        for procedure in self.list(user_id).await? {
            match compile_trigger(&procedure.trigger_pattern) {
                Ok(re) if re.is_match(input) => matched.push(procedure),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(procedure = %procedure.name, error = %e, "Skipping procedure with bad trigger");
                }
            }
        }
        Ok(matched)
    }

    /// Outcomes logged for a procedure, oldest first.
    pub async fn history(&self, user_id: &str, name: &str) -> SDKResult<Vec<bool>> {
        let procedure = self.get(user_id, name).await?;
        Ok(self
            .store
            .read(move |conn| procedures::invocations(conn, &procedure.id))
            .await?)
    }
}

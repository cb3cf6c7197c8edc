//! SDK Configuration
//!
//! Every section deserializes with defaults, so a TOML file only needs the
//! keys it changes. Call [`MnemoConfig::validate`] before opening a context.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// SDK configuration options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MnemoConfig {
    /// Directory holding `mnemo.db`, `backups/` and `vector_indices/`
    pub storage_root: PathBuf,

    /// Persistent store configuration
    pub store: StoreConfig,

    /// Tier manager and consolidation configuration
    pub memory: MemoryConfig,

    /// Hybrid retrieval configuration
    pub retrieval: RetrievalConfig,

    /// Cache layer configuration
    pub cache: CacheConfig,

    /// Concurrency controller configuration
    pub controller: ControllerConfig,

    /// Embedder configuration
    pub embedding: EmbeddingConfig,
}

/// Persistent store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Bound on every lock wait in milliseconds (default: 30000)
    pub busy_timeout_ms: u64,

    /// Checkpoint the WAL on shutdown (default: true)
    pub checkpoint_on_shutdown: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 30_000,
            checkpoint_on_shutdown: true,
        }
    }
}

/// Memory system configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Pending episodes that trigger a consolidation pass (default: 20)
    pub consolidation_threshold: usize,

    /// Background consolidation interval in seconds (default: 300 = 5 minutes)
    pub consolidation_interval: u64,

    /// Run the background consolidation task (default: true)
    pub auto_consolidate: bool,

    /// Smallest episode group that becomes a concept (default: 2)
    pub min_group_size: usize,

    /// Recency half-life of procedure success rates, in invocations (default: 20)
    pub procedure_half_life: f64,

    /// Conversation turns kept per user (default: 50)
    pub stm_window: usize,

    /// Conversation turn time-to-live in seconds (default: 86400 = 1 day)
    pub stm_ttl_secs: u64,

    /// Prune conversation turns on every append (default: true)
    pub auto_prune: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            consolidation_threshold: 20,
            consolidation_interval: 300, // 5 minutes
            auto_consolidate: true,
            min_group_size: 2,
            procedure_half_life: 20.0,
            stm_window: 50,
            stm_ttl_secs: 86_400, // 1 day
            auto_prune: true,
        }
    }
}

/// Hybrid retrieval configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Weight of the normalized lexical rank (default: 0.5)
    pub lexical_weight: f64,

    /// Weight of the normalized cosine similarity (default: 0.5)
    pub semantic_weight: f64,

    /// Candidates fetched per list, as a multiple of the limit (default: 4)
    pub candidate_multiplier: usize,

    /// Limit used when the caller passes 0 (default: 10)
    pub default_limit: usize,

    /// Answer lexical-only when the embedder fails (default: false)
    pub lexical_fallback: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            lexical_weight: 0.5,
            semantic_weight: 0.5,
            candidate_multiplier: 4,
            default_limit: 10,
            lexical_fallback: false,
        }
    }
}

/// Cache layer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum entries before LRU eviction (default: 1024)
    pub capacity: usize,

    /// TTL for recall and mental-model entries in seconds (default: 60)
    pub ttl_secs: u64,

    /// Invalidation bus buffer (default: 1024)
    pub bus_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            ttl_secs: 60,
            bus_capacity: 1024,
        }
    }
}

/// Token bucket for one operation class.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimit {
    pub per_second: u32,
    pub burst: u32,
}

/// Concurrency controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Concurrently running units (default: 16)
    pub workers: usize,

    /// Units allowed to wait for a worker (default: 128)
    pub queue_depth: usize,

    /// Timeout applied when the caller gives none, in milliseconds (default: 30000)
    pub default_timeout_ms: u64,

    pub search_rate: RateLimit,
    pub write_rate: RateLimit,
    pub consolidate_rate: RateLimit,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 16,
            queue_depth: 128,
            default_timeout_ms: 30_000,
            search_rate: RateLimit {
                per_second: 500,
                burst: 100,
            },
            write_rate: RateLimit {
                per_second: 200,
                burst: 50,
            },
            consolidate_rate: RateLimit {
                per_second: 10,
                burst: 5,
            },
        }
    }
}

/// Embedder backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingProvider {
    /// Deterministic feature hashing, no model download
    Hashing,
    /// all-MiniLM-L6-v2 through fastembed (`embeddings` feature)
    Fastembed,
}

/// Embedding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProvider,

    /// Model name recorded in the vector manifest
    pub model: String,

    /// Vector dimension (default: 384)
    pub dimension: usize,

    /// Embed LRU cache size (default: 256)
    pub query_cache_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::Hashing,
            model: "hashing-bow-v1".to_string(),
            dimension: 384,
            query_cache_size: 256,
        }
    }
}

impl MnemoConfig {
    /// Create a config rooted at `storage_root`
    pub fn new(storage_root: impl Into<PathBuf>) -> Self {
        Self {
            storage_root: storage_root.into(),
            ..Default::default()
        }
    }

    /// Parse a TOML document; absent keys keep their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigValidationError> {
        toml::from_str(content).map_err(|e| ConfigValidationError::Parse(e.to_string()))
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigValidationError> {
        toml::to_string_pretty(self).map_err(|e| ConfigValidationError::Parse(e.to_string()))
    }

    /// Set memory configuration
    pub fn with_memory(mut self, memory: MemoryConfig) -> Self {
        self.memory = memory;
        self
    }

    /// Set retrieval configuration
    pub fn with_retrieval(mut self, retrieval: RetrievalConfig) -> Self {
        self.retrieval = retrieval;
        self
    }

    /// Set controller configuration
    pub fn with_controller(mut self, controller: ControllerConfig) -> Self {
        self.controller = controller;
        self
    }

    /// Set the consolidation threshold
    pub fn with_consolidation_threshold(mut self, threshold: usize) -> Self {
        self.memory.consolidation_threshold = threshold;
        self
    }

    /// Disable the background consolidation task
    pub fn without_background_consolidation(mut self) -> Self {
        self.memory.auto_consolidate = false;
        self
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.store.busy_timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.ttl_secs)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.controller.default_timeout_ms)
    }

    /// Reader connections: one per controller worker, so an admitted unit
    /// never waits on the store's pool.
    pub fn reader_pool_size(&self) -> usize {
        self.controller.workers
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.storage_root.as_os_str().is_empty() {
            return Err(ConfigValidationError::MissingStorageRoot);
        }

        let positive = [
            ("store.busy_timeout_ms", self.store.busy_timeout_ms as f64),
            ("memory.consolidation_threshold", self.memory.consolidation_threshold as f64),
            ("memory.consolidation_interval", self.memory.consolidation_interval as f64),
            ("memory.min_group_size", self.memory.min_group_size as f64),
            ("memory.procedure_half_life", self.memory.procedure_half_life),
            ("memory.stm_window", self.memory.stm_window as f64),
            ("retrieval.candidate_multiplier", self.retrieval.candidate_multiplier as f64),
            ("retrieval.default_limit", self.retrieval.default_limit as f64),
            ("cache.capacity", self.cache.capacity as f64),
            ("controller.workers", self.controller.workers as f64),
            ("embedding.dimension", self.embedding.dimension as f64),
        ];
        for (field, value) in positive {
            if !(value > 0.0 && value.is_finite()) {
                return Err(ConfigValidationError::InvalidValue {
                    field: field.into(),
                    message: "must be greater than 0".into(),
                });
            }
        }

        let weights = [
            ("retrieval.lexical_weight", self.retrieval.lexical_weight),
            ("retrieval.semantic_weight", self.retrieval.semantic_weight),
        ];
        for (field, value) in weights {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigValidationError::InvalidValue {
                    field: field.into(),
                    message: "must be between 0 and 1".into(),
                });
            }
        }
        if self.retrieval.lexical_weight + self.retrieval.semantic_weight <= 0.0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "retrieval".into(),
                message: "lexical and semantic weights cannot both be 0".into(),
            });
        }

        let rates = [
            ("controller.search_rate", self.controller.search_rate),
            ("controller.write_rate", self.controller.write_rate),
            ("controller.consolidate_rate", self.controller.consolidate_rate),
        ];
        for (field, rate) in rates {
            if rate.per_second == 0 || rate.burst == 0 {
                return Err(ConfigValidationError::InvalidValue {
                    field: field.into(),
                    message: "per_second and burst must be greater than 0".into(),
                });
            }
        }

        Ok(())
    }
}

/// Configuration validation errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("storage_root is required")]
    MissingStorageRoot,

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("failed to parse config: {0}")]
    Parse(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MnemoConfig::default();
        assert_eq!(config.memory.consolidation_threshold, 20);
        assert_eq!(config.memory.procedure_half_life, 20.0);
        assert_eq!(config.controller.workers, 16);
        assert_eq!(config.store.busy_timeout_ms, 30_000);
        assert_eq!(config.retrieval.lexical_weight, config.retrieval.semantic_weight);
        assert!(!config.retrieval.lexical_fallback);
    }

    #[test]
    fn test_config_builder() {
        let config = MnemoConfig::new("/tmp/mnemo")
            .with_consolidation_threshold(5)
            .without_background_consolidation();

        assert_eq!(config.storage_root, PathBuf::from("/tmp/mnemo"));
        assert_eq!(config.memory.consolidation_threshold, 5);
        assert!(!config.memory.auto_consolidate);
    }

    #[test]
    fn test_config_validation() {
        let mut config = MnemoConfig::default();
        assert!(config.validate().is_err()); // Missing storage root

        config.storage_root = "/tmp/mnemo".into();
        assert!(config.validate().is_ok());

        config.memory.consolidation_threshold = 0;
        assert!(config.validate().is_err());

        config.memory.consolidation_threshold = 20;
        config.retrieval.semantic_weight = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml() {
        let config = MnemoConfig::from_toml_str(
            r#"
            storage_root = "/var/lib/mnemo"

            [memory]
            consolidation_threshold = 8

            [retrieval]
            lexical_fallback = true
            "#,
        )
        .unwrap();

        assert_eq!(config.memory.consolidation_threshold, 8);
        assert_eq!(config.memory.stm_window, 50);
        assert!(config.retrieval.lexical_fallback);
        assert!(config.validate().is_ok());

        let round = MnemoConfig::from_toml_str(&config.to_toml_string().unwrap()).unwrap();
        assert_eq!(round.memory.consolidation_threshold, 8);
    }

    #[test]
    fn test_reader_pool_follows_workers() {
        let config = MnemoConfig::from_toml_str(
            r#"
            storage_root = "/var/lib/mnemo"

            [store]
            pool_size = 4

            [controller]
            workers = 32
            "#,
        )
        .unwrap();

        // A stale pool_size from an older file is ignored.
        assert_eq!(config.reader_pool_size(), 32);
        assert!(!config.to_toml_string().unwrap().contains("pool_size"));
    }

    #[test]
    fn test_bad_toml() {
        assert!(matches!(
            MnemoConfig::from_toml_str("[memory]\nconsolidation_threshold = \"lots\""),
            Err(ConfigValidationError::Parse(_))
        ));
    }
}

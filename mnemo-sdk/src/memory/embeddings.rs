//! Embedding Service for Semantic Search
//!
//! Two backends sit behind the [`Embedder`] trait:
//!
//! - [`HashingEmbedder`]: deterministic feature hashing over word and
//!   character-trigram features. Needs no model download; the default.
//! - `FastembedEmbedder`: local all-MiniLM-L6-v2 inference through
//!   `fastembed` (384 dimensions), behind the `embeddings` feature.
//!
//! [`CachingEmbedder`] puts a bounded LRU in front of either backend so
//! repeated recall queries skip inference.

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;

use crate::config::{EmbeddingConfig, EmbeddingProvider};
use crate::utils::hash64;
use crate::{SDKError, SDKResult};

/// Embedding dimensions for all-MiniLM-L6-v2
pub const EMBEDDING_DIMENSIONS: usize = 384;

/// Turns text into fixed-size vectors.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model name recorded in the vector manifest.
    fn model(&self) -> &str;

    fn dimensions(&self) -> usize;

    async fn embed(&self, text: &str) -> SDKResult<Vec<f32>>;

    async fn embed_batch(&self, texts: &[String]) -> SDKResult<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            vectors.push(self.embed(text).await?);
        }
        Ok(vectors)
    }
}

/// Build the embedder selected by `config`, wrapped in the query cache.
pub fn build_embedder(config: &EmbeddingConfig) -> SDKResult<Arc<dyn Embedder>> {
    let inner: Arc<dyn Embedder> = match config.provider {
        EmbeddingProvider::Hashing => {
            Arc::new(HashingEmbedder::new(config.dimension).with_model(&config.model))
        }
        #[cfg(feature = "embeddings")]
        EmbeddingProvider::Fastembed => {
            if config.dimension != EMBEDDING_DIMENSIONS {
                return Err(SDKError::invalid_operation(format!(
                    "fastembed all-MiniLM-L6-v2 produces {} dimensions, config asks for {}",
                    EMBEDDING_DIMENSIONS, config.dimension
                )));
            }
            Arc::new(FastembedEmbedder::new())
        }
        #[cfg(not(feature = "embeddings"))]
        EmbeddingProvider::Fastembed => {
            return Err(SDKError::embedding(
                "Embeddings feature not enabled. Compile with --features embeddings",
            ));
        }
    };

    if config.query_cache_size == 0 {
        return Ok(inner);
    }
    Ok(Arc::new(CachingEmbedder::new(inner, config.query_cache_size)))
}

// ─────────────────────────────────────────────────────────────────────────────
// Hashing embedder
// ─────────────────────────────────────────────────────────────────────────────

/// Deterministic bag-of-features embedder.
///
/// Every lowercase word adds ±1 to a hashed bucket and each of its character
/// trigrams adds ±0.5, then the vector is L2-normalized. Texts that share
/// words or word stems land close together, so hybrid ranking behaves
/// sensibly without a model.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
    model: String,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
            model: "hashing-bow-v1".to_string(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    fn bucket(&self, feature: &str) -> (usize, f32) {
        let hash = hash64(feature);
        let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
        ((hash % self.dimensions as u64) as usize, sign)
    }

    /// Synchronous core, shared by `embed` and tests.
    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        let lowered = text.to_lowercase();

        for word in lowered.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty()) {
            let (index, sign) = self.bucket(&format!("w:{}", word));
            vector[index] += sign;

            let chars: Vec<char> = format!("^{}$", word).chars().collect();
            for gram in chars.windows(3) {
                let gram: String = gram.iter().collect();
                let (index, sign) = self.bucket(&format!("g:{}", gram));
                vector[index] += 0.5 * sign;
            }
        }

        normalize(&mut vector);
        vector
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn model(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, text: &str) -> SDKResult<Vec<f32>> {
        Ok(self.embed_sync(text))
    }
}

fn normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// fastembed
// ─────────────────────────────────────────────────────────────────────────────

/// Embedding service backed by fastembed, loaded on first use
#[cfg(feature = "embeddings")]
pub struct FastembedEmbedder {
    model: Arc<tokio::sync::RwLock<Option<fastembed::TextEmbedding>>>,
}

#[cfg(feature = "embeddings")]
impl Default for FastembedEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "embeddings")]
impl FastembedEmbedder {
    pub fn new() -> Self {
        Self {
            model: Arc::new(tokio::sync::RwLock::new(None)),
        }
    }

    /// Initialize the embedding model (lazy loading)
    async fn ensure_model(&self) -> SDKResult<()> {
        use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};

        if self.model.read().await.is_some() {
            return Ok(());
        }

        let mut model_guard = self.model.write().await;
        if model_guard.is_some() {
            return Ok(());
        }

        tracing::info!("Loading embedding model: all-MiniLM-L6-v2");
        let start = std::time::Instant::now();

        let mut init_options = InitOptions::default();
        init_options.model_name = EmbeddingModel::AllMiniLML6V2;
        init_options.show_download_progress = false;

        let model = TextEmbedding::try_new(init_options)
            .map_err(|e| SDKError::embedding(format!("Failed to load embedding model: {}", e)))?;

        tracing::info!(elapsed_ms = start.elapsed().as_millis() as u64, "Embedding model loaded");
        *model_guard = Some(model);
        Ok(())
    }
}

#[cfg(feature = "embeddings")]
#[async_trait]
impl Embedder for FastembedEmbedder {
    fn model(&self) -> &str {
        "all-MiniLM-L6-v2"
    }

    fn dimensions(&self) -> usize {
        EMBEDDING_DIMENSIONS
    }

    async fn embed(&self, text: &str) -> SDKResult<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| SDKError::embedding("No embedding generated"))
    }

    async fn embed_batch(&self, texts: &[String]) -> SDKResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.ensure_model().await?;

        let model_guard = self.model.read().await;
        let model = model_guard
            .as_ref()
            .ok_or_else(|| SDKError::embedding("Embedding model not initialized"))?;

        model
            .embed(texts.to_vec(), None)
            .map_err(|e| SDKError::embedding(format!("Failed to generate embeddings: {}", e)))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Query cache
// ─────────────────────────────────────────────────────────────────────────────

/// LRU of recent text → vector results in front of another embedder.
pub struct CachingEmbedder {
    inner: Arc<dyn Embedder>,
    cache: Mutex<LruCache<String, Vec<f32>>>,
}

impl CachingEmbedder {
    pub fn new(inner: Arc<dyn Embedder>, capacity: usize) -> Self {
        Self {
            inner,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN),
            )),
        }
    }

    pub fn cached_len(&self) -> usize {
        self.cache.lock().len()
    }
}

#[async_trait]
impl Embedder for CachingEmbedder {
    fn model(&self) -> &str {
        self.inner.model()
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    async fn embed(&self, text: &str) -> SDKResult<Vec<f32>> {
        if let Some(vector) = self.cache.lock().get(text) {
            return Ok(vector.clone());
        }
        let vector = self.inner.embed(text).await?;
        self.cache.lock().put(text.to_string(), vector.clone());
        Ok(vector)
    }
}

/// Compute cosine similarity between two vectors
///
/// Returns a value between -1.0 and 1.0, where 1.0 means identical,
/// 0.0 means orthogonal, and -1.0 means opposite.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    mnemo_core::index::vector::cosine(a, b) as f32
}

/// Normalize a similarity score to 0-1 range
///
/// Converts cosine similarity (-1 to 1) to relevance score (0 to 1)
pub fn normalize_similarity(similarity: f64) -> f64 {
    ((similarity + 1.0) / 2.0).clamp(0.0, 1.0)
}

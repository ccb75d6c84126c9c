//! Embedding models.
//!
//! [`Embedder`] is the seam between the index pipeline and whatever turns
//! text into vectors. [`FastEmbedder`] is the real implementation backed by
//! fastembed:
//! - Lazy model loading on first embed, held for the life of the value
//! - Configurable model cache directory
//! - Batch embedding generation

use fastembed::{InitOptions, TextEmbedding};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Mutex;

/// Error type for embedding operations
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Model initialization failed: {0}")]
    InitFailed(String),

    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),

    #[error("Invalid model name: {0}")]
    InvalidModel(String),
}

/// Maps text to fixed-dimension vectors.
///
/// Implementations must be deterministic: the same text yields the same
/// vector for a given model.
pub trait Embedder: Send + Sync {
    /// Model name, persisted (hashed) with the index.
    fn name(&self) -> &str;

    fn dimensions(&self) -> usize;

    /// One vector per input text, in input order.
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.embed_batch(&[text.to_string()])?
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::EmbeddingFailed("No embedding returned".to_string()))
    }

    /// SHA256 hash of the model name for storage identification.
    fn model_id_hash(&self) -> [u8; 32] {
        Sha256::digest(self.name().as_bytes()).into()
    }
}

/// fastembed-backed [`Embedder`].
/// Uses a Mutex because fastembed's embed() requires &mut self.
pub struct FastEmbedder {
    model: Mutex<Option<TextEmbedding>>,
    variant: fastembed::EmbeddingModel,
    model_name: String,
    dimensions: usize,
    cache_dir: PathBuf,
    show_download_progress: bool,
}

impl FastEmbedder {
    /// Create an embedder for the given model name.
    ///
    /// Nothing is loaded here; the model is read from `cache_dir/models`
    /// (or downloaded there) on the first call to `embed_batch`.
    ///
    /// # Arguments
    /// * `model_name` - Name of the model (e.g., "all-MiniLM-L6-v2")
    /// * `cache_dir` - Directory to cache downloaded models
    pub fn new(model_name: &str, cache_dir: PathBuf) -> Result<Self, EmbeddingError> {
        let (variant, dimensions) = Self::parse_model_name(model_name)?;

        Ok(Self {
            model: Mutex::new(None),
            variant,
            model_name: model_name.to_string(),
            dimensions,
            cache_dir,
            show_download_progress: false,
        })
    }

    pub fn with_download_progress(mut self, show: bool) -> Self {
        self.show_download_progress = show;
        self
    }

    #[cfg(test)]
    pub fn is_loaded(&self) -> bool {
        self.model
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }

    fn load(&self) -> Result<TextEmbedding, EmbeddingError> {
        log::info!("loading embedding model '{}'", self.model_name);

        let models_dir = self.cache_dir.join("models");
        std::fs::create_dir_all(&models_dir).map_err(|e| {
            EmbeddingError::InitFailed(format!("Failed to create models directory: {}", e))
        })?;

        let options = InitOptions::new(self.variant.clone())
            .with_cache_dir(models_dir)
            .with_show_download_progress(self.show_download_progress);

        TextEmbedding::try_new(options).map_err(|e| EmbeddingError::InitFailed(e.to_string()))
    }

    /// Parse model name string to fastembed enum and its output dimensions.
    fn parse_model_name(
        name: &str,
    ) -> Result<(fastembed::EmbeddingModel, usize), EmbeddingError> {
        match name.to_lowercase().as_str() {
            "all-minilm-l6-v2" | "allminiml6v2" => {
                Ok((fastembed::EmbeddingModel::AllMiniLML6V2, 384))
            }
            "all-minilm-l6-v2-q" | "allminiml6v2q" => {
                Ok((fastembed::EmbeddingModel::AllMiniLML6V2Q, 384))
            }
            "bge-small-en-v1.5" | "bgesmallenv15" => {
                Ok((fastembed::EmbeddingModel::BGESmallENV15, 384))
            }
            "bge-small-en-v1.5-q" | "bgesmallenv15q" => {
                Ok((fastembed::EmbeddingModel::BGESmallENV15Q, 384))
            }
            "bge-base-en-v1.5" | "bgebaseenv15" => {
                Ok((fastembed::EmbeddingModel::BGEBaseENV15, 768))
            }
            "bge-base-en-v1.5-q" | "bgebaseenv15q" => {
                Ok((fastembed::EmbeddingModel::BGEBaseENV15Q, 768))
            }
            _ => Err(EmbeddingError::InvalidModel(format!(
                "Unknown model: {}. Supported models: all-MiniLM-L6-v2, bge-small-en-v1.5, bge-base-en-v1.5 (add -q suffix for quantized)",
                name
            ))),
        }
    }
}

impl Embedder for FastEmbedder {
    fn name(&self) -> &str {
        &self.model_name
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let mut guard = self.model.lock().map_err(|e| {
            EmbeddingError::EmbeddingFailed(format!("Failed to acquire model lock: {}", e))
        })?;

        if guard.is_none() {
            *guard = Some(self.load()?);
        }

        let model = guard
            .as_mut()
            .ok_or_else(|| EmbeddingError::InitFailed("model not loaded".to_string()))?;

        let embeddings = model
            .embed(texts.to_vec(), None)
            .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))?;

        if let Some(vector) = embeddings.iter().find(|v| v.len() != self.dimensions) {
            return Err(EmbeddingError::EmbeddingFailed(format!(
                "model '{}' returned {} dimensions, expected {}",
                self.model_name,
                vector.len(),
                self.dimensions
            )));
        }

        Ok(embeddings)
    }
}

//! Semantic search over bookmark titles.
//!
//! Local embeddings via fastembed-rs plus an in-memory vector index that is
//! persisted between runs and refreshed incrementally.
//!
//! # Architecture
//!
//! - `embeddings`: `Embedder` trait and the fastembed-backed implementation
//! - `index`: In-memory vector index with cosine similarity search
//! - `storage`: Binary file I/O for index.bin persistence
//! - `preprocess`: Title normalization and change-detection hashes
//! - `service`: The refresh/query pipeline the UI talks to

pub mod embeddings;
pub mod index;
pub mod preprocess;
pub mod service;
pub mod storage;

pub use embeddings::{Embedder, EmbeddingError, FastEmbedder};
pub use service::{
    IndexStatus, PipelineState, RefreshReport, SearchError, SearchHit, SearchPipeline,
    DEFAULT_BATCH_SIZE, INDEX_FILE_NAME,
};

/// Default embedding model name
pub const DEFAULT_MODEL: &str = "all-MiniLM-L6-v2";

/// Default number of results per query
pub const DEFAULT_TOP_K: usize = 5;

//! In-memory vector index with cosine similarity search.
//!
//! Entries are keyed by bookmark ID and kept in insertion order. Inserting
//! an ID that is already present overwrites the entry in place, so an ID
//! never appears twice and keeps its original position for tie-breaking.

use std::collections::{HashMap, HashSet};

use crate::bookmarks::Bookmark;

/// An entry in the vector index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    /// Bookmark ID
    pub id: u64,
    /// Hash of the title that was embedded
    pub content_hash: u64,
    pub title: String,
    pub url: String,
    /// The embedding vector
    pub embedding: Vec<f32>,
}

impl IndexEntry {
    pub fn new(bookmark: &Bookmark, content_hash: u64, embedding: Vec<f32>) -> Self {
        Self {
            id: bookmark.id,
            content_hash,
            title: bookmark.title.clone(),
            url: bookmark.url.clone(),
            embedding,
        }
    }
}

/// What an insert did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Replaced,
}

/// In-memory vector index for semantic search.
#[derive(Debug, Clone)]
pub struct VectorIndex {
    entries: Vec<IndexEntry>,
    /// Bookmark ID -> position in `entries`
    positions: HashMap<u64, usize>,
    /// Expected embedding dimensions
    dimensions: usize,
}

/// Search result from the vector index.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    /// Bookmark ID
    pub id: u64,
    /// Cosine similarity score (-1.0 to 1.0)
    pub score: f32,
}

impl VectorIndex {
    /// Create a new empty vector index with specified dimensions.
    pub fn new(dimensions: usize) -> Self {
        Self::with_capacity(dimensions, 0)
    }

    /// Create an index with pre-allocated capacity.
    pub fn with_capacity(dimensions: usize, capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            positions: HashMap::with_capacity(capacity),
            dimensions,
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert a new entry or overwrite the one with the same ID.
    pub fn upsert(&mut self, entry: IndexEntry) -> Result<Upsert, IndexError> {
        if entry.embedding.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: entry.embedding.len(),
            });
        }

        match self.positions.get(&entry.id) {
            Some(&pos) => {
                self.entries[pos] = entry;
                Ok(Upsert::Replaced)
            }
            None => {
                self.positions.insert(entry.id, self.entries.len());
                self.entries.push(entry);
                Ok(Upsert::Inserted)
            }
        }
    }

    /// Add a batch of vectors for the given bookmarks.
    ///
    /// Returns how many IDs were not present before. The batch is validated
    /// up front, so a dimension mismatch leaves the index untouched.
    pub fn add(
        &mut self,
        vectors: Vec<Vec<f32>>,
        bookmarks: &[Bookmark],
        content_hashes: &[u64],
    ) -> Result<usize, IndexError> {
        if vectors.len() != bookmarks.len() || content_hashes.len() != bookmarks.len() {
            return Err(IndexError::LengthMismatch {
                vectors: vectors.len(),
                ids: bookmarks.len(),
            });
        }

        if let Some(bad) = vectors.iter().find(|v| v.len() != self.dimensions) {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: bad.len(),
            });
        }

        let mut inserted = 0;
        for ((embedding, bookmark), hash) in vectors.into_iter().zip(bookmarks).zip(content_hashes) {
            if self.upsert(IndexEntry::new(bookmark, *hash, embedding))? == Upsert::Inserted {
                inserted += 1;
            }
        }

        Ok(inserted)
    }

    /// Update the stored url without touching the vector.
    pub fn set_url(&mut self, id: u64, url: &str) -> bool {
        match self.positions.get(&id) {
            Some(&pos) => {
                self.entries[pos].url = url.to_string();
                true
            }
            None => false,
        }
    }

    /// Drop every entry whose ID is not in `keep`. Returns the removed IDs.
    pub fn retain_ids(&mut self, keep: &HashSet<u64>) -> Vec<u64> {
        let removed: Vec<u64> = self
            .entries
            .iter()
            .filter(|e| !keep.contains(&e.id))
            .map(|e| e.id)
            .collect();

        if !removed.is_empty() {
            self.entries.retain(|e| keep.contains(&e.id));
            self.reindex();
        }

        removed
    }

    pub fn get(&self, id: u64) -> Option<&IndexEntry> {
        self.positions.get(&id).map(|&pos| &self.entries[pos])
    }

    /// All bookmark IDs in insertion order.
    #[cfg(test)]
    pub fn ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.entries.iter().map(|e| e.id)
    }

    /// Iterate over all entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &IndexEntry> {
        self.entries.iter()
    }

    /// Return the `limit` entries most similar to `query`.
    ///
    /// Results are sorted by score, highest first; equal scores keep
    /// insertion order. Fewer than `limit` entries yields all of them.
    pub fn search(&self, query: &[f32], limit: usize) -> Result<Vec<SearchResult>, IndexError> {
        if query.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: query.len(),
            });
        }

        let query_norm = Self::l2_norm(query);
        if query_norm < f32::EPSILON {
            return Err(IndexError::ZeroNormVector);
        }

        let mut results: Vec<SearchResult> = self
            .entries
            .iter()
            .map(|entry| SearchResult {
                id: entry.id,
                score: Self::cosine_similarity(query, &entry.embedding, query_norm),
            })
            .collect();

        // stable sort: ties stay in insertion order
        results.sort_by(|a, b| b.score.total_cmp(&a.score));
        results.truncate(limit);

        Ok(results)
    }

    /// Compute L2 norm of a vector.
    fn l2_norm(v: &[f32]) -> f32 {
        v.iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    /// Compute cosine similarity between two vectors.
    /// Zero-norm targets (e.g. an untitled bookmark under some models) score 0.
    fn cosine_similarity(query: &[f32], target: &[f32], query_norm: f32) -> f32 {
        let target_norm = Self::l2_norm(target);
        if target_norm < f32::EPSILON {
            return 0.0;
        }

        let dot_product: f32 = query.iter().zip(target.iter()).map(|(a, b)| a * b).sum();
        dot_product / (query_norm * target_norm)
    }

    fn reindex(&mut self) {
        self.positions = self
            .entries
            .iter()
            .enumerate()
            .map(|(pos, e)| (e.id, pos))
            .collect();
    }
}

/// Errors that can occur during index operations.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Length mismatch: {vectors} vectors for {ids} ids")]
    LengthMismatch { vectors: usize, ids: usize },

    #[error("Cannot search with zero-norm vector")]
    ZeroNormVector,
}

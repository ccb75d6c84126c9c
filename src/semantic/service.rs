//! The indexing and query pipeline.
//!
//! Ties the pieces together:
//! profile locator -> snapshot reader -> embedder -> vector index <-> storage.
//!
//! State machine: `Uninitialized -> Indexing -> Ready -> (Querying -> Ready)*`.
//! `Indexing` is re-entered from `Ready` on every refresh. A failed refresh
//! returns to whichever state it started from.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::bookmarks::Bookmark;
use crate::lock::FileLock;
use crate::profile::{LocateError, ProfileLocator};
use crate::semantic::embeddings::{Embedder, EmbeddingError};
use crate::semantic::index::{IndexError, VectorIndex};
use crate::semantic::preprocess::{content_hash, preprocess_title};
use crate::semantic::storage::{VectorStorage, VectorStorageError};
use crate::snapshot::{SnapshotError, SnapshotReader};
use crate::storage::BackendLocal;

/// File name of the persisted index inside the data directory
pub const INDEX_FILE_NAME: &str = "index.bin";

/// Report of the last successful refresh, next to the index
pub const REPORT_FILE_NAME: &str = "last_refresh.json";

/// Default number of titles embedded per model call
pub const DEFAULT_BATCH_SIZE: usize = 64;

/// Errors that can occur in the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error(transparent)]
    Locate(#[from] LocateError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Storage error: {0}")]
    Storage(#[from] VectorStorageError),

    #[error("The index is empty; run an indexing pass first")]
    EmptyIndex,

    #[error("Failed to lock data directory: {0}")]
    Lock(std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    Uninitialized,
    Indexing,
    Ready,
    Querying,
}

/// What a refresh changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshReport {
    /// Bookmarks in the snapshot
    pub total: usize,
    /// New IDs embedded
    pub added: usize,
    /// Renamed bookmarks re-embedded
    pub updated: usize,
    /// Bookmarks whose url changed but title did not
    pub relinked: usize,
    /// IDs no longer in the snapshot
    pub removed: usize,
    pub unchanged: usize,
    /// Whether the index was written to disk
    pub saved: bool,
    /// RFC 3339 timestamp
    pub refreshed_at: String,
}

impl RefreshReport {
    pub fn has_changes(&self) -> bool {
        self.added + self.updated + self.relinked + self.removed > 0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexStatus {
    pub state: PipelineState,
    pub indexed: usize,
    pub model: String,
    pub dimensions: usize,
    pub index_path: PathBuf,
    pub last_refresh: Option<RefreshReport>,
}

/// A ranked search result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub id: u64,
    pub title: String,
    pub url: String,
    pub score: f32,
}

/// Work derived from diffing a snapshot against the index.
#[derive(Default)]
struct RefreshPlan {
    embed: Vec<Bookmark>,
    relink: Vec<Bookmark>,
    keep: HashSet<u64>,
    unchanged: usize,
}

/// Service for indexing and searching bookmark titles.
pub struct SearchPipeline {
    embedder: Arc<dyn Embedder>,
    locator: ProfileLocator,
    reader: SnapshotReader,
    storage: VectorStorage,
    base_path: PathBuf,
    batch_size: usize,
    state: PipelineState,
    index: Option<VectorIndex>,
    last_refresh: Option<RefreshReport>,
}

impl SearchPipeline {
    /// Create a pipeline persisting its index under `base_path`.
    ///
    /// Nothing is loaded here; the persisted index is read on the first
    /// refresh or search.
    pub fn new(embedder: Arc<dyn Embedder>, locator: ProfileLocator, base_path: PathBuf) -> Self {
        Self {
            embedder,
            locator,
            reader: SnapshotReader::new(),
            storage: VectorStorage::new(base_path.join(INDEX_FILE_NAME)),
            base_path,
            batch_size: DEFAULT_BATCH_SIZE,
            state: PipelineState::Uninitialized,
            index: None,
            last_refresh: None,
        }
    }

    pub fn with_reader(mut self, reader: SnapshotReader) -> Self {
        self.reader = reader;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    #[cfg(test)]
    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Number of indexed bookmarks; 0 until the index is loaded.
    pub fn indexed_count(&self) -> usize {
        self.index.as_ref().map(|index| index.len()).unwrap_or(0)
    }

    /// Path of the bookmark database a refresh would read.
    pub fn locate_profile(&self) -> Result<PathBuf, SearchError> {
        Ok(self.locator.locate()?)
    }

    pub fn status(&self) -> IndexStatus {
        IndexStatus {
            state: self.state,
            indexed: self.indexed_count(),
            model: self.embedder.name().to_string(),
            dimensions: self.embedder.dimensions(),
            index_path: self.storage.path().to_path_buf(),
            last_refresh: self.last_refresh.clone(),
        }
    }

    /// Load the persisted index without reading a snapshot.
    ///
    /// Missing or corrupt files yield an empty index. Returns the number of
    /// loaded entries.
    pub fn load_index(&mut self) -> Result<usize, SearchError> {
        if self.index.is_none() {
            let index = self.load_persisted()?;
            self.index = Some(index);
        }

        if self.last_refresh.is_none() {
            self.last_refresh = self.read_report();
        }

        let count = self.indexed_count();
        if self.state == PipelineState::Uninitialized && count > 0 {
            self.state = PipelineState::Ready;
        }
        Ok(count)
    }

    /// Bring the index in line with the live bookmark database.
    pub fn ensure_index_fresh(&mut self) -> Result<RefreshReport, SearchError> {
        self.ensure_index_fresh_with(&mut |_, _| {})
    }

    /// Like [`ensure_index_fresh`](Self::ensure_index_fresh), reporting
    /// `(embedded, to_embed)` after every embedding batch.
    pub fn ensure_index_fresh_with(
        &mut self,
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<RefreshReport, SearchError> {
        self.run_indexing(|pipeline| {
            let source = pipeline.locator.locate()?;
            let bookmarks = pipeline.reader.read(&source)?;
            pipeline.apply_snapshot(bookmarks, progress)
        })
    }

    /// Index an already extracted set of bookmarks as if it were a snapshot.
    pub fn index_bookmarks(
        &mut self,
        bookmarks: Vec<Bookmark>,
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<RefreshReport, SearchError> {
        self.run_indexing(|pipeline| pipeline.apply_snapshot(bookmarks, progress))
    }

    /// Throw away the persisted index and index everything again.
    pub fn rebuild(
        &mut self,
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<RefreshReport, SearchError> {
        {
            let _lock = self.lock()?;
            self.storage.delete()?;
        }
        log::info!("deleted persisted index, rebuilding");

        self.index = Some(VectorIndex::new(self.embedder.dimensions()));
        self.state = PipelineState::Uninitialized;
        self.last_refresh = None;

        self.ensure_index_fresh_with(progress)
    }

    /// Return the `k` bookmarks whose titles are most similar to `query`.
    pub fn search(&mut self, query: &str, k: usize) -> Result<Vec<SearchHit>, SearchError> {
        self.load_index()?;

        if self.index.as_ref().map_or(true, VectorIndex::is_empty) {
            return Err(SearchError::EmptyIndex);
        }

        let previous = self.state;
        self.state = PipelineState::Querying;
        let result = self.query(query, k);
        self.state = previous;

        result
    }

    fn query(&self, query: &str, k: usize) -> Result<Vec<SearchHit>, SearchError> {
        let text = preprocess_title(query);
        if text.is_empty() || k == 0 {
            return Ok(vec![]);
        }

        let index = self.index.as_ref().ok_or(SearchError::EmptyIndex)?;
        let query_embedding = self.embedder.embed(&text)?;

        let hits = index
            .search(&query_embedding, k)?
            .into_iter()
            .filter_map(|result| {
                index.get(result.id).map(|entry| SearchHit {
                    id: entry.id,
                    title: entry.title.clone(),
                    url: entry.url.clone(),
                    score: result.score,
                })
            })
            .collect();

        Ok(hits)
    }

    /// Enter `Indexing`, run `work`, and settle the resulting state.
    fn run_indexing<F>(&mut self, work: F) -> Result<RefreshReport, SearchError>
    where
        F: FnOnce(&mut Self) -> Result<RefreshReport, SearchError>,
    {
        let previous = self.state;
        self.state = PipelineState::Indexing;

        match work(self) {
            Ok(report) => {
                self.state = PipelineState::Ready;
                self.write_report(&report);
                self.last_refresh = Some(report.clone());
                Ok(report)
            }
            Err(err) => {
                log::error!("indexing failed: {err}");
                self.state = previous;
                Err(err)
            }
        }
    }

    fn apply_snapshot(
        &mut self,
        mut bookmarks: Vec<Bookmark>,
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<RefreshReport, SearchError> {
        let mut seen = HashSet::new();
        bookmarks.retain(|b| seen.insert(b.id));

        if self.index.is_none() {
            self.index = Some(self.load_persisted()?);
        }

        let plan = self.plan(&bookmarks);
        let hashes: Vec<u64> = plan.embed.iter().map(|b| content_hash(&b.title)).collect();
        let vectors = self.embed_all(&plan.embed, progress)?;

        let index = self.index.get_or_insert_with(|| VectorIndex::new(self.embedder.dimensions()));
        let inserted = index.add(vectors, &plan.embed, &hashes)?;

        let mut report = RefreshReport {
            total: bookmarks.len(),
            added: inserted,
            updated: plan.embed.len() - inserted,
            unchanged: plan.unchanged,
            refreshed_at: chrono::Utc::now().to_rfc3339(),
            ..Default::default()
        };

        for bookmark in &plan.relink {
            if index.set_url(bookmark.id, &bookmark.url) {
                report.relinked += 1;
            }
        }

        report.removed = index.retain_ids(&plan.keep).len();

        if report.has_changes() || !self.storage.exists() {
            if let Err(err) = self.save() {
                // memory is ahead of disk now; reload on next use
                self.index = None;
                return Err(err);
            }
            report.saved = true;
        }

        log::info!(
            "index refreshed: {} added, {} updated, {} relinked, {} removed, {} unchanged",
            report.added,
            report.updated,
            report.relinked,
            report.removed,
            report.unchanged
        );

        Ok(report)
    }

    /// Diff the snapshot against the current index.
    fn plan(&self, bookmarks: &[Bookmark]) -> RefreshPlan {
        let mut plan = RefreshPlan::default();

        for bookmark in bookmarks {
            plan.keep.insert(bookmark.id);

            let existing = self.index.as_ref().and_then(|index| index.get(bookmark.id));
            match existing {
                Some(entry) if entry.content_hash == content_hash(&bookmark.title) => {
                    if entry.url == bookmark.url {
                        plan.unchanged += 1;
                    } else {
                        plan.relink.push(bookmark.clone());
                    }
                }
                _ => plan.embed.push(bookmark.clone()),
            }
        }

        plan
    }

    fn embed_all(
        &self,
        bookmarks: &[Bookmark],
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<Vec<Vec<f32>>, SearchError> {
        let total = bookmarks.len();
        let mut vectors = Vec::with_capacity(total);

        if total > 0 {
            log::info!("embedding {total} titles with '{}'", self.embedder.name());
        }

        for chunk in bookmarks.chunks(self.batch_size) {
            let texts: Vec<String> = chunk.iter().map(|b| preprocess_title(&b.title)).collect();
            let batch = self.embedder.embed_batch(&texts)?;

            if batch.len() != texts.len() {
                return Err(EmbeddingError::EmbeddingFailed(format!(
                    "expected {} embeddings, got {}",
                    texts.len(),
                    batch.len()
                ))
                .into());
            }

            vectors.extend(batch);
            progress(vectors.len(), total);
        }

        Ok(vectors)
    }

    fn load_persisted(&self) -> Result<VectorIndex, SearchError> {
        let _lock = self.lock()?;
        let outcome = self
            .storage
            .load_outcome(&self.embedder.model_id_hash(), self.embedder.dimensions());
        Ok(outcome.into_index_or_empty(self.embedder.dimensions()))
    }

    fn save(&self) -> Result<(), SearchError> {
        let Some(index) = self.index.as_ref() else {
            return Ok(());
        };

        let _lock = self.lock()?;
        self.storage.save(index, &self.embedder.model_id_hash())?;
        Ok(())
    }

    fn read_report(&self) -> Option<RefreshReport> {
        let store = BackendLocal::new(&self.base_path).ok()?;
        if !store.exists(REPORT_FILE_NAME) {
            return None;
        }

        let parsed = store
            .read(REPORT_FILE_NAME)
            .map_err(|err| err.to_string())
            .and_then(|bytes| serde_json::from_slice(&bytes).map_err(|err| err.to_string()));

        match parsed {
            Ok(report) => Some(report),
            Err(err) => {
                log::warn!("ignoring unreadable {REPORT_FILE_NAME}: {err}");
                None
            }
        }
    }

    /// The report is informational; failing to write it doesn't fail the refresh.
    fn write_report(&self, report: &RefreshReport) {
        let result = serde_json::to_vec_pretty(report)
            .map_err(std::io::Error::from)
            .and_then(|bytes| BackendLocal::new(&self.base_path)?.write(REPORT_FILE_NAME, &bytes));

        if let Err(err) = result {
            log::warn!("failed to write {REPORT_FILE_NAME}: {err}");
        }
    }

    fn lock(&self) -> Result<FileLock, SearchError> {
        FileLock::acquire_blocking(&self.base_path).map_err(SearchError::Lock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::fixtures::WordEmbedder;

    fn pipeline(dir: &std::path::Path) -> SearchPipeline {
        SearchPipeline::new(
            Arc::new(WordEmbedder::new()),
            ProfileLocator::from_roots(vec![]),
            dir.to_path_buf(),
        )
    }

    #[test]
    fn test_starts_uninitialized() {
        let tmp = tempfile::tempdir().unwrap();
        let pipeline = pipeline(tmp.path());

        assert_eq!(pipeline.state(), PipelineState::Uninitialized);
        assert_eq!(pipeline.indexed_count(), 0);
        assert!(pipeline.status().last_refresh.is_none());
        assert_eq!(pipeline.status().index_path, tmp.path().join(INDEX_FILE_NAME));
    }

    #[test]
    fn test_search_on_fresh_index_is_empty_index_error() {
        let tmp = tempfile::tempdir().unwrap();
        let mut pipeline = pipeline(tmp.path());

        let result = pipeline.search("anything", 5);
        assert!(matches!(result, Err(SearchError::EmptyIndex)));
        assert_eq!(pipeline.state(), PipelineState::Uninitialized);
    }

    #[test]
    fn test_batch_size_is_at_least_one() {
        let tmp = tempfile::tempdir().unwrap();
        let mut pipeline = pipeline(tmp.path()).with_batch_size(0);

        let bookmarks = vec![
            Bookmark::new(1, "a", "https://a"),
            Bookmark::new(2, "b", "https://b"),
        ];
        let mut calls = Vec::new();
        pipeline
            .index_bookmarks(bookmarks, &mut |done, total| calls.push((done, total)))
            .unwrap();

        assert_eq!(calls, vec![(1, 2), (2, 2)]);
    }

    #[test]
    fn test_failed_refresh_restores_state() {
        let tmp = tempfile::tempdir().unwrap();
        let mut pipeline = pipeline(tmp.path());

        let result = pipeline.ensure_index_fresh();
        assert!(matches!(result, Err(SearchError::Locate(_))));
        assert_eq!(pipeline.state(), PipelineState::Uninitialized);

        pipeline
            .index_bookmarks(vec![Bookmark::new(1, "a", "https://a")], &mut |_, _| {})
            .unwrap();
        assert_eq!(pipeline.state(), PipelineState::Ready);

        assert!(pipeline.ensure_index_fresh().is_err());
        assert_eq!(pipeline.state(), PipelineState::Ready);
    }
}

//! Binary storage for the vector index.
//!
//! File format: index.bin
//!
//! Header (55 bytes):
//! - magic: [u8; 4] ("MSIX")
//! - version: u8 (1)
//! - model_id: [u8; 32] (SHA256 hash of model name)
//! - dimensions: u16 (little-endian)
//! - entry_count: u64 (little-endian)
//! - body_checksum: u32 (CRC32 of everything after the header)
//! - header_checksum: u32 (CRC32 of header fields before it)
//!
//! Entries (repeated, in index insertion order):
//! - bookmark_id: u64 (little-endian)
//! - content_hash: u64 (little-endian)
//! - title: u32 length + UTF-8 bytes
//! - url: u32 length + UTF-8 bytes
//! - embedding: [f32; dimensions] (little-endian)

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::semantic::index::{IndexEntry, VectorIndex};

/// Current file format version
const FORMAT_VERSION: u8 = 1;

const MAGIC: &[u8; 4] = b"MSIX";

/// magic(4) + version(1) + model_id(32) + dimensions(2) + entry_count(8)
/// + body_checksum(4) + header_checksum(4)
const HEADER_SIZE: usize = 55;

/// Longest title or url accepted when reading
const MAX_STRING_LEN: usize = 1 << 20;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum VectorStorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("Model mismatch: file uses different model")]
    ModelMismatch,

    #[error("Checksum mismatch: file may be corrupted")]
    ChecksumMismatch,

    #[error("Dimension mismatch: expected {expected}, file has {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// Result of a soft load.
#[derive(Debug)]
pub enum LoadOutcome {
    /// No persisted index yet
    Absent,
    /// A file exists but cannot be used
    Corrupt(VectorStorageError),
    Loaded(VectorIndex),
}

impl LoadOutcome {
    /// Resolve to a usable index, starting fresh when absent or corrupt.
    pub fn into_index_or_empty(self, dimensions: usize) -> VectorIndex {
        match self {
            LoadOutcome::Loaded(index) => {
                log::info!("Loaded {} vectors from storage", index.len());
                index
            }
            LoadOutcome::Absent => {
                log::info!("No existing index, starting fresh");
                VectorIndex::new(dimensions)
            }
            LoadOutcome::Corrupt(err) => {
                log::warn!("Persisted index unusable ({err}), rebuilding from scratch");
                VectorIndex::new(dimensions)
            }
        }
    }
}

/// Storage manager for the vector index.
pub struct VectorStorage {
    path: PathBuf,
}

impl VectorStorage {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load the index, reporting absence and corruption instead of failing.
    pub fn load_outcome(&self, expected_model_id: &[u8; 32], expected_dimensions: usize) -> LoadOutcome {
        match self.load(expected_model_id, expected_dimensions) {
            Ok(index) => LoadOutcome::Loaded(index),
            Err(VectorStorageError::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
                LoadOutcome::Absent
            }
            Err(err) => LoadOutcome::Corrupt(err),
        }
    }

    /// Load the vector index from storage.
    ///
    /// # Arguments
    /// * `expected_model_id` - SHA256 hash of the expected model name
    /// * `expected_dimensions` - Expected embedding dimensions
    pub fn load(
        &self,
        expected_model_id: &[u8; 32],
        expected_dimensions: usize,
    ) -> Result<VectorIndex, VectorStorageError> {
        let bytes = std::fs::read(&self.path)?;
        let mut reader = ByteReader::new(&bytes);

        let header = Self::read_header(&mut reader)?;
        Self::validate_header(&header, expected_model_id, expected_dimensions)?;

        let body = reader.rest();
        if crc32fast::hash(body) != header.body_checksum {
            return Err(VectorStorageError::ChecksumMismatch);
        }

        let dimensions = header.dimensions as usize;
        let mut index = VectorIndex::with_capacity(dimensions, (header.entry_count as usize).min(1 << 16));
        let mut body = ByteReader::new(body);

        for _ in 0..header.entry_count {
            let entry = Self::read_entry(&mut body, dimensions)?;
            index
                .upsert(entry)
                .map_err(|e| VectorStorageError::InvalidFormat(e.to_string()))?;
        }

        if !body.rest().is_empty() {
            return Err(VectorStorageError::InvalidFormat(
                "trailing data after last entry".to_string(),
            ));
        }

        Ok(index)
    }

    /// Save the vector index to storage.
    ///
    /// Uses atomic write: temp file -> fsync -> rename
    pub fn save(&self, index: &VectorIndex, model_id: &[u8; 32]) -> Result<(), VectorStorageError> {
        let temp_path = self.path.with_extension("tmp");

        let result = self.write_to_file(&temp_path, index, model_id);

        if result.is_err() {
            let _ = std::fs::remove_file(&temp_path);
            return result;
        }

        std::fs::rename(&temp_path, &self.path)?;
        log::debug!("saved {} vectors to {}", index.len(), self.path.display());

        Ok(())
    }

    /// Delete the storage file if it exists.
    pub fn delete(&self) -> Result<(), VectorStorageError> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    fn write_to_file(
        &self,
        path: &Path,
        index: &VectorIndex,
        model_id: &[u8; 32],
    ) -> Result<(), VectorStorageError> {
        let mut body = Vec::new();
        for entry in index.iter() {
            Self::write_entry(&mut body, entry)?;
        }

        let dimensions = u16::try_from(index.dimensions()).map_err(|_| {
            VectorStorageError::InvalidFormat(format!(
                "{} dimensions do not fit the header",
                index.dimensions()
            ))
        })?;

        let header = Header {
            model_id: *model_id,
            dimensions,
            entry_count: index.len() as u64,
            body_checksum: crc32fast::hash(&body),
        };

        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(&Self::encode_header(&header))?;
        writer.write_all(&body)?;

        writer.flush()?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;

        Ok(())
    }

    fn encode_header(header: &Header) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];

        bytes[0..4].copy_from_slice(MAGIC);
        bytes[4] = FORMAT_VERSION;
        bytes[5..37].copy_from_slice(&header.model_id);
        bytes[37..39].copy_from_slice(&header.dimensions.to_le_bytes());
        bytes[39..47].copy_from_slice(&header.entry_count.to_le_bytes());
        bytes[47..51].copy_from_slice(&header.body_checksum.to_le_bytes());

        let checksum = crc32fast::hash(&bytes[0..51]);
        bytes[51..55].copy_from_slice(&checksum.to_le_bytes());

        bytes
    }

    fn read_header(reader: &mut ByteReader<'_>) -> Result<Header, VectorStorageError> {
        let bytes = reader.take(HEADER_SIZE)?;

        if &bytes[0..4] != MAGIC {
            return Err(VectorStorageError::InvalidFormat(
                "not a marksearch index file".to_string(),
            ));
        }

        let version = bytes[4];
        if version != FORMAT_VERSION {
            return Err(VectorStorageError::VersionMismatch(version, FORMAT_VERSION));
        }

        let stored_checksum = u32::from_le_bytes(le_array(&bytes[51..55]));
        if crc32fast::hash(&bytes[0..51]) != stored_checksum {
            return Err(VectorStorageError::ChecksumMismatch);
        }

        Ok(Header {
            model_id: le_array(&bytes[5..37]),
            dimensions: u16::from_le_bytes(le_array(&bytes[37..39])),
            entry_count: u64::from_le_bytes(le_array(&bytes[39..47])),
            body_checksum: u32::from_le_bytes(le_array(&bytes[47..51])),
        })
    }

    fn validate_header(
        header: &Header,
        expected_model_id: &[u8; 32],
        expected_dimensions: usize,
    ) -> Result<(), VectorStorageError> {
        if header.model_id != *expected_model_id {
            return Err(VectorStorageError::ModelMismatch);
        }

        if header.dimensions as usize != expected_dimensions {
            return Err(VectorStorageError::DimensionMismatch {
                expected: expected_dimensions,
                got: header.dimensions as usize,
            });
        }

        Ok(())
    }

    fn read_entry(reader: &mut ByteReader<'_>, dimensions: usize) -> Result<IndexEntry, VectorStorageError> {
        let id = reader.read_u64()?;
        let content_hash = reader.read_u64()?;
        let title = reader.read_string()?;
        let url = reader.read_string()?;

        let mut embedding = Vec::with_capacity(dimensions);
        for _ in 0..dimensions {
            embedding.push(f32::from_le_bytes(le_array(reader.take(4)?)));
        }

        Ok(IndexEntry {
            id,
            content_hash,
            title,
            url,
            embedding,
        })
    }

    fn write_entry(out: &mut Vec<u8>, entry: &IndexEntry) -> Result<(), VectorStorageError> {
        out.extend_from_slice(&entry.id.to_le_bytes());
        out.extend_from_slice(&entry.content_hash.to_le_bytes());
        write_string(out, &entry.title)?;
        write_string(out, &entry.url)?;

        for &value in &entry.embedding {
            out.extend_from_slice(&value.to_le_bytes());
        }

        Ok(())
    }
}

fn write_string(out: &mut Vec<u8>, value: &str) -> Result<(), VectorStorageError> {
    if value.len() > MAX_STRING_LEN {
        return Err(VectorStorageError::InvalidFormat(format!(
            "string of {} bytes exceeds the {} byte limit",
            value.len(),
            MAX_STRING_LEN
        )));
    }

    out.extend_from_slice(&(value.len() as u32).to_le_bytes());
    out.extend_from_slice(value.as_bytes());
    Ok(())
}

/// Copy a slice of known length into a fixed array.
fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}

/// Bounds-checked cursor over an in-memory file.
struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], VectorStorageError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| VectorStorageError::InvalidFormat("file is truncated".to_string()))?;

        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    fn read_u64(&mut self) -> Result<u64, VectorStorageError> {
        Ok(u64::from_le_bytes(le_array(self.take(8)?)))
    }

    fn read_string(&mut self) -> Result<String, VectorStorageError> {
        let len = u32::from_le_bytes(le_array(self.take(4)?)) as usize;
        if len > MAX_STRING_LEN {
            return Err(VectorStorageError::InvalidFormat(format!(
                "string length {len} exceeds limit"
            )));
        }

        String::from_utf8(self.take(len)?.to_vec())
            .map_err(|e| VectorStorageError::InvalidFormat(format!("invalid UTF-8: {e}")))
    }
}

/// File header structure.
#[derive(Debug)]
struct Header {
    model_id: [u8; 32],
    dimensions: u16,
    entry_count: u64,
    body_checksum: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom};

    fn test_model_id() -> [u8; 32] {
        let mut id = [0u8; 32];
        id[0] = 0xAB;
        id[31] = 0xCD;
        id
    }

    fn entry(id: u64, title: &str, embedding: Vec<f32>) -> IndexEntry {
        IndexEntry {
            id,
            content_hash: id * 100,
            title: title.to_string(),
            url: format!("https://example.com/{id}"),
            embedding,
        }
    }

    fn sample_index() -> VectorIndex {
        let mut index = VectorIndex::new(3);
        index.upsert(entry(7, "Learn Rust", vec![1.0, 0.0, 0.0])).unwrap();
        index.upsert(entry(2, "", vec![0.0, 1.0, 0.0])).unwrap();
        index.upsert(entry(5, "日本語タイトル", vec![0.5, 0.5, 0.7])).unwrap();
        index
    }

    #[test]
    fn test_save_and_load_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = VectorStorage::new(tmp.path().join("index.bin"));
        let model_id = test_model_id();

        storage.save(&VectorIndex::new(384), &model_id).unwrap();
        assert!(storage.exists());

        let loaded = storage.load(&model_id, 384).unwrap();
        assert_eq!(loaded.len(), 0);
        assert_eq!(loaded.dimensions(), 384);
    }

    #[test]
    fn test_save_and_load_preserves_entries_and_order() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = VectorStorage::new(tmp.path().join("index.bin"));
        let model_id = test_model_id();
        let index = sample_index();

        storage.save(&index, &model_id).unwrap();
        let loaded = storage.load(&model_id, 3).unwrap();

        assert_eq!(loaded.ids().collect::<Vec<_>>(), vec![7, 2, 5]);
        assert_eq!(loaded.iter().collect::<Vec<_>>(), index.iter().collect::<Vec<_>>());

        let query = [0.4, 0.6, 0.1];
        assert_eq!(loaded.search(&query, 3).unwrap(), index.search(&query, 3).unwrap());
    }

    #[test]
    fn test_load_outcome_absent() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = VectorStorage::new(tmp.path().join("index.bin"));

        assert!(matches!(
            storage.load_outcome(&test_model_id(), 3),
            LoadOutcome::Absent
        ));
        assert!(storage
            .load_outcome(&test_model_id(), 3)
            .into_index_or_empty(3)
            .is_empty());
    }

    #[test]
    fn test_model_mismatch_is_corrupt() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = VectorStorage::new(tmp.path().join("index.bin"));
        storage.save(&sample_index(), &test_model_id()).unwrap();

        let mut wrong_model_id = [0u8; 32];
        wrong_model_id[0] = 0xFF;

        assert!(matches!(
            storage.load(&wrong_model_id, 3),
            Err(VectorStorageError::ModelMismatch)
        ));
        assert!(matches!(
            storage.load_outcome(&wrong_model_id, 3),
            LoadOutcome::Corrupt(VectorStorageError::ModelMismatch)
        ));
    }

    #[test]
    fn test_dimension_mismatch() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = VectorStorage::new(tmp.path().join("index.bin"));
        storage.save(&sample_index(), &test_model_id()).unwrap();

        let result = storage.load(&test_model_id(), 384);
        assert!(matches!(result, Err(VectorStorageError::DimensionMismatch { .. })));
    }

    #[test]
    fn test_atomic_write_cleans_up_on_error() {
        let path = PathBuf::from("/nonexistent/directory/index.bin");
        let storage = VectorStorage::new(path.clone());

        let result = storage.save(&sample_index(), &test_model_id());

        assert!(result.is_err());
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_delete() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = VectorStorage::new(tmp.path().join("index.bin"));
        storage.save(&sample_index(), &test_model_id()).unwrap();

        storage.delete().unwrap();
        assert!(!storage.exists());
        // deleting twice is fine
        storage.delete().unwrap();
    }

    #[test]
    fn test_header_checksum_detects_corruption() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("index.bin");
        let storage = VectorStorage::new(path.clone());
        storage.save(&sample_index(), &test_model_id()).unwrap();

        let mut file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(10)).unwrap();
        file.write_all(&[0xFF]).unwrap();
        drop(file);

        let result = storage.load(&test_model_id(), 3);
        assert!(matches!(result, Err(VectorStorageError::ChecksumMismatch)));
    }

    #[test]
    fn test_body_checksum_detects_corruption() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("index.bin");
        let storage = VectorStorage::new(path.clone());
        storage.save(&sample_index(), &test_model_id()).unwrap();

        let mut file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(HEADER_SIZE as u64 + 3)).unwrap();
        file.write_all(&[0x42]).unwrap();
        drop(file);

        let result = storage.load(&test_model_id(), 3);
        assert!(matches!(result, Err(VectorStorageError::ChecksumMismatch)));
    }

    #[test]
    fn test_truncated_and_garbage_files_are_corrupt() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("index.bin");
        let storage = VectorStorage::new(path.clone());

        storage.save(&sample_index(), &test_model_id()).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 5]).unwrap();
        assert!(matches!(
            storage.load_outcome(&test_model_id(), 3),
            LoadOutcome::Corrupt(_)
        ));

        std::fs::write(&path, b"garbage").unwrap();
        assert!(matches!(
            storage.load(&test_model_id(), 3),
            Err(VectorStorageError::InvalidFormat(_))
        ));

        let index = storage.load_outcome(&test_model_id(), 3).into_index_or_empty(3);
        assert!(index.is_empty());
        assert_eq!(index.dimensions(), 3);
    }

    #[test]
    fn test_newer_version_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("index.bin");
        let storage = VectorStorage::new(path.clone());
        storage.save(&sample_index(), &test_model_id()).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[4] = FORMAT_VERSION + 1;
        std::fs::write(&path, &bytes).unwrap();

        assert!(matches!(
            storage.load(&test_model_id(), 3),
            Err(VectorStorageError::VersionMismatch(_, FORMAT_VERSION))
        ));
    }
}

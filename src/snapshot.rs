//! Point-in-time copies of the live bookmark database.
//!
//! The browser keeps `places.sqlite` open (and writes to its WAL) while it
//! runs, so the database and its `-wal` companion are copied into a private
//! temporary directory and read from there. The directory lives exactly as
//! long as the [`Snapshot`] value and is removed when it is dropped.

use rusqlite::{Connection, OpenFlags};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::bookmarks::Bookmark;

const SNAPSHOT_PREFIX: &str = "marksearch-snapshot-";

/// Snapshot directories older than this were left by an interrupted run
const STALE_SNAPSHOT_AGE: Duration = Duration::from_secs(60 * 60);

/// Tables the extraction query depends on
const REQUIRED_TABLES: [&str; 2] = ["moz_bookmarks", "moz_places"];

/// Bookmark rows (type 1) joined with their place. Folders and separators
/// have no place and drop out of the join.
const BOOKMARKS_QUERY: &str = "
    SELECT b.id, COALESCE(b.title, ''), COALESCE(p.url, '')
    FROM moz_bookmarks b
    JOIN moz_places p ON b.fk = p.id
    WHERE b.type = 1
    ORDER BY b.id";

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("failed to create snapshot directory: {0}")]
    TempDir(std::io::Error),

    #[error("failed to copy {path}: {source}")]
    Copy {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to read bookmark database: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("unexpected bookmark database schema: missing table {0}")]
    UnexpectedSchema(&'static str),
}

/// A private copy of a bookmark database.
pub struct Snapshot {
    // removed with everything in it on drop
    _dir: tempfile::TempDir,
    db_path: PathBuf,
}

impl Snapshot {
    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// Extract every bookmark record from the copy.
    pub fn read_bookmarks(&self) -> Result<Vec<Bookmark>, SnapshotError> {
        // The copy is ours, so opening it writable is fine. SQLite may need
        // to create a `-shm` file next to a copied WAL.
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(self.path(), flags)?;

        for table in REQUIRED_TABLES {
            let count: i64 = conn.query_row(
                "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [table],
                |row| row.get(0),
            )?;
            if count == 0 {
                return Err(SnapshotError::UnexpectedSchema(table));
            }
        }

        let mut stmt = conn.prepare(BOOKMARKS_QUERY)?;
        let rows = stmt.query_map([], |row| {
            Ok(Bookmark {
                id: row.get::<_, i64>(0)? as u64,
                title: row.get(1)?,
                url: row.get(2)?,
            })
        })?;

        let mut bookmarks = Vec::new();
        for row in rows {
            bookmarks.push(row?);
        }

        Ok(bookmarks)
    }
}

/// Takes snapshots of a bookmark database and reads them.
#[derive(Debug, Clone)]
pub struct SnapshotReader {
    temp_root: Option<PathBuf>,
    stale_after: Duration,
}

impl Default for SnapshotReader {
    fn default() -> Self {
        Self {
            temp_root: None,
            stale_after: STALE_SNAPSHOT_AGE,
        }
    }
}

impl SnapshotReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place snapshot directories under `root` instead of the system temp dir.
    pub fn with_temp_root(root: PathBuf) -> Self {
        Self {
            temp_root: Some(root),
            ..Self::default()
        }
    }

    /// Age after which a leftover snapshot directory is removed.
    pub fn with_stale_after(mut self, age: Duration) -> Self {
        self.stale_after = age;
        self
    }

    /// Copy `source` (and its WAL, if any) into a fresh temporary directory.
    pub fn take(&self, source: &Path) -> Result<Snapshot, SnapshotError> {
        let root = self.temp_root.clone().unwrap_or_else(std::env::temp_dir);
        // Drop doesn't run when the process is killed mid-copy
        sweep_stale(&root, self.stale_after);

        let dir = tempfile::Builder::new()
            .prefix(SNAPSHOT_PREFIX)
            .tempdir_in(&root)
            .map_err(SnapshotError::TempDir)?;

        let file_name = source
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_else(|| "places.sqlite".into());
        let db_path = dir.path().join(&file_name);

        copy_file(source, &db_path)?;

        let mut wal_name = file_name;
        wal_name.push("-wal");
        let wal_source = source.with_file_name(&wal_name);
        if wal_source.is_file() {
            copy_file(&wal_source, &dir.path().join(&wal_name))?;
        }

        log::debug!("snapshot of {} at {}", source.display(), db_path.display());

        Ok(Snapshot { _dir: dir, db_path })
    }

    /// Snapshot `source`, extract its bookmarks and discard the snapshot.
    pub fn read(&self, source: &Path) -> Result<Vec<Bookmark>, SnapshotError> {
        let snapshot = self.take(source)?;
        let bookmarks = snapshot.read_bookmarks()?;
        log::info!(
            "read {} bookmarks from {}",
            bookmarks.len(),
            source.display()
        );
        Ok(bookmarks)
    }
}

fn copy_file(from: &Path, to: &Path) -> Result<(), SnapshotError> {
    std::fs::copy(from, to)
        .map(|_| ())
        .map_err(|source| SnapshotError::Copy {
            path: from.to_path_buf(),
            source,
        })
}

/// Remove snapshot directories under `root` older than `max_age`.
fn sweep_stale(root: &Path, max_age: Duration) {
    let Ok(entries) = std::fs::read_dir(root) else {
        return;
    };

    for entry in entries.filter_map(|entry| entry.ok()) {
        if !entry.file_name().to_string_lossy().starts_with(SNAPSHOT_PREFIX) {
            continue;
        }

        let age = entry
            .metadata()
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|modified| modified.elapsed().ok());

        if age.is_some_and(|age| age >= max_age) {
            let path = entry.path();
            match std::fs::remove_dir_all(&path) {
                Ok(()) => log::info!("removed stale snapshot {}", path.display()),
                Err(err) => log::warn!("cannot remove stale snapshot {}: {err}", path.display()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::fixtures::create_places_db;

    fn dir_is_empty(path: &Path) -> bool {
        std::fs::read_dir(path).unwrap().next().is_none()
    }

    #[test]
    fn test_reads_bookmarks_and_cleans_up() {
        let tmp = tempfile::tempdir().unwrap();
        let temp_root = tmp.path().join("snapshots");
        std::fs::create_dir_all(&temp_root).unwrap();

        let source = tmp.path().join("places.sqlite");
        create_places_db(
            &source,
            &[
                (2, Some("Learn Rust"), "https://rust-lang.org/learn"),
                (3, None, "https://example.com/untitled"),
                (4, Some("Cooking recipes"), "https://food.example"),
            ],
        );

        let reader = SnapshotReader::with_temp_root(temp_root.clone());
        let bookmarks = reader.read(&source).unwrap();

        assert_eq!(bookmarks.len(), 3);
        assert_eq!(bookmarks[0].id, 2);
        assert_eq!(bookmarks[0].title, "Learn Rust");
        assert_eq!(bookmarks[0].url, "https://rust-lang.org/learn");
        assert_eq!(bookmarks[1].title, "");
        assert_eq!(bookmarks[2].title, "Cooking recipes");

        assert!(dir_is_empty(&temp_root));
    }

    #[test]
    fn test_folders_are_not_bookmarks() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("places.sqlite");
        create_places_db(&source, &[(5, Some("Only one"), "https://one.example")]);

        let bookmarks = SnapshotReader::new().read(&source).unwrap();
        // the fixture's root folder and separator must not show up
        assert_eq!(bookmarks.len(), 1);
        assert_eq!(bookmarks[0].id, 5);
    }

    #[test]
    fn test_snapshot_lives_until_dropped() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("places.sqlite");
        create_places_db(&source, &[(2, Some("a"), "https://a.example")]);

        let snapshot = SnapshotReader::new().take(&source).unwrap();
        let dir = snapshot.path().parent().unwrap().to_path_buf();
        assert!(snapshot.path().is_file());
        assert_eq!(snapshot.read_bookmarks().unwrap().len(), 1);

        drop(snapshot);
        assert!(!dir.exists());
    }

    #[test]
    fn test_non_database_file_fails_without_leftovers() {
        let tmp = tempfile::tempdir().unwrap();
        let temp_root = tmp.path().join("snapshots");
        std::fs::create_dir_all(&temp_root).unwrap();

        let source = tmp.path().join("places.sqlite");
        std::fs::write(&source, "this is not an sqlite database\n".repeat(200)).unwrap();

        let reader = SnapshotReader::with_temp_root(temp_root.clone());
        let result = reader.read(&source);

        assert!(matches!(result, Err(SnapshotError::Database(_))));
        assert!(dir_is_empty(&temp_root));
    }

    #[test]
    fn test_unexpected_schema() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("places.sqlite");
        let conn = Connection::open(&source).unwrap();
        conn.execute_batch("CREATE TABLE moz_bookmarks (id INTEGER PRIMARY KEY);")
            .unwrap();
        drop(conn);

        let result = SnapshotReader::new().read(&source);
        assert!(matches!(
            result,
            Err(SnapshotError::UnexpectedSchema("moz_places"))
        ));
    }

    #[test]
    fn test_missing_source_is_copy_error() {
        let tmp = tempfile::tempdir().unwrap();
        let temp_root = tmp.path().join("snapshots");
        std::fs::create_dir_all(&temp_root).unwrap();

        let reader = SnapshotReader::with_temp_root(temp_root.clone());
        let result = reader.read(&tmp.path().join("missing.sqlite"));

        assert!(matches!(result, Err(SnapshotError::Copy { .. })));
        assert!(dir_is_empty(&temp_root));
    }

    #[test]
    fn test_leftover_snapshots_are_swept() {
        let tmp = tempfile::tempdir().unwrap();
        let temp_root = tmp.path().join("snapshots");
        let leftover = temp_root.join(format!("{SNAPSHOT_PREFIX}interrupted"));
        let unrelated = temp_root.join("someone-else");
        std::fs::create_dir_all(&leftover).unwrap();
        std::fs::create_dir_all(&unrelated).unwrap();
        std::fs::write(leftover.join("places.sqlite"), b"half a copy").unwrap();

        let source = tmp.path().join("places.sqlite");
        create_places_db(&source, &[(2, Some("a"), "https://a.example")]);

        let reader = SnapshotReader::with_temp_root(temp_root.clone())
            .with_stale_after(Duration::ZERO);
        assert_eq!(reader.read(&source).unwrap().len(), 1);

        assert!(!leftover.exists());
        assert!(unrelated.exists());
    }

    #[test]
    fn test_recent_snapshots_of_other_runs_are_kept() {
        let tmp = tempfile::tempdir().unwrap();
        let temp_root = tmp.path().join("snapshots");
        let active = temp_root.join(format!("{SNAPSHOT_PREFIX}in-progress"));
        std::fs::create_dir_all(&active).unwrap();

        let source = tmp.path().join("places.sqlite");
        create_places_db(&source, &[(2, Some("a"), "https://a.example")]);

        SnapshotReader::with_temp_root(temp_root).read(&source).unwrap();

        assert!(active.exists());
    }
}

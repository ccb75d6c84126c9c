//! Browser profile discovery.
//!
//! Finds the `places.sqlite` database of the default Firefox profile by
//! walking an ordered list of candidate roots for the host operating system.
//! Within a root every child directory is a profile candidate; the largest
//! `places.sqlite` that actually carries a `moz_bookmarks` table wins.
//! The first root yielding a valid profile ends the search.

use rusqlite::{Connection, ErrorCode, OpenFlags};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File name of the Firefox bookmark/history database
pub const PLACES_FILE_NAME: &str = "places.sqlite";

/// Databases smaller than this are fresh, never-used profiles
pub const DEFAULT_MIN_PROFILE_SIZE: u64 = 100 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum LocateError {
    #[error("no browser profile with bookmarks found (searched: {})", display_paths(.searched))]
    ProfileNotFound { searched: Vec<PathBuf> },
}

fn display_paths(paths: &[PathBuf]) -> String {
    if paths.is_empty() {
        return "nothing".to_string();
    }

    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsFamily {
    Windows,
    MacOs,
    Linux,
}

impl OsFamily {
    pub fn current() -> Self {
        match std::env::consts::OS {
            "windows" => OsFamily::Windows,
            "macos" => OsFamily::MacOs,
            _ => OsFamily::Linux,
        }
    }
}

/// The bits of the host environment that decide where profiles live.
#[derive(Debug, Clone)]
pub struct HostEnv {
    pub os: OsFamily,
    pub home: Option<PathBuf>,
    pub appdata: Option<PathBuf>,
}

impl HostEnv {
    pub fn current() -> Self {
        let home = match homedir::my_home() {
            Ok(home) => home,
            Err(err) => {
                log::warn!("could not determine home directory: {err}");
                None
            }
        };

        Self {
            os: OsFamily::current(),
            home,
            appdata: std::env::var_os("APPDATA").map(PathBuf::from),
        }
    }
}

/// A directory that may contain browser profiles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateRoot {
    pub label: &'static str,
    pub path: PathBuf,
}

type RootStrategy = fn(&HostEnv) -> Option<PathBuf>;

/// Known default install locations, tried in order.
const ROOT_STRATEGIES: &[(OsFamily, &str, RootStrategy)] = &[
    (OsFamily::Windows, "firefox (appdata)", windows_appdata),
    (OsFamily::MacOs, "firefox (application support)", macos_application_support),
    (OsFamily::Linux, "firefox", linux_dot_mozilla),
    (OsFamily::Linux, "firefox (snap)", linux_snap),
    (OsFamily::Linux, "firefox (flatpak)", linux_flatpak),
];

fn windows_appdata(env: &HostEnv) -> Option<PathBuf> {
    env.appdata
        .as_ref()
        .map(|appdata| appdata.join("Mozilla").join("Firefox").join("Profiles"))
}

fn macos_application_support(env: &HostEnv) -> Option<PathBuf> {
    env.home.as_ref().map(|home| {
        home.join("Library")
            .join("Application Support")
            .join("Firefox")
            .join("Profiles")
    })
}

fn linux_dot_mozilla(env: &HostEnv) -> Option<PathBuf> {
    env.home
        .as_ref()
        .map(|home| home.join(".mozilla").join("firefox"))
}

fn linux_snap(env: &HostEnv) -> Option<PathBuf> {
    env.home.as_ref().map(|home| {
        home.join("snap")
            .join("firefox")
            .join("common")
            .join(".mozilla")
            .join("firefox")
    })
}

fn linux_flatpak(env: &HostEnv) -> Option<PathBuf> {
    env.home.as_ref().map(|home| {
        home.join(".var")
            .join("app")
            .join("org.mozilla.firefox")
            .join(".mozilla")
            .join("firefox")
    })
}

/// Candidate roots for the given host, in the order they are tried.
pub fn candidate_roots(env: &HostEnv) -> Vec<CandidateRoot> {
    ROOT_STRATEGIES
        .iter()
        .filter(|(os, _, _)| *os == env.os)
        .filter_map(|(_, label, strategy)| {
            strategy(env).map(|path| CandidateRoot { label: *label, path })
        })
        .collect()
}

pub struct ProfileLocator {
    roots: Vec<CandidateRoot>,
    min_size: u64,
    override_path: Option<PathBuf>,
}

impl ProfileLocator {
    /// Locator using the default install locations of the given host.
    pub fn for_host(env: &HostEnv) -> Self {
        Self::from_roots(candidate_roots(env))
    }

    pub fn from_roots(roots: Vec<CandidateRoot>) -> Self {
        Self {
            roots,
            min_size: DEFAULT_MIN_PROFILE_SIZE,
            override_path: None,
        }
    }

    pub fn with_min_size(mut self, min_size: u64) -> Self {
        self.min_size = min_size;
        self
    }

    /// A manually chosen profile directory or `places.sqlite` file.
    /// When set, discovery is skipped entirely.
    pub fn with_override(mut self, path: Option<PathBuf>) -> Self {
        self.override_path = path;
        self
    }

    pub fn roots(&self) -> &[CandidateRoot] {
        &self.roots
    }

    /// Return the path of the bookmark database to index.
    pub fn locate(&self) -> Result<PathBuf, LocateError> {
        if let Some(path) = &self.override_path {
            return Self::resolve_override(path);
        }

        for root in &self.roots {
            if !root.path.is_dir() {
                log::debug!("skipping missing profile root {}", root.path.display());
                continue;
            }

            if let Some(places) = self.scan_root(&root.path) {
                log::info!("using {} profile at {}", root.label, places.display());
                return Ok(places);
            }
        }

        Err(LocateError::ProfileNotFound {
            searched: self.roots.iter().map(|r| r.path.clone()).collect(),
        })
    }

    fn resolve_override(path: &Path) -> Result<PathBuf, LocateError> {
        let places = if path.is_dir() {
            path.join(PLACES_FILE_NAME)
        } else {
            path.to_path_buf()
        };

        if places.is_file() {
            Ok(places)
        } else {
            Err(LocateError::ProfileNotFound {
                searched: vec![places],
            })
        }
    }

    /// Pick the largest qualifying `places.sqlite` among the root's children.
    fn scan_root(&self, root: &Path) -> Option<PathBuf> {
        let entries = match std::fs::read_dir(root) {
            Ok(entries) => entries,
            Err(err) => {
                log::warn!("cannot list {}: {err}", root.display());
                return None;
            }
        };

        let mut best: Option<(PathBuf, u64)> = None;

        for entry in entries.filter_map(|entry| entry.ok()) {
            let places = entry.path().join(PLACES_FILE_NAME);
            let size = match std::fs::metadata(&places) {
                Ok(meta) if meta.is_file() => meta.len(),
                _ => continue,
            };

            if size < self.min_size {
                continue;
            }

            if best.as_ref().is_some_and(|(_, best_size)| size <= *best_size) {
                continue;
            }

            if has_bookmarks_table(&places) {
                best = Some((places, size));
            }
        }

        best.map(|(path, _)| path)
    }
}

fn has_bookmarks_table(path: &Path) -> bool {
    let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = match Connection::open_with_flags(path, flags) {
        Ok(conn) => conn,
        Err(err) => {
            log::debug!("cannot open {}: {err}", path.display());
            return false;
        }
    };

    // a running browser holds the database exclusively; don't wait on it
    if let Err(err) = conn.busy_timeout(Duration::ZERO) {
        log::debug!("cannot set busy timeout on {}: {err}", path.display());
    }

    match conn.query_row(
        "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = 'moz_bookmarks'",
        [],
        |row| row.get::<_, i64>(0),
    ) {
        Ok(count) => count > 0,
        Err(err) if is_locked(&err) => {
            // in use by the browser, so it is a live profile; the snapshot
            // copy is what gets inspected later
            log::debug!("{} is locked, accepting it as in use", path.display());
            true
        }
        Err(err) => {
            log::debug!("cannot inspect {}: {err}", path.display());
            false
        }
    }
}

fn is_locked(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _)
            if matches!(failure.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Small files kept directly in the data directory.
#[derive(Clone, Debug)]
pub struct BackendLocal {
    base_dir: PathBuf,
}

impl BackendLocal {
    pub fn new(base_dir: &Path) -> io::Result<Self> {
        std::fs::create_dir_all(base_dir)?;
        Ok(BackendLocal {
            base_dir: base_dir.to_path_buf(),
        })
    }

    pub fn exists(&self, ident: &str) -> bool {
        self.base_dir.join(ident).is_file()
    }

    pub fn read(&self, ident: &str) -> io::Result<Vec<u8>> {
        std::fs::read(self.base_dir.join(ident))
    }

    /// Replace `ident` atomically: readers see the old or the new content, never a mix.
    pub fn write(&self, ident: &str, data: &[u8]) -> io::Result<()> {
        let mut temp = tempfile::NamedTempFile::new_in(&self.base_dir)?;
        temp.write_all(data)?;
        temp.as_file().sync_all()?;
        temp.persist(self.base_dir.join(ident))
            .map_err(|err| err.error)?;
        Ok(())
    }
}

//! On-disk cache for generated artifacts (tiles, rendered pages).
//!
//! Files are written to a temporary name and renamed into place on commit,
//! so readers never see a partially written entry.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tempfile::NamedTempFile;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct CacheDir {
    root: PathBuf,
    max_age: Duration,
}

impl CacheDir {
    pub fn new(root: impl AsRef<Path>, max_age: Duration) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            max_age,
        }
    }

    /// Creates the directory and, if asked, empties it. Returns how many
    /// files were removed.
    pub fn prepare(&self, cleanup: bool) -> io::Result<usize> {
        fs::create_dir_all(&self.root)?;
        if !cleanup {
            return Ok(0);
        }
        let mut removed = 0;
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.is_file() {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        info!("Cleaned {} cached file(s) from {}", removed, self.root.display());
        Ok(removed)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    /// Path of the entry `name`. Path separators and leading dots are
    /// replaced so entries cannot escape the cache directory.
    pub fn path_for(&self, name: &str) -> PathBuf {
        let mut safe: String = name
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        if safe.starts_with('.') {
            safe.replace_range(..1, "_");
        }
        self.root.join(safe)
    }

    /// True if the entry exists and is younger than the maximum age.
    pub fn is_fresh(&self, name: &str) -> bool {
        fs::metadata(self.path_for(name))
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .is_some_and(|age| age < self.max_age)
    }

    pub fn create(&self, name: &str) -> io::Result<CacheFile> {
        let file = tempfile::Builder::new()
            .prefix(".tmp-")
            .tempfile_in(&self.root)?;
        Ok(CacheFile {
            file,
            target: self.path_for(name),
        })
    }

    pub fn remove(&self, name: &str) -> io::Result<()> {
        match fs::remove_file(self.path_for(name)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    /// Removes entries older than the maximum age as of `now`.
    pub fn purge_expired(&self, now: SystemTime) -> io::Result<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            let expired = meta
                .modified()
                .ok()
                .and_then(|m| now.duration_since(m).ok())
                .is_some_and(|age| age >= self.max_age);
            if expired {
                fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        if removed > 0 {
            debug!("Purged {} expired cache file(s)", removed);
        }
        Ok(removed)
    }
}

/// A cache entry being written.
pub struct CacheFile {
    file: NamedTempFile,
    target: PathBuf,
}

impl CacheFile {
    /// Moves the finished file into place.
    pub fn commit(mut self) -> io::Result<PathBuf> {
        self.file.flush()?;
        self.file.persist(&self.target).map_err(|e| e.error)?;
        Ok(self.target)
    }
}

impl Write for CacheFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

//! Disk reader interface and its implementations.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

/// Bytes of a file plus the metadata the record store keeps.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub bytes: Vec<u8>,
    pub hash: String,
    pub mtime: i64,
}

impl SourceFile {
    pub fn new(bytes: Vec<u8>, mtime: i64) -> Self {
        let hash = content_hash(&bytes);
        Self { bytes, hash, mtime }
    }
}

pub fn content_hash(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

pub trait SourceReader: Send + Sync {
    fn read(&self, path: &Path) -> io::Result<SourceFile>;
    fn exists(&self, path: &Path) -> bool;
}

/// Reads straight from the filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiskReader;

impl SourceReader for DiskReader {
    fn read(&self, path: &Path) -> io::Result<SourceFile> {
        let bytes = std::fs::read(path)?;
        let mtime = std::fs::metadata(path)?
            .modified()?
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        Ok(SourceFile::new(bytes, mtime))
    }

    fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }
}

/// In-memory file set, used for embedding and tests. Counts reads so callers
/// can observe reparses.
#[derive(Debug, Default)]
pub struct MemoryReader {
    files: RwLock<HashMap<PathBuf, String>>,
    reads: AtomicUsize,
}

#[allow(dead_code)]
impl MemoryReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_files<P, S>(files: impl IntoIterator<Item = (P, S)>) -> Self
    where
        P: Into<PathBuf>,
        S: Into<String>,
    {
        let reader = Self::new();
        for (path, text) in files {
            reader.insert(path, text);
        }
        reader
    }

    pub fn insert(&self, path: impl Into<PathBuf>, text: impl Into<String>) {
        if let Ok(mut files) = self.files.write() {
            files.insert(path.into(), text.into());
        }
    }

    pub fn remove(&self, path: &Path) {
        if let Ok(mut files) = self.files.write() {
            files.remove(path);
        }
    }

    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }
}

impl SourceReader for MemoryReader {
    fn read(&self, path: &Path) -> io::Result<SourceFile> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let files = self
            .files
            .read()
            .map_err(|_| io::Error::other("memory reader lock poisoned"))?;
        match files.get(path) {
            Some(text) => Ok(SourceFile::new(text.as_bytes().to_vec(), 0)),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} not found", path.display()),
            )),
        }
    }

    fn exists(&self, path: &Path) -> bool {
        self.files
            .read()
            .map(|files| files.contains_key(path))
            .unwrap_or(false)
    }
}

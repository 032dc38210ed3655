//! Durable blob store for large objects.
//!
//! Keys are relative slash-separated paths (`bundles/latex-base.data`,
//! `fmt-cache/1a2b3c4d_pdflatex.fmt`, package files under their VFS paths)
//! mapped directly onto a directory tree under the store root.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::warn;

use super::CacheError;

/// Directory-backed store for bundle bodies, format files, and package
/// files. Reads hand out owned buffers; the canonical bytes on disk are
/// never exposed by reference.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn open(root: &Path) -> Result<Self, CacheError> {
        fs::create_dir_all(root).map_err(|source| CacheError::Io {
            path: root.to_path_buf(),
            source,
        })?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        // Keys are engine-namespace paths; strip the leading slash so
        // absolute VFS paths nest under the store root.
        self.root.join(key.trim_start_matches('/'))
    }

    /// Read a blob. Missing keys are `None`; I/O failures are errors.
    pub fn read(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let path = self.path_for(key);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(CacheError::Io { path, source }),
        }
    }

    /// Write a blob, creating parent directories as needed.
    pub fn write(&self, key: &str, bytes: &[u8]) -> Result<(), CacheError> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| CacheError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        fs::write(&path, bytes).map_err(|source| CacheError::Io { path, source })
    }

    /// Fire-and-forget write: persistence failures are logged, never
    /// surfaced to the compile path.
    pub fn write_logged(&self, key: &str, bytes: &[u8]) {
        if let Err(e) = self.write(key, bytes) {
            warn!(key = %key, error = %e, "blob write failed");
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.path_for(key).is_file()
    }

    /// Delete every blob in the store.
    pub fn clear(&self) -> Result<(), CacheError> {
        if self.root.exists() {
            fs::remove_dir_all(&self.root).map_err(|source| CacheError::Io {
                path: self.root.clone(),
                source,
            })?;
        }
        fs::create_dir_all(&self.root).map_err(|source| CacheError::Io {
            path: self.root.clone(),
            source,
        })
    }

    /// Total bytes on disk, for cache statistics.
    pub fn size_bytes(&self) -> u64 {
        fn walk(dir: &Path) -> u64 {
            let mut total = 0;
            if let Ok(entries) = fs::read_dir(dir) {
                for entry in entries.flatten() {
                    let path = entry.path();
                    if path.is_dir() {
                        total += walk(&path);
                    } else if let Ok(meta) = entry.metadata() {
                        total += meta.len();
                    }
                }
            }
            total
        }
        walk(&self.root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_then_read_round_trip() {
        let temp = TempDir::new().unwrap();
        let store = BlobStore::open(temp.path()).unwrap();

        store.write("bundles/latex-base.data", b"body bytes").unwrap();
        let read = store.read("bundles/latex-base.data").unwrap();
        assert_eq!(read, Some(b"body bytes".to_vec()));
    }

    #[test]
    fn test_read_missing_is_none() {
        let temp = TempDir::new().unwrap();
        let store = BlobStore::open(temp.path()).unwrap();
        assert_eq!(store.read("missing").unwrap(), None);
    }

    #[test]
    fn test_vfs_path_keys_nest() {
        let temp = TempDir::new().unwrap();
        let store = BlobStore::open(temp.path()).unwrap();

        store
            .write("/texlive/texmf-dist/tex/latex/foo/foo.sty", b"sty")
            .unwrap();
        assert!(store.contains("/texlive/texmf-dist/tex/latex/foo/foo.sty"));
    }

    #[test]
    fn test_clear_empties_store() {
        let temp = TempDir::new().unwrap();
        let store = BlobStore::open(temp.path()).unwrap();

        store.write("a/b", b"1").unwrap();
        store.clear().unwrap();
        assert_eq!(store.read("a/b").unwrap(), None);
        assert_eq!(store.size_bytes(), 0);
    }

    #[test]
    fn test_size_bytes_sums_files() {
        let temp = TempDir::new().unwrap();
        let store = BlobStore::open(temp.path()).unwrap();

        store.write("a", &[0u8; 100]).unwrap();
        store.write("b/c", &[0u8; 50]).unwrap();
        assert_eq!(store.size_bytes(), 150);
    }
}

//! Durable metadata store: one table per record kind, JSON rows on disk,
//! with version-gated invalidation.
//!
//! Each table directory holds a `_version` file. Opening a table with a
//! newer code version than the stored one clears the table wholesale and
//! re-stamps it.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{info, warn};

use super::CacheError;

const VERSION_FILE: &str = "_version";

/// JSON-record store with one directory per table.
#[derive(Debug, Clone)]
pub struct MetaStore {
    root: PathBuf,
}

impl MetaStore {
    pub fn open(root: &Path) -> Result<Self, CacheError> {
        fs::create_dir_all(root).map_err(|source| CacheError::Io {
            path: root.to_path_buf(),
            source,
        })?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn table_dir(&self, table: &str) -> PathBuf {
        self.root.join(table)
    }

    fn row_path(&self, table: &str, key: &str) -> PathBuf {
        // Keys may contain characters that are not filesystem-safe.
        let safe: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            })
            .collect();
        self.table_dir(table).join(format!("{safe}.json"))
    }

    /// Ensure a table exists at the given cache version, evicting it if the
    /// stored version is older.
    pub fn open_table(&self, table: &str, version: u32) -> Result<(), CacheError> {
        let dir = self.table_dir(table);
        let version_path = dir.join(VERSION_FILE);
        let stored = fs::read_to_string(&version_path)
            .ok()
            .and_then(|s| s.trim().parse::<u32>().ok());
        match stored {
            Some(v) if v >= version => return Ok(()),
            Some(v) => {
                info!(table = %table, stored = v, current = version, "cache version bump, evicting table");
                fs::remove_dir_all(&dir).map_err(|source| CacheError::Io {
                    path: dir.clone(),
                    source,
                })?;
            }
            None => {}
        }
        fs::create_dir_all(&dir).map_err(|source| CacheError::Io {
            path: dir.clone(),
            source,
        })?;
        fs::write(&version_path, version.to_string()).map_err(|source| CacheError::Io {
            path: version_path,
            source,
        })
    }

    pub fn get<T: DeserializeOwned>(&self, table: &str, key: &str) -> Option<T> {
        let path = self.row_path(table, key);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(table = %table, key = %key, error = %e, "metadata read failed");
                }
                return None;
            }
        };
        match serde_json::from_slice(&raw) {
            Ok(row) => Some(row),
            Err(e) => {
                warn!(table = %table, key = %key, error = %e, "corrupt metadata row, dropping");
                let _ = fs::remove_file(&path);
                None
            }
        }
    }

    /// Fire-and-forget row write.
    pub fn put<T: Serialize>(&self, table: &str, key: &str, row: &T) {
        let path = self.row_path(table, key);
        let write = || -> io::Result<()> {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let raw = serde_json::to_vec(row).map_err(io::Error::other)?;
            fs::write(&path, raw)
        };
        if let Err(e) = write() {
            warn!(table = %table, key = %key, error = %e, "metadata write failed");
        }
    }

    /// Remove every table.
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Row {
        blob: String,
        size: u64,
    }

    #[test]
    fn test_put_then_get() {
        let temp = TempDir::new().unwrap();
        let store = MetaStore::open(temp.path()).unwrap();
        store.open_table("formats", 1).unwrap();

        let row = Row {
            blob: "fmt-cache/abc_pdflatex.fmt".to_string(),
            size: 42,
        };
        store.put("formats", "abc_pdflatex", &row);
        assert_eq!(store.get::<Row>("formats", "abc_pdflatex"), Some(row));
    }

    #[test]
    fn test_version_bump_evicts_table() {
        let temp = TempDir::new().unwrap();
        let store = MetaStore::open(temp.path()).unwrap();

        store.open_table("packages", 1).unwrap();
        store.put("packages", "amsmath", &Row { blob: "x".into(), size: 1 });
        assert!(store.get::<Row>("packages", "amsmath").is_some());

        store.open_table("packages", 2).unwrap();
        assert!(store.get::<Row>("packages", "amsmath").is_none());
    }

    #[test]
    fn test_same_version_preserves_rows() {
        let temp = TempDir::new().unwrap();
        let store = MetaStore::open(temp.path()).unwrap();

        store.open_table("pdfs", 3).unwrap();
        store.put("pdfs", "k", &Row { blob: "y".into(), size: 2 });

        store.open_table("pdfs", 3).unwrap();
        assert!(store.get::<Row>("pdfs", "k").is_some());
    }

    #[test]
    fn test_corrupt_row_is_dropped() {
        let temp = TempDir::new().unwrap();
        let store = MetaStore::open(temp.path()).unwrap();
        store.open_table("aux", 1).unwrap();

        let path = temp.path().join("aux").join("bad.json");
        fs::write(&path, b"{not json").unwrap();
        assert!(store.get::<Row>("aux", "bad").is_none());
        assert!(!path.exists());
    }

    #[test]
    fn test_keys_with_slashes_are_sanitized() {
        let temp = TempDir::new().unwrap();
        let store = MetaStore::open(temp.path()).unwrap();
        store.open_table("packages", 1).unwrap();

        store.put("packages", "a/b:c", &Row { blob: "z".into(), size: 3 });
        assert!(store.get::<Row>("packages", "a/b:c").is_some());
    }
}

//! The persistent cache: memory overlays in front of a durable blob store
//! and a durable metadata store.
//!
//! # Tiers
//!
//! - **Blob store** — bundle bodies, format files, individual package files
//!   under their VFS paths, the engine image.
//! - **Metadata store** — JSON rows for packages (file lists, dependencies,
//!   `not_found` markers), PDFs, aux-file sets, formats, the engine image.
//! - **Memory overlay** — bundle bodies and packages/formats are retained
//!   for the session; the PDF overlay is a bounded LRU (moka).
//!
//! Every logical tier carries an integer cache version. Opening a tier whose
//! stored version is older clears it wholesale and re-stamps it. Writes are
//! fire-and-forget: a failed persist is logged and never fails a compile.

mod blob;
mod meta;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::Engine as _;
use chrono::{DateTime, Utc};
use moka::future::Cache as MokaCache;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub use blob::BlobStore;
pub use meta::MetaStore;

/// Code-side cache versions. Bumping one evicts the matching tier on the
/// next open.
pub mod version {
    /// Remote packages fetched through the proxy.
    pub const CTAN: u32 = 2;
    /// Bundle bodies.
    pub const BUNDLE: u32 = 1;
    /// The compiled engine image.
    pub const WASM: u32 = 1;
    /// Aux-file sets.
    pub const AUX: u32 = 1;
    /// Compiled document PDFs.
    pub const DOC: u32 = 1;
    /// Dumped format files.
    pub const FMT: u32 = 1;
}

const TABLE_PACKAGES: &str = "packages";
const TABLE_PDFS: &str = "pdfs";
const TABLE_AUX: &str = "aux";
const TABLE_FORMATS: &str = "formats";
const TABLE_ENGINE: &str = "engine";

/// Bounded size of the in-memory PDF overlay, in entries.
const PDF_OVERLAY_CAPACITY: u64 = 32;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct PackageRecord {
    files: Vec<String>,
    dependencies: Vec<String>,
    not_found: bool,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PdfRecord {
    blob: String,
    size: u64,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct AuxRecord {
    // Aux files are small; their bytes live inline, base64-coded.
    files: HashMap<String, String>,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FormatRecord {
    blob: String,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct EngineImageRecord {
    blob: String,
    size: u64,
    timestamp: DateTime<Utc>,
}

/// A package as remembered by the cache: either its file map and declared
/// dependencies, or a negative `not_found` marker that short-circuits any
/// further fetch for the rest of the session (and beyond).
#[derive(Debug, Clone, Default)]
pub struct CachedPackage {
    pub not_found: bool,
    pub files: HashMap<String, Vec<u8>>,
    pub dependencies: Vec<String>,
}

/// All cache tiers behind one handle. Cheap to clone and share.
#[derive(Clone)]
pub struct TexCache {
    blob: BlobStore,
    meta: MetaStore,
    bundles: Arc<RwLock<HashMap<String, Arc<Vec<u8>>>>>,
    packages: Arc<RwLock<HashMap<String, Arc<CachedPackage>>>>,
    formats: Arc<RwLock<HashMap<String, Arc<Vec<u8>>>>>,
    pdfs: MokaCache<String, Arc<Vec<u8>>>,
}

impl TexCache {
    /// Open (or create) the cache under `root`, applying version gating to
    /// every tier.
    pub fn open(root: &Path) -> Result<Self, CacheError> {
        let blob = BlobStore::open(&root.join("blobs"))?;
        let meta = MetaStore::open(&root.join("meta"))?;
        meta.open_table(TABLE_PACKAGES, version::CTAN)?;
        meta.open_table(TABLE_PDFS, version::DOC)?;
        meta.open_table(TABLE_AUX, version::AUX)?;
        meta.open_table(TABLE_FORMATS, version::FMT)?;
        meta.open_table(TABLE_ENGINE, version::WASM)?;
        Ok(Self {
            blob,
            meta,
            bundles: Arc::new(RwLock::new(HashMap::new())),
            packages: Arc::new(RwLock::new(HashMap::new())),
            formats: Arc::new(RwLock::new(HashMap::new())),
            pdfs: MokaCache::new(PDF_OVERLAY_CAPACITY),
        })
    }

    pub fn blob_store(&self) -> &BlobStore {
        &self.blob
    }

    // ---- bundles -----------------------------------------------------------

    /// Resident bundle body, consulting memory then the blob store.
    pub fn get_bundle(&self, id: &str) -> Option<Arc<Vec<u8>>> {
        if let Some(body) = self.bundles.read().get(id) {
            return Some(Arc::clone(body));
        }
        let body = self.blob.read(&format!("bundles/{id}.data")).ok()??;
        let body = Arc::new(body);
        self.bundles
            .write()
            .insert(id.to_string(), Arc::clone(&body));
        Some(body)
    }

    /// Retain a bundle body in memory and persist it durably.
    pub fn put_bundle(&self, id: &str, body: Vec<u8>) -> Arc<Vec<u8>> {
        let body = Arc::new(body);
        self.bundles
            .write()
            .insert(id.to_string(), Arc::clone(&body));
        self.blob.write_logged(&format!("bundles/{id}.data"), &body);
        body
    }

    /// Whether the bundle body is resident in memory (without touching disk).
    pub fn bundle_resident(&self, id: &str) -> bool {
        self.bundles.read().contains_key(id)
    }

    // ---- documents ---------------------------------------------------------

    fn doc_key(document_hash: u32, engine: &str) -> String {
        format!("{document_hash:08x}_{engine}")
    }

    /// Cached PDF for `(document_hash, engine)`. Returns a detached copy;
    /// the caller may hand it to the engine which mutates buffers.
    pub async fn get_pdf(&self, document_hash: u32, engine: &str) -> Option<Vec<u8>> {
        let key = Self::doc_key(document_hash, engine);
        if let Some(pdf) = self.pdfs.get(&key).await {
            return Some(pdf.as_ref().clone());
        }
        let record: PdfRecord = self.meta.get(TABLE_PDFS, &key)?;
        let pdf = self.blob.read(&record.blob).ok()??;
        let pdf = Arc::new(pdf);
        self.pdfs.insert(key, Arc::clone(&pdf)).await;
        Some(pdf.as_ref().clone())
    }

    pub async fn put_pdf(&self, document_hash: u32, engine: &str, pdf: &[u8]) {
        let key = Self::doc_key(document_hash, engine);
        let blob = format!("doc-cache/{key}.pdf");
        self.blob.write_logged(&blob, pdf);
        self.meta.put(
            TABLE_PDFS,
            &key,
            &PdfRecord {
                blob,
                size: pdf.len() as u64,
                timestamp: Utc::now(),
            },
        );
        self.pdfs.insert(key, Arc::new(pdf.to_vec())).await;
    }

    // ---- aux files ---------------------------------------------------------

    pub fn get_aux(&self, key: &str) -> Option<HashMap<String, Vec<u8>>> {
        let record: AuxRecord = self.meta.get(TABLE_AUX, key)?;
        let mut files = HashMap::with_capacity(record.files.len());
        for (path, encoded) in record.files {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(&encoded)
                .ok()?;
            files.insert(path, bytes);
        }
        Some(files)
    }

    pub fn put_aux(&self, key: &str, files: &HashMap<String, Vec<u8>>) {
        let encoded = files
            .iter()
            .map(|(path, bytes)| {
                (
                    path.clone(),
                    base64::engine::general_purpose::STANDARD.encode(bytes),
                )
            })
            .collect();
        self.meta.put(
            TABLE_AUX,
            key,
            &AuxRecord {
                files: encoded,
                timestamp: Utc::now(),
            },
        );
    }

    // ---- formats -----------------------------------------------------------

    fn format_key(preamble_hash: u32, engine: &str) -> String {
        format!("{preamble_hash:08x}_{engine}")
    }

    pub fn get_format(&self, preamble_hash: u32, engine: &str) -> Option<Vec<u8>> {
        let key = Self::format_key(preamble_hash, engine);
        if let Some(fmt) = self.formats.read().get(&key) {
            return Some(fmt.as_ref().clone());
        }
        let record: FormatRecord = self.meta.get(TABLE_FORMATS, &key)?;
        let fmt = self.blob.read(&record.blob).ok()??;
        let fmt = Arc::new(fmt);
        self.formats.write().insert(key, Arc::clone(&fmt));
        Some(fmt.as_ref().clone())
    }

    pub fn put_format(&self, preamble_hash: u32, engine: &str, fmt: &[u8]) {
        let key = Self::format_key(preamble_hash, engine);
        let blob = format!("fmt-cache/{key}.fmt");
        self.blob.write_logged(&blob, fmt);
        self.meta.put(
            TABLE_FORMATS,
            &key,
            &FormatRecord {
                blob,
                timestamp: Utc::now(),
            },
        );
        self.formats.write().insert(key, Arc::new(fmt.to_vec()));
    }

    // ---- packages ----------------------------------------------------------

    pub fn get_package(&self, name: &str) -> Option<Arc<CachedPackage>> {
        if let Some(pkg) = self.packages.read().get(name) {
            return Some(Arc::clone(pkg));
        }
        let record: PackageRecord = self.meta.get(TABLE_PACKAGES, name)?;
        let pkg = if record.not_found {
            CachedPackage {
                not_found: true,
                ..Default::default()
            }
        } else {
            let mut files = HashMap::with_capacity(record.files.len());
            for path in record.files {
                let bytes = self.blob.read(&path).ok()??;
                files.insert(path, bytes);
            }
            CachedPackage {
                not_found: false,
                files,
                dependencies: record.dependencies,
            }
        };
        let pkg = Arc::new(pkg);
        self.packages
            .write()
            .insert(name.to_string(), Arc::clone(&pkg));
        Some(pkg)
    }

    pub fn put_package(
        &self,
        name: &str,
        files: HashMap<String, Vec<u8>>,
        dependencies: Vec<String>,
    ) -> Arc<CachedPackage> {
        for (path, bytes) in &files {
            self.blob.write_logged(path, bytes);
        }
        self.meta.put(
            TABLE_PACKAGES,
            name,
            &PackageRecord {
                files: files.keys().cloned().collect(),
                dependencies: dependencies.clone(),
                not_found: false,
                timestamp: Utc::now(),
            },
        );
        let package = Arc::new(CachedPackage {
            not_found: false,
            files,
            dependencies,
        });
        self.packages
            .write()
            .insert(name.to_string(), Arc::clone(&package));
        package
    }

    /// Persist a negative marker so no further fetch is issued for this
    /// package.
    pub fn put_package_not_found(&self, name: &str) {
        debug!(package = %name, "caching not_found marker");
        self.meta.put(
            TABLE_PACKAGES,
            name,
            &PackageRecord {
                files: Vec::new(),
                dependencies: Vec::new(),
                not_found: true,
                timestamp: Utc::now(),
            },
        );
        self.packages.write().insert(
            name.to_string(),
            Arc::new(CachedPackage {
                not_found: true,
                ..Default::default()
            }),
        );
    }

    // ---- engine image ------------------------------------------------------

    pub fn get_engine_image(&self) -> Option<Vec<u8>> {
        let record: EngineImageRecord = self.meta.get(TABLE_ENGINE, "engine")?;
        self.blob.read(&record.blob).ok()?
    }

    pub fn put_engine_image(&self, image: &[u8]) {
        let blob = "engine/engine.wasm".to_string();
        self.blob.write_logged(&blob, image);
        self.meta.put(
            TABLE_ENGINE,
            "engine",
            &EngineImageRecord {
                blob,
                size: image.len() as u64,
                timestamp: Utc::now(),
            },
        );
    }

    // ---- maintenance -------------------------------------------------------

    /// Drop every tier, durable and in-memory, and re-stamp versions.
    pub async fn clear(&self) -> Result<(), CacheError> {
        self.blob.clear()?;
        self.meta.clear()?;
        self.meta.open_table(TABLE_PACKAGES, version::CTAN)?;
        self.meta.open_table(TABLE_PDFS, version::DOC)?;
        self.meta.open_table(TABLE_AUX, version::AUX)?;
        self.meta.open_table(TABLE_FORMATS, version::FMT)?;
        self.meta.open_table(TABLE_ENGINE, version::WASM)?;
        self.bundles.write().clear();
        self.packages.write().clear();
        self.formats.write().clear();
        self.pdfs.invalidate_all();
        self.pdfs.run_pending_tasks().await;
        Ok(())
    }

    /// Disk footprint, for `cache stats`.
    pub fn size_bytes(&self) -> u64 {
        self.blob.size_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_pdf_round_trip_and_detached_copies() {
        let temp = TempDir::new().unwrap();
        let cache = TexCache::open(temp.path()).unwrap();

        cache.put_pdf(0xabcd, "pdflatex", b"%PDF-1.5").await;
        let mut first = cache.get_pdf(0xabcd, "pdflatex").await.unwrap();
        first[0] = b'X'; // caller mutation must not leak back
        let second = cache.get_pdf(0xabcd, "pdflatex").await.unwrap();
        assert_eq!(&second, b"%PDF-1.5");
    }

    #[tokio::test]
    async fn test_pdf_survives_reopen() {
        let temp = TempDir::new().unwrap();
        {
            let cache = TexCache::open(temp.path()).unwrap();
            cache.put_pdf(1, "pdflatex", b"pdf bytes").await;
        }
        let cache = TexCache::open(temp.path()).unwrap();
        assert_eq!(
            cache.get_pdf(1, "pdflatex").await,
            Some(b"pdf bytes".to_vec())
        );
    }

    #[test]
    fn test_bundle_memory_and_disk() {
        let temp = TempDir::new().unwrap();
        let cache = TexCache::open(temp.path()).unwrap();

        assert!(cache.get_bundle("latex-base").is_none());
        cache.put_bundle("latex-base", b"body".to_vec());
        assert!(cache.bundle_resident("latex-base"));
        assert_eq!(
            cache.get_bundle("latex-base").unwrap().as_ref(),
            &b"body".to_vec()
        );

        // A fresh handle over the same root reads the durable copy.
        let cache2 = TexCache::open(temp.path()).unwrap();
        assert!(!cache2.bundle_resident("latex-base"));
        assert!(cache2.get_bundle("latex-base").is_some());
        assert!(cache2.bundle_resident("latex-base"));
    }

    #[test]
    fn test_package_round_trip() {
        let temp = TempDir::new().unwrap();
        let cache = TexCache::open(temp.path()).unwrap();

        let mut files = HashMap::new();
        files.insert(
            "/texlive/texmf-dist/tex/latex/foo/foo.sty".to_string(),
            b"\\ProvidesPackage{foo}".to_vec(),
        );
        cache.put_package("foo", files, vec!["bar".to_string()]);

        let pkg = cache.get_package("foo").unwrap();
        assert!(!pkg.not_found);
        assert_eq!(pkg.dependencies, ["bar"]);
        assert_eq!(pkg.files.len(), 1);
    }

    #[test]
    fn test_not_found_marker_persists() {
        let temp = TempDir::new().unwrap();
        {
            let cache = TexCache::open(temp.path()).unwrap();
            cache.put_package_not_found("totally-fake-pkg");
        }
        let cache = TexCache::open(temp.path()).unwrap();
        assert!(cache.get_package("totally-fake-pkg").unwrap().not_found);
    }

    #[test]
    fn test_aux_round_trip() {
        let temp = TempDir::new().unwrap();
        let cache = TexCache::open(temp.path()).unwrap();

        let mut files = HashMap::new();
        files.insert("/document.aux".to_string(), b"\\relax\n".to_vec());
        cache.put_aux("1234abcd_fmt", &files);
        assert_eq!(cache.get_aux("1234abcd_fmt"), Some(files));
    }

    #[test]
    fn test_format_round_trip() {
        let temp = TempDir::new().unwrap();
        let cache = TexCache::open(temp.path()).unwrap();

        cache.put_format(0xfeed, "pdflatex", b"fmt blob");
        assert_eq!(
            cache.get_format(0xfeed, "pdflatex"),
            Some(b"fmt blob".to_vec())
        );
        assert!(cache.get_format(0xfeed, "xelatex").is_none());
    }

    #[tokio::test]
    async fn test_clear_drops_everything() {
        let temp = TempDir::new().unwrap();
        let cache = TexCache::open(temp.path()).unwrap();

        cache.put_bundle("b", b"body".to_vec());
        cache.put_format(1, "pdflatex", b"fmt");
        cache.put_pdf(2, "pdflatex", b"pdf").await;
        cache.clear().await.unwrap();

        assert!(cache.get_bundle("b").is_none());
        assert!(cache.get_format(1, "pdflatex").is_none());
        assert!(cache.get_pdf(2, "pdflatex").await.is_none());
    }
}

//! The virtual file system mounted into the engine's namespace.
//!
//! A fresh `Vfs` is built for every compile attempt. Files mount in one of
//! three states (eager bytes, lazy slices of resident bundle bodies, or
//! deferred markers whose bytes live on the server); the read path resolves
//! markers in place. Deferred reads that miss the session byte-range cache
//! record a pending request and substitute zero-length bytes — the engine
//! then reports the file missing and the orchestrator fetches the range
//! before the next attempt.
//!
//! `finalize()` runs once after all mounts: font maps are rewritten and the
//! `ls-R` index is emitted so kpathsea can see every mounted file.

mod fontmap;
mod lsr;
mod node;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use tracing::debug;

use crate::bundle::{BundleManifest, GlobalFileManifest};
use crate::engine::TEX_ROOT;
use crate::fetch::RangeCache;

pub use node::{BundleSlice, FileContent};

/// File name of the unified kpathsea font map.
pub const UNIFIED_MAP_NAME: &str = "pdftex.map";

/// Suffixes that must be loaded eagerly: kpathsea compares their contents
/// during path search, and per-compile map rewriting needs the bytes
/// resident.
const EAGER_SUFFIXES: &[&str] = &[".fmt", "texmf.cnf", ".map", ".pfb", ".enc"];

fn normalize(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn must_load_eagerly(path: &str) -> bool {
    EAGER_SUFFIXES.iter().any(|suffix| path.ends_with(suffix))
}

/// Per-attempt virtual file system.
pub struct Vfs {
    files: BTreeMap<String, FileContent>,
    dirs: BTreeSet<String>,
    /// Resident bundle bodies, shared with the session bundle map.
    bodies: HashMap<String, Arc<Vec<u8>>>,
    /// Session byte-range cache, shared with the bundle fetcher.
    range_cache: RangeCache,
    pending_ranges: Vec<BundleSlice>,
    pending_range_keys: HashSet<(String, u64, u64)>,
    pending_bundles: Vec<String>,
    pending_bundle_keys: HashSet<String>,
    /// Font file name -> absolute mounted path, built during bundle mounts.
    font_index: HashMap<String, String>,
    /// Auxiliary map files awaiting merge into the unified map.
    queued_maps: Vec<String>,
    lazy_enabled: bool,
    finalized: bool,
    bytes_read: u64,
    reads: u64,
}

impl Vfs {
    pub fn new(range_cache: RangeCache, lazy_enabled: bool) -> Self {
        Self {
            files: BTreeMap::new(),
            dirs: BTreeSet::new(),
            bodies: HashMap::new(),
            range_cache,
            pending_ranges: Vec::new(),
            pending_range_keys: HashSet::new(),
            pending_bundles: Vec::new(),
            pending_bundle_keys: HashSet::new(),
            font_index: HashMap::new(),
            queued_maps: Vec::new(),
            lazy_enabled,
            finalized: false,
            bytes_read: 0,
            reads: 0,
        }
    }

    // ---- mounting ----------------------------------------------------------

    /// Mount a file eagerly. Auxiliary font maps are queued for merging
    /// into the unified map at finalize time.
    pub fn mount(&mut self, path: &str, bytes: Vec<u8>) {
        let path = normalize(path);
        if path.ends_with(".map") && file_name(&path) != UNIFIED_MAP_NAME {
            self.queued_maps.push(path.clone());
        }
        self.insert_file(path, FileContent::Eager(bytes));
    }

    /// Mount a lazy marker over a resident bundle body.
    pub fn mount_lazy(&mut self, path: &str, bundle: &str, start: u64, end: u64) {
        self.insert_file(
            normalize(path),
            FileContent::Lazy(BundleSlice::new(bundle, start, end)),
        );
    }

    /// Mount a deferred marker; the bundle body need not be resident.
    pub fn mount_deferred(&mut self, path: &str, bundle: &str, start: u64, end: u64) {
        self.insert_file(
            normalize(path),
            FileContent::Deferred(BundleSlice::new(bundle, start, end)),
        );
    }

    /// Mount every file of a bundle whose body is resident. Paths matching
    /// the eager-load rule are copied immediately; the rest become lazy
    /// markers (or eager copies when the lazy file system is disabled).
    pub fn mount_bundle(
        &mut self,
        id: &str,
        body: Arc<Vec<u8>>,
        global: &GlobalFileManifest,
        per_bundle: Option<&BundleManifest>,
    ) {
        let entries = bundle_entries(id, global, per_bundle);
        if entries.is_empty() {
            debug!(bundle = %id, "no manifest entries for bundle");
            return;
        }
        for (path, start, end) in entries {
            self.index_font_file(&path);
            if must_load_eagerly(&path) || !self.lazy_enabled {
                let bytes = body[start as usize..end as usize].to_vec();
                self.mount(&path, bytes);
            } else {
                self.mount_lazy(&path, id, start, end);
            }
        }
        self.bodies.insert(id.to_string(), body);
    }

    /// Mount a bundle as deferred markers only; no body is stored. When no
    /// manifest knows the bundle's files, a whole-bundle fetch is requested
    /// instead.
    pub fn mount_deferred_bundle(
        &mut self,
        id: &str,
        global: &GlobalFileManifest,
        per_bundle: Option<&BundleManifest>,
    ) {
        let entries = bundle_entries(id, global, per_bundle);
        if entries.is_empty() {
            self.request_bundle(id);
            return;
        }
        for (path, start, end) in entries {
            self.index_font_file(&path);
            if path.ends_with(".map") && file_name(&path) != UNIFIED_MAP_NAME {
                self.queued_maps.push(path.clone());
            }
            self.mount_deferred(&path, id, start, end);
        }
    }

    /// Mount user-provided or remotely fetched files.
    pub fn mount_external_files(&mut self, files: &HashMap<String, Vec<u8>>) {
        for (path, bytes) in files {
            self.index_font_file(&normalize(path));
            self.mount(path, bytes.clone());
        }
    }

    fn insert_file(&mut self, path: String, content: FileContent) {
        // Parent directories exist implicitly once a file is mounted.
        let mut dir = path.as_str();
        while let Some(idx) = dir.rfind('/') {
            dir = &dir[..idx];
            if dir.is_empty() {
                break;
            }
            if !self.dirs.insert(dir.to_string()) {
                break;
            }
        }
        self.files.insert(path, content);
    }

    fn index_font_file(&mut self, path: &str) {
        if path.ends_with(".pfb") || path.ends_with(".enc") {
            self.font_index
                .insert(file_name(path).to_string(), normalize(path));
        }
    }

    // ---- reads and writes --------------------------------------------------

    /// Read a file, resolving lazy and deferred markers.
    ///
    /// A deferred miss records a pending byte-range request and yields
    /// zero-length bytes so the engine surfaces the missing file itself.
    pub fn read(&mut self, path: &str) -> Option<Vec<u8>> {
        let path = normalize(path);
        let content = self.files.get(&path)?.clone();
        let resolved = match content {
            FileContent::Eager(bytes) => bytes,
            FileContent::Lazy(slice) => match self.bodies.get(&slice.bundle) {
                Some(body) => body[slice.start as usize..slice.end as usize].to_vec(),
                None => {
                    // Marker without a resident body: ask for the whole
                    // bundle and report the file empty for now.
                    let bundle = slice.bundle.clone();
                    self.request_bundle(&bundle);
                    Vec::new()
                }
            },
            FileContent::Deferred(slice) => {
                match self.range_cache.get(&slice.bundle, slice.start, slice.end) {
                    Some(cached) => cached.as_ref().clone(),
                    None => {
                        self.request_range(slice);
                        Vec::new()
                    }
                }
            }
        };
        // One-shot promotion: every resolved read leaves the node eager.
        self.files
            .insert(path, FileContent::Eager(resolved.clone()));
        self.reads += 1;
        self.bytes_read += resolved.len() as u64;
        Some(resolved)
    }

    /// Write a file (engine output or host-provided content).
    pub fn write(&mut self, path: &str, bytes: Vec<u8>) {
        self.insert_file(normalize(path), FileContent::Eager(bytes));
    }

    pub fn exists(&self, path: &str) -> bool {
        self.files.contains_key(&normalize(path))
    }

    /// Content state of a file, for diagnostics and tests.
    pub fn state_of(&self, path: &str) -> Option<&'static str> {
        self.files.get(&normalize(path)).map(FileContent::state_name)
    }

    pub fn file_paths(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    // ---- pending requests --------------------------------------------------

    fn request_range(&mut self, slice: BundleSlice) {
        let key = (slice.bundle.clone(), slice.start, slice.end);
        if self.pending_range_keys.insert(key) {
            debug!(
                bundle = %slice.bundle,
                start = slice.start,
                end = slice.end,
                "deferred read, queuing byte-range request"
            );
            self.pending_ranges.push(slice);
        }
    }

    fn request_bundle(&mut self, id: &str) {
        if self.pending_bundle_keys.insert(id.to_string()) {
            debug!(bundle = %id, "queuing whole-bundle request");
            self.pending_bundles.push(id.to_string());
        }
    }

    /// Byte ranges requested by deferred reads during the last engine run.
    pub fn pending_ranges(&self) -> &[BundleSlice] {
        &self.pending_ranges
    }

    /// Whole bundles requested during the last engine run.
    pub fn pending_bundles(&self) -> &[String] {
        &self.pending_bundles
    }

    // ---- finalisation and stats --------------------------------------------

    /// Process font maps and emit `ls-R`. Idempotent within one VFS.
    pub fn finalize(&mut self) {
        if self.finalized {
            return;
        }
        self.process_font_maps();
        let index = lsr::generate(self.file_paths(), TEX_ROOT);
        self.write(&format!("{TEX_ROOT}/ls-R"), index.into_bytes());
        self.finalized = true;
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn read_count(&self) -> u64 {
        self.reads
    }

    pub(crate) fn font_index(&self) -> &HashMap<String, String> {
        &self.font_index
    }

    pub(crate) fn queued_map_paths(&self) -> Vec<String> {
        self.queued_maps.clone()
    }
}

/// File set of a bundle: the global manifest is authoritative, the
/// per-bundle manifest is the fallback for dynamically fetched bundles.
fn bundle_entries(
    id: &str,
    global: &GlobalFileManifest,
    per_bundle: Option<&BundleManifest>,
) -> Vec<(String, u64, u64)> {
    let from_global: Vec<(String, u64, u64)> = global
        .files_of(id)
        .into_iter()
        .map(|(path, loc)| (normalize(path), loc.start, loc.end))
        .collect();
    if !from_global.is_empty() {
        return from_global;
    }
    per_bundle
        .map(|manifest| {
            manifest
                .files
                .iter()
                .map(|entry| (normalize(&entry.full_path()), entry.start, entry.end))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::{pack, FileLocation};

    fn global_with(entries: &[(&str, &str, u64, u64)]) -> GlobalFileManifest {
        let json: HashMap<String, FileLocation> = entries
            .iter()
            .map(|(path, bundle, start, end)| {
                (
                    path.to_string(),
                    FileLocation {
                        bundle: bundle.to_string(),
                        start: *start,
                        end: *end,
                    },
                )
            })
            .collect();
        GlobalFileManifest::from_json(serde_json::to_vec(&json).unwrap().as_slice()).unwrap()
    }

    #[test]
    fn test_lazy_read_returns_exact_slice() {
        let files = vec![
            (
                "texlive/texmf-dist/tex/latex/base/article.cls".to_string(),
                b"class bytes".to_vec(),
            ),
            (
                "texlive/texmf-dist/tex/latex/base/size10.clo".to_string(),
                b"clo bytes!".to_vec(),
            ),
        ];
        let (body, manifest) = pack("latex-base", &files);
        let mut vfs = Vfs::new(RangeCache::new(), true);
        let global = GlobalFileManifest::default();
        vfs.mount_bundle("latex-base", Arc::new(body.clone()), &global, Some(&manifest));

        for (path, bytes) in &files {
            assert_eq!(vfs.state_of(path), Some("lazy"));
            assert_eq!(vfs.read(path).unwrap(), *bytes);
            // One-shot promotion.
            assert_eq!(vfs.state_of(path), Some("eager"));
        }
    }

    #[test]
    fn test_eager_rule_copies_immediately() {
        let files = vec![
            (
                "texlive/texmf-dist/fonts/map/pdftex/updmap/pdftex.map".to_string(),
                b"cmr10 CMR10 <cmr10.pfb\n".to_vec(),
            ),
            (
                "texlive/texmf-dist/tex/latex/base/latex.ltx".to_string(),
                b"latex".to_vec(),
            ),
        ];
        let (body, manifest) = pack("latex-base", &files);
        let mut vfs = Vfs::new(RangeCache::new(), true);
        vfs.mount_bundle(
            "latex-base",
            Arc::new(body),
            &GlobalFileManifest::default(),
            Some(&manifest),
        );
        assert_eq!(
            vfs.state_of("/texlive/texmf-dist/fonts/map/pdftex/updmap/pdftex.map"),
            Some("eager")
        );
        assert_eq!(
            vfs.state_of("/texlive/texmf-dist/tex/latex/base/latex.ltx"),
            Some("lazy")
        );
    }

    #[test]
    fn test_lazy_disabled_mounts_all_eager() {
        let files = vec![(
            "texlive/texmf-dist/tex/latex/base/latex.ltx".to_string(),
            b"latex".to_vec(),
        )];
        let (body, manifest) = pack("latex-base", &files);
        let mut vfs = Vfs::new(RangeCache::new(), false);
        vfs.mount_bundle(
            "latex-base",
            Arc::new(body),
            &GlobalFileManifest::default(),
            Some(&manifest),
        );
        assert_eq!(
            vfs.state_of("/texlive/texmf-dist/tex/latex/base/latex.ltx"),
            Some("eager")
        );
    }

    #[test]
    fn test_deferred_read_records_pending_and_yields_empty() {
        let global = global_with(&[(
            "/texlive/texmf-dist/fonts/type1/public/cm-super/sfrm1000.pfb",
            "cm-super",
            100,
            200,
        )]);
        let mut vfs = Vfs::new(RangeCache::new(), true);
        vfs.mount_deferred_bundle("cm-super", &global, None);

        let path = "/texlive/texmf-dist/fonts/type1/public/cm-super/sfrm1000.pfb";
        assert_eq!(vfs.state_of(path), Some("deferred"));
        assert_eq!(vfs.read(path).unwrap(), Vec::<u8>::new());
        assert_eq!(
            vfs.pending_ranges(),
            &[BundleSlice::new("cm-super", 100, 200)]
        );

        // A second read does not duplicate the request.
        let mut vfs2 = Vfs::new(RangeCache::new(), true);
        vfs2.mount_deferred_bundle("cm-super", &global, None);
        vfs2.read(path);
        vfs2.read(path);
        assert_eq!(vfs2.pending_ranges().len(), 1);
    }

    #[test]
    fn test_deferred_read_hits_range_cache() {
        let ranges = RangeCache::new();
        ranges.insert("cm-super", 100, 200, vec![7u8; 100]);
        let global = global_with(&[(
            "/texlive/texmf-dist/fonts/type1/public/cm-super/sfrm1000.pfb",
            "cm-super",
            100,
            200,
        )]);
        let mut vfs = Vfs::new(ranges, true);
        vfs.mount_deferred_bundle("cm-super", &global, None);

        let bytes = vfs
            .read("/texlive/texmf-dist/fonts/type1/public/cm-super/sfrm1000.pfb")
            .unwrap();
        assert_eq!(bytes, vec![7u8; 100]);
        assert!(vfs.pending_ranges().is_empty());
    }

    #[test]
    fn test_deferred_bundle_without_manifest_requests_whole_bundle() {
        let mut vfs = Vfs::new(RangeCache::new(), true);
        vfs.mount_deferred_bundle("mystery", &GlobalFileManifest::default(), None);
        assert_eq!(vfs.pending_bundles(), &["mystery".to_string()]);
    }

    #[test]
    fn test_mount_queues_aux_maps_only() {
        let mut vfs = Vfs::new(RangeCache::new(), true);
        vfs.mount(
            "/texlive/texmf-dist/fonts/map/pdftex/updmap/pdftex.map",
            b"x".to_vec(),
        );
        vfs.mount(
            "/texlive/texmf-dist/fonts/map/dvips/times/times.map",
            b"y".to_vec(),
        );
        assert_eq!(
            vfs.queued_map_paths(),
            vec!["/texlive/texmf-dist/fonts/map/dvips/times/times.map".to_string()]
        );
    }

    #[test]
    fn test_write_then_read() {
        let mut vfs = Vfs::new(RangeCache::new(), true);
        vfs.write("/document.tex", b"\\documentclass{article}".to_vec());
        assert_eq!(
            vfs.read("/document.tex").unwrap(),
            b"\\documentclass{article}"
        );
    }

    #[test]
    fn test_read_counts_bytes() {
        let mut vfs = Vfs::new(RangeCache::new(), true);
        vfs.write("/a", vec![0u8; 10]);
        vfs.write("/b", vec![0u8; 5]);
        vfs.read("/a");
        vfs.read("/b");
        assert_eq!(vfs.bytes_read(), 15);
        assert_eq!(vfs.read_count(), 2);
    }

    #[test]
    fn test_finalize_idempotent() {
        let mut vfs = Vfs::new(RangeCache::new(), true);
        vfs.write("/texlive/texmf-dist/tex/latex/base/article.cls", vec![1]);
        vfs.finalize();
        let first = vfs.read("/texlive/ls-R").unwrap();
        vfs.finalize();
        let second = vfs.read("/texlive/ls-R").unwrap();
        assert_eq!(first, second);
    }
}

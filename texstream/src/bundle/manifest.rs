//! Bundle manifests and the global index files that describe them.
//!
//! A bundle is a contiguous byte blob plus an ordered manifest of
//! `(path, name, start, end)` entries. The global manifests map file paths
//! to bundles, package names to bundles, and bundles to the bundles they
//! require.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while validating or parsing manifests.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("manifest entry {path} has inverted range {start}..{end}")]
    InvertedRange { path: String, start: u64, end: u64 },

    #[error("manifest entries are not contiguous at {path} (expected offset {expected}, got {got})")]
    NotContiguous {
        path: String,
        expected: u64,
        got: u64,
    },

    #[error("duplicate path {0} in bundle manifest")]
    DuplicatePath(String),

    #[error("manifest covers {covered} bytes but body is {body_len} bytes")]
    SizeMismatch { covered: u64, body_len: u64 },

    #[error("failed to parse manifest: {0}")]
    Parse(#[from] serde_json::Error),
}

/// One file inside a bundle body.
///
/// `path` is the directory portion, `name` the file name; the file's bytes
/// are `body[start..end]`, exactly `end - start` long.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleEntry {
    pub path: String,
    pub name: String,
    pub start: u64,
    pub end: u64,
}

impl BundleEntry {
    /// Full path of this entry inside the engine namespace.
    pub fn full_path(&self) -> String {
        if self.path.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.path.trim_end_matches('/'), self.name)
        }
    }

    /// Byte length of the file.
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Manifest of one bundle, as stored in `<id>.meta.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleManifest {
    pub name: String,
    pub files: Vec<BundleEntry>,
    #[serde(rename = "totalSize")]
    pub total_size: u64,
}

impl BundleManifest {
    pub fn from_json(raw: &[u8]) -> Result<Self, ManifestError> {
        Ok(serde_json::from_slice(raw)?)
    }

    /// Check the packing invariants against a body of `body_len` bytes:
    /// ranges are ordered, contiguous, non-overlapping, unique by full
    /// path, and cover the body exactly (no padding).
    pub fn validate(&self, body_len: u64) -> Result<(), ManifestError> {
        let mut offset = 0u64;
        let mut seen = HashSet::new();
        for entry in &self.files {
            if entry.end < entry.start {
                return Err(ManifestError::InvertedRange {
                    path: entry.full_path(),
                    start: entry.start,
                    end: entry.end,
                });
            }
            if entry.start != offset {
                return Err(ManifestError::NotContiguous {
                    path: entry.full_path(),
                    expected: offset,
                    got: entry.start,
                });
            }
            if !seen.insert(entry.full_path()) {
                return Err(ManifestError::DuplicatePath(entry.full_path()));
            }
            offset = entry.end;
        }
        if offset != body_len {
            return Err(ManifestError::SizeMismatch {
                covered: offset,
                body_len,
            });
        }
        Ok(())
    }

    /// Look up the byte range of a file by its full path.
    pub fn locate(&self, full_path: &str) -> Option<(u64, u64)> {
        self.files
            .iter()
            .find(|e| e.full_path() == full_path)
            .map(|e| (e.start, e.end))
    }
}

/// Where a file lives: which bundle, and the byte range inside its body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileLocation {
    pub bundle: String,
    pub start: u64,
    pub end: u64,
}

/// The authoritative path index, parsed from `file-manifest.json`.
///
/// Per-bundle manifests are only a fallback for bundles fetched dynamically
/// and not yet present here.
#[derive(Debug, Clone, Default)]
pub struct GlobalFileManifest {
    entries: HashMap<String, FileLocation>,
}

impl GlobalFileManifest {
    pub fn from_json(raw: &[u8]) -> Result<Self, ManifestError> {
        let entries: HashMap<String, FileLocation> = serde_json::from_slice(raw)?;
        Ok(Self { entries })
    }

    pub fn lookup(&self, path: &str) -> Option<&FileLocation> {
        self.entries.get(path)
    }

    /// All files belonging to one bundle, as `(full_path, location)` pairs.
    pub fn files_of(&self, bundle: &str) -> Vec<(&str, &FileLocation)> {
        let mut files: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, loc)| loc.bundle == bundle)
            .map(|(path, loc)| (path.as_str(), loc))
            .collect();
        files.sort_by_key(|(_, loc)| loc.start);
        files
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct RegistryDescriptor {
    #[serde(alias = "name")]
    id: String,
}

/// The set of known bundle IDs, extracted from `registry.json` descriptors.
#[derive(Debug, Clone, Default)]
pub struct BundleRegistry {
    ids: HashSet<String>,
}

impl BundleRegistry {
    pub fn from_json(raw: &[u8]) -> Result<Self, ManifestError> {
        let descriptors: Vec<RegistryDescriptor> = serde_json::from_slice(raw)?;
        Ok(Self {
            ids: descriptors.into_iter().map(|d| d.id).collect(),
        })
    }

    pub fn from_ids<I: IntoIterator<Item = String>>(ids: I) -> Self {
        Self {
            ids: ids.into_iter().collect(),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.ids.iter().map(String::as_str)
    }
}

/// LaTeX package name to the bundle that contains it (`package-map.json`).
#[derive(Debug, Clone, Default)]
pub struct PackageMap {
    map: HashMap<String, String>,
}

impl PackageMap {
    pub fn from_json(raw: &[u8]) -> Result<Self, ManifestError> {
        let map: HashMap<String, String> = serde_json::from_slice(raw)?;
        Ok(Self { map })
    }

    pub fn from_entries<I: IntoIterator<Item = (String, String)>>(entries: I) -> Self {
        Self {
            map: entries.into_iter().collect(),
        }
    }

    pub fn bundle_for(&self, package: &str) -> Option<&str> {
        self.map.get(package).map(String::as_str)
    }

    pub fn contains(&self, package: &str) -> bool {
        self.map.contains_key(package)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct EngineEntry {
    #[serde(default)]
    required: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct BundleEntryDeps {
    #[serde(default)]
    requires: Vec<String>,
}

/// The bundle dependency graph (`bundle-deps.json`): per-bundle requires,
/// per-engine required sets, and the global deferred list.
#[derive(Debug, Clone, Default)]
pub struct BundleDeps {
    engines: HashMap<String, EngineEntry>,
    bundles: HashMap<String, BundleEntryDeps>,
    deferred: HashSet<String>,
}

impl BundleDeps {
    pub fn from_json(raw: &[u8]) -> Result<Self, ManifestError> {
        #[derive(Deserialize)]
        struct Raw {
            #[serde(default)]
            engines: HashMap<String, EngineEntry>,
            #[serde(default)]
            bundles: HashMap<String, BundleEntryDeps>,
            #[serde(default)]
            deferred: Vec<String>,
        }
        let raw: Raw = serde_json::from_slice(raw)?;
        let deps = Self {
            engines: raw.engines,
            bundles: raw.bundles,
            deferred: raw.deferred.into_iter().collect(),
        };
        for (engine, entry) in &deps.engines {
            for bundle in &entry.required {
                if deps.deferred.contains(bundle) {
                    tracing::warn!(
                        engine = %engine,
                        bundle = %bundle,
                        "bundle is both engine-required and deferred; required wins"
                    );
                }
            }
        }
        Ok(deps)
    }

    /// Bundles every compile with this engine must mount.
    pub fn required_for(&self, engine: &str) -> &[String] {
        self.engines
            .get(engine)
            .map(|e| e.required.as_slice())
            .unwrap_or(&[])
    }

    /// Bundles this bundle pulls in.
    pub fn requires(&self, bundle: &str) -> &[String] {
        self.bundles
            .get(bundle)
            .map(|b| b.requires.as_slice())
            .unwrap_or(&[])
    }

    /// Whether a bundle's files are mounted as deferred markers. A bundle
    /// in an engine's required set is never deferred for that engine.
    pub fn is_deferred(&self, bundle: &str, engine: &str) -> bool {
        self.deferred.contains(bundle)
            && !self
                .engines
                .get(engine)
                .map(|e| e.required.iter().any(|b| b == bundle))
                .unwrap_or(false)
    }
}

/// Optional package-granularity dependency graph (`package-deps.json`).
#[derive(Debug, Clone, Default)]
pub struct PackageDeps {
    map: HashMap<String, Vec<String>>,
}

impl PackageDeps {
    pub fn from_json(raw: &[u8]) -> Result<Self, ManifestError> {
        let map: HashMap<String, Vec<String>> = serde_json::from_slice(raw)?;
        Ok(Self { map })
    }

    pub fn deps_of(&self, package: &str) -> &[String] {
        self.map.get(package).map(Vec::as_slice).unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, name: &str, start: u64, end: u64) -> BundleEntry {
        BundleEntry {
            path: path.to_string(),
            name: name.to_string(),
            start,
            end,
        }
    }

    #[test]
    fn test_full_path_joins_with_slash() {
        let e = entry("texlive/texmf-dist/tex/latex/base", "article.cls", 0, 10);
        assert_eq!(
            e.full_path(),
            "texlive/texmf-dist/tex/latex/base/article.cls"
        );
    }

    #[test]
    fn test_validate_accepts_contiguous_manifest() {
        let manifest = BundleManifest {
            name: "latex-base".to_string(),
            files: vec![entry("a", "x.sty", 0, 4), entry("a", "y.sty", 4, 9)],
            total_size: 9,
        };
        assert!(manifest.validate(9).is_ok());
    }

    #[test]
    fn test_validate_rejects_gap() {
        let manifest = BundleManifest {
            name: "b".to_string(),
            files: vec![entry("a", "x.sty", 0, 4), entry("a", "y.sty", 5, 9)],
            total_size: 9,
        };
        assert!(matches!(
            manifest.validate(9),
            Err(ManifestError::NotContiguous { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_padding() {
        let manifest = BundleManifest {
            name: "b".to_string(),
            files: vec![entry("a", "x.sty", 0, 4)],
            total_size: 4,
        };
        assert!(matches!(
            manifest.validate(6),
            Err(ManifestError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_duplicate_path() {
        let manifest = BundleManifest {
            name: "b".to_string(),
            files: vec![entry("a", "x.sty", 0, 4), entry("a", "x.sty", 4, 8)],
            total_size: 8,
        };
        assert!(matches!(
            manifest.validate(8),
            Err(ManifestError::DuplicatePath(_))
        ));
    }

    #[test]
    fn test_manifest_json_uses_total_size_key() {
        let raw = br#"{"name":"fonts-cm","files":[{"path":"f","name":"cmr10.tfm","start":0,"end":3}],"totalSize":3}"#;
        let manifest = BundleManifest::from_json(raw).unwrap();
        assert_eq!(manifest.total_size, 3);
        assert_eq!(manifest.locate("f/cmr10.tfm"), Some((0, 3)));
    }

    #[test]
    fn test_global_manifest_lookup_and_files_of() {
        let raw = br#"{
            "texlive/a.sty": {"bundle": "b1", "start": 0, "end": 5},
            "texlive/b.sty": {"bundle": "b1", "start": 5, "end": 9},
            "texlive/c.sty": {"bundle": "b2", "start": 0, "end": 2}
        }"#;
        let manifest = GlobalFileManifest::from_json(raw).unwrap();
        assert_eq!(manifest.lookup("texlive/a.sty").unwrap().bundle, "b1");
        let files = manifest.files_of("b1");
        assert_eq!(files.len(), 2);
        // Sorted by start offset.
        assert_eq!(files[0].0, "texlive/a.sty");
    }

    #[test]
    fn test_registry_extracts_ids() {
        let raw = br#"[{"id": "latex-base"}, {"id": "fonts-cm", "extra": 1}]"#;
        let registry = BundleRegistry::from_json(raw).unwrap();
        assert!(registry.contains("latex-base"));
        assert!(registry.contains("fonts-cm"));
        assert!(!registry.contains("missing"));
    }

    #[test]
    fn test_bundle_deps_required_and_deferred() {
        let raw = br#"{
            "engines": {"pdflatex": {"required": ["latex-base"]}},
            "bundles": {"latex-base": {"requires": ["fonts-cm"]}},
            "deferred": ["cm-super", "latex-base"]
        }"#;
        let deps = BundleDeps::from_json(raw).unwrap();
        assert_eq!(deps.required_for("pdflatex"), ["latex-base"]);
        assert_eq!(deps.requires("latex-base"), ["fonts-cm"]);
        assert!(deps.is_deferred("cm-super", "pdflatex"));
        // Required for the engine overrides the deferred listing.
        assert!(!deps.is_deferred("latex-base", "pdflatex"));
        assert!(deps.is_deferred("latex-base", "xelatex"));
    }
}

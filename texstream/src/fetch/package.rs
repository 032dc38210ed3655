//! On-demand package retrieval from the remote proxy.
//!
//! Two sources are tried in order: the XZ-compressed TAR endpoint
//! (`/api/texlive/<pkg>`) and the JSON endpoint (`/api/fetch/<pkg>`). A
//! failed direct fetch may be redirected once through `/api/ctan-pkg/<pkg>`
//! when the package lives inside a differently named archive. Misses at
//! every source persist a `not_found` marker so the session never fetches
//! that name again.

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

use base64::Engine as _;
use serde::Deserialize;
use tracing::{debug, info, warn};
use xz2::read::XzDecoder;

use crate::cache::{CachedPackage, TexCache};

use super::{FetchError, Transport};

/// Extensions mounted into the engine's TeX tree.
const TEX_EXTENSIONS: &[&str] = &["sty", "cls", "def", "cfg", "tex", "fd", "clo", "ltx"];
const FONT_EXTENSIONS: &[&str] = &["pfb", "pfm", "afm", "tfm", "vf", "map", "enc"];

/// A freshly fetched package: file map in the engine namespace plus the
/// dependencies the source declared.
#[derive(Debug, Default)]
pub struct FetchedPackage {
    pub files: HashMap<String, Vec<u8>>,
    pub dependencies: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct JsonFile {
    content: String,
    #[serde(default)]
    encoding: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JsonPackage {
    #[serde(default)]
    files: HashMap<String, JsonFile>,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CtanPackage {
    #[serde(default)]
    contained_in: Option<String>,
}

/// Retrieves individual packages through the remote proxy.
pub struct PackageFetcher {
    transport: Arc<dyn Transport>,
    cache: TexCache,
    proxy_url: String,
}

impl PackageFetcher {
    pub fn new(transport: Arc<dyn Transport>, cache: TexCache, proxy_url: &str) -> Self {
        Self {
            transport,
            cache,
            proxy_url: proxy_url.trim_end_matches('/').to_string(),
        }
    }

    /// Fetch a package, consulting the cache (including negative markers)
    /// first. On success the package is persisted with the current cache
    /// version stamp.
    pub async fn fetch(&self, name: &str) -> Result<Arc<CachedPackage>, FetchError> {
        if let Some(cached) = self.cache.get_package(name) {
            if cached.not_found {
                debug!(package = %name, "skipping fetch, not_found marker present");
                return Err(FetchError::PackageNotFound(name.to_string()));
            }
            return Ok(cached);
        }

        match self.fetch_uncached(name).await {
            Ok(fetched) => {
                info!(
                    package = %name,
                    files = fetched.files.len(),
                    "fetched remote package"
                );
                Ok(self
                    .cache
                    .put_package(name, fetched.files, fetched.dependencies))
            }
            Err(e) => {
                warn!(package = %name, error = %e, "package absent at every source");
                self.cache.put_package_not_found(name);
                Err(FetchError::PackageNotFound(name.to_string()))
            }
        }
    }

    async fn fetch_uncached(&self, name: &str) -> Result<FetchedPackage, FetchError> {
        if let Ok(pkg) = self.fetch_archive(name, name).await {
            return Ok(pkg);
        }
        match self.fetch_json(name).await {
            Ok(pkg) => Ok(pkg),
            Err(direct_err) => {
                // The package may live inside a differently named archive.
                if let Some(container) = self.container_of(name).await {
                    if container != name {
                        debug!(package = %name, container = %container, "retrying via containing archive");
                        return self.fetch_archive(name, &container).await;
                    }
                }
                Err(direct_err)
            }
        }
    }

    /// `/api/texlive/<archive>`: XZ-compressed TAR, filtered to TeX and
    /// font files and grafted into the engine namespace.
    async fn fetch_archive(&self, name: &str, archive: &str) -> Result<FetchedPackage, FetchError> {
        let url = format!("{}/api/texlive/{}", self.proxy_url, archive);
        let response = self.transport.get(&url).await?;
        if !response.is_success() {
            return Err(FetchError::Status {
                url,
                status: response.status,
            });
        }
        let files = extract_archive(name, &response.body)?;
        if files.is_empty() {
            return Err(FetchError::PackageNotFound(name.to_string()));
        }
        Ok(FetchedPackage {
            files,
            dependencies: Vec::new(),
        })
    }

    /// `/api/fetch/<pkg>`: JSON with per-file content and declared
    /// dependencies.
    async fn fetch_json(&self, name: &str) -> Result<FetchedPackage, FetchError> {
        let url = format!("{}/api/fetch/{}", self.proxy_url, name);
        let response = self.transport.get(&url).await?;
        if !response.is_success() {
            return Err(FetchError::Status {
                url,
                status: response.status,
            });
        }
        let parsed: JsonPackage =
            serde_json::from_slice(&response.body).map_err(|e| FetchError::Network {
                url: url.clone(),
                reason: format!("bad package JSON: {e}"),
            })?;
        if let Some(error) = parsed.error {
            return Err(FetchError::Network { url, reason: error });
        }
        let mut files = HashMap::new();
        for (path, file) in parsed.files {
            let bytes = if file.encoding.as_deref() == Some("base64") {
                base64::engine::general_purpose::STANDARD
                    .decode(file.content.as_bytes())
                    .map_err(|e| FetchError::Decompress {
                        what: format!("package {name} file {path}"),
                        reason: e.to_string(),
                    })?
            } else {
                file.content.into_bytes()
            };
            let mounted = if path.starts_with('/') {
                if path.split('/').any(|s| s == "..") {
                    continue;
                }
                path
            } else {
                match map_archive_path(name, &path) {
                    Some(mapped) => mapped,
                    None => continue,
                }
            };
            files.insert(mounted, bytes);
        }
        if files.is_empty() {
            return Err(FetchError::PackageNotFound(name.to_string()));
        }
        Ok(FetchedPackage {
            files,
            dependencies: parsed.dependencies,
        })
    }

    /// `/api/ctan-pkg/<pkg>`: optional `contained_in` naming the real
    /// archive.
    async fn container_of(&self, name: &str) -> Option<String> {
        let url = format!("{}/api/ctan-pkg/{}", self.proxy_url, name);
        let response = self.transport.get(&url).await.ok()?;
        if !response.is_success() {
            return None;
        }
        let parsed: CtanPackage = serde_json::from_slice(&response.body).ok()?;
        parsed.contained_in
    }
}

/// Decompress and unpack a proxy archive into the engine namespace.
fn extract_archive(pkg: &str, payload: &[u8]) -> Result<HashMap<String, Vec<u8>>, FetchError> {
    let mut tar_bytes = Vec::new();
    XzDecoder::new(payload)
        .read_to_end(&mut tar_bytes)
        .map_err(|e| FetchError::Decompress {
            what: format!("package {pkg}"),
            reason: e.to_string(),
        })?;

    let mut files = HashMap::new();
    let mut archive = tar::Archive::new(tar_bytes.as_slice());
    let entries = archive.entries().map_err(|e| FetchError::Decompress {
        what: format!("package {pkg}"),
        reason: e.to_string(),
    })?;
    for entry in entries {
        let mut entry = entry.map_err(|e| FetchError::Decompress {
            what: format!("package {pkg}"),
            reason: e.to_string(),
        })?;
        if entry.header().entry_type() != tar::EntryType::Regular {
            continue;
        }
        let path = match entry.path() {
            Ok(path) => path.to_string_lossy().into_owned(),
            Err(_) => continue,
        };
        let Some(mounted) = map_archive_path(pkg, &path) else {
            continue;
        };
        let mut bytes = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut bytes)
            .map_err(|e| FetchError::Decompress {
                what: format!("package {pkg} entry {path}"),
                reason: e.to_string(),
            })?;
        files.insert(mounted, bytes);
    }
    Ok(files)
}

/// Map an archive member path into the engine namespace, or drop it.
///
/// Documentation and source trees are dropped, as is anything that is not
/// a TeX or font file. Paths already containing `texmf-dist` keep their
/// tail; `tex/…` and `fonts/…` subtrees are grafted under
/// `/texlive/texmf-dist/`; anything else falls back to
/// `/texlive/texmf-dist/tex/latex/<pkg>/<file>`.
pub fn map_archive_path(pkg: &str, path: &str) -> Option<String> {
    let segments: Vec<&str> = path
        .split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect();
    let file = segments.last()?;
    if segments
        .iter()
        .any(|s| *s == "doc" || *s == "source" || *s == "..")
    {
        return None;
    }
    let ext = file.rsplit_once('.')?.1.to_ascii_lowercase();
    if !TEX_EXTENSIONS.contains(&ext.as_str()) && !FONT_EXTENSIONS.contains(&ext.as_str()) {
        return None;
    }
    if let Some(idx) = segments.iter().position(|s| *s == "texmf-dist") {
        return Some(format!("/texlive/{}", segments[idx..].join("/")));
    }
    if let Some(idx) = segments
        .iter()
        .position(|s| *s == "tex" || *s == "fonts")
    {
        return Some(format!("/texlive/texmf-dist/{}", segments[idx..].join("/")));
    }
    Some(format!("/texlive/texmf-dist/tex/latex/{pkg}/{file}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use xz2::write::XzEncoder;

    #[test]
    fn test_map_preserves_texmf_dist() {
        assert_eq!(
            map_archive_path("foo", "archive/texmf-dist/tex/latex/foo/foo.sty"),
            Some("/texlive/texmf-dist/tex/latex/foo/foo.sty".to_string())
        );
    }

    #[test]
    fn test_map_grafts_tex_subtree() {
        assert_eq!(
            map_archive_path("foo", "foo-1.0/tex/latex/foo/foo.sty"),
            Some("/texlive/texmf-dist/tex/latex/foo/foo.sty".to_string())
        );
        assert_eq!(
            map_archive_path("bar", "bar/fonts/tfm/public/bar/bar10.tfm"),
            Some("/texlive/texmf-dist/fonts/tfm/public/bar/bar10.tfm".to_string())
        );
    }

    #[test]
    fn test_map_fallback_flat_file() {
        assert_eq!(
            map_archive_path("foo", "foo.sty"),
            Some("/texlive/texmf-dist/tex/latex/foo/foo.sty".to_string())
        );
    }

    #[test]
    fn test_map_drops_doc_and_source() {
        assert_eq!(map_archive_path("foo", "foo/doc/foo.tex"), None);
        assert_eq!(map_archive_path("foo", "foo/source/foo.dtx"), None);
    }

    #[test]
    fn test_map_drops_unknown_extensions() {
        assert_eq!(map_archive_path("foo", "foo/README"), None);
        assert_eq!(map_archive_path("foo", "foo/foo.pdf"), None);
        assert_eq!(map_archive_path("foo", "foo/foo.ins"), None);
    }

    fn make_xz_tar(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, data) in entries {
            let mut header = tar::Header::new_ustar();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, *data).unwrap();
        }
        let tar_bytes = builder.into_inner().unwrap();
        let mut encoder = XzEncoder::new(Vec::new(), 6);
        encoder.write_all(&tar_bytes).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_extract_archive_filters_and_grafts() {
        let payload = make_xz_tar(&[
            ("foo/tex/latex/foo/foo.sty", b"\\ProvidesPackage{foo}"),
            ("foo/doc/foo.tex", b"docs"),
            ("foo/README", b"readme"),
        ]);
        let files = extract_archive("foo", &payload).unwrap();
        assert_eq!(files.len(), 1);
        assert!(files.contains_key("/texlive/texmf-dist/tex/latex/foo/foo.sty"));
    }

    #[test]
    fn test_extract_archive_corrupt_payload() {
        assert!(matches!(
            extract_archive("foo", b"definitely not xz"),
            Err(FetchError::Decompress { .. })
        ));
    }
}

//! Bundle body and byte-range fetching.
//!
//! Fetch order for a bundle body: memory, durable blob store, then the
//! remote `<base>/<id>.data.gz`. Byte ranges come from the uncompressed
//! `<base>/<id>.raw` endpoint and land in a session range cache so the
//! next compile attempt's reads are hits.

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

use flate2::read::GzDecoder;
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::bundle::BundleManifest;
use crate::cache::TexCache;

use super::{FetchError, Transport, TransportResponse};

/// Key of one fetched slice: `(bundle_id, start, end)`.
pub type RangeKey = (String, u64, u64);

/// Session cache of fetched byte ranges. Shared between the bundle fetcher
/// (writer) and the VFS (reader), and retained across compile retries.
#[derive(Clone, Default)]
pub struct RangeCache {
    inner: Arc<RwLock<HashMap<RangeKey, Arc<Vec<u8>>>>>,
}

impl RangeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, bundle: &str, start: u64, end: u64) -> Option<Arc<Vec<u8>>> {
        self.inner
            .read()
            .get(&(bundle.to_string(), start, end))
            .map(Arc::clone)
    }

    pub fn contains(&self, bundle: &str, start: u64, end: u64) -> bool {
        self.inner
            .read()
            .contains_key(&(bundle.to_string(), start, end))
    }

    pub fn insert(&self, bundle: &str, start: u64, end: u64, bytes: Vec<u8>) -> Arc<Vec<u8>> {
        let bytes = Arc::new(bytes);
        self.inner
            .write()
            .insert((bundle.to_string(), start, end), Arc::clone(&bytes));
        bytes
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

/// Retrieves bundle bodies, manifests, and byte ranges.
pub struct BundleFetcher {
    transport: Arc<dyn Transport>,
    cache: TexCache,
    base_url: String,
    ranges: RangeCache,
    manifests: RwLock<HashMap<String, Arc<BundleManifest>>>,
}

impl BundleFetcher {
    pub fn new(transport: Arc<dyn Transport>, cache: TexCache, base_url: &str) -> Self {
        Self {
            transport,
            cache,
            base_url: base_url.trim_end_matches('/').to_string(),
            ranges: RangeCache::new(),
            manifests: RwLock::new(HashMap::new()),
        }
    }

    /// The session byte-range cache, for sharing with the VFS.
    pub fn range_cache(&self) -> RangeCache {
        self.ranges.clone()
    }

    /// Fetch a bundle body, consulting memory and the blob store before the
    /// network. The returned body is retained for the rest of the session.
    pub async fn fetch_bundle(&self, id: &str) -> Result<Arc<Vec<u8>>, FetchError> {
        if let Some(body) = self.cache.get_bundle(id) {
            debug!(bundle = %id, "bundle body cache hit");
            return Ok(body);
        }
        let url = format!("{}/{}.data.gz", self.base_url, id);
        let response = self.transport.get(&url).await?;
        if !response.is_success() {
            return Err(FetchError::Status {
                url,
                status: response.status,
            });
        }
        let body = decode_body(id, response)?;
        info!(bundle = %id, bytes = body.len(), "fetched bundle body");
        // Cached only after successful decode, so a corrupt payload never
        // poisons the store.
        Ok(self.cache.put_bundle(id, body))
    }

    /// Fetch the per-bundle manifest (`<id>.meta.json`), memoized for the
    /// session.
    pub async fn fetch_manifest(&self, id: &str) -> Result<Arc<BundleManifest>, FetchError> {
        if let Some(manifest) = self.manifests.read().get(id) {
            return Ok(Arc::clone(manifest));
        }
        let url = format!("{}/{}.meta.json", self.base_url, id);
        let response = self.transport.get(&url).await?;
        if !response.is_success() {
            return Err(FetchError::Status {
                url,
                status: response.status,
            });
        }
        let manifest = Arc::new(BundleManifest::from_json(&response.body)?);
        self.manifests
            .write()
            .insert(id.to_string(), Arc::clone(&manifest));
        Ok(manifest)
    }

    /// Fetch `[start, end)` of an uncompressed bundle body and record it in
    /// the session range cache.
    pub async fn fetch_range(
        &self,
        id: &str,
        start: u64,
        end: u64,
    ) -> Result<Arc<Vec<u8>>, FetchError> {
        if let Some(slice) = self.ranges.get(id, start, end) {
            return Ok(slice);
        }
        let url = format!("{}/{}.raw", self.base_url, id);
        let response = self.transport.get_range(&url, start, end).await?;
        if !response.is_success() {
            return Err(FetchError::Status {
                url,
                status: response.status,
            });
        }
        let expected = (end - start) as usize;
        if response.body.len() != expected {
            return Err(FetchError::RangeLength {
                bundle: id.to_string(),
                start,
                end,
                got: response.body.len(),
            });
        }
        debug!(bundle = %id, start, end, "fetched byte range");
        Ok(self.ranges.insert(id, start, end, response.body))
    }
}

/// Decompress a bundle payload. The transport reports how the wire encoded
/// it: Brotli is undone by the transport itself, anything else is gzip.
fn decode_body(id: &str, response: TransportResponse) -> Result<Vec<u8>, FetchError> {
    if response.transport_decompressed() {
        return Ok(response.body);
    }
    let mut decoder = GzDecoder::new(response.body.as_slice());
    let mut body = Vec::new();
    decoder
        .read_to_end(&mut body)
        .map_err(|e| FetchError::Decompress {
            what: format!("bundle {id}"),
            reason: e.to_string(),
        })?;
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_decode_body_gzip() {
        let response = TransportResponse {
            status: 200,
            content_encoding: None,
            body: gzip(b"bundle body"),
        };
        assert_eq!(decode_body("b", response).unwrap(), b"bundle body");
    }

    #[test]
    fn test_decode_body_brotli_passthrough() {
        let response = TransportResponse {
            status: 200,
            content_encoding: Some("br".to_string()),
            body: b"already plain".to_vec(),
        };
        assert_eq!(decode_body("b", response).unwrap(), b"already plain");
    }

    #[test]
    fn test_decode_body_corrupt_rejects() {
        let response = TransportResponse {
            status: 200,
            content_encoding: None,
            body: b"not gzip at all".to_vec(),
        };
        assert!(matches!(
            decode_body("b", response),
            Err(FetchError::Decompress { .. })
        ));
    }

    #[test]
    fn test_range_cache_round_trip() {
        let ranges = RangeCache::new();
        assert!(!ranges.contains("fonts", 10, 20));
        ranges.insert("fonts", 10, 20, vec![1u8; 10]);
        assert!(ranges.contains("fonts", 10, 20));
        assert_eq!(ranges.get("fonts", 10, 20).unwrap().len(), 10);
        // A different range of the same bundle is distinct.
        assert!(!ranges.contains("fonts", 10, 21));
    }
}

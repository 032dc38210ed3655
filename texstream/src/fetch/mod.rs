//! Remote resource fetchers: bundle bodies, byte ranges of bundle bodies,
//! and individual packages from the remote proxy.
//!
//! Fetchers speak through the [`Transport`] trait so tests can run against
//! an in-memory double; production wires in [`HttpTransport`].

mod bundle;
mod package;
mod transport;

use thiserror::Error;

pub use bundle::{BundleFetcher, RangeCache, RangeKey};
pub use package::{FetchedPackage, PackageFetcher};
pub use transport::{BoxFuture, HttpTransport, Transport, TransportResponse};

use crate::bundle::ManifestError;

/// Errors from the fetch layer.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {reason}")]
    Network { url: String, reason: String },

    #[error("request to {url} returned status {status}")]
    Status { url: String, status: u16 },

    #[error("failed to decompress {what}: {reason}")]
    Decompress { what: String, reason: String },

    #[error("byte range {start}..{end} of {bundle} returned {got} bytes")]
    RangeLength {
        bundle: String,
        start: u64,
        end: u64,
        got: usize,
    },

    #[error("package {0} not found at any source")]
    PackageNotFound(String),

    #[error(transparent)]
    Manifest(#[from] ManifestError),
}

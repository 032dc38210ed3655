//! Transport abstraction over HTTP.
//!
//! Dyn-compatible via `Pin<Box<dyn Future>>` so fetchers can hold an
//! `Arc<dyn Transport>` and tests can substitute an in-memory double.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use super::FetchError;

/// Boxed future type for dyn-compatible async methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Default client-level timeout. Operation caps are enforced above the
/// transport by the orchestrator.
const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// A fetched response: status, the content-encoding the transport reports,
/// and the body bytes as received.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub content_encoding: Option<String>,
    pub body: Vec<u8>,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Whether the transport already decompressed the payload (Brotli).
    pub fn transport_decompressed(&self) -> bool {
        self.content_encoding
            .as_deref()
            .map(|e| e.contains("br"))
            .unwrap_or(false)
    }
}

/// Byte-oriented GET transport.
pub trait Transport: Send + Sync {
    fn get(&self, url: &str) -> BoxFuture<'_, Result<TransportResponse, FetchError>>;

    /// HTTP Range request for `[start, end)` (sent as `bytes=start-(end-1)`).
    fn get_range(
        &self,
        url: &str,
        start: u64,
        end: u64,
    ) -> BoxFuture<'_, Result<TransportResponse, FetchError>>;
}

/// Production transport over `reqwest`.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self, FetchError> {
        Self::with_timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Network {
                url: String::new(),
                reason: format!("client build failed: {e}"),
            })?;
        Ok(Self { client })
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        url: &str,
    ) -> Result<TransportResponse, FetchError> {
        let response = request.send().await.map_err(|e| FetchError::Network {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        let status = response.status().as_u16();
        let content_encoding = response
            .headers()
            .get(reqwest::header::CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::Network {
                url: url.to_string(),
                reason: e.to_string(),
            })?
            .to_vec();
        Ok(TransportResponse {
            status,
            content_encoding,
            body,
        })
    }
}

impl Transport for HttpTransport {
    fn get(&self, url: &str) -> BoxFuture<'_, Result<TransportResponse, FetchError>> {
        let url = url.to_string();
        Box::pin(async move { self.send(self.client.get(&url), &url).await })
    }

    fn get_range(
        &self,
        url: &str,
        start: u64,
        end: u64,
    ) -> BoxFuture<'_, Result<TransportResponse, FetchError>> {
        let url = url.to_string();
        Box::pin(async move {
            let request = self
                .client
                .get(&url)
                .header(reqwest::header::RANGE, format!("bytes={}-{}", start, end - 1));
            self.send(request, &url).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_range() {
        let ok = TransportResponse {
            status: 206,
            content_encoding: None,
            body: vec![],
        };
        assert!(ok.is_success());
        let not_found = TransportResponse {
            status: 404,
            content_encoding: None,
            body: vec![],
        };
        assert!(!not_found.is_success());
    }

    #[test]
    fn test_transport_decompressed_detects_brotli() {
        let br = TransportResponse {
            status: 200,
            content_encoding: Some("br".to_string()),
            body: vec![],
        };
        assert!(br.transport_decompressed());
        let plain = TransportResponse {
            status: 200,
            content_encoding: None,
            body: vec![],
        };
        assert!(!plain.transport_decompressed());
    }
}

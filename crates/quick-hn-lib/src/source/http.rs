//! HTTP client seam for source adapters

use super::SourceError;
use std::future::Future;
use std::sync::Arc;

/// Asynchronous HTTP GET
///
/// Adapters are generic over this trait so tests can serve canned responses.
pub trait HttpClient: Send + Sync {
    /// Fetch `url` and return the response body, failing on transport errors and
    /// non-success status codes.
    fn get(&self, url: &str) -> impl Future<Output = Result<Vec<u8>, SourceError>> + Send;
}

impl<C: HttpClient> HttpClient for Arc<C> {
    fn get(&self, url: &str) -> impl Future<Output = Result<Vec<u8>, SourceError>> + Send {
        (**self).get(url)
    }
}

/// User-Agent sent with every request
#[cfg(feature = "http")]
const USER_AGENT: &str = concat!("quick-hn-importer/", env!("CARGO_PKG_VERSION"));

/// HTTP client backed by `reqwest`
#[cfg(feature = "http")]
#[derive(Clone, Debug)]
pub struct ReqwestClient {
    client: reqwest::Client,
}

#[cfg(feature = "http")]
impl ReqwestClient {
    /// Create a client with the given request timeout
    pub fn with_timeout(timeout_secs: u64) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| SourceError::Http(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[cfg(feature = "http")]
impl HttpClient for ReqwestClient {
    async fn get(&self, url: &str) -> Result<Vec<u8>, SourceError> {
        tracing::trace!(url, "HTTP GET request starting");

        let response = match self.client.get(url).send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(
                    url,
                    error = %e,
                    is_timeout = e.is_timeout(),
                    "HTTP request failed"
                );
                return Err(SourceError::Http(format!("Request failed: {e}")));
            }
        };

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(url, status = status.as_u16(), "HTTP error status");
            return Err(SourceError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| SourceError::Http(format!("Failed to read response: {e}")))?;
        tracing::debug!(url, bytes = bytes.len(), "HTTP response received");
        Ok(bytes.to_vec())
    }
}

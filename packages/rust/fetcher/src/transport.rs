//! Network transport seam for the fetcher.
//!
//! [`Transport`] performs exactly one GET and classifies the failure; it
//! never retries. [`HttpTransport`] is the production implementation on top
//! of `reqwest`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::debug;

use imgdesc_shared::{ImgDescError, Result};

/// User-Agent string for fetch requests.
const USER_AGENT: &str = concat!("imgdesc/", env!("CARGO_PKG_VERSION"));

/// Why a single GET produced no body.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The configured timeout elapsed before the response completed.
    #[error("request timed out")]
    Timeout,

    /// The server answered with something other than 200.
    #[error("HTTP {0}")]
    Status(u16),

    /// DNS, connection, TLS or body-read failure.
    #[error("network failure: {0}")]
    Network(String),
}

/// One network GET returning the full response body.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, url: &str) -> std::result::Result<Vec<u8>, TransportError>;
}

/// `reqwest`-backed transport with a per-request timeout.
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Build a transport whose requests time out after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(timeout)
            .build()
            .map_err(|e| ImgDescError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, url: &str) -> std::result::Result<Vec<u8>, TransportError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(classify_error)?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(TransportError::Status(status.as_u16()));
        }

        let body = response.bytes().await.map_err(classify_error)?;
        debug!(url, bytes = body.len(), "downloaded");
        Ok(body.to_vec())
    }
}

fn classify_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Network(err.to_string())
    }
}

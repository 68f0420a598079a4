//! Inference backend seam.

use std::time::Duration;

use async_trait::async_trait;

/// Why a backend call produced no text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InferenceError {
    /// The backend asked us to slow down. Transient.
    #[error("rate limited")]
    RateLimited {
        /// Wait hinted by the backend, if any.
        retry_after: Option<Duration>,
    },

    /// Malformed payload, model unavailable, internal error. Not retried.
    #[error("model error: {0}")]
    Model(String),
}

/// A multimodal model reachable over some RPC.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Describe `payload` according to `prompt` using `model`.
    async fn call(
        &self,
        model: &str,
        prompt: &str,
        payload: &[u8],
    ) -> std::result::Result<String, InferenceError>;
}

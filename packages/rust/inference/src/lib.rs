//! Image description through a multimodal model.
//!
//! - [`backend`]: the [`InferenceBackend`] seam and [`InferenceError`]
//! - [`openrouter`]: HTTP backend for OpenAI-compatible chat completions
//! - [`client`]: [`InferenceClient`]: bounded fan-out with rate-limit backoff and a description cache

pub mod backend;
pub mod client;
pub mod openrouter;

pub use backend::{InferenceBackend, InferenceError};
pub use client::{InferenceClient, InferenceStats, InferenceSummary};
pub use openrouter::OpenRouterBackend;

//! Resource fetching for imgdesc runs.
//!
//! This crate provides:
//! - [`transport`]: the [`Transport`] seam and the `reqwest`-backed [`HttpTransport`]
//! - [`engine`]: [`Fetcher`]: single attempts, retry with backoff, bounded fan-out

pub mod engine;
pub mod transport;

pub use engine::{FetchSummary, Fetcher};
pub use transport::{HttpTransport, Transport, TransportError};

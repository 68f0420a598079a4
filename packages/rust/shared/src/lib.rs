//! Shared types, error model, and configuration for imgdesc.
//!
//! This crate is the foundation depended on by all other imgdesc crates.
//! It provides:
//! - [`ImgDescError`]: the unified error type
//! - Domain types ([`WorkItem`], [`FetchResult`], [`InferenceResult`], table records)
//! - [`RetryPolicy`]: exponential backoff shared by fetch and inference
//! - Configuration ([`AppConfig`] and the per-stage runtime configs)

pub mod config;
pub mod error;
pub mod retry;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, FetchConfig, FetchSection, InferenceConfig, InferenceSection, StorageConfig,
    StorageSection, TableNames, WorklistConfig, WorklistSection, config_dir, config_file_path,
    init_config, load_config, load_config_from, resolve_api_key,
};
pub use error::{ImgDescError, Result};
pub use retry::RetryPolicy;
pub use types::{
    CodeRecord, DescRecord, FetchResult, FetchStatus, InferenceResult, InferenceStatus, Rows,
    TableWrite, UrlRecord, WorkItem, WriteMode,
};

//! Core domain types shared by every pipeline stage.

use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// WorkItem
// ---------------------------------------------------------------------------

/// One unit of work: a resource identifier and the URL it is fetched from.
///
/// The id is the primary key across all stages.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: i64,
    pub url: String,
}

impl WorkItem {
    pub fn new(id: i64, url: impl Into<String>) -> Self {
        Self {
            id,
            url: url.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Fetch stage
// ---------------------------------------------------------------------------

/// Coarse outcome of fetching one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FetchStatus {
    Ok,
    Timeout,
    HttpError,
    NetworkError,
    /// Never dispatched because the run was cancelled.
    Cancelled,
}

impl FetchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Timeout => "TIMEOUT",
            Self::HttpError => "HTTP_ERROR",
            Self::NetworkError => "NETWORK_ERROR",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Transient failures worth another attempt. `HTTP_ERROR` is a
    /// definitive resource-side answer and is never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::NetworkError)
    }
}

impl fmt::Display for FetchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The result of fetching one [`WorkItem`].
///
/// `content` is present if and only if the status is [`FetchStatus::Ok`];
/// the constructors are the only way to build one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResult {
    id: i64,
    url: String,
    content: Option<Vec<u8>>,
    status: FetchStatus,
}

impl FetchResult {
    /// A successful fetch carrying the response body.
    pub fn ok(item: &WorkItem, content: Vec<u8>) -> Self {
        Self {
            id: item.id,
            url: item.url.clone(),
            content: Some(content),
            status: FetchStatus::Ok,
        }
    }

    /// A failed fetch. Passing [`FetchStatus::Ok`] is a logic error and is
    /// downgraded to `NETWORK_ERROR` so the content invariant still holds.
    pub fn failed(item: &WorkItem, status: FetchStatus) -> Self {
        debug_assert_ne!(status, FetchStatus::Ok, "failed() called with OK status");
        let status = match status {
            FetchStatus::Ok => FetchStatus::NetworkError,
            other => other,
        };
        Self {
            id: item.id,
            url: item.url.clone(),
            content: None,
            status,
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn status(&self) -> FetchStatus {
        self.status
    }

    pub fn content(&self) -> Option<&[u8]> {
        self.content.as_deref()
    }

    pub fn has_content(&self) -> bool {
        self.content.is_some()
    }
}

// ---------------------------------------------------------------------------
// Inference stage
// ---------------------------------------------------------------------------

/// Outcome of describing one fetched resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InferenceStatus {
    Ok,
    SkippedNoContent,
    ModelError,
    RateLimited,
    /// Never dispatched because the run was cancelled.
    Cancelled,
}

impl InferenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::SkippedNoContent => "SKIPPED_NO_CONTENT",
            Self::ModelError => "MODEL_ERROR",
            Self::RateLimited => "RATE_LIMITED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for InferenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The description produced for one item, or the reason there is none.
///
/// `description` is present (and non-empty) if and only if the status is
/// [`InferenceStatus::Ok`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceResult {
    id: i64,
    url: String,
    description: Option<String>,
    status: InferenceStatus,
}

impl InferenceResult {
    /// A successful description, stored exactly as the model returned it.
    /// Blank text is a masked failure and becomes `MODEL_ERROR`.
    pub fn described(id: i64, url: impl Into<String>, text: &str) -> Self {
        if text.trim().is_empty() {
            return Self::failed(id, url, InferenceStatus::ModelError);
        }
        Self {
            id,
            url: url.into(),
            description: Some(text.to_string()),
            status: InferenceStatus::Ok,
        }
    }

    /// An item with no description. `OK` is downgraded to `MODEL_ERROR`.
    pub fn failed(id: i64, url: impl Into<String>, status: InferenceStatus) -> Self {
        debug_assert_ne!(status, InferenceStatus::Ok, "failed() called with OK status");
        let status = match status {
            InferenceStatus::Ok => InferenceStatus::ModelError,
            other => other,
        };
        Self {
            id,
            url: url.into(),
            description: None,
            status,
        }
    }

    /// The short-circuit result for a fetch that produced no content.
    pub fn skipped(fetch: &FetchResult) -> Self {
        Self::failed(fetch.id(), fetch.url(), InferenceStatus::SkippedNoContent)
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn status(&self) -> InferenceStatus {
        self.status
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }
}

// ---------------------------------------------------------------------------
// Table records
// ---------------------------------------------------------------------------

/// Row of the `image_urls` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlRecord {
    pub id: i64,
    pub url: String,
}

impl From<&WorkItem> for UrlRecord {
    fn from(item: &WorkItem) -> Self {
        Self {
            id: item.id,
            url: item.url.clone(),
        }
    }
}

/// Row of the `image_codes` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeRecord {
    pub id: i64,
    pub url: String,
    pub content: Option<Vec<u8>>,
    pub fetch_status: String,
}

impl From<&FetchResult> for CodeRecord {
    fn from(fetch: &FetchResult) -> Self {
        Self {
            id: fetch.id(),
            url: fetch.url().to_string(),
            content: fetch.content().map(<[u8]>::to_vec),
            fetch_status: fetch.status().as_str().to_string(),
        }
    }
}

/// Row of the `image_desc` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescRecord {
    pub id: i64,
    pub url: String,
    pub description: Option<String>,
    pub status: String,
}

impl From<&InferenceResult> for DescRecord {
    fn from(result: &InferenceResult) -> Self {
        Self {
            id: result.id(),
            url: result.url().to_string(),
            description: result.description().map(str::to_string),
            status: result.status().as_str().to_string(),
        }
    }
}

/// Schema-typed rows handed to a storage backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rows {
    Urls(Vec<UrlRecord>),
    Codes(Vec<CodeRecord>),
    Descriptions(Vec<DescRecord>),
}

impl Rows {
    pub fn len(&self) -> usize {
        match self {
            Self::Urls(rows) => rows.len(),
            Self::Codes(rows) => rows.len(),
            Self::Descriptions(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Short schema name, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Urls(_) => "urls",
            Self::Codes(_) => "codes",
            Self::Descriptions(_) => "descriptions",
        }
    }
}

/// How rows are applied to a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WriteMode {
    Append,
    Overwrite,
}

impl WriteMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Append => "APPEND",
            Self::Overwrite => "OVERWRITE",
        }
    }
}

/// One table write within a multi-table commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableWrite {
    pub table: String,
    pub rows: Rows,
    pub mode: WriteMode,
}

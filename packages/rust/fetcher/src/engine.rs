//! Concurrent, retrying resource fetcher.
//!
//! [`Fetcher::fetch`] performs one attempt. [`Fetcher::fetch_with_retry`]
//! wraps it with exponential backoff for transient failures, and
//! [`Fetcher::fetch_all`] fans a worklist out under a counting semaphore.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use imgdesc_shared::{FetchConfig, FetchResult, FetchStatus, Result, RetryPolicy, WorkItem};

use crate::transport::{HttpTransport, Transport, TransportError};

// ---------------------------------------------------------------------------
// FetchSummary
// ---------------------------------------------------------------------------

/// Status counts for a completed fetch stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchSummary {
    pub ok: usize,
    pub timeout: usize,
    pub http_error: usize,
    pub network_error: usize,
    pub cancelled: usize,
}

impl FetchSummary {
    pub fn from_results(results: &[FetchResult]) -> Self {
        let mut summary = Self::default();
        for result in results {
            match result.status() {
                FetchStatus::Ok => summary.ok += 1,
                FetchStatus::Timeout => summary.timeout += 1,
                FetchStatus::HttpError => summary.http_error += 1,
                FetchStatus::NetworkError => summary.network_error += 1,
                FetchStatus::Cancelled => summary.cancelled += 1,
            }
        }
        summary
    }

    pub fn total(&self) -> usize {
        self.ok + self.timeout + self.http_error + self.network_error + self.cancelled
    }
}

// ---------------------------------------------------------------------------
// Fetcher
// ---------------------------------------------------------------------------

/// Downloads resource bodies with bounded concurrency, timeout and retry.
///
/// Stateless between items apart from the semaphore created per
/// [`fetch_all`](Self::fetch_all) call.
#[derive(Clone)]
pub struct Fetcher {
    config: FetchConfig,
    transport: Arc<dyn Transport>,
}

impl Fetcher {
    /// Create a fetcher backed by [`HttpTransport`].
    pub fn new(config: FetchConfig) -> Result<Self> {
        let transport = HttpTransport::new(config.timeout)?;
        Ok(Self::with_transport(config, Arc::new(transport)))
    }

    /// Create a fetcher with a custom transport.
    pub fn with_transport(config: FetchConfig, transport: Arc<dyn Transport>) -> Self {
        Self { config, transport }
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// One attempt, no retry.
    pub async fn fetch(&self, item: &WorkItem) -> FetchResult {
        fetch_once(self.transport.as_ref(), item).await
    }

    /// Attempt `item` up to `max_attempts` times, retrying only `TIMEOUT`
    /// and `NETWORK_ERROR`. The last result is returned.
    pub async fn fetch_with_retry(&self, item: &WorkItem, cancel: &CancellationToken) -> FetchResult {
        fetch_with_retry(self.transport.as_ref(), &self.config.retry, item, cancel).await
    }

    /// Fetch every item; see [`fetch_all_with_progress`](Self::fetch_all_with_progress).
    pub async fn fetch_all(&self, items: &[WorkItem], cancel: &CancellationToken) -> Vec<FetchResult> {
        self.fetch_all_with_progress(items, cancel, |_| {}).await
    }

    /// Fetch every item with at most `concurrency` requests in flight.
    ///
    /// Returns exactly one result per input item, in input order. Once
    /// `cancel` fires no new request is started and undispatched items come
    /// back as `CANCELLED`; requests already in flight run to completion.
    #[instrument(skip_all, fields(items = items.len(), concurrency = self.config.concurrency))]
    pub async fn fetch_all_with_progress(
        &self,
        items: &[WorkItem],
        cancel: &CancellationToken,
        mut on_result: impl FnMut(&FetchResult),
    ) -> Vec<FetchResult> {
        let start_time = Instant::now();
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));

        info!(
            max_attempts = self.config.retry.max_attempts,
            timeout_ms = self.config.timeout.as_millis() as u64,
            "starting fetch stage"
        );

        let mut handles = Vec::with_capacity(items.len());
        for item in items {
            if cancel.is_cancelled() {
                handles.push((item, None));
                continue;
            }

            let transport = self.transport.clone();
            let sem = semaphore.clone();
            let policy = self.config.retry;
            let cancel = cancel.clone();
            let task_item = item.clone();

            handles.push((
                item,
                Some(tokio::spawn(async move {
                    let permit = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => None,
                        permit = sem.acquire_owned() => permit.ok(),
                    };
                    let Some(_permit) = permit else {
                        return FetchResult::failed(&task_item, FetchStatus::Cancelled);
                    };
                    if cancel.is_cancelled() {
                        return FetchResult::failed(&task_item, FetchStatus::Cancelled);
                    }

                    fetch_with_retry(transport.as_ref(), &policy, &task_item, &cancel).await
                })),
            ));
        }

        // Collect results
        let mut results = Vec::with_capacity(items.len());
        for (item, handle) in handles {
            let result = match handle {
                None => FetchResult::failed(item, FetchStatus::Cancelled),
                Some(handle) => match handle.await {
                    Ok(result) => result,
                    Err(e) => {
                        warn!(id = item.id, error = %e, "fetch task failed");
                        FetchResult::failed(item, FetchStatus::NetworkError)
                    }
                },
            };
            on_result(&result);
            results.push(result);
        }

        let summary = FetchSummary::from_results(&results);
        info!(
            ok = summary.ok,
            timeout = summary.timeout,
            http_error = summary.http_error,
            network_error = summary.network_error,
            cancelled = summary.cancelled,
            duration_ms = start_time.elapsed().as_millis() as u64,
            "fetch stage completed"
        );

        results
    }
}

// ---------------------------------------------------------------------------
// Single item fetching
// ---------------------------------------------------------------------------

/// One GET, classified into a [`FetchResult`].
async fn fetch_once(transport: &dyn Transport, item: &WorkItem) -> FetchResult {
    match transport.get(&item.url).await {
        Ok(body) => FetchResult::ok(item, body),
        Err(TransportError::Status(code)) => {
            // The code is only logged; callers need the coarse status.
            warn!(id = item.id, url = %item.url, status = code, "non-200 response");
            FetchResult::failed(item, FetchStatus::HttpError)
        }
        Err(TransportError::Timeout) => {
            debug!(id = item.id, url = %item.url, "fetch timed out");
            FetchResult::failed(item, FetchStatus::Timeout)
        }
        Err(TransportError::Network(message)) => {
            debug!(id = item.id, url = %item.url, error = %message, "network failure");
            FetchResult::failed(item, FetchStatus::NetworkError)
        }
    }
}

async fn fetch_with_retry(
    transport: &dyn Transport,
    policy: &RetryPolicy,
    item: &WorkItem,
    cancel: &CancellationToken,
) -> FetchResult {
    let mut attempts = 0;
    loop {
        let result = fetch_once(transport, item).await;
        attempts += 1;

        if !result.status().is_retryable() || !policy.allows_retry(attempts) {
            if result.status().is_retryable() {
                warn!(id = item.id, attempts, status = %result.status(), "giving up on fetch");
            }
            return result;
        }

        let delay = policy.delay_for(attempts - 1);
        debug!(
            id = item.id,
            attempt = attempts,
            status = %result.status(),
            delay_ms = delay.as_millis() as u64,
            "retrying fetch"
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(id = item.id, "run cancelled during fetch backoff");
                return result;
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

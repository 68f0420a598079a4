//! Bounded, rate-limit-aware inference over a batch of fetch results.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use imgdesc_shared::{FetchResult, InferenceConfig, InferenceResult, InferenceStatus};
use imgdesc_storage::Storage;

use crate::backend::{InferenceBackend, InferenceError};

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Counters accumulated over the lifetime of an [`InferenceClient`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InferenceStats {
    pub backend_calls: usize,
    pub cache_hits: usize,
    pub rate_limit_retries: usize,
}

#[derive(Default)]
struct Counters {
    backend_calls: AtomicUsize,
    cache_hits: AtomicUsize,
    rate_limit_retries: AtomicUsize,
}

/// Status counts for a completed inference stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InferenceSummary {
    pub ok: usize,
    pub skipped_no_content: usize,
    pub model_error: usize,
    pub rate_limited: usize,
    pub cancelled: usize,
}

impl InferenceSummary {
    pub fn from_results(results: &[InferenceResult]) -> Self {
        let mut summary = Self::default();
        for result in results {
            match result.status() {
                InferenceStatus::Ok => summary.ok += 1,
                InferenceStatus::SkippedNoContent => summary.skipped_no_content += 1,
                InferenceStatus::ModelError => summary.model_error += 1,
                InferenceStatus::RateLimited => summary.rate_limited += 1,
                InferenceStatus::Cancelled => summary.cancelled += 1,
            }
        }
        summary
    }

    pub fn total(&self) -> usize {
        self.ok + self.skipped_no_content + self.model_error + self.rate_limited + self.cancelled
    }
}

// ---------------------------------------------------------------------------
// InferenceClient
// ---------------------------------------------------------------------------

/// Sends fetched payloads to a model and collects one result per input.
///
/// Cloning is cheap; clones share the backend, cache and counters.
#[derive(Clone)]
pub struct InferenceClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: InferenceConfig,
    backend: Arc<dyn InferenceBackend>,
    cache: Option<Arc<Storage>>,
    counters: Counters,
}

impl InferenceClient {
    pub fn new(config: InferenceConfig, backend: Arc<dyn InferenceBackend>) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config,
                backend,
                cache: None,
                counters: Counters::default(),
            }),
        }
    }

    /// Look descriptions up in (and store them to) `storage` before calling
    /// the backend. Ignored when caching is disabled in the config.
    pub fn with_cache(config: InferenceConfig, backend: Arc<dyn InferenceBackend>, storage: Arc<Storage>) -> Self {
        let cache = config.cache.then_some(storage);
        Self {
            inner: Arc::new(ClientInner {
                config,
                backend,
                cache,
                counters: Counters::default(),
            }),
        }
    }

    pub fn config(&self) -> &InferenceConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> InferenceStats {
        let counters = &self.inner.counters;
        InferenceStats {
            backend_calls: counters.backend_calls.load(Ordering::Relaxed),
            cache_hits: counters.cache_hits.load(Ordering::Relaxed),
            rate_limit_retries: counters.rate_limit_retries.load(Ordering::Relaxed),
        }
    }

    /// Describe a single fetch result, including rate-limit retries.
    pub async fn describe(&self, fetch: &FetchResult, cancel: &CancellationToken) -> InferenceResult {
        self.inner.describe(fetch, cancel).await
    }

    /// Describe a batch; see [`infer_with_progress`](Self::infer_with_progress).
    pub async fn infer(&self, batch: &[FetchResult], cancel: &CancellationToken) -> Vec<InferenceResult> {
        self.infer_with_progress(batch, cancel, |_| {}).await
    }

    /// Describe every fetch result with at most `concurrency` backend calls
    /// in flight.
    ///
    /// Returns one result per input, in input order. Inputs without content
    /// are skipped without a backend call. After `cancel` fires no new call
    /// is started and pending items come back as `CANCELLED`.
    #[instrument(skip_all, fields(items = batch.len(), concurrency = self.inner.config.concurrency, model = %self.inner.config.model))]
    pub async fn infer_with_progress(
        &self,
        batch: &[FetchResult],
        cancel: &CancellationToken,
        mut on_result: impl FnMut(&InferenceResult),
    ) -> Vec<InferenceResult> {
        let start_time = Instant::now();
        let semaphore = Arc::new(Semaphore::new(self.inner.config.concurrency.max(1)));

        info!(
            with_content = batch.iter().filter(|f| f.has_content()).count(),
            cache = self.inner.cache.is_some(),
            "starting inference stage"
        );

        let mut handles = Vec::with_capacity(batch.len());
        for fetch in batch {
            if !fetch.has_content() {
                handles.push((fetch, Pending::Ready(InferenceResult::skipped(fetch))));
                continue;
            }
            if cancel.is_cancelled() {
                handles.push((fetch, Pending::Ready(cancelled(fetch))));
                continue;
            }

            let inner = self.inner.clone();
            let sem = semaphore.clone();
            let cancel = cancel.clone();
            let task_fetch = fetch.clone();

            handles.push((
                fetch,
                Pending::Spawned(tokio::spawn(async move {
                    let permit = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => None,
                        permit = sem.acquire_owned() => permit.ok(),
                    };
                    let Some(_permit) = permit else {
                        return cancelled(&task_fetch);
                    };
                    if cancel.is_cancelled() {
                        return cancelled(&task_fetch);
                    }

                    inner.describe(&task_fetch, &cancel).await
                })),
            ));
        }

        let mut results = Vec::with_capacity(batch.len());
        for (fetch, pending) in handles {
            let result = match pending {
                Pending::Ready(result) => result,
                Pending::Spawned(handle) => match handle.await {
                    Ok(result) => result,
                    Err(e) => {
                        warn!(id = fetch.id(), error = %e, "inference task failed");
                        InferenceResult::failed(fetch.id(), fetch.url(), InferenceStatus::ModelError)
                    }
                },
            };
            on_result(&result);
            results.push(result);
        }

        let summary = InferenceSummary::from_results(&results);
        let stats = self.stats();
        info!(
            ok = summary.ok,
            skipped = summary.skipped_no_content,
            model_error = summary.model_error,
            rate_limited = summary.rate_limited,
            cancelled = summary.cancelled,
            backend_calls = stats.backend_calls,
            cache_hits = stats.cache_hits,
            duration_ms = start_time.elapsed().as_millis() as u64,
            "inference stage completed"
        );

        results
    }
}

enum Pending {
    Ready(InferenceResult),
    Spawned(tokio::task::JoinHandle<InferenceResult>),
}

fn cancelled(fetch: &FetchResult) -> InferenceResult {
    InferenceResult::failed(fetch.id(), fetch.url(), InferenceStatus::Cancelled)
}

impl ClientInner {
    async fn describe(&self, fetch: &FetchResult, cancel: &CancellationToken) -> InferenceResult {
        let Some(payload) = fetch.content() else {
            return InferenceResult::skipped(fetch);
        };

        let key = self.cache.as_ref().map(|_| CacheKey::new(payload, &self.config.prompt));
        if let Some(described) = self.lookup(fetch, key.as_ref()).await {
            return described;
        }

        let policy = self.config.retry;
        let mut attempts = 0;
        loop {
            attempts += 1;
            self.counters.backend_calls.fetch_add(1, Ordering::Relaxed);

            let call = self.backend.call(&self.config.model, &self.config.prompt, payload);
            let outcome = match tokio::time::timeout(self.config.timeout, call).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(id = fetch.id(), timeout_ms = self.config.timeout.as_millis() as u64, "inference timed out");
                    return InferenceResult::failed(fetch.id(), fetch.url(), InferenceStatus::ModelError);
                }
            };

            let retry_after = match outcome {
                Ok(text) => {
                    let result = InferenceResult::described(fetch.id(), fetch.url(), &text);
                    match result.description() {
                        Some(description) => self.store(fetch, key.as_ref(), description).await,
                        None => warn!(id = fetch.id(), "model returned an empty description"),
                    }
                    return result;
                }
                Err(InferenceError::Model(message)) => {
                    warn!(id = fetch.id(), error = %message, "model error");
                    return InferenceResult::failed(fetch.id(), fetch.url(), InferenceStatus::ModelError);
                }
                Err(InferenceError::RateLimited { retry_after }) => retry_after,
            };

            if !policy.allows_retry(attempts) {
                warn!(id = fetch.id(), attempts, "still rate limited, giving up");
                return InferenceResult::failed(fetch.id(), fetch.url(), InferenceStatus::RateLimited);
            }

            // Honour the server hint, but never beyond the policy ceiling.
            let hinted = retry_after.unwrap_or(Duration::ZERO).min(policy.max_delay);
            let delay = policy.delay_for(attempts - 1).max(hinted);
            self.counters.rate_limit_retries.fetch_add(1, Ordering::Relaxed);
            debug!(
                id = fetch.id(),
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                "rate limited, backing off"
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(id = fetch.id(), "run cancelled during inference backoff");
                    return InferenceResult::failed(fetch.id(), fetch.url(), InferenceStatus::RateLimited);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn lookup(&self, fetch: &FetchResult, key: Option<&CacheKey>) -> Option<InferenceResult> {
        let (storage, key) = (self.cache.as_ref()?, key?);
        match storage
            .get_cached_description(&key.content_hash, &self.config.model, &key.prompt_hash)
            .await
        {
            Ok(Some(description)) => {
                self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                debug!(id = fetch.id(), "description cache hit");
                Some(InferenceResult::described(fetch.id(), fetch.url(), &description))
            }
            Ok(None) => None,
            Err(e) => {
                warn!(id = fetch.id(), error = %e, "description cache lookup failed");
                None
            }
        }
    }

    async fn store(&self, fetch: &FetchResult, key: Option<&CacheKey>, description: &str) {
        let (Some(storage), Some(key)) = (self.cache.as_ref(), key) else {
            return;
        };
        if let Err(e) = storage
            .set_cached_description(&key.content_hash, &self.config.model, &key.prompt_hash, description)
            .await
        {
            warn!(id = fetch.id(), error = %e, "failed to cache description");
        }
    }
}

// ---------------------------------------------------------------------------
// Cache keys
// ---------------------------------------------------------------------------

struct CacheKey {
    content_hash: String,
    prompt_hash: String,
}

impl CacheKey {
    fn new(payload: &[u8], prompt: &str) -> Self {
        Self {
            content_hash: sha256_hex(payload),
            prompt_hash: sha256_hex(prompt.as_bytes()),
        }
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use imgdesc_shared::{RetryPolicy, WorkItem};
    use uuid::Uuid;

    type Reply = std::result::Result<String, InferenceError>;

    /// Replies are consumed in order; the last one repeats forever.
    struct ScriptedBackend {
        replies: Mutex<VecDeque<Reply>>,
        calls: AtomicUsize,
        delay: Duration,
    }

    impl ScriptedBackend {
        fn new(replies: Vec<Reply>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
            })
        }

        fn slow(reply: Reply, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(vec![reply].into()),
                calls: AtomicUsize::new(0),
                delay,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl InferenceBackend for ScriptedBackend {
        async fn call(&self, _model: &str, _prompt: &str, _payload: &[u8]) -> Reply {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let mut replies = self.replies.lock().unwrap();
            if replies.len() > 1 {
                replies.pop_front().unwrap()
            } else {
                replies.front().cloned().unwrap()
            }
        }
    }

    fn config(max_attempts: u32) -> InferenceConfig {
        InferenceConfig {
            model: "test/model".into(),
            prompt: "Describe this image.".into(),
            concurrency: 2,
            retry: RetryPolicy::new(max_attempts, Duration::from_millis(1), Duration::from_millis(5)),
            timeout: Duration::from_secs(5),
            cache: true,
        }
    }

    fn ok_fetch(id: i64) -> FetchResult {
        FetchResult::ok(&WorkItem::new(id, format!("https://img.test/{id}")), vec![id as u8; 4])
    }

    fn failed_fetch(id: i64) -> FetchResult {
        FetchResult::failed(
            &WorkItem::new(id, format!("https://img.test/{id}")),
            imgdesc_shared::FetchStatus::HttpError,
        )
    }

    fn rate_limited() -> Reply {
        Err(InferenceError::RateLimited { retry_after: None })
    }

    #[tokio::test]
    async fn fetches_without_content_are_skipped_without_calls() {
        let backend = ScriptedBackend::new(vec![Ok("a red square".into())]);
        let client = InferenceClient::new(config(3), backend.clone());
        let batch = vec![ok_fetch(1), failed_fetch(2), ok_fetch(3)];

        let results = client.infer(&batch, &CancellationToken::new()).await;

        let ids: Vec<i64> = results.iter().map(InferenceResult::id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(results[0].status(), InferenceStatus::Ok);
        assert_eq!(results[1].status(), InferenceStatus::SkippedNoContent);
        assert_eq!(results[1].description(), None);
        assert_eq!(results[2].description(), Some("a red square"));
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test]
    async fn rate_limit_is_retried_until_success() {
        let backend = ScriptedBackend::new(vec![rate_limited(), rate_limited(), Ok("a dog".into())]);
        let client = InferenceClient::new(config(3), backend.clone());

        let result = client.describe(&ok_fetch(7), &CancellationToken::new()).await;

        assert_eq!(result.status(), InferenceStatus::Ok);
        assert_eq!(result.description(), Some("a dog"));
        assert_eq!(backend.calls(), 3);
        assert_eq!(client.stats().rate_limit_retries, 2);
    }

    #[tokio::test]
    async fn persistent_rate_limit_exhausts_attempts() {
        let backend = ScriptedBackend::new(vec![rate_limited()]);
        let client = InferenceClient::new(config(2), backend.clone());

        let result = client.describe(&ok_fetch(1), &CancellationToken::new()).await;

        assert_eq!(result.status(), InferenceStatus::RateLimited);
        assert_eq!(result.description(), None);
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test]
    async fn model_error_is_not_retried() {
        let backend = ScriptedBackend::new(vec![Err(InferenceError::Model("bad payload".into()))]);
        let client = InferenceClient::new(config(5), backend.clone());

        let result = client.describe(&ok_fetch(1), &CancellationToken::new()).await;

        assert_eq!(result.status(), InferenceStatus::ModelError);
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn blank_text_is_a_model_error() {
        let backend = ScriptedBackend::new(vec![Ok("   \n".into())]);
        let client = InferenceClient::new(config(3), backend);

        let result = client.describe(&ok_fetch(1), &CancellationToken::new()).await;

        assert_eq!(result.status(), InferenceStatus::ModelError);
        assert_eq!(result.description(), None);
    }

    #[tokio::test]
    async fn slow_backend_times_out_as_model_error() {
        let backend = ScriptedBackend::slow(Ok("late".into()), Duration::from_millis(500));
        let mut cfg = config(3);
        cfg.timeout = Duration::from_millis(20);
        let client = InferenceClient::new(cfg, backend.clone());

        let result = client.describe(&ok_fetch(1), &CancellationToken::new()).await;

        assert_eq!(result.status(), InferenceStatus::ModelError);
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn cancelled_batch_makes_no_calls() {
        let backend = ScriptedBackend::new(vec![Ok("x".into())]);
        let client = InferenceClient::new(config(3), backend.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let results = client.infer(&[ok_fetch(1), failed_fetch(2)], &cancel).await;

        assert_eq!(results[0].status(), InferenceStatus::Cancelled);
        assert_eq!(results[1].status(), InferenceStatus::SkippedNoContent);
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        struct Gauge {
            current: AtomicUsize,
            peak: AtomicUsize,
        }

        #[async_trait]
        impl InferenceBackend for Gauge {
            async fn call(&self, _: &str, _: &str, _: &[u8]) -> Reply {
                let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                self.current.fetch_sub(1, Ordering::SeqCst);
                Ok("ok".into())
            }
        }

        let gauge = Arc::new(Gauge {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let client = InferenceClient::new(config(1), gauge.clone());
        let batch: Vec<FetchResult> = (1..=8).map(ok_fetch).collect();

        let results = client.infer(&batch, &CancellationToken::new()).await;

        assert_eq!(results.len(), 8);
        assert!(gauge.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn cached_descriptions_skip_the_backend() {
        let path = std::env::temp_dir().join(format!("imgdesc_test_{}.db", Uuid::now_v7()));
        let storage = Arc::new(Storage::open(&path).await.unwrap());

        let first_backend = ScriptedBackend::new(vec![Ok("a lighthouse at dusk".into())]);
        let first = InferenceClient::with_cache(config(3), first_backend.clone(), storage.clone());
        let result = first.describe(&ok_fetch(4), &CancellationToken::new()).await;
        assert_eq!(result.status(), InferenceStatus::Ok);
        assert_eq!(first_backend.calls(), 1);

        let second_backend = ScriptedBackend::new(vec![Ok("something else".into())]);
        let second = InferenceClient::with_cache(config(3), second_backend.clone(), storage);
        let result = second.describe(&ok_fetch(4), &CancellationToken::new()).await;

        assert_eq!(result.description(), Some("a lighthouse at dusk"));
        assert_eq!(second_backend.calls(), 0);
        assert_eq!(second.stats().cache_hits, 1);
    }

    #[tokio::test]
    async fn cache_disabled_in_config_always_calls() {
        let path = std::env::temp_dir().join(format!("imgdesc_test_{}.db", Uuid::now_v7()));
        let storage = Arc::new(Storage::open(&path).await.unwrap());
        let mut cfg = config(3);
        cfg.cache = false;

        let backend = ScriptedBackend::new(vec![Ok("a bridge".into())]);
        let client = InferenceClient::with_cache(cfg, backend.clone(), storage);
        client.describe(&ok_fetch(1), &CancellationToken::new()).await;
        client.describe(&ok_fetch(1), &CancellationToken::new()).await;

        assert_eq!(backend.calls(), 2);
        assert_eq!(client.stats().cache_hits, 0);
    }

    #[test]
    fn summary_counts_every_status() {
        let results = vec![
            InferenceResult::described(1, "u", "x"),
            InferenceResult::skipped(&failed_fetch(2)),
            InferenceResult::failed(3, "u", InferenceStatus::RateLimited),
        ];
        let summary = InferenceSummary::from_results(&results);
        assert_eq!(summary.ok, 1);
        assert_eq!(summary.skipped_no_content, 1);
        assert_eq!(summary.rate_limited, 1);
        assert_eq!(summary.total(), 3);
    }
}

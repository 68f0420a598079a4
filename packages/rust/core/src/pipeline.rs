//! End-to-end run: worklist → fetch → inference → reconcile → commit.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use imgdesc_fetcher::{FetchSummary, Fetcher};
use imgdesc_inference::{InferenceClient, InferenceSummary};
use imgdesc_shared::{
    CodeRecord, DescRecord, FetchResult, FetchStatus, ImgDescError, InferenceResult,
    InferenceStatus, Result, Rows, TableNames, TableWrite, UrlRecord, WorkItem, WorklistConfig,
    WriteMode,
};
use imgdesc_storage::{RunRecord, TableStore, validate_table_names};

use crate::worklist;

// ---------------------------------------------------------------------------
// Run state
// ---------------------------------------------------------------------------

/// Lifecycle of one run. `Committed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunState {
    Generating,
    Fetching,
    Inferring,
    Reconciling,
    Committed,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Generating => "GENERATING",
            Self::Fetching => "FETCHING",
            Self::Inferring => "INFERRING",
            Self::Reconciling => "RECONCILING",
            Self::Committed => "COMMITTED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary of a finished run, emitted whatever the outcome.
#[derive(Debug)]
pub struct PipelineRun {
    /// Run identifier (UUID v7).
    pub id: String,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Number of work items generated, zero if generation failed.
    pub requested: usize,
    pub fetch: FetchSummary,
    pub inference: InferenceSummary,
    pub backend_calls: usize,
    pub cache_hits: usize,
    /// Why the run failed.
    pub error: Option<ImgDescError>,
}

impl PipelineRun {
    fn start() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7().to_string(),
            state: RunState::Generating,
            started_at: now,
            finished_at: now,
            requested: 0,
            fetch: FetchSummary::default(),
            inference: InferenceSummary::default(),
            backend_calls: 0,
            cache_hits: 0,
            error: None,
        }
    }

    pub fn is_committed(&self) -> bool {
        self.state == RunState::Committed
    }

    pub fn elapsed(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }

    /// Per-stage counts as a JSON document.
    pub fn stats_json(&self) -> serde_json::Value {
        serde_json::json!({
            "requested": self.requested,
            "fetch": {
                "OK": self.fetch.ok,
                "TIMEOUT": self.fetch.timeout,
                "HTTP_ERROR": self.fetch.http_error,
                "NETWORK_ERROR": self.fetch.network_error,
                "CANCELLED": self.fetch.cancelled,
            },
            "inference": {
                "OK": self.inference.ok,
                "SKIPPED_NO_CONTENT": self.inference.skipped_no_content,
                "MODEL_ERROR": self.inference.model_error,
                "RATE_LIMITED": self.inference.rate_limited,
                "CANCELLED": self.inference.cancelled,
            },
            "backend_calls": self.backend_calls,
            "cache_hits": self.cache_hits,
        })
    }

    pub fn to_record(&self) -> RunRecord {
        RunRecord {
            id: self.id.clone(),
            state: self.state.as_str().to_string(),
            started_at: self.started_at.to_rfc3339(),
            finished_at: self.finished_at.to_rfc3339(),
            stats_json: self.stats_json().to_string(),
            error: self.error.as_ref().map(|e| e.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Progress callback for reporting run status.
pub trait ProgressReporter: Send + Sync {
    /// Called when the run enters a new state.
    fn phase(&self, state: RunState);
    /// Called once per work item after the fetch stage settles it.
    fn item_fetched(&self, result: &FetchResult, current: usize, total: usize);
    /// Called once per work item after the inference stage settles it.
    fn item_described(&self, result: &InferenceResult, current: usize, total: usize);
    /// Called when the run reaches a terminal state.
    fn done(&self, run: &PipelineRun);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _state: RunState) {}
    fn item_fetched(&self, _result: &FetchResult, _current: usize, _total: usize) {}
    fn item_described(&self, _result: &InferenceResult, _current: usize, _total: usize) {}
    fn done(&self, _run: &PipelineRun) {}
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Owns the components of a run and drives them in order.
pub struct Pipeline {
    worklist: WorklistConfig,
    fetcher: Fetcher,
    inference: InferenceClient,
    store: Arc<dyn TableStore>,
    tables: TableNames,
}

impl Pipeline {
    pub fn new(
        worklist: WorklistConfig,
        fetcher: Fetcher,
        inference: InferenceClient,
        store: Arc<dyn TableStore>,
        tables: TableNames,
    ) -> Self {
        Self {
            worklist,
            fetcher,
            inference,
            store,
            tables,
        }
    }

    /// Execute one run.
    ///
    /// Never returns an error: failures end the run in
    /// [`RunState::Failed`] with the reason on [`PipelineRun::error`]. The
    /// stage tables are only replaced when the run commits.
    #[instrument(skip_all, fields(start = self.worklist.start, end = self.worklist.end))]
    pub async fn run(&self, progress: &dyn ProgressReporter, cancel: &CancellationToken) -> PipelineRun {
        let mut run = PipelineRun::start();
        info!(run_id = %run.id, template = %self.worklist.url_template, "starting run");

        let outcome = self.execute(&mut run, progress, cancel).await;
        run.finished_at = Utc::now();
        match outcome {
            Ok(()) => run.state = RunState::Committed,
            Err(e) => {
                run.state = RunState::Failed;
                run.error = Some(e);
            }
        }
        progress.phase(run.state);

        self.emit(&run).await;
        progress.done(&run);
        run
    }

    /// Walk the non-terminal states.
    ///
    /// Configuration problems surface as [`ImgDescError::Config`] before any
    /// I/O. Zero throughput, cancellation and commit failures are
    /// [`ImgDescError::Run`]; a failed worklist write stays a storage error.
    async fn execute(
        &self,
        run: &mut PipelineRun,
        progress: &dyn ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<()> {
        // --- Generating ---
        progress.phase(RunState::Generating);
        let items = worklist::from_config(&self.worklist)?;
        validate_table_names(&self.tables)?;
        run.requested = items.len();

        let urls = Rows::Urls(items.iter().map(UrlRecord::from).collect());
        self.store
            .write(&self.tables.urls, urls, WriteMode::Append)
            .await?;

        // --- Fetching ---
        run.state = RunState::Fetching;
        progress.phase(RunState::Fetching);
        let total = items.len();
        let mut fetched = 0;
        let fetches = self
            .fetcher
            .fetch_all_with_progress(&items, cancel, |result| {
                fetched += 1;
                progress.item_fetched(result, fetched, total);
            })
            .await;
        run.fetch = FetchSummary::from_results(&fetches);

        if cancel.is_cancelled() {
            return Err(ImgDescError::Run("run cancelled during fetch".into()));
        }
        if run.fetch.ok == 0 {
            return Err(ImgDescError::Run("no resource was fetched successfully".into()));
        }

        // --- Inferring ---
        run.state = RunState::Inferring;
        progress.phase(RunState::Inferring);
        let mut described = 0;
        let before = self.inference.stats();
        let inferences = self
            .inference
            .infer_with_progress(&fetches, cancel, |result| {
                described += 1;
                progress.item_described(result, described, total);
            })
            .await;
        let after = self.inference.stats();
        run.inference = InferenceSummary::from_results(&inferences);
        run.backend_calls = after.backend_calls - before.backend_calls;
        run.cache_hits = after.cache_hits - before.cache_hits;

        if cancel.is_cancelled() {
            return Err(ImgDescError::Run("run cancelled during inference".into()));
        }

        // --- Reconciling ---
        run.state = RunState::Reconciling;
        progress.phase(RunState::Reconciling);
        let reconciled = reconcile(&items, fetches, inferences);

        self.store
            .commit(vec![
                TableWrite {
                    table: self.tables.codes.clone(),
                    rows: Rows::Codes(reconciled.codes),
                    mode: WriteMode::Overwrite,
                },
                TableWrite {
                    table: self.tables.descriptions.clone(),
                    rows: Rows::Descriptions(reconciled.descriptions),
                    mode: WriteMode::Overwrite,
                },
            ])
            .await
            .map_err(|e| ImgDescError::Run(format!("failed to commit results: {e}")))
    }

    /// Log the run summary and persist it best-effort.
    async fn emit(&self, run: &PipelineRun) {
        let elapsed_ms = run.elapsed().num_milliseconds();
        match &run.error {
            None => info!(
                run_id = %run.id,
                state = %run.state,
                requested = run.requested,
                fetched = run.fetch.ok,
                described = run.inference.ok,
                backend_calls = run.backend_calls,
                cache_hits = run.cache_hits,
                elapsed_ms,
                "run finished"
            ),
            Some(e) => error!(
                run_id = %run.id,
                state = %run.state,
                requested = run.requested,
                fetched = run.fetch.ok,
                error = %e,
                elapsed_ms,
                "run failed"
            ),
        }

        if let Err(e) = self.store.record_run(&run.to_record()).await {
            warn!(run_id = %run.id, error = %e, "failed to record run history");
        }
    }
}

// ---------------------------------------------------------------------------
// Reconciliation
// ---------------------------------------------------------------------------

/// Final rows for one run, one per work item, sorted by id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciled {
    pub codes: Vec<CodeRecord>,
    pub descriptions: Vec<DescRecord>,
}

/// Merge stage results into one row per work item.
///
/// Output order follows item id, not completion order. An item missing from
/// a stage's results is reported as `CANCELLED` (or `SKIPPED_NO_CONTENT` for
/// inference when it has no content).
pub fn reconcile(
    items: &[WorkItem],
    fetches: Vec<FetchResult>,
    inferences: Vec<InferenceResult>,
) -> Reconciled {
    let mut fetches: HashMap<i64, FetchResult> = fetches.into_iter().map(|f| (f.id(), f)).collect();
    let mut inferences: HashMap<i64, InferenceResult> =
        inferences.into_iter().map(|r| (r.id(), r)).collect();

    let mut ordered: Vec<&WorkItem> = items.iter().collect();
    ordered.sort_by_key(|item| item.id);

    let mut codes = Vec::with_capacity(ordered.len());
    let mut descriptions = Vec::with_capacity(ordered.len());
    for item in ordered {
        let fetch = fetches
            .remove(&item.id)
            .unwrap_or_else(|| FetchResult::failed(item, FetchStatus::Cancelled));
        let inference = inferences.remove(&item.id).unwrap_or_else(|| {
            if fetch.has_content() {
                InferenceResult::failed(item.id, item.url.as_str(), InferenceStatus::Cancelled)
            } else {
                InferenceResult::skipped(&fetch)
            }
        });

        codes.push(CodeRecord::from(&fetch));
        descriptions.push(DescRecord::from(&inference));
    }

    Reconciled { codes, descriptions }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use imgdesc_fetcher::{Transport, TransportError};
    use imgdesc_inference::{InferenceBackend, InferenceError};
    use imgdesc_shared::{FetchConfig, InferenceConfig, RetryPolicy};
    use imgdesc_storage::MemoryStore;

    /// Serves bodies keyed by URL; unknown URLs answer 404.
    struct FakeTransport {
        bodies: HashMap<String, Vec<u8>>,
        calls: AtomicUsize,
    }

    impl FakeTransport {
        fn new(bodies: &[(&str, &[u8])]) -> Arc<Self> {
            Arc::new(Self {
                bodies: bodies
                    .iter()
                    .map(|(url, body)| (url.to_string(), body.to_vec()))
                    .collect(),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn get(&self, url: &str) -> std::result::Result<Vec<u8>, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.bodies.get(url).cloned().ok_or(TransportError::Status(404))
        }
    }

    /// Describes a payload by looking its bytes up.
    struct FakeBackend {
        answers: HashMap<Vec<u8>, String>,
        calls: AtomicUsize,
    }

    impl FakeBackend {
        fn new(answers: &[(&[u8], &str)]) -> Arc<Self> {
            Arc::new(Self {
                answers: answers
                    .iter()
                    .map(|(payload, text)| (payload.to_vec(), text.to_string()))
                    .collect(),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl InferenceBackend for FakeBackend {
        async fn call(
            &self,
            _model: &str,
            _prompt: &str,
            payload: &[u8],
        ) -> std::result::Result<String, InferenceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answers
                .get(payload)
                .cloned()
                .ok_or_else(|| InferenceError::Model("unknown payload".into()))
        }
    }

    /// Records phases so tests can assert the state sequence.
    #[derive(Default)]
    struct RecordingProgress {
        phases: Mutex<Vec<RunState>>,
        fetched: AtomicUsize,
        described: AtomicUsize,
    }

    impl ProgressReporter for RecordingProgress {
        fn phase(&self, state: RunState) {
            self.phases.lock().unwrap().push(state);
        }
        fn item_fetched(&self, _result: &FetchResult, _current: usize, _total: usize) {
            self.fetched.fetch_add(1, Ordering::SeqCst);
        }
        fn item_described(&self, _result: &InferenceResult, _current: usize, _total: usize) {
            self.described.fetch_add(1, Ordering::SeqCst);
        }
        fn done(&self, _run: &PipelineRun) {}
    }

    fn worklist(start: i64, end: i64) -> WorklistConfig {
        WorklistConfig {
            start,
            end,
            url_template: "https://x/{id}".into(),
        }
    }

    fn fetch_config() -> FetchConfig {
        FetchConfig {
            timeout: Duration::from_secs(1),
            concurrency: 4,
            retry: RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(2)),
        }
    }

    fn inference_config() -> InferenceConfig {
        InferenceConfig {
            model: "test/model".into(),
            prompt: "Describe this image.".into(),
            concurrency: 2,
            retry: RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(2)),
            timeout: Duration::from_secs(1),
            cache: false,
        }
    }

    fn pipeline(
        worklist: WorklistConfig,
        transport: Arc<FakeTransport>,
        backend: Arc<FakeBackend>,
        store: Arc<dyn TableStore>,
    ) -> Pipeline {
        pipeline_with_tables(worklist, transport, backend, store, TableNames::default())
    }

    fn pipeline_with_tables(
        worklist: WorklistConfig,
        transport: Arc<FakeTransport>,
        backend: Arc<FakeBackend>,
        store: Arc<dyn TableStore>,
        tables: TableNames,
    ) -> Pipeline {
        Pipeline::new(
            worklist,
            Fetcher::with_transport(fetch_config(), transport),
            InferenceClient::new(inference_config(), backend),
            store,
            tables,
        )
    }

    fn cat_and_dog() -> (Arc<FakeTransport>, Arc<FakeBackend>) {
        let transport = FakeTransport::new(&[("https://x/1", &b"cat-bytes"[..]), ("https://x/2", &b"dog-bytes"[..])]);
        let backend = FakeBackend::new(&[(&b"cat-bytes"[..], "a cat"), (&b"dog-bytes"[..], "a dog")]);
        (transport, backend)
    }

    fn descriptions(rows: Option<Rows>) -> Vec<DescRecord> {
        match rows {
            Some(Rows::Descriptions(rows)) => rows,
            other => panic!("expected description rows, got {other:?}"),
        }
    }

    fn codes(rows: Option<Rows>) -> Vec<CodeRecord> {
        match rows {
            Some(Rows::Codes(rows)) => rows,
            other => panic!("expected code rows, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn three_items_one_missing() {
        let (transport, backend) = cat_and_dog();
        let store = Arc::new(MemoryStore::new());
        let progress = RecordingProgress::default();

        let run = pipeline(worklist(1, 3), transport, backend.clone(), store.clone())
            .run(&progress, &CancellationToken::new())
            .await;

        assert_eq!(run.state, RunState::Committed, "error: {:?}", run.error);
        assert_eq!(run.requested, 3);
        assert_eq!(run.fetch.ok, 2);
        assert_eq!(run.fetch.http_error, 1);
        assert_eq!(run.inference.ok, 2);
        assert_eq!(run.inference.skipped_no_content, 1);
        assert_eq!(run.backend_calls, 2);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);

        let desc = descriptions(store.rows("image_desc").await);
        let summary: Vec<(i64, &str, Option<&str>)> = desc
            .iter()
            .map(|d| (d.id, d.status.as_str(), d.description.as_deref()))
            .collect();
        assert_eq!(
            summary,
            vec![
                (1, "OK", Some("a cat")),
                (2, "OK", Some("a dog")),
                (3, "SKIPPED_NO_CONTENT", None),
            ]
        );

        let codes = codes(store.rows("image_codes").await);
        assert_eq!(codes[0].content.as_deref(), Some(&b"cat-bytes"[..]));
        assert_eq!(codes[2].content, None);
        assert_eq!(codes[2].fetch_status, "HTTP_ERROR");

        assert_eq!(
            *progress.phases.lock().unwrap(),
            vec![
                RunState::Generating,
                RunState::Fetching,
                RunState::Inferring,
                RunState::Reconciling,
                RunState::Committed,
            ]
        );
        assert_eq!(progress.fetched.load(Ordering::SeqCst), 3);
        assert_eq!(progress.described.load(Ordering::SeqCst), 3);

        let runs = store.runs().await;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].state, "COMMITTED");
        let stats: serde_json::Value = serde_json::from_str(&runs[0].stats_json).unwrap();
        assert_eq!(stats["fetch"]["HTTP_ERROR"], 1);
        assert_eq!(stats["inference"]["SKIPPED_NO_CONTENT"], 1);
    }

    #[tokio::test]
    async fn repeated_runs_produce_identical_tables() {
        let store = Arc::new(MemoryStore::new());

        let mut snapshots = Vec::new();
        for _ in 0..2 {
            let (transport, backend) = cat_and_dog();
            let run = pipeline(worklist(1, 3), transport, backend, store.clone())
                .run(&SilentProgress, &CancellationToken::new())
                .await;
            assert!(run.is_committed());
            snapshots.push((
                store.rows("image_codes").await,
                store.rows("image_desc").await,
            ));
        }

        assert_eq!(snapshots[0], snapshots[1]);
        // The worklist table accumulates across runs.
        assert_eq!(store.rows("image_urls").await.map(|r| r.len()), Some(6));
    }

    #[tokio::test]
    async fn no_successful_fetch_fails_without_stage_writes() {
        let transport = FakeTransport::new(&[]);
        let backend = FakeBackend::new(&[]);
        let store = Arc::new(MemoryStore::new());

        let run = pipeline(worklist(1, 4), transport, backend.clone(), store.clone())
            .run(&SilentProgress, &CancellationToken::new())
            .await;

        assert_eq!(run.state, RunState::Failed);
        assert_eq!(run.fetch.http_error, 4);
        let err = run.error.unwrap();
        assert!(matches!(err, ImgDescError::Run(ref reason) if reason.contains("no resource")), "got {err:?}");
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
        assert!(store.rows("image_codes").await.is_none());
        assert!(store.rows("image_desc").await.is_none());
        assert_eq!(store.runs().await[0].state, "FAILED");
    }

    #[tokio::test]
    async fn failed_run_keeps_previous_tables() {
        let store = Arc::new(MemoryStore::new());
        let (transport, backend) = cat_and_dog();
        pipeline(worklist(1, 3), transport, backend, store.clone())
            .run(&SilentProgress, &CancellationToken::new())
            .await;
        let before = store.rows("image_desc").await;

        let run = pipeline(worklist(1, 3), FakeTransport::new(&[]), FakeBackend::new(&[]), store.clone())
            .run(&SilentProgress, &CancellationToken::new())
            .await;

        assert_eq!(run.state, RunState::Failed);
        assert_eq!(store.rows("image_desc").await, before);
    }

    #[tokio::test]
    async fn commit_failure_fails_the_run_atomically() {
        let (transport, backend) = cat_and_dog();
        let store = Arc::new(MemoryStore::failing_on("image_desc"));

        let run = pipeline(worklist(1, 3), transport, backend, store.clone())
            .run(&SilentProgress, &CancellationToken::new())
            .await;

        assert_eq!(run.state, RunState::Failed);
        let err = run.error.unwrap();
        assert!(matches!(err, ImgDescError::Run(ref reason) if reason.contains("commit")), "got {err:?}");
        assert!(store.rows("image_codes").await.is_none());
        assert!(store.rows("image_desc").await.is_none());
        assert_eq!(store.runs().await.len(), 1);
    }

    #[tokio::test]
    async fn config_error_fails_before_any_io() {
        let (transport, backend) = cat_and_dog();
        let store = Arc::new(MemoryStore::new());
        let progress = RecordingProgress::default();

        let run = pipeline(worklist(5, 1), transport.clone(), backend, store.clone())
            .run(&progress, &CancellationToken::new())
            .await;

        assert_eq!(run.state, RunState::Failed);
        assert!(run.error.as_ref().unwrap().is_config());
        assert_eq!(run.requested, 0);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
        assert!(store.write_log().await.is_empty());
        assert_eq!(
            *progress.phases.lock().unwrap(),
            vec![RunState::Generating, RunState::Failed]
        );
        assert!(store.runs().await[0].error.as_deref().unwrap().starts_with("config error"));
    }

    #[tokio::test]
    async fn invalid_table_name_fails_before_any_io() {
        let (transport, backend) = cat_and_dog();
        let store = Arc::new(MemoryStore::new());
        let progress = RecordingProgress::default();
        let tables = TableNames {
            codes: "image codes".into(),
            ..TableNames::default()
        };

        let run = pipeline_with_tables(worklist(1, 3), transport.clone(), backend.clone(), store.clone(), tables)
            .run(&progress, &CancellationToken::new())
            .await;

        assert_eq!(run.state, RunState::Failed);
        assert!(run.error.as_ref().unwrap().is_config(), "got {:?}", run.error);
        assert_eq!(run.requested, 0);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
        assert!(store.write_log().await.is_empty());
        assert_eq!(
            *progress.phases.lock().unwrap(),
            vec![RunState::Generating, RunState::Failed]
        );
    }

    #[tokio::test]
    async fn cancelled_before_fetch_marks_items_cancelled() {
        let (transport, backend) = cat_and_dog();
        let store = Arc::new(MemoryStore::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let run = pipeline(worklist(1, 3), transport.clone(), backend, store.clone())
            .run(&SilentProgress, &cancel)
            .await;

        assert_eq!(run.state, RunState::Failed);
        assert!(matches!(run.error, Some(ImgDescError::Run(_))));
        assert_eq!(run.fetch.cancelled, 3);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
        assert!(store.rows("image_desc").await.is_none());
    }

    #[tokio::test]
    async fn run_history_failure_does_not_change_outcome() {
        struct NoHistory(MemoryStore);

        #[async_trait]
        impl TableStore for NoHistory {
            async fn write(&self, table: &str, rows: Rows, mode: WriteMode) -> imgdesc_shared::Result<()> {
                self.0.write(table, rows, mode).await
            }
            async fn commit(&self, writes: Vec<TableWrite>) -> imgdesc_shared::Result<()> {
                self.0.commit(writes).await
            }
            async fn record_run(&self, _run: &RunRecord) -> imgdesc_shared::Result<()> {
                Err(ImgDescError::Storage("history table is read-only".into()))
            }
        }

        let (transport, backend) = cat_and_dog();
        let run = pipeline(worklist(1, 2), transport, backend, Arc::new(NoHistory(MemoryStore::new())))
            .run(&SilentProgress, &CancellationToken::new())
            .await;

        assert!(run.is_committed());
    }

    #[test]
    fn reconcile_sorts_by_id_and_fills_gaps() {
        let items = vec![
            WorkItem::new(3, "https://x/3"),
            WorkItem::new(1, "https://x/1"),
            WorkItem::new(2, "https://x/2"),
        ];
        let fetches = vec![
            FetchResult::ok(&items[0], b"three".to_vec()),
            FetchResult::failed(&items[1], FetchStatus::Timeout),
        ];
        let inferences = vec![InferenceResult::described(3, "https://x/3", "three")];

        let reconciled = reconcile(&items, fetches, inferences);

        let ids: Vec<i64> = reconciled.descriptions.iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(reconciled.codes[0].fetch_status, "TIMEOUT");
        assert_eq!(reconciled.codes[1].fetch_status, "CANCELLED");
        assert_eq!(reconciled.descriptions[0].status, "SKIPPED_NO_CONTENT");
        assert_eq!(reconciled.descriptions[1].status, "SKIPPED_NO_CONTENT");
        assert_eq!(reconciled.descriptions[2].description.as_deref(), Some("three"));
    }

    #[test]
    fn run_state_names() {
        assert_eq!(RunState::Reconciling.to_string(), "RECONCILING");
    }
}

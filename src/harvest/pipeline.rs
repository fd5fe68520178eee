//! Two-phase harvest orchestrator.
//!
//! This module provides the [`HarvestPipeline`] coordinator that runs:
//! 1. **Search**: every query against the [`ImageProvider`], one after the
//!    other, collecting candidates
//! 2. **Download**: every candidate through Fetcher → Content Gate → image
//!    store on a bounded worker pool, with one manifest row per candidate
//!
//! Per-candidate failures never escape the download phase; they become skip
//! rows. Only run-level I/O failures surface as [`PipelineError`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument};

use crate::config::HarvestConfig;
use crate::executor::{Completed, HarvesterExecutor};
use crate::harvest::gate::ContentGate;
use crate::harvest::manifest::{read_manifest, store_image, ManifestWriter};
use crate::harvest::traits::{ConfigError, PipelineError};
use crate::model::{CandidateRecord, DownloadOutcome, ManifestRow, OutcomeStatus};
use crate::traits::{Fetcher, ImageProvider};

/// Completions between two progress log lines.
pub const PROGRESS_EVERY: usize = 25;

// ============================================================================
// Pipeline Types
// ============================================================================

/// Statistics about one harvest run.
#[derive(Debug, Default, Clone)]
pub struct HarvestStats {
    /// Candidates that entered the download phase
    pub candidates: usize,

    /// Rows with status `ok`
    pub accepted: usize,

    /// Rows with status `skip`
    pub skipped: usize,

    /// Skip counts keyed by reason code (e.g., "dup_url", "http_404")
    pub by_reason: BTreeMap<String, usize>,

    /// Time spent on the search phase (milliseconds)
    pub search_duration_ms: u64,

    /// Time spent on the download phase (milliseconds)
    pub download_duration_ms: u64,

    /// Total time spent on the run (milliseconds)
    pub total_duration_ms: u64,
}

impl HarvestStats {
    fn record(&mut self, row: &ManifestRow) {
        match row.status {
            OutcomeStatus::Ok => self.accepted += 1,
            OutcomeStatus::Skip => {
                self.skipped += 1;
                let reason = row.reason.clone().unwrap_or_default();
                *self.by_reason.entry(reason).or_default() += 1;
            }
        }
    }

    /// Rows written so far.
    pub fn rows(&self) -> usize {
        self.accepted + self.skipped
    }
}

/// Complete harvest result.
#[derive(Debug)]
pub struct HarvestResult {
    pub stats: HarvestStats,

    /// Tabular manifest written by this run
    pub csv_path: PathBuf,

    /// Line-oriented manifest written by this run
    pub jsonl_path: PathBuf,
}

// ============================================================================
// Per-candidate pipeline
// ============================================================================

/// Runs one candidate from discovery to a terminal outcome.
///
/// `Discovered → Fetching → {FetchFailed | Fetched}`, and a fetched
/// candidate ends as duplicate, too small, write error or accepted.
pub async fn process_candidate<F>(
    gate: &ContentGate,
    fetcher: &F,
    out_dir: &Path,
    candidate: &CandidateRecord,
) -> DownloadOutcome
where
    F: Fetcher + ?Sized,
{
    let url = match gate.claim(candidate) {
        Ok(url) => url,
        Err(skip) => return skip,
    };

    let response = fetcher.fetch(url).await;

    match gate.admit(response) {
        Ok(admitted) => store_image(out_dir, candidate, admitted).await,
        Err(skip) => skip,
    }
}

// ============================================================================
// Pipeline Executor
// ============================================================================

/// Harvest run over a provider and a fetcher.
///
/// # Example
///
/// ```ignore
/// let provider = FlickrProvider::new(api_key)?;
/// let fetcher = HttpFetcher::new(config.per_host)?;
/// let result = HarvestPipeline::new(provider, fetcher, config).execute().await?;
/// println!("{} accepted", result.stats.accepted);
/// ```
pub struct HarvestPipeline<P, F>
where
    P: ImageProvider,
    F: Fetcher,
{
    provider: P,
    fetcher: Arc<F>,
    config: HarvestConfig,
}

impl<P, F> HarvestPipeline<P, F>
where
    P: ImageProvider,
    F: Fetcher + 'static,
{
    pub fn new(provider: P, fetcher: F, config: HarvestConfig) -> Self {
        Self {
            provider,
            fetcher: Arc::new(fetcher),
            config,
        }
    }

    pub fn config(&self) -> &HarvestConfig {
        &self.config
    }

    /// Runs both phases and returns the run statistics.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] before searching if the settings
    /// are invalid or the existing manifest holds a label outside the two
    /// classes. Returns other [`PipelineError`]s if the output directory or
    /// the manifest cannot be created or appended, or if download workers die.
    #[instrument(skip(self), fields(label = %self.config.label))]
    pub async fn execute(&self) -> Result<HarvestResult, PipelineError> {
        let start = Instant::now();
        let mut stats = HarvestStats::default();

        self.config.validate()?;
        self.check_existing_labels()?;

        info!("Starting search phase");
        let search_start = Instant::now();
        let candidates = self.search_phase().await;
        stats.search_duration_ms = search_start.elapsed().as_millis() as u64;
        stats.candidates = candidates.len();
        info!(
            duration_ms = stats.search_duration_ms,
            candidates = stats.candidates,
            "Search phase completed"
        );

        info!("Starting download phase");
        let download_start = Instant::now();
        self.download_phase(candidates, &mut stats).await?;
        stats.download_duration_ms = download_start.elapsed().as_millis() as u64;
        stats.total_duration_ms = start.elapsed().as_millis() as u64;

        info!(
            duration_ms = stats.download_duration_ms,
            accepted = stats.accepted,
            skipped = stats.skipped,
            reasons = ?stats.by_reason,
            "Download phase completed"
        );

        Ok(HarvestResult {
            stats,
            csv_path: self.config.csv_path(),
            jsonl_path: self.config.jsonl_path(),
        })
    }

    /// Refuses to append to a manifest whose rows carry a third label.
    fn check_existing_labels(&self) -> Result<(), PipelineError> {
        let path = self.config.jsonl_path();
        if !path.exists() {
            return Ok(());
        }
        let rows = read_manifest(&path)?;
        if let Some(row) = rows.iter().find(|r| !self.config.is_class(&r.label)) {
            return Err(ConfigError::Invalid(format!(
                "manifest '{}' already holds label '{}', outside the classes {:?}",
                path.display(),
                row.label,
                self.config.classes
            ))
            .into());
        }
        Ok(())
    }

    /// Queries the provider sequentially, pausing between queries.
    pub async fn search_phase(&self) -> Vec<CandidateRecord> {
        let mut all = Vec::new();
        for (i, query) in self.config.search_queries().enumerate() {
            if i > 0 && !self.config.query_pause.is_zero() {
                tokio::time::sleep(self.config.query_pause).await;
            }
            let found = self
                .provider
                .search(query, self.config.limit, self.config.license)
                .await;
            info!(
                query,
                provider = self.provider.provider_id(),
                found = found.len(),
                "Query processed"
            );
            all.extend(found);
        }
        all
    }

    /// Pushes every candidate through the bounded worker pool and persists
    /// one manifest row per completion.
    pub async fn download_phase(
        &self,
        candidates: Vec<CandidateRecord>,
        stats: &mut HarvestStats,
    ) -> Result<(), PipelineError> {
        let out_dir = self.config.out_dir.clone();
        tokio::fs::create_dir_all(&out_dir)
            .await
            .map_err(|source| PipelineError::OutputDir {
                path: out_dir.clone(),
                source,
            })?;

        let mut writer = ManifestWriter::open(
            &self.config.csv_path(),
            &self.config.jsonl_path(),
            self.config.label.trim(),
        )
        .await?;

        let total = candidates.len();
        let gate = Arc::new(ContentGate::new(self.config.min_width, self.config.min_height));
        let fetcher = Arc::clone(&self.fetcher);
        let out_dir = Arc::new(out_dir);

        let executor = HarvesterExecutor::new(self.config.concurrency);
        let mut submission = executor.submit(candidates, move |_ticket, candidate| {
            let gate = Arc::clone(&gate);
            let fetcher = Arc::clone(&fetcher);
            let out_dir = Arc::clone(&out_dir);
            async move {
                let outcome =
                    process_candidate(gate.as_ref(), fetcher.as_ref(), &out_dir, &candidate).await;
                (candidate, outcome)
            }
        });

        while let Some(Completed {
            ticket,
            output: (candidate, outcome),
        }) = submission.next().await
        {
            let row = writer.persist(&candidate, &outcome).await?;
            debug!(
                ticket,
                id = %row.id,
                status = row.status.as_str(),
                reason = row.reason.as_deref().unwrap_or(""),
                "Candidate finished"
            );
            stats.record(&row);

            let done = stats.rows();
            if done % PROGRESS_EVERY == 0 || done == total {
                info!(done, total, accepted = stats.accepted, "Download progress");
            }
        }

        let aborted = submission.finish().await;
        if aborted > 0 {
            return Err(PipelineError::WorkersAborted(aborted));
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harvest::gate::tests::png;
    use crate::harvest::manifest::derive_id;
    use crate::traits::{FetchResponse, LicenseFilter};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    // Mock provider returning canned candidates per query
    #[derive(Default)]
    struct MockProvider {
        results: HashMap<String, Vec<CandidateRecord>>,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ImageProvider for MockProvider {
        fn provider_id(&self) -> &str {
            "mock"
        }

        async fn search(&self, query: &str, limit: usize, _license: LicenseFilter) -> Vec<CandidateRecord> {
            self.calls.lock().unwrap().push(query.to_string());
            let mut found = self.results.get(query).cloned().unwrap_or_default();
            found.truncate(limit);
            found
        }
    }

    // Mock fetcher serving canned responses; unknown URLs are 404
    #[derive(Default)]
    struct MockFetcher {
        responses: HashMap<String, FetchResponse>,
        hits: Mutex<HashMap<String, usize>>,
    }

    impl MockFetcher {
        fn serve(mut self, url: &str, response: FetchResponse) -> Self {
            self.responses.insert(url.to_string(), response);
            self
        }
    }

    #[async_trait]
    impl Fetcher for MockFetcher {
        async fn fetch(&self, url: &str) -> FetchResponse {
            *self.hits.lock().unwrap().entry(url.to_string()).or_default() += 1;
            // Vary latency so completions arrive out of submission order.
            tokio::time::sleep(Duration::from_millis((url.len() % 5) as u64)).await;
            self.responses
                .get(url)
                .cloned()
                .unwrap_or_else(|| FetchResponse::failed(404))
        }
    }

    fn candidate(url: &str, query: &str) -> CandidateRecord {
        CandidateRecord {
            source_url: url.to_string(),
            page_url: format!("https://www.flickr.com/photos/x/{}", url.len()),
            license: Some("CC BY 2.0".to_string()),
            width: Some(1024),
            height: Some(768),
            query: query.to_string(),
            provider: "mock".to_string(),
        }
    }

    fn config(dir: &Path, queries: &[&str]) -> HarvestConfig {
        HarvestConfig {
            queries: queries.iter().map(|q| q.to_string()).collect(),
            out_dir: dir.to_path_buf(),
            label: "smiski".to_string(),
            min_width: 256,
            min_height: 256,
            concurrency: 4,
            query_pause: Duration::ZERO,
            ..HarvestConfig::default()
        }
    }

    fn provider(query: &str, candidates: Vec<CandidateRecord>) -> MockProvider {
        let mut p = MockProvider::default();
        p.results.insert(query.to_string(), candidates);
        p
    }

    fn reason_count(rows: &[ManifestRow], reason: &str) -> usize {
        rows.iter().filter(|r| r.reason.as_deref() == Some(reason)).count()
    }

    fn image_files(dir: &Path) -> Vec<PathBuf> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| {
                !matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("csv") | Some("jsonl")
                )
            })
            .collect()
    }

    /// Invariants every run must satisfy.
    fn assert_manifest_consistent(result: &HarvestResult, expected_rows: usize) -> Vec<ManifestRow> {
        let rows = read_manifest(&result.jsonl_path).unwrap();
        assert_eq!(rows.len(), expected_rows);
        assert_eq!(result.stats.rows(), expected_rows);

        let csv = std::fs::read_to_string(&result.csv_path).unwrap();
        let csv_rows = csv.split("\r\n").filter(|l| !l.is_empty()).count() - 1;
        assert_eq!(csv_rows, expected_rows);

        for row in rows.iter().filter(|r| r.status == OutcomeStatus::Ok) {
            let path = PathBuf::from(row.filepath.as_ref().unwrap());
            assert!(std::fs::metadata(&path).unwrap().len() > 0);
            assert_eq!(row.label, "smiski");
        }
        rows
    }

    #[tokio::test]
    async fn test_duplicate_source_url() {
        let dir = tempfile::tempdir().unwrap();
        let url = "https://img.example/a.png";
        let pipeline = HarvestPipeline::new(
            provider("smiski", vec![candidate(url, "smiski"), candidate(url, "smiski")]),
            MockFetcher::default().serve(url, FetchResponse::ok(png(300, 300, 1), None)),
            config(dir.path(), &["smiski"]),
        );

        let result = pipeline.execute().await.unwrap();
        let rows = assert_manifest_consistent(&result, 2);
        assert_eq!(rows.iter().filter(|r| r.status == OutcomeStatus::Ok).count(), 1);
        assert_eq!(reason_count(&rows, "dup_url"), 1);
        assert_eq!(image_files(dir.path()).len(), 1);
        assert_eq!(pipeline.fetcher.hits.lock().unwrap()[url], 1);
    }

    #[tokio::test]
    async fn test_http_404_writes_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = HarvestPipeline::new(
            provider("smiski", vec![candidate("https://img.example/gone.jpg", "smiski")]),
            MockFetcher::default(),
            config(dir.path(), &["smiski"]),
        );

        let result = pipeline.execute().await.unwrap();
        let rows = assert_manifest_consistent(&result, 1);
        assert_eq!(rows[0].status, OutcomeStatus::Skip);
        assert_eq!(rows[0].reason.as_deref(), Some("http_404"));
        assert!(rows[0].filepath.is_none());
        assert!(image_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_undersized_image_is_too_small() {
        let dir = tempfile::tempdir().unwrap();
        let url = "https://img.example/tiny.png";
        let pipeline = HarvestPipeline::new(
            provider("smiski", vec![candidate(url, "smiski")]),
            MockFetcher::default().serve(url, FetchResponse::ok(png(50, 50, 2), None)),
            config(dir.path(), &["smiski"]),
        );

        let result = pipeline.execute().await.unwrap();
        let rows = assert_manifest_consistent(&result, 1);
        assert_eq!(rows[0].reason.as_deref(), Some("too_small"));
        assert_eq!((rows[0].width, rows[0].height), (Some(50), Some(50)));
        assert!(rows[0].sha256.is_some());
        assert!(image_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_identical_bytes_accepted_once() {
        let dir = tempfile::tempdir().unwrap();
        let bytes = png(400, 300, 9);
        let pipeline = HarvestPipeline::new(
            provider(
                "smiski",
                vec![
                    candidate("https://a.example/1.png", "smiski"),
                    candidate("https://b.example/2.png", "smiski"),
                ],
            ),
            MockFetcher::default()
                .serve("https://a.example/1.png", FetchResponse::ok(bytes.clone(), None))
                .serve("https://b.example/2.png", FetchResponse::ok(bytes, None)),
            config(dir.path(), &["smiski"]),
        );

        let result = pipeline.execute().await.unwrap();
        let rows = assert_manifest_consistent(&result, 2);
        assert_eq!(result.stats.accepted, 1);
        assert_eq!(reason_count(&rows, "dup_hash"), 1);
        assert_eq!(rows[0].sha256, rows[1].sha256);
        assert_eq!(image_files(dir.path()).len(), 1);
    }

    #[tokio::test]
    async fn test_mixed_outcomes_and_fail_open() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = HarvestPipeline::new(
            provider(
                "smiski",
                vec![
                    candidate("", "smiski"),
                    candidate("https://x.example/opaque", "smiski"),
                    candidate("https://x.example/down.jpg", "smiski"),
                    candidate("https://x.example/big.png", "smiski"),
                ],
            ),
            MockFetcher::default()
                .serve(
                    "https://x.example/opaque",
                    FetchResponse::ok(b"not an image".to_vec(), Some("image/webp".into())),
                )
                .serve("https://x.example/down.jpg", FetchResponse::failed(-1))
                .serve(
                    "https://x.example/big.png",
                    FetchResponse::ok(png(512, 512, 4), Some("image/png".into())),
                ),
            config(dir.path(), &["smiski"]),
        );

        let result = pipeline.execute().await.unwrap();
        let rows = assert_manifest_consistent(&result, 4);
        assert_eq!(result.stats.accepted, 2);
        assert_eq!(result.stats.by_reason.get("no_url"), Some(&1));
        assert_eq!(result.stats.by_reason.get("http_-1"), Some(&1));

        let opaque = rows
            .iter()
            .find(|r| r.source_url == "https://x.example/opaque")
            .unwrap();
        assert_eq!(opaque.status, OutcomeStatus::Ok);
        assert!(opaque.filepath.as_ref().unwrap().ends_with(".webp"));
        // Hints survive when the bytes could not be measured.
        assert_eq!(opaque.width, Some(1024));

        let no_url = rows.iter().find(|r| r.source_url.is_empty()).unwrap();
        assert!(no_url.id.starts_with("ts-"));
    }

    #[tokio::test]
    async fn test_queries_run_in_order_and_accumulate() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = provider("first", vec![candidate("https://a.example/1.png", "first")]);
        p.results.insert(
            "second".to_string(),
            vec![
                candidate("https://a.example/2.png", "second"),
                candidate("https://a.example/3.png", "second"),
            ],
        );
        let pipeline = HarvestPipeline::new(p, MockFetcher::default(), config(dir.path(), &["first", "", "second"]));

        let result = pipeline.execute().await.unwrap();
        assert_eq!(result.stats.candidates, 3);
        assert_eq!(*pipeline.provider.calls.lock().unwrap(), vec!["first", "second"]);

        let rows = assert_manifest_consistent(&result, 3);
        assert_eq!(rows.iter().filter(|r| r.query == "second").count(), 2);
    }

    #[tokio::test]
    async fn test_empty_search_still_creates_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("nested/out");
        let pipeline = HarvestPipeline::new(
            MockProvider::default(),
            MockFetcher::default(),
            config(&out, &["nothing"]),
        );
        let result = pipeline.execute().await.unwrap();
        assert_eq!(result.stats.candidates, 0);
        assert!(result.csv_path.exists());
        assert_manifest_consistent(&result, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_many_candidates_under_contention() {
        let dir = tempfile::tempdir().unwrap();
        let mut fetcher = MockFetcher::default();
        let mut candidates = Vec::new();
        for i in 0..60u32 {
            let url = format!("https://h.example/{}.png", i % 20);
            // Twenty distinct URLs, ten distinct payloads.
            fetcher = fetcher.serve(&url, FetchResponse::ok(png(300, 300, (i % 10) as u8), None));
            candidates.push(candidate(&url, "smiski"));
        }
        let mut cfg = config(dir.path(), &["smiski"]);
        cfg.concurrency = 8;
        let pipeline = HarvestPipeline::new(provider("smiski", candidates), fetcher, cfg);

        let result = pipeline.execute().await.unwrap();
        let rows = assert_manifest_consistent(&result, 60);
        let accepted = result.stats.accepted;
        assert_eq!(accepted, 10);
        assert_eq!(image_files(dir.path()).len(), 10);
        assert_eq!(reason_count(&rows, "dup_url"), 40);
        assert_eq!(reason_count(&rows, "dup_hash"), 10);

        let mut ok_hashes: Vec<_> = rows
            .iter()
            .filter(|r| r.status == OutcomeStatus::Ok)
            .map(|r| r.sha256.clone().unwrap())
            .collect();
        ok_hashes.sort();
        ok_hashes.dedup();
        assert_eq!(ok_hashes.len(), 10);
        assert!(pipeline.fetcher.hits.lock().unwrap().values().all(|n| *n == 1));
    }

    #[tokio::test]
    async fn test_identifier_stable_across_runs() {
        let url = "https://img.example/stable.png";
        let mut ids = Vec::new();
        for _ in 0..2 {
            let dir = tempfile::tempdir().unwrap();
            let pipeline = HarvestPipeline::new(
                provider("smiski", vec![candidate(url, "smiski")]),
                MockFetcher::default().serve(url, FetchResponse::ok(png(300, 300, 5), None)),
                config(dir.path(), &["smiski"]),
            );
            let result = pipeline.execute().await.unwrap();
            let rows = assert_manifest_consistent(&result, 1);
            assert_eq!(rows[0].status, OutcomeStatus::Ok);
            ids.push(rows[0].id.clone());
        }
        assert_eq!(ids[0], ids[1]);
        assert_eq!(ids[0], derive_id(url));
    }

    #[tokio::test]
    async fn test_third_label_is_rejected_before_search() {
        let dir = tempfile::tempdir().unwrap();
        let url = "https://img.example/pos.png";
        for label in ["smiski", "non_smiski"] {
            let mut cfg = config(dir.path(), &["smiski"]);
            cfg.label = label.to_string();
            let pipeline = HarvestPipeline::new(
                provider("smiski", vec![candidate(url, "smiski")]),
                MockFetcher::default().serve(url, FetchResponse::ok(png(300, 300, 7), None)),
                cfg,
            );
            pipeline.execute().await.unwrap();
        }

        let mut cfg = config(dir.path(), &["smiski"]);
        cfg.label = "banana".to_string();
        let pipeline = HarvestPipeline::new(provider("smiski", vec![]), MockFetcher::default(), cfg);
        let err = pipeline.execute().await.unwrap_err();
        assert!(matches!(err, PipelineError::Config(ConfigError::Invalid(_))));
        assert!(pipeline.provider.calls.lock().unwrap().is_empty());

        // Renaming the classes cannot smuggle a third label into the same manifest.
        let mut cfg = config(dir.path(), &["smiski"]);
        cfg.classes = ["banana".to_string(), "smiski".to_string()];
        cfg.label = "banana".to_string();
        let pipeline = HarvestPipeline::new(provider("smiski", vec![]), MockFetcher::default(), cfg);
        assert!(matches!(pipeline.execute().await, Err(PipelineError::Config(_))));

        let mut labels: Vec<String> = read_manifest(&dir.path().join("download_manifest.jsonl"))
            .unwrap()
            .into_iter()
            .map(|r| r.label)
            .collect();
        labels.sort();
        labels.dedup();
        assert_eq!(labels, vec!["non_smiski", "smiski"]);
    }

    #[tokio::test]
    async fn test_rerun_appends_to_existing_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let url = "https://img.example/again.png";
        for _ in 0..2 {
            let pipeline = HarvestPipeline::new(
                provider("smiski", vec![candidate(url, "smiski")]),
                MockFetcher::default().serve(url, FetchResponse::ok(png(300, 300, 6), None)),
                config(dir.path(), &["smiski"]),
            );
            pipeline.execute().await.unwrap();
        }
        // Fresh dedup state per run: the same image is accepted again.
        let rows = read_manifest(&dir.path().join("download_manifest.jsonl")).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.status == OutcomeStatus::Ok));
        assert_eq!(image_files(dir.path()).len(), 2);
    }
}

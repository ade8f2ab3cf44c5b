//! One item's journey from manifest to bundle.
//!
//! ```text
//! FetchingManifest ─► FetchingFragments ─► Assembling ─► Done
//!        │                                     │
//!        ├─► Skipped (over the ceiling)        └─► Failed
//!        └─► Failed (unreachable / no title / no fragments)
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};
use url::Url;

use folio_bundle::{Assembler, BundleMeta, write_bundle};
use folio_fetch::{ContentExtractor, ExtractedPage, Fetcher};
use folio_shared::{FolioError, Fragment, FragmentRef, JobRequest, JobResult, Result, RunConfig};

use crate::fragment::fetch_fragment;
use crate::limiter::ConcurrencyLimiter;
use crate::retry::RetryController;

// ---------------------------------------------------------------------------
// Phases
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobPhase {
    FetchingManifest,
    FetchingFragments,
    Assembling,
    Done,
    Failed,
    Skipped,
}

impl JobPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Skipped)
    }

    /// Forward-only transition table.
    pub fn can_advance_to(self, next: JobPhase) -> bool {
        use JobPhase::*;
        matches!(
            (self, next),
            (FetchingManifest, FetchingFragments | Failed | Skipped)
                | (FetchingFragments, Assembling)
                | (Assembling, Done | Failed)
        )
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Per-job knobs taken from the run configuration.
#[derive(Debug, Clone)]
pub struct JobSettings {
    /// Simultaneous fragment fetches (K).
    pub concurrency: usize,
    pub request_delay: Duration,
    /// Fragment ceiling; 0 disables it.
    pub max_fragments: usize,
    pub output_dir: PathBuf,
}

impl From<&RunConfig> for JobSettings {
    fn from(config: &RunConfig) -> Self {
        Self {
            concurrency: config.concurrency,
            request_delay: config.request_delay,
            max_fragments: config.max_fragments,
            output_dir: config.output_dir.clone(),
        }
    }
}

/// Everything a job needs, shared by all jobs a worker runs.
#[derive(Clone)]
pub struct JobContext {
    pub fetcher: Arc<dyn Fetcher>,
    pub extractor: Arc<dyn ContentExtractor>,
    pub assembler: Arc<dyn Assembler>,
    pub settings: JobSettings,
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A single-use download job. [`Job::run`] consumes it.
pub struct Job {
    request: JobRequest,
    context: Arc<JobContext>,
    phase: JobPhase,
}

/// What the manifest step produced.
struct Manifest {
    title: String,
    entries: Vec<FragmentRef>,
}

impl Job {
    pub fn new(request: JobRequest, context: Arc<JobContext>) -> Self {
        Self {
            request,
            context,
            phase: JobPhase::FetchingManifest,
        }
    }

    pub fn phase(&self) -> JobPhase {
        self.phase
    }

    fn advance(&mut self, next: JobPhase) {
        debug_assert!(
            self.phase.can_advance_to(next),
            "illegal job transition {:?} -> {next:?}",
            self.phase
        );
        debug!(id = %self.request.id, from = ?self.phase, to = ?next, "job phase");
        self.phase = next;
    }

    /// Run the job to a terminal state. Never returns an error: every failure
    /// is folded into the [`JobResult`].
    #[instrument(skip_all, fields(id = %self.request.id))]
    pub async fn run(mut self, progress: &mut (dyn FnMut(usize, usize) + Send)) -> JobResult {
        let manifest = match self.fetch_manifest().await {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!(error = %e, "manifest step failed");
                self.advance(JobPhase::Failed);
                return JobResult::failure(&self.request, 0, e);
            }
        };
        let total = manifest.entries.len();

        let ceiling = self.context.settings.max_fragments;
        if ceiling > 0 && total > ceiling {
            let reason = FolioError::CeilingExceeded {
                count: total,
                ceiling,
            };
            info!(total, ceiling, "skipping item over the fragment ceiling");
            self.advance(JobPhase::Skipped);
            return JobResult::skipped(&self.request, total, reason);
        }

        self.advance(JobPhase::FetchingFragments);
        let (fragments, failed) = self.fetch_fragments(&manifest.entries, progress).await;

        self.advance(JobPhase::Assembling);
        match self.assemble(&manifest.title, fragments, failed).await {
            Ok(path) => {
                self.advance(JobPhase::Done);
                info!(total, failed, path = %path.display(), "job done");
                JobResult::success(&self.request, total, failed, path)
            }
            Err(e) => {
                warn!(error = %e, "assembly failed");
                self.advance(JobPhase::Failed);
                JobResult::failure(&self.request, total, e)
            }
        }
    }

    async fn fetch_manifest(&self) -> Result<Manifest> {
        let url = Url::parse(&self.request.url).map_err(|e| {
            FolioError::parse(format!("invalid item url '{}': {e}", self.request.url))
        })?;

        let html = self.context.fetcher.fetch(&url).await?;
        let ExtractedPage {
            title, manifest, ..
        } = self.context.extractor.extract(&html, &url);

        if title.trim().is_empty() {
            return Err(FolioError::manifest(format!("no title on {url}")));
        }
        if manifest.is_empty() {
            return Err(FolioError::manifest(format!("no fragments listed on {url}")));
        }

        debug!(title = %title, fragments = manifest.len(), "manifest resolved");
        Ok(Manifest {
            title,
            entries: manifest,
        })
    }

    async fn fetch_fragments(
        &self,
        entries: &[FragmentRef],
        progress: &mut (dyn FnMut(usize, usize) + Send),
    ) -> (Vec<Fragment>, usize) {
        let settings = &self.context.settings;
        let limiter = ConcurrencyLimiter::new(settings.concurrency, settings.request_delay);
        let retry = RetryController::for_limiter(&limiter);

        let titles: Vec<String> = entries.iter().map(|e| e.title.clone()).collect();
        let task = |index: usize| {
            let fetcher = self.context.fetcher.clone();
            let extractor = self.context.extractor.clone();
            let source = entries[index].clone();
            fetch_fragment(fetcher, extractor, index, source)
        };

        let resolution = retry.resolve(&limiter, &titles, task, progress).await;
        (resolution.fragments, resolution.failed)
    }

    async fn assemble(&self, title: &str, fragments: Vec<Fragment>, failed: usize) -> Result<PathBuf> {
        let meta = BundleMeta {
            id: self.request.id.clone(),
            title: title.to_string(),
            source_url: self.request.url.clone(),
            failed_fragments: failed,
        };
        let assembler = self.context.assembler.clone();
        let output_dir = self.context.settings.output_dir.clone();

        // Conversion and the file write are blocking work.
        tokio::task::spawn_blocking(move || {
            let bytes = assembler.assemble(&meta, &fragments)?;
            write_bundle(&output_dir, &meta, assembler.extension(), &bytes)
        })
        .await
        .map_err(|e| FolioError::Assembly(format!("assembler task aborted: {e}")))?
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use folio_shared::{JobOutcome, ListingItem};

    // -- Stubs shared with the worker and coordinator tests ---------------

    /// Serves a synthetic catalog: `/item/<id>?n=<count>` lists `count`
    /// fragments at `/item/<id>/<i>`. Fragment URLs in `fail` fail that many
    /// times before succeeding.
    #[derive(Default)]
    pub(crate) struct StubFetcher {
        pub fail: HashMap<String, usize>,
        pub calls: Mutex<HashMap<String, usize>>,
        pub active: AtomicUsize,
        pub peak: AtomicUsize,
        pub delay: Duration,
    }

    impl StubFetcher {
        pub fn total_calls(&self) -> usize {
            self.calls.lock().unwrap().values().sum()
        }
    }

    #[async_trait]
    impl Fetcher for StubFetcher {
        async fn fetch(&self, url: &Url) -> Result<String> {
            let key = url.to_string();
            let attempt = {
                let mut calls = self.calls.lock().unwrap();
                let n = calls.entry(key.clone()).or_default();
                *n += 1;
                *n
            };

            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.active.fetch_sub(1, Ordering::SeqCst);

            if attempt <= self.fail.get(&key).copied().unwrap_or(0) {
                return Err(FolioError::Network(format!("stub failure {attempt} for {key}")));
            }
            Ok(key)
        }
    }

    /// "Parses" the URL echoed back by [`StubFetcher`].
    pub(crate) struct StubExtractor;

    impl ContentExtractor for StubExtractor {
        fn extract(&self, html: &str, page_url: &Url) -> ExtractedPage {
            let segments: Vec<&str> = page_url.path_segments().map(|s| s.collect()).unwrap_or_default();
            match segments.as_slice() {
                ["item", id] => {
                    let count: usize = page_url
                        .query_pairs()
                        .find(|(k, _)| k == "n")
                        .and_then(|(_, v)| v.parse().ok())
                        .unwrap_or(0);
                    let manifest = (0..count)
                        .map(|i| FragmentRef {
                            title: format!("Part {}", i + 1),
                            url: format!("https://stub.test/item/{id}/{i}"),
                        })
                        .collect();
                    ExtractedPage {
                        title: format!("Item {id}"),
                        manifest,
                        body: None,
                    }
                }
                ["item", _, index] => ExtractedPage {
                    title: String::new(),
                    manifest: Vec::new(),
                    body: Some(format!("<p>{index} of {html}</p>")),
                },
                _ => ExtractedPage {
                    title: String::new(),
                    manifest: Vec::new(),
                    body: None,
                },
            }
        }

        fn extract_listing(&self, _html: &str, _page_url: &Url) -> Vec<ListingItem> {
            Vec::new()
        }
    }

    /// Joins fragment bodies; fails when any fragment is unresolved.
    pub(crate) struct StubAssembler;

    impl Assembler for StubAssembler {
        fn assemble(&self, meta: &BundleMeta, fragments: &[Fragment]) -> Result<Vec<u8>> {
            let mut out = format!("{}\n", meta.title);
            for fragment in fragments {
                let body = fragment
                    .body
                    .as_deref()
                    .ok_or_else(|| FolioError::Assembly("unresolved fragment".into()))?;
                out.push_str(body);
                out.push('\n');
            }
            Ok(out.into_bytes())
        }

        fn extension(&self) -> &str {
            "txt"
        }
    }

    pub(crate) fn temp_output() -> PathBuf {
        std::env::temp_dir().join(format!("folio-core-test-{}", uuid::Uuid::now_v7()))
    }

    pub(crate) fn context(fetcher: Arc<StubFetcher>, concurrency: usize, output_dir: PathBuf) -> JobContext {
        JobContext {
            fetcher,
            extractor: Arc::new(StubExtractor),
            assembler: Arc::new(StubAssembler),
            settings: JobSettings {
                concurrency,
                request_delay: Duration::ZERO,
                max_fragments: 2000,
                output_dir,
            },
        }
    }

    pub(crate) fn request(id: &str, fragments: usize) -> JobRequest {
        JobRequest {
            id: id.into(),
            title: format!("Listing {id}"),
            url: format!("https://stub.test/item/{id}?n={fragments}"),
        }
    }

    // -- Tests --------------------------------------------------------------

    #[test]
    fn transitions_are_forward_only() {
        use JobPhase::*;
        assert!(FetchingManifest.can_advance_to(FetchingFragments));
        assert!(FetchingManifest.can_advance_to(Skipped));
        assert!(Assembling.can_advance_to(Failed));
        assert!(!FetchingFragments.can_advance_to(FetchingManifest));
        assert!(!Done.can_advance_to(Assembling));
        assert!(!FetchingFragments.can_advance_to(Skipped));
        assert!(Done.is_terminal() && Skipped.is_terminal());
        assert!(!Assembling.is_terminal());
    }

    #[tokio::test]
    async fn job_assembles_every_fragment() {
        let out = temp_output();
        let fetcher = Arc::new(StubFetcher::default());
        let ctx = Arc::new(context(fetcher.clone(), 3, out.clone()));
        let mut reports = Vec::new();

        let result = Job::new(request("lost-sea", 4), ctx)
            .run(&mut |c, t| reports.push((c, t)))
            .await;

        assert_eq!(result.outcome, JobOutcome::Success);
        assert_eq!(result.total_fragments, 4);
        assert_eq!(result.failed_fragments, 0);
        let path = result.bundle_path.expect("bundle path");
        let text = std::fs::read_to_string(&path).unwrap();
        let first = text.find("<p>0 of").unwrap();
        let last = text.find("<p>3 of").unwrap();
        assert!(text.starts_with("Item lost-sea\n"));
        assert!(first < last);
        assert_eq!(reports.last(), Some(&(4, 4)));

        let _ = std::fs::remove_dir_all(&out);
    }

    #[tokio::test]
    async fn fetches_stay_within_concurrency() {
        let out = temp_output();
        let fetcher = Arc::new(StubFetcher {
            delay: Duration::from_millis(5),
            ..StubFetcher::default()
        });
        let ctx = Arc::new(context(fetcher.clone(), 3, out.clone()));

        let result = Job::new(request("wide", 20), ctx).run(&mut |_, _| {}).await;

        assert!(result.is_success());
        assert!(fetcher.peak.load(Ordering::SeqCst) <= 3);
        let _ = std::fs::remove_dir_all(&out);
    }

    #[tokio::test]
    async fn zero_fragments_fails_without_fetching_fragments() {
        let fetcher = Arc::new(StubFetcher::default());
        let ctx = Arc::new(context(fetcher.clone(), 3, temp_output()));

        let result = Job::new(request("empty", 0), ctx).run(&mut |_, _| {}).await;

        assert_eq!(result.outcome, JobOutcome::Failure);
        assert_eq!(result.total_fragments, 0);
        assert!(result.error.unwrap().contains("no fragments"));
        // Only the item page itself.
        assert_eq!(fetcher.total_calls(), 1);
    }

    #[tokio::test]
    async fn over_ceiling_is_skipped_without_fetching_fragments() {
        let fetcher = Arc::new(StubFetcher::default());
        let ctx = Arc::new(context(fetcher.clone(), 3, temp_output()));

        let result = Job::new(request("huge", 5000), ctx).run(&mut |_, _| {}).await;

        assert_eq!(result.outcome, JobOutcome::Skipped);
        assert_eq!(result.total_fragments, 5000);
        assert_eq!(fetcher.total_calls(), 1);
    }

    #[tokio::test]
    async fn unreachable_item_fails() {
        let fetcher = Arc::new(StubFetcher {
            fail: HashMap::from([("https://stub.test/item/gone?n=3".to_string(), usize::MAX)]),
            ..StubFetcher::default()
        });
        let ctx = Arc::new(context(fetcher, 3, temp_output()));

        let result = Job::new(request("gone", 3), ctx).run(&mut |_, _| {}).await;

        assert_eq!(result.outcome, JobOutcome::Failure);
        assert!(result.bundle_path.is_none());
    }

    #[tokio::test]
    async fn failing_fragment_becomes_placeholder() {
        let out = temp_output();
        let fetcher = Arc::new(StubFetcher {
            fail: HashMap::from([("https://stub.test/item/holey/1".to_string(), usize::MAX)]),
            ..StubFetcher::default()
        });
        let ctx = Arc::new(context(fetcher.clone(), 2, out.clone()));

        let result = Job::new(request("holey", 3), ctx).run(&mut |_, _| {}).await;

        assert!(result.is_success());
        assert_eq!(result.failed_fragments, 1);
        let text = std::fs::read_to_string(result.bundle_path.unwrap()).unwrap();
        assert!(text.contains(crate::fragment::FAILED_FRAGMENT_BODY));
        assert_eq!(
            fetcher.calls.lock().unwrap()["https://stub.test/item/holey/1"],
            3
        );

        let _ = std::fs::remove_dir_all(&out);
    }
}

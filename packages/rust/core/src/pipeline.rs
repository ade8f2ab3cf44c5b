//! End-to-end `run` pipeline: listing → worker pool → bundles.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, instrument, warn};
use uuid::Uuid;

use folio_bundle::MarkdownAssembler;
use folio_fetch::{ContentExtractor, HttpFetcher, ListingCache, SelectorExtractor, scan_listing};
use folio_shared::{FolioError, JobRequest, JobResult, ListingItem, PoolStats, Result, RunConfig};

use crate::coordinator::{PoolObserver, WorkerPool};
use crate::job::JobSettings;
use crate::worker::{HttpRunnerFactory, RunnerFactory};

/// Result of one pipeline run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: Uuid,
    /// Items handed to the pool.
    pub items: usize,
    /// Whether the listing came from the cache rather than a fresh scan.
    pub from_cache: bool,
    pub stats: PoolStats,
    pub output_dir: PathBuf,
    pub elapsed: Duration,
}

/// Progress callback for reporting pipeline status.
///
/// Extends [`PoolObserver`] with pipeline-level notifications.
pub trait ProgressReporter: PoolObserver {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called once the listing is known, before any job is dispatched.
    fn items_found(&self, count: usize);
    /// Called when the pipeline completes.
    fn done(&self, summary: &RunSummary);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl PoolObserver for SilentProgress {
    fn job_started(&self, _request: &JobRequest, _slot: usize) {}
    fn job_progress(&self, _id: &str, _title: &str, _completed: usize, _total: usize) {}
    fn job_finished(&self, _result: &JobResult, _stats: &PoolStats) {}
    fn worker_respawned(&self, _slot: usize, _generation: u64) {}
}

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn items_found(&self, _count: usize) {}
    fn done(&self, _summary: &RunSummary) {}
}

/// Run the full pipeline with the built-in HTTP fetcher, selector extractor
/// and Markdown assembler.
///
/// 1. Listing: read the cache, or scan listing pages and rewrite the cache
/// 2. Start the worker pool
/// 3. Enqueue every item and wait for the pool to drain
/// 4. Shut the pool down and report
#[instrument(skip_all, fields(pages = config.pages, workers = config.workers))]
pub async fn run<R>(config: &RunConfig, progress: Arc<R>) -> Result<RunSummary>
where
    R: ProgressReporter + 'static,
{
    config.validate()?;

    let extractor: Arc<dyn ContentExtractor> = Arc::new(SelectorExtractor::new(&config.site)?);
    let factory: Arc<dyn RunnerFactory> = Arc::new(HttpRunnerFactory::new(
        config.fetch.clone(),
        extractor.clone(),
        Arc::new(MarkdownAssembler::new()),
        JobSettings::from(config),
    ));

    run_with(config, extractor.as_ref(), factory, progress).await
}

/// Same as [`run`], with the worker runners supplied by `factory`.
pub async fn run_with<R>(
    config: &RunConfig,
    extractor: &dyn ContentExtractor,
    factory: Arc<dyn RunnerFactory>,
    progress: Arc<R>,
) -> Result<RunSummary>
where
    R: ProgressReporter + 'static,
{
    let start = Instant::now();
    let run_id = Uuid::now_v7();
    info!(%run_id, "starting run");

    // --- Phase 1: Listing ---
    progress.phase("Resolving listing");
    let (items, from_cache) = resolve_listing(config, extractor).await?;
    progress.items_found(items.len());

    if items.is_empty() {
        warn!("listing is empty, nothing to download");
    }

    // --- Phase 2: Pool ---
    progress.phase("Starting workers");
    let observer: Arc<dyn PoolObserver> = progress.clone();
    let pool = WorkerPool::start(config.workers, factory, observer).await?;

    // --- Phase 3: Download ---
    progress.phase("Downloading");
    let jobs: Vec<JobRequest> = items.iter().map(JobRequest::from).collect();
    pool.enqueue(jobs)?;
    pool.wait_until_done().await?;

    // --- Phase 4: Shutdown ---
    progress.phase("Stopping workers");
    let stats = pool.shutdown().await?;

    let summary = RunSummary {
        run_id,
        items: items.len(),
        from_cache,
        stats,
        output_dir: config.output_dir.clone(),
        elapsed: start.elapsed(),
    };
    progress.done(&summary);

    info!(
        %run_id,
        items = summary.items,
        succeeded = stats.succeeded,
        failed = stats.failed,
        skipped = stats.skipped,
        elapsed_ms = summary.elapsed.as_millis(),
        "run complete"
    );

    Ok(summary)
}

/// Load the listing from the cache, falling back to a fresh scan.
///
/// A refresh, a missing cache, an empty cache, or an unreadable cache all
/// trigger a scan; the scan result is written back to the cache.
async fn resolve_listing(
    config: &RunConfig,
    extractor: &dyn ContentExtractor,
) -> Result<(Vec<ListingItem>, bool)> {
    let cache = ListingCache::new(&config.cache_path);

    if !config.refresh {
        match cache.load() {
            Ok(Some(cached)) if !cached.items.is_empty() => {
                info!(
                    items = cached.items.len(),
                    scanned_at = %cached.scanned_at,
                    "using cached listing"
                );
                return Ok((cached.items, true));
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "listing cache unreadable, rescanning"),
        }
    }

    let fetcher = HttpFetcher::new(&config.fetch)?;
    let items = scan_listing(&fetcher, extractor, &config.site, config.pages).await?;

    if items.is_empty() {
        return Err(FolioError::validation("listing scan found no items"));
    }
    cache.store(&items)?;

    Ok((items, false))
}

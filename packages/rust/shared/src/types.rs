//! Core domain types for folio runs.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Listing
// ---------------------------------------------------------------------------

/// One catalog entry discovered by a listing scan. Persisted in the listing cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingItem {
    /// Stable identifier derived from the item URL.
    pub id: String,
    /// Display title as shown on the listing page.
    pub title: String,
    /// Absolute URL of the item page.
    pub url: String,
}

/// A queued unit of work: the enqueued copy of a [`ListingItem`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub id: String,
    pub title: String,
    pub url: String,
}

impl From<&ListingItem> for JobRequest {
    fn from(item: &ListingItem) -> Self {
        Self {
            id: item.id.clone(),
            title: item.title.clone(),
            url: item.url.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Fragments
// ---------------------------------------------------------------------------

/// One entry of an item's manifest: where a fragment lives and what it is called.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentRef {
    pub title: String,
    pub url: String,
}

/// One ordered chunk of an item's content.
///
/// `body` stays `None` until the fragment resolves; after the retry passes a
/// job replaces every remaining `None` with a placeholder, so assembled
/// fragments always carry a body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    /// Dense position within the item, `0..N`.
    pub index: usize,
    pub title: String,
    pub body: Option<String>,
}

impl Fragment {
    /// A fragment slot that has not been resolved yet.
    pub fn pending(index: usize, title: impl Into<String>) -> Self {
        Self {
            index,
            title: title.into(),
            body: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.body.is_some()
    }
}

// ---------------------------------------------------------------------------
// Job results
// ---------------------------------------------------------------------------

/// Terminal classification of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    Success,
    Failure,
    Skipped,
}

/// The one terminal report a job produces.
///
/// Serializes to the worker protocol's `result` shape
/// (`success`, `skipped?`, `error?`, `totalFragments?`, `failedFragments?`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "ResultWire", from = "ResultWire")]
pub struct JobResult {
    pub id: String,
    pub title: String,
    pub outcome: JobOutcome,
    /// Fragment count known at manifest time (0 if the manifest never resolved).
    pub total_fragments: usize,
    /// Fragments that were filled with a placeholder after all retry passes.
    pub failed_fragments: usize,
    pub error: Option<String>,
    /// Where the assembled bundle was written, on success.
    pub bundle_path: Option<PathBuf>,
}

impl JobResult {
    pub fn success(
        request: &JobRequest,
        total_fragments: usize,
        failed_fragments: usize,
        bundle_path: PathBuf,
    ) -> Self {
        Self {
            id: request.id.clone(),
            title: request.title.clone(),
            outcome: JobOutcome::Success,
            total_fragments,
            failed_fragments,
            error: None,
            bundle_path: Some(bundle_path),
        }
    }

    pub fn failure(request: &JobRequest, total_fragments: usize, error: impl ToString) -> Self {
        Self {
            id: request.id.clone(),
            title: request.title.clone(),
            outcome: JobOutcome::Failure,
            total_fragments,
            failed_fragments: 0,
            error: Some(error.to_string()),
            bundle_path: None,
        }
    }

    pub fn skipped(request: &JobRequest, total_fragments: usize, reason: impl ToString) -> Self {
        Self {
            id: request.id.clone(),
            title: request.title.clone(),
            outcome: JobOutcome::Skipped,
            total_fragments,
            failed_fragments: 0,
            error: Some(reason.to_string()),
            bundle_path: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == JobOutcome::Success
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResultWire {
    id: String,
    #[serde(default)]
    title: String,
    success: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    skipped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    total_fragments: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    failed_fragments: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bundle_path: Option<PathBuf>,
}

impl From<JobResult> for ResultWire {
    fn from(r: JobResult) -> Self {
        Self {
            id: r.id,
            title: r.title,
            success: r.outcome == JobOutcome::Success,
            skipped: r.outcome == JobOutcome::Skipped,
            error: r.error,
            total_fragments: Some(r.total_fragments),
            failed_fragments: (r.outcome == JobOutcome::Success).then_some(r.failed_fragments),
            bundle_path: r.bundle_path,
        }
    }
}

impl From<ResultWire> for JobResult {
    fn from(w: ResultWire) -> Self {
        let outcome = match (w.success, w.skipped) {
            (true, _) => JobOutcome::Success,
            (false, true) => JobOutcome::Skipped,
            (false, false) => JobOutcome::Failure,
        };
        Self {
            id: w.id,
            title: w.title,
            outcome,
            total_fragments: w.total_fragments.unwrap_or(0),
            failed_fragments: w.failed_fragments.unwrap_or(0),
            error: w.error,
            bundle_path: w.bundle_path,
        }
    }
}

// ---------------------------------------------------------------------------
// PoolStats
// ---------------------------------------------------------------------------

/// Run-wide aggregate, owned and mutated by the pool coordinator only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub in_flight: usize,
}

impl PoolStats {
    /// A job was handed to a worker.
    pub fn dispatched(&mut self) {
        self.in_flight += 1;
    }

    /// A worker reported a terminal result.
    pub fn record(&mut self, result: &JobResult) {
        self.in_flight = self.in_flight.saturating_sub(1);
        match result.outcome {
            JobOutcome::Success => self.succeeded += 1,
            JobOutcome::Failure => self.failed += 1,
            JobOutcome::Skipped => self.skipped += 1,
        }
    }

    /// A worker died while holding a job; the job counts as failed.
    pub fn record_fault(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
        self.failed += 1;
    }

    /// Number of jobs that reached a terminal state.
    pub fn finished(&self) -> usize {
        self.succeeded + self.failed + self.skipped
    }
}

/// Generate a URL/filesystem-safe slug from a title.
pub fn slugify(title: &str) -> String {
    title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

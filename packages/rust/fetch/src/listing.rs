//! Listing scans and the on-disk listing cache.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use url::Url;

use folio_shared::{FolioError, ListingItem, Result, SiteConfig};

use crate::extractor::ContentExtractor;
use crate::fetcher::Fetcher;

/// Scan listing pages `1..=pages` and collect their items in first-seen order.
///
/// A page that fails to fetch is logged and skipped. The scan stops early at
/// the first page that yields no items. It only fails when nothing at all was
/// collected and at least one page errored.
#[instrument(skip_all, fields(pages = pages))]
pub async fn scan_listing(
    fetcher: &dyn Fetcher,
    extractor: &dyn ContentExtractor,
    site: &SiteConfig,
    pages: u32,
) -> Result<Vec<ListingItem>> {
    let mut seen = HashSet::new();
    let mut items = Vec::new();
    let mut last_error = None;

    for page in 1..=pages {
        let raw = site.listing_page_url(page);
        let url = Url::parse(&raw)
            .map_err(|e| FolioError::config(format!("invalid listing url '{raw}': {e}")))?;

        let body = match fetcher.fetch(&url).await {
            Ok(body) => body,
            Err(e) => {
                warn!(page, %url, error = %e, "listing page failed, skipping");
                last_error = Some(e);
                continue;
            }
        };

        let found = extractor.extract_listing(&body, &url);
        debug!(page, found = found.len(), "listing page scanned");

        if found.is_empty() {
            info!(page, "listing page has no items, stopping scan");
            break;
        }

        for item in found {
            if seen.insert(item.id.clone()) {
                items.push(item);
            }
        }
    }

    if items.is_empty() {
        if let Some(e) = last_error {
            return Err(e);
        }
    }

    info!(items = items.len(), "listing scan complete");
    Ok(items)
}

// ---------------------------------------------------------------------------
// ListingCache
// ---------------------------------------------------------------------------

/// Serialized form of the listing cache file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedListing {
    pub scanned_at: DateTime<Utc>,
    pub items: Vec<ListingItem>,
}

/// JSON file holding the last listing scan.
#[derive(Debug, Clone)]
pub struct ListingCache {
    path: PathBuf,
}

impl ListingCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the cache. Returns `None` if the file does not exist.
    pub fn load(&self) -> Result<Option<CachedListing>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let content =
            std::fs::read_to_string(&self.path).map_err(|e| FolioError::io(&self.path, e))?;
        let cached: CachedListing = serde_json::from_str(&content).map_err(|e| {
            FolioError::validation(format!(
                "invalid listing cache {}: {e}",
                self.path.display()
            ))
        })?;

        debug!(path = %self.path.display(), items = cached.items.len(), "listing cache loaded");
        Ok(Some(cached))
    }

    /// Replace the cache contents (write to temp, then rename).
    pub fn store(&self, items: &[ListingItem]) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| FolioError::io(parent, e))?;
        }

        let cached = CachedListing {
            scanned_at: Utc::now(),
            items: items.to_vec(),
        };
        let json = serde_json::to_string_pretty(&cached)
            .map_err(|e| FolioError::validation(format!("failed to serialize listing: {e}")))?;

        let temp = self.path.with_extension("json.tmp");
        std::fs::write(&temp, json).map_err(|e| FolioError::io(&temp, e))?;
        std::fs::rename(&temp, &self.path).map_err(|e| FolioError::io(&self.path, e))?;

        info!(path = %self.path.display(), items = items.len(), "listing cache written");
        Ok(())
    }
}

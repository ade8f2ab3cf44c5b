//! Fragment fetch task: fetch one fragment page and extract its body.

use std::sync::Arc;

use tracing::{debug, warn};
use url::Url;

use folio_fetch::{ContentExtractor, Fetcher};
use folio_shared::{FolioError, FragmentRef, Result};

/// A successfully retrieved fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFragment {
    pub title: String,
    pub body: String,
}

/// Body stored for fragments that never resolved.
pub const FAILED_FRAGMENT_BODY: &str =
    "<p><em>[This fragment could not be retrieved.]</em></p>";

/// Fetch and extract the fragment at `index`.
///
/// An empty or whitespace-only body counts as [`FolioError::EmptyContent`] so
/// the retry controller picks the index up again.
pub async fn fetch_fragment(
    fetcher: Arc<dyn Fetcher>,
    extractor: Arc<dyn ContentExtractor>,
    index: usize,
    source: FragmentRef,
) -> Result<ResolvedFragment> {
    let url = Url::parse(&source.url)
        .map_err(|e| FolioError::parse(format!("invalid fragment url '{}': {e}", source.url)))?;

    let html = fetcher.fetch(&url).await.inspect_err(|e| {
        warn!(index, %url, error = %e, "fragment fetch failed");
    })?;

    let page = extractor.extract(&html, &url);
    let body = page
        .body
        .filter(|b| !b.trim().is_empty())
        .ok_or_else(|| FolioError::EmptyContent {
            url: url.to_string(),
        })?;

    let title = if page.title.trim().is_empty() {
        source.title
    } else {
        page.title
    };

    debug!(index, %url, bytes = body.len(), "fragment resolved");
    Ok(ResolvedFragment { title, body })
}

/// Title for a fragment that stays unresolved: the manifest title, or `Fragment N` (1-based).
pub fn placeholder_title(index: usize, original: &str) -> String {
    if original.trim().is_empty() {
        format!("Fragment {}", index + 1)
    } else {
        original.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use folio_fetch::ExtractedPage;
    use folio_shared::ListingItem;

    struct StaticFetcher(&'static str);

    #[async_trait]
    impl Fetcher for StaticFetcher {
        async fn fetch(&self, _url: &Url) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    /// Treats the whole page as the body and never finds a title.
    struct RawExtractor;

    impl ContentExtractor for RawExtractor {
        fn extract(&self, html: &str, _page_url: &Url) -> ExtractedPage {
            ExtractedPage {
                title: String::new(),
                manifest: Vec::new(),
                body: Some(html.to_string()),
            }
        }

        fn extract_listing(&self, _html: &str, _page_url: &Url) -> Vec<ListingItem> {
            Vec::new()
        }
    }

    fn source() -> FragmentRef {
        FragmentRef {
            title: "Chapter 1".into(),
            url: "https://example.com/book/lost-sea/1".into(),
        }
    }

    #[tokio::test]
    async fn falls_back_to_manifest_title() {
        let fragment = fetch_fragment(
            Arc::new(StaticFetcher("<p>text</p>")),
            Arc::new(RawExtractor),
            0,
            source(),
        )
        .await
        .unwrap();

        assert_eq!(fragment.title, "Chapter 1");
        assert_eq!(fragment.body, "<p>text</p>");
    }

    #[tokio::test]
    async fn whitespace_body_is_empty_content() {
        let err = fetch_fragment(
            Arc::new(StaticFetcher("  \n\t ")),
            Arc::new(RawExtractor),
            0,
            source(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, FolioError::EmptyContent { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn placeholder_titles() {
        assert_eq!(placeholder_title(2, "Epilogue"), "Epilogue");
        assert_eq!(placeholder_title(2, " "), "Fragment 3");
    }
}

//! Page → structured record extraction.
//!
//! Extraction is pure: it never performs I/O and never fails on odd markup.
//! Missing fields come back empty and the caller decides what that means.

use std::collections::HashSet;

use scraper::{Html, Selector};
use url::Url;

use folio_shared::{FolioError, FragmentRef, ListingItem, Result, SiteConfig, slugify};

/// Fields extracted from an item page or a fragment page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedPage {
    /// Page title (empty if none was found).
    pub title: String,
    /// Ordered fragment links, resolved against the page URL.
    pub manifest: Vec<FragmentRef>,
    /// Main content HTML, if the body selector matched.
    pub body: Option<String>,
}

/// Trait for turning fetched HTML into records.
pub trait ContentExtractor: Send + Sync {
    /// Extract title, manifest, and body from an item or fragment page.
    fn extract(&self, html: &str, page_url: &Url) -> ExtractedPage;

    /// Extract catalog entries from a listing page.
    fn extract_listing(&self, html: &str, page_url: &Url) -> Vec<ListingItem>;
}

// ---------------------------------------------------------------------------
// SelectorExtractor
// ---------------------------------------------------------------------------

/// Extractor driven by the CSS selectors in the `[site]` config section.
pub struct SelectorExtractor {
    listing_item: Selector,
    item_title: Selector,
    manifest: Selector,
    fragment_title: Selector,
    fragment_body: Selector,
    chrome: Selector,
}

impl SelectorExtractor {
    /// Compile the configured selectors. Fails on the first invalid one.
    pub fn new(site: &SiteConfig) -> Result<Self> {
        Ok(Self {
            listing_item: compile("listing_item_selector", &site.listing_item_selector)?,
            item_title: compile("item_title_selector", &site.item_title_selector)?,
            manifest: compile("manifest_selector", &site.manifest_selector)?,
            fragment_title: compile("fragment_title_selector", &site.fragment_title_selector)?,
            fragment_body: compile("fragment_body_selector", &site.fragment_body_selector)?,
            chrome: compile("chrome", "script, style, noscript, iframe, nav, aside")?,
        })
    }

    fn title(&self, doc: &Html) -> String {
        first_text(doc, &self.item_title)
            .or_else(|| first_text(doc, &self.fragment_title))
            .unwrap_or_default()
    }

    fn manifest(&self, doc: &Html, page_url: &Url) -> Vec<FragmentRef> {
        doc.select(&self.manifest)
            .filter_map(|el| {
                let href = el.value().attr("href")?;
                let url = resolve_link(page_url, href)?;
                let title = collapse_whitespace(&el.text().collect::<String>());
                Some(FragmentRef { title, url })
            })
            .collect()
    }

    fn body(&self, doc: &Html) -> Option<String> {
        let el = doc.select(&self.fragment_body).next()?;
        let html = el.inner_html();
        Some(self.strip_chrome(&html))
    }

    /// Remove script/style/navigation elements from an HTML snippet.
    fn strip_chrome(&self, html: &str) -> String {
        let fragment = Html::parse_fragment(html);
        let mut result = html.to_string();
        for el in fragment.select(&self.chrome) {
            result = result.replace(&el.html(), "");
        }
        result
    }
}

impl ContentExtractor for SelectorExtractor {
    fn extract(&self, html: &str, page_url: &Url) -> ExtractedPage {
        let doc = Html::parse_document(html);
        ExtractedPage {
            title: self.title(&doc),
            manifest: self.manifest(&doc, page_url),
            body: self.body(&doc),
        }
    }

    fn extract_listing(&self, html: &str, page_url: &Url) -> Vec<ListingItem> {
        let doc = Html::parse_document(html);
        let mut seen = HashSet::new();
        let mut items = Vec::new();

        for el in doc.select(&self.listing_item) {
            let Some(href) = el.value().attr("href") else {
                continue;
            };
            let Some(url) = resolve_link(page_url, href) else {
                continue;
            };
            let Some(id) = Url::parse(&url).ok().and_then(|u| item_id_from_url(&u)) else {
                continue;
            };
            if !seen.insert(id.clone()) {
                continue;
            }
            let title = collapse_whitespace(&el.text().collect::<String>());
            items.push(ListingItem { id, title, url });
        }

        items
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn compile(name: &str, css: &str) -> Result<Selector> {
    Selector::parse(css)
        .map_err(|e| FolioError::config(format!("invalid selector for {name} '{css}': {e}")))
}

fn first_text(doc: &Html, selector: &Selector) -> Option<String> {
    doc.select(selector)
        .map(|el| collapse_whitespace(&el.text().collect::<String>()))
        .find(|t| !t.is_empty())
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Resolve an href against the page URL, dropping anchors and non-navigational links.
fn resolve_link(base: &Url, href: &str) -> Option<String> {
    if href.starts_with('#') || href.starts_with("javascript:") || href.starts_with("mailto:") {
        return None;
    }
    let mut resolved = base.join(href).ok()?;
    resolved.set_fragment(None);
    Some(resolved.to_string())
}

/// Derive a stable item id from the last non-empty path segment of its URL.
pub fn item_id_from_url(url: &Url) -> Option<String> {
    let segment = url
        .path_segments()?
        .filter(|s| !s.is_empty())
        .next_back()?;
    let segment = segment
        .trim_end_matches(".html")
        .trim_end_matches(".htm");
    let id = slugify(segment);
    (!id.is_empty()).then_some(id)
}

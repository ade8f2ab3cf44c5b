//! Network retrieval, content extraction, and listing scans.
//!
//! This crate provides:
//! - [`fetcher`]: the [`Fetcher`] trait and the retrying [`HttpFetcher`]
//! - [`extractor`]: the [`ContentExtractor`] trait and the CSS-selector based [`SelectorExtractor`]
//! - [`listing`]: listing page scans and the on-disk [`ListingCache`]

pub mod extractor;
pub mod fetcher;
pub mod listing;

pub use extractor::{ContentExtractor, ExtractedPage, SelectorExtractor, item_id_from_url};
pub use fetcher::{Fetcher, HttpFetcher};
pub use listing::{CachedListing, ListingCache, scan_listing};

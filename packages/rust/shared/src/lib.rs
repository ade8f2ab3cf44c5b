//! Shared types, error model, and configuration for folio.
//!
//! This crate is the foundation depended on by all other folio crates.
//! It provides:
//! - [`FolioError`]: the unified error type
//! - Domain types ([`ListingItem`], [`JobRequest`], [`Fragment`], [`JobResult`], [`PoolStats`])
//! - Configuration ([`AppConfig`], [`RunConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, DefaultsConfig, FetchConfig, RunConfig, SiteConfig, config_dir, config_file_path,
    init_config, load_config, load_config_from,
};
pub use error::{FolioError, Result};
pub use types::{
    Fragment, FragmentRef, JobOutcome, JobRequest, JobResult, ListingItem, PoolStats, slugify,
};

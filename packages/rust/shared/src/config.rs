//! Application configuration for folio.
//!
//! User config lives at `~/.folio/folio.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FolioError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "folio.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".folio";

// ---------------------------------------------------------------------------
// Config structs (matching folio.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Run defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Network retrieval settings.
    #[serde(default)]
    pub fetch: FetchConfig,

    /// The catalog site: URL templates and extraction selectors.
    #[serde(default)]
    pub site: SiteConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Directory bundles are written to.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Listing cache file.
    #[serde(default = "default_cache_path")]
    pub cache_path: String,

    /// Number of listing pages to scan.
    #[serde(default = "default_pages")]
    pub pages: u32,

    /// Worker pool size.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Simultaneous fragment fetches per job.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Delay between fragment requests within a job.
    #[serde(default = "default_request_delay")]
    pub request_delay_ms: u64,

    /// Items with more fragments than this are skipped. 0 disables the ceiling.
    #[serde(default = "default_max_fragments")]
    pub max_fragments: usize,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            cache_path: default_cache_path(),
            pages: default_pages(),
            workers: default_workers(),
            concurrency: default_concurrency(),
            request_delay_ms: default_request_delay(),
            max_fragments: default_max_fragments(),
        }
    }
}

fn default_output_dir() -> String {
    "bundles".into()
}
fn default_cache_path() -> String {
    "listing-cache.json".into()
}
fn default_pages() -> u32 {
    1
}
fn default_workers() -> usize {
    4
}
fn default_concurrency() -> usize {
    3
}
fn default_request_delay() -> u64 {
    500
}
fn default_max_fragments() -> usize {
    2000
}

/// `[fetch]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Attempts per request, redirects included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base backoff delay.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,

    /// Per-request timeout.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// User-Agent header.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay(),
            timeout_secs: default_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

impl FetchConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_retry_delay() -> u64 {
    1000
}
fn default_timeout() -> u64 {
    30
}
fn default_user_agent() -> String {
    concat!("folio/", env!("CARGO_PKG_VERSION")).into()
}

/// `[site]` section: where the catalog lives and how its pages are shaped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    /// Listing page URL; `{page}` is replaced by the 1-based page number.
    #[serde(default = "default_listing_url")]
    pub listing_url: String,

    /// Anchor selector for items on a listing page.
    #[serde(default = "default_listing_item_selector")]
    pub listing_item_selector: String,

    /// Title selector on an item page.
    #[serde(default = "default_item_title_selector")]
    pub item_title_selector: String,

    /// Anchor selector for manifest entries on an item page.
    #[serde(default = "default_manifest_selector")]
    pub manifest_selector: String,

    /// Title selector on a fragment page.
    #[serde(default = "default_fragment_title_selector")]
    pub fragment_title_selector: String,

    /// Body selector on a fragment page.
    #[serde(default = "default_fragment_body_selector")]
    pub fragment_body_selector: String,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            listing_url: default_listing_url(),
            listing_item_selector: default_listing_item_selector(),
            item_title_selector: default_item_title_selector(),
            manifest_selector: default_manifest_selector(),
            fragment_title_selector: default_fragment_title_selector(),
            fragment_body_selector: default_fragment_body_selector(),
        }
    }
}

impl SiteConfig {
    /// URL of the given 1-based listing page.
    pub fn listing_page_url(&self, page: u32) -> String {
        self.listing_url.replace("{page}", &page.to_string())
    }
}

fn default_listing_url() -> String {
    "https://example.com/catalog?page={page}".into()
}
fn default_listing_item_selector() -> String {
    ".catalog .item a.title".into()
}
fn default_item_title_selector() -> String {
    "h1".into()
}
fn default_manifest_selector() -> String {
    ".contents a".into()
}
fn default_fragment_title_selector() -> String {
    "h1, h2".into()
}
fn default_fragment_body_selector() -> String {
    "article, .content, main".into()
}

// ---------------------------------------------------------------------------
// Run config (runtime, merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime configuration for one run, merged from config file + CLI flags.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Listing pages to scan.
    pub pages: u32,
    /// Worker pool size.
    pub workers: usize,
    /// Per-job fragment concurrency.
    pub concurrency: usize,
    /// Inter-request delay inside a job.
    pub request_delay: Duration,
    /// Fragment ceiling (0 = unlimited).
    pub max_fragments: usize,
    /// Bypass the listing cache and rescan.
    pub refresh: bool,
    /// Bundle output directory.
    pub output_dir: PathBuf,
    /// Listing cache file.
    pub cache_path: PathBuf,
    pub fetch: FetchConfig,
    pub site: SiteConfig,
}

impl From<&AppConfig> for RunConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            pages: config.defaults.pages,
            workers: config.defaults.workers,
            concurrency: config.defaults.concurrency,
            request_delay: Duration::from_millis(config.defaults.request_delay_ms),
            max_fragments: config.defaults.max_fragments,
            refresh: false,
            output_dir: PathBuf::from(&config.defaults.output_dir),
            cache_path: PathBuf::from(&config.defaults.cache_path),
            fetch: config.fetch.clone(),
            site: config.site.clone(),
        }
    }
}

impl RunConfig {
    /// Reject values the pool cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(FolioError::config("workers must be at least 1"));
        }
        if self.concurrency == 0 {
            return Err(FolioError::config("concurrency must be at least 1"));
        }
        if self.fetch.max_attempts == 0 {
            return Err(FolioError::config("fetch.max_attempts must be at least 1"));
        }
        if !self.site.listing_url.contains("{page}") {
            tracing::warn!(
                listing_url = %self.site.listing_url,
                "listing_url has no {{page}} placeholder; every page scans the same URL"
            );
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.folio/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| FolioError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.folio/folio.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| FolioError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| FolioError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| FolioError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| FolioError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| FolioError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("listing_url"));
        assert!(toml_str.contains("max_fragments"));
    }

    #[test]
    fn partial_config_fills_defaults() {
        let toml_str = r#"
[defaults]
workers = 8

[site]
listing_url = "https://novels.example.org/list/{page}"
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.defaults.workers, 8);
        assert_eq!(config.defaults.concurrency, 3);
        assert_eq!(config.fetch.max_attempts, 3);
        assert_eq!(
            config.site.listing_page_url(4),
            "https://novels.example.org/list/4"
        );
        assert_eq!(config.site.item_title_selector, "h1");
    }

    #[test]
    fn run_config_from_app_config() {
        let app = AppConfig::default();
        let run = RunConfig::from(&app);
        assert_eq!(run.workers, 4);
        assert_eq!(run.concurrency, 3);
        assert_eq!(run.request_delay, Duration::from_millis(500));
        assert_eq!(run.max_fragments, 2000);
        assert!(!run.refresh);
        assert!(run.validate().is_ok());
    }

    #[test]
    fn zero_workers_rejected() {
        let mut run = RunConfig::from(&AppConfig::default());
        run.workers = 0;
        let err = run.validate().unwrap_err();
        assert!(err.to_string().contains("workers"));
    }
}

//! Error types for folio.
//!
//! Library crates use [`FolioError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all folio operations.
#[derive(Debug, thiserror::Error)]
pub enum FolioError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Transient network/HTTP failure (timeouts, resets, 5xx). Retried with linear backoff.
    #[error("network error: {0}")]
    Network(String),

    /// The remote asked us to slow down. Retried with exponential backoff.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Permanent HTTP failure (4xx other than 429). Not retried by the fetcher.
    #[error("request rejected: {0}")]
    Rejected(String),

    /// A page came back successfully but carried no usable content.
    #[error("empty content at {url}")]
    EmptyContent { url: String },

    /// The item manifest is unusable (missing title or no fragments).
    #[error("manifest error: {message}")]
    Manifest { message: String },

    /// The item has more fragments than the configured ceiling.
    #[error("fragment count {count} exceeds ceiling {ceiling}")]
    CeilingExceeded { count: usize, ceiling: usize },

    /// The document assembler could not produce or persist a bundle.
    #[error("assembly error: {0}")]
    Assembly(String),

    /// A worker's execution context died while running.
    #[error("worker {slot} fault: {message}")]
    WorkerFault { slot: usize, message: String },

    /// Worker pool setup or control-channel failure.
    #[error("pool error: {0}")]
    Pool(String),

    /// HTML parsing or content extraction error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (schema mismatch, invalid format, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, FolioError>;

impl FolioError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a manifest error from any displayable message.
    pub fn manifest(msg: impl Into<String>) -> Self {
        Self::Manifest {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the fetcher should spend another attempt on this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::RateLimited(_) | Self::EmptyContent { .. }
        )
    }

    /// Whether this error is a rate-limit signal (exponential backoff, quiet logging).
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Self::RateLimited(_))
    }
}

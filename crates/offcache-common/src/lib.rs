//! # Offcache Common
//!
//! Shared error taxonomy, logging configuration, and retry utilities for the
//! Offcache offline caching engine.
//!
//! ## Features
//!
//! - One error type for transport, storage, upstream and precondition failures
//! - Logging configuration and setup
//! - Retry and timeout utilities
//! - Result extension traits

use std::time::Duration;
use thiserror::Error;

pub mod logging;
pub mod retry;

pub use logging::{init_logging, LogConfig, LogFormat};
pub use retry::{retry_with_backoff, with_timeout, RetryConfig};

type BoxedSource = Box<dyn std::error::Error + Send + Sync>;

/// Unified error type for Offcache.
#[derive(Error, Debug)]
pub enum OfflineError {
    /// The network was unreachable, timed out, or failed name resolution.
    #[error("Transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<BoxedSource>,
    },

    /// The underlying blob or log store failed to read or write.
    #[error("Storage error: {message}")]
    Storage {
        message: String,
        #[source]
        source: Option<BoxedSource>,
    },

    /// The network answered with a non-2xx status.
    #[error("Upstream returned {status} for {url}")]
    UpstreamStatus { status: u16, url: String },

    /// A required all-or-nothing step could not complete.
    #[error("Precondition failed: {0}")]
    StrictPrecondition(String),

    /// A navigation failed and no fallback document was cached.
    #[error("Navigation failed: {url}")]
    NavigationFailed {
        url: String,
        #[source]
        source: Option<BoxedSource>,
    },

    /// Configuration errors.
    #[error("Config error: {0}")]
    Config(String),

    /// Serialization errors.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout errors.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Resource not found.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Internal error (unexpected).
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        backtrace: Option<backtrace::Backtrace>,
    },
}

impl OfflineError {
    /// Create a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            source: None,
        }
    }

    /// Create a transport error with source.
    pub fn transport_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Transport {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Create a storage error with source.
    pub fn storage_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a precondition error.
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::StrictPrecondition(message.into())
    }

    /// Create a navigation failure, keeping the transport error that caused it.
    pub fn navigation_failed(url: impl Into<String>, cause: Option<OfflineError>) -> Self {
        Self::NavigationFailed {
            url: url.into(),
            source: cause.map(|e| Box::new(e) as BoxedSource),
        }
    }

    /// Create a config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create an internal error with backtrace.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            backtrace: Some(backtrace::Backtrace::new()),
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OfflineError::Transport { .. } | OfflineError::Timeout(_) | OfflineError::Io(_)
        )
    }

    /// Check if this error means the network could not be reached.
    pub fn is_transport(&self) -> bool {
        matches!(self, OfflineError::Transport { .. } | OfflineError::Timeout(_))
    }

    /// Get the error category for logs.
    pub fn category(&self) -> &'static str {
        match self {
            OfflineError::Transport { .. } => "transport",
            OfflineError::Storage { .. } => "storage",
            OfflineError::UpstreamStatus { .. } => "upstream_status",
            OfflineError::StrictPrecondition(_) => "strict_precondition",
            OfflineError::NavigationFailed { .. } => "navigation",
            OfflineError::Config(_) => "config",
            OfflineError::Serialization(_) => "serialization",
            OfflineError::Io(_) => "io",
            OfflineError::Timeout(_) => "timeout",
            OfflineError::NotFound(_) => "not_found",
            OfflineError::Internal { .. } => "internal",
        }
    }
}

impl From<serde_json::Error> for OfflineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type alias for Offcache operations.
pub type Result<T> = std::result::Result<T, OfflineError>;

/// Extension trait for Result.
pub trait ResultExt<T> {
    /// Wrap any error as a storage error with context.
    fn storage_context(self, message: impl Into<String>) -> Result<T>;

    /// Wrap any error as a transport error with context.
    fn transport_context(self, message: impl Into<String>) -> Result<T>;
}

impl<T, E: std::error::Error + Send + Sync + 'static> ResultExt<T> for std::result::Result<T, E> {
    fn storage_context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| OfflineError::storage_with_source(message, e))
    }

    fn transport_context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| OfflineError::transport_with_source(message, e))
    }
}

/// Extension trait for Option.
pub trait OptionExt<T> {
    /// Convert None to a NotFound error.
    fn ok_or_not_found(self, resource: impl Into<String>) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_not_found(self, resource: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| OfflineError::NotFound(resource.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        assert_eq!(OfflineError::transport("test").category(), "transport");
        assert_eq!(OfflineError::storage("test").category(), "storage");
        assert_eq!(
            OfflineError::Timeout(Duration::from_secs(1)).category(),
            "timeout"
        );
        assert_eq!(
            OfflineError::precondition("shell").category(),
            "strict_precondition"
        );
    }

    #[test]
    fn test_retryable() {
        assert!(OfflineError::transport("test").is_retryable());
        assert!(OfflineError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!OfflineError::storage("test").is_retryable());
        assert!(!OfflineError::precondition("shell").is_retryable());
    }

    #[test]
    fn test_navigation_failed_keeps_cause() {
        let err = OfflineError::navigation_failed(
            "https://example.com/",
            Some(OfflineError::transport("offline")),
        );
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("Transport error: offline"));
    }

    #[test]
    fn test_storage_context() {
        let io: std::result::Result<(), std::io::Error> =
            Err(std::io::Error::new(std::io::ErrorKind::Other, "disk"));
        let err = io.storage_context("write entry").unwrap_err();
        assert!(matches!(err, OfflineError::Storage { .. }));
        assert_eq!(err.to_string(), "Storage error: write entry");
    }

    #[test]
    fn test_option_ext() {
        let some: Option<i32> = Some(42);
        assert_eq!(some.ok_or_not_found("test").unwrap(), 42);

        let none: Option<i32> = None;
        assert!(matches!(
            none.ok_or_not_found("test"),
            Err(OfflineError::NotFound(_))
        ));
    }
}

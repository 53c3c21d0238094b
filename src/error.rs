//! Error types for the layered cache engine

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, CacheError>;

/// Boxed error returned by upstream providers
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Stable, machine-readable error codes.
///
/// Callers branch on these instead of matching on messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Miss,
    Timeout,
    Full,
    Corrupted,
    Closed,
    Disconnected,
    Io,
    Serialization,
    Config,
    Upstream,
}

impl ErrorCode {
    /// Wire/log representation of the code
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Miss => "CACHE_MISS",
            ErrorCode::Timeout => "CACHE_TIMEOUT",
            ErrorCode::Full => "CACHE_FULL",
            ErrorCode::Corrupted => "CACHE_CORRUPTED",
            ErrorCode::Closed => "CACHE_CLOSED",
            ErrorCode::Disconnected => "CACHE_DISCONNECTED",
            ErrorCode::Io => "CACHE_IO",
            ErrorCode::Serialization => "CACHE_SERIALIZATION",
            ErrorCode::Config => "CACHE_CONFIG",
            ErrorCode::Upstream => "CACHE_UPSTREAM",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur in any cache tier
#[derive(Error, Debug)]
pub enum CacheError {
    // =========================================================================
    // Lookup / Capacity
    // =========================================================================
    /// Key absent or expired. Expected during normal operation.
    #[error("cache miss: {key}")]
    Miss { key: String },

    /// A tier call exceeded its bound
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// Capacity exceeded and eviction could not make room
    #[error("cache full: {size} entries (max {max_size})")]
    Full { size: usize, max_size: usize },

    // =========================================================================
    // Lifecycle
    // =========================================================================
    /// Operation issued after close()
    #[error("cache is closed")]
    Closed,

    /// Remote tier is not connected
    #[error("remote cache is not connected")]
    Disconnected,

    // =========================================================================
    // Persistence
    // =========================================================================
    /// Persisted data unreadable or unparseable
    #[error("cache data corrupted at {path}: {reason}")]
    Corrupted { path: PathBuf, reason: String },

    /// I/O error against a cache file
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Value (de)serialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // =========================================================================
    // Configuration / Collaborators
    // =========================================================================
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Upstream provider failed to fetch
    #[error("upstream provider failed: {source}")]
    Upstream {
        #[source]
        source: BoxError,
    },
}

impl CacheError {
    /// Build a miss for `key`
    pub fn miss(key: impl Into<String>) -> Self {
        CacheError::Miss { key: key.into() }
    }

    /// Wrap an I/O error with the path it happened on
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CacheError::Io {
            path: path.into(),
            source,
        }
    }

    /// Stable code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            CacheError::Miss { .. } => ErrorCode::Miss,
            CacheError::Timeout { .. } => ErrorCode::Timeout,
            CacheError::Full { .. } => ErrorCode::Full,
            CacheError::Closed => ErrorCode::Closed,
            CacheError::Disconnected => ErrorCode::Disconnected,
            CacheError::Corrupted { .. } => ErrorCode::Corrupted,
            CacheError::Io { .. } => ErrorCode::Io,
            CacheError::Serialization(_) => ErrorCode::Serialization,
            CacheError::Config(_) => ErrorCode::Config,
            CacheError::Upstream { .. } => ErrorCode::Upstream,
        }
    }

    /// True when the error means "not here, try elsewhere"
    #[inline]
    pub fn is_miss(&self) -> bool {
        self.code() == ErrorCode::Miss
    }

    /// True for errors raised because the tier was closed
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.code() == ErrorCode::Closed
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(CacheError::miss("k").code().as_str(), "CACHE_MISS");
        assert_eq!(CacheError::Closed.code().as_str(), "CACHE_CLOSED");
        assert_eq!(
            CacheError::Full {
                size: 2,
                max_size: 2
            }
            .code(),
            ErrorCode::Full
        );
    }

    #[test]
    fn test_miss_predicate_does_not_depend_on_identity() {
        let a = CacheError::miss("a");
        let b = CacheError::miss("b");
        assert!(a.is_miss());
        assert!(b.is_miss());
        assert!(!CacheError::Disconnected.is_miss());
    }

    #[test]
    fn test_io_error_keeps_source() {
        use std::error::Error as _;

        let err = CacheError::io(
            "/tmp/x.json",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert_eq!(err.code(), ErrorCode::Io);
        assert!(err.source().is_some());
        assert!(err.to_string().contains("/tmp/x.json"));
    }

    #[test]
    fn test_upstream_wraps_boxed_error() {
        let source: BoxError = "quote api returned 429".into();
        let err = CacheError::Upstream { source };
        assert_eq!(err.code(), ErrorCode::Upstream);
        assert!(err.to_string().contains("429"));
    }
}

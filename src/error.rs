//! Error types for etree-dl
//!
//! The taxonomy mirrors how failures are handled by the acquisition pipeline:
//! - Fatal errors (lock conflicts, exhausted search retries) abort a run before
//!   any fetching begins
//! - Per-identifier errors (rate limiting, HTTP failures, parse failures) are
//!   recorded in the collection's failed list and never abort a batch
//! - State corruption is recovered inside the state store and never surfaces

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for etree-dl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for etree-dl
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "fetch.concurrency")
        key: Option<String>,
    },

    /// Resource lock acquisition or release failed
    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    /// Persistent state could not be read or written
    #[error("state error: {0}")]
    State(#[from] StateError),

    /// Transport-level failure (connect, timeout, body read)
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Remote archive answered with a non-success status other than 429
    #[error("HTTP {status} from {url}")]
    Http {
        /// Response status code
        status: u16,
        /// Requested URL
        url: String,
    },

    /// Remote archive answered with 429 Too Many Requests
    #[error("rate limited by remote archive: {url}")]
    RateLimited {
        /// Requested URL
        url: String,
    },

    /// Response body could not be interpreted
    #[error("failed to parse {context}: {reason}")]
    Parse {
        /// What was being parsed (e.g., "metadata for gd1977-05-08")
        context: String,
        /// Why parsing failed
        reason: String,
    },

    /// Collection search could not complete; the run aborts before fetching
    #[error("search for collection {collection} failed: {source}")]
    Search {
        /// Collection being searched
        collection: String,
        /// Last error observed after retries were exhausted
        #[source]
        source: Box<Error>,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Shutdown in progress - not accepting new runs
    #[error("shutdown in progress: not accepting new runs")]
    ShuttingDown,

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether this error is the remote archive's rate limit response
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Error::RateLimited { .. })
    }

    /// Whether this error is a lock conflict (another holder is active)
    pub fn is_lock_conflict(&self) -> bool {
        matches!(self, Error::Lock(LockError::Conflict { .. }))
    }
}

/// Resource lock errors
#[derive(Debug, Error)]
pub enum LockError {
    /// Another holder owns the lock and the wait window elapsed
    #[error(
        "{operation}:{resource} is held by pid {holder_pid} on {holder_host} since {acquired_at}"
    )]
    Conflict {
        /// Locked operation name
        operation: String,
        /// Locked resource name
        resource: String,
        /// Process id of the current holder
        holder_pid: u32,
        /// Hostname of the current holder
        holder_host: String,
        /// When the holder acquired the lock (RFC 3339)
        acquired_at: String,
    },

    /// The token does not correspond to a lock held by this manager
    #[error("unknown lock token {token}")]
    InvalidToken {
        /// The unrecognized token
        token: String,
    },
}

/// State store errors
#[derive(Debug, Error)]
pub enum StateError {
    /// A persisted document exists but does not parse or fails validation
    #[error("corrupt state file {path}: {reason}")]
    Corrupt {
        /// Path of the corrupt document
        path: PathBuf,
        /// What made it invalid
        reason: String,
    },

    /// An identifier cannot be mapped to a cache path
    #[error("invalid identifier {identifier:?}: {reason}")]
    InvalidIdentifier {
        /// The rejected identifier
        identifier: String,
        /// Why it was rejected
        reason: String,
    },
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_conflict_message_names_holder() {
        let err = Error::Lock(LockError::Conflict {
            operation: "download".to_string(),
            resource: "GratefulDead".to_string(),
            holder_pid: 4242,
            holder_host: "tapebox".to_string(),
            acquired_at: "2024-01-01T00:00:00Z".to_string(),
        });

        let msg = err.to_string();
        assert!(msg.contains("download:GratefulDead"), "got: {msg}");
        assert!(msg.contains("4242"));
        assert!(msg.contains("tapebox"));
        assert!(err.is_lock_conflict());
        assert!(!err.is_rate_limited());
    }

    #[test]
    fn search_error_exposes_source() {
        use std::error::Error as _;

        let err = Error::Search {
            collection: "Phish".to_string(),
            source: Box::new(Error::Http {
                status: 503,
                url: "http://archive/advancedsearch.php".to_string(),
            }),
        };

        assert!(err.to_string().contains("Phish"));
        let source = err.source().expect("search error should carry a source");
        assert!(source.to_string().contains("503"));
    }

    #[test]
    fn rate_limited_is_detected() {
        let err = Error::RateLimited {
            url: "http://archive/metadata/x".to_string(),
        };
        assert!(err.is_rate_limited());
        assert!(!err.is_lock_conflict());
    }

    #[test]
    fn io_error_converts_via_from() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn invalid_token_message() {
        let err: Error = LockError::InvalidToken {
            token: "abc".to_string(),
        }
        .into();
        assert_eq!(err.to_string(), "lock error: unknown lock token abc");
    }
}

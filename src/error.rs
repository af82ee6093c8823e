//! # Error Handling for Transom
//!
//! A single crate-wide [`Error`] enum covers every failure mode, so callers
//! match on one type and function signatures stay small.
//!
//! ## Error Categories
//!
//! | Category | Examples | Typical Response |
//! |----------|----------|------------------|
//! | Upstream auth | sync returned 401 | Terminate the poller, evict the device |
//! | Upstream transient | network error, 5xx, 429 | Exponential backoff, retry forever |
//! | Storage | SQLite failure, schema mismatch | Do not advance `since`; retry next poll |
//! | Client | malformed request, expired session | Reject the single request |
//! | Lifecycle | engine shut down | Fail fast |

use thiserror::Error;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in Transom operations.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Upstream Errors
    // =========================================================================
    /// The upstream homeserver rejected the device's access token.
    ///
    /// Terminal for the poller: the device's session is gone. Any connection
    /// for this device sees [`Error::SessionExpired`] on its next request.
    #[error("upstream rejected credentials (HTTP 401)")]
    UpstreamAuth,

    /// The upstream request failed in a retryable way: network error, 5xx,
    /// 429, or any non-auth 4xx. The poller backs off and retries forever.
    #[error("upstream request failed (status {status:?}): {message}")]
    UpstreamTransient {
        /// HTTP status if a response was received; `None` for network errors.
        status: Option<u16>,
        /// Human-readable cause for logs.
        message: String,
    },

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// SQLite operation failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Schema version mismatch or corruption detected.
    #[error("schema error: {0}")]
    Schema(String),

    /// An event blob could not be parsed far enough to extract its envelope
    /// (`event_id`, `type`, ...). The event is dropped, not the response.
    #[error("malformed event: {0}")]
    BadEvent(String),

    // =========================================================================
    // Client Errors
    // =========================================================================
    /// The client request was structurally invalid (bad ranges, a second
    /// in-flight request on the same `pos`, ...).
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The device behind this connection was evicted after an upstream 401.
    #[error("session expired for device '{device_id}'")]
    SessionExpired {
        /// The device whose upstream session died.
        device_id: String,
    },

    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    /// The engine is shutting down or an internal channel closed.
    #[error("engine closed")]
    Closed,
}

impl Error {
    /// Whether a poller should back off and retry after this error.
    ///
    /// Only [`Error::UpstreamAuth`] is terminal; storage failures are retried
    /// on the next poll without advancing `since`.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Error::UpstreamAuth)
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let transient = Error::UpstreamTransient {
            status: Some(502),
            message: "bad gateway".to_string(),
        };
        assert_eq!(
            transient.to_string(),
            "upstream request failed (status Some(502)): bad gateway"
        );

        let expired = Error::SessionExpired {
            device_id: "FOOBAR".to_string(),
        };
        assert_eq!(expired.to_string(), "session expired for device 'FOOBAR'");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(!Error::UpstreamAuth.is_retryable());
        assert!(Error::UpstreamTransient {
            status: None,
            message: "connection reset".to_string(),
        }
        .is_retryable());
        assert!(Error::Schema("bad version".to_string()).is_retryable());
    }

    #[test]
    fn test_sqlite_error_conversion() {
        let sqlite_err = rusqlite::Error::InvalidParameterName("test".to_string());
        let our_err: Error = sqlite_err.into();
        assert!(matches!(our_err, Error::Sqlite(_)));
        assert!(our_err.to_string().contains("sqlite error"));
    }
}

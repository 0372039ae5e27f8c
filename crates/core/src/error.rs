//! Error types shared by the server runtime.
//!
//! The taxonomy mirrors how failures propagate: configuration and PID-file
//! errors abort startup, fatal errors terminate a worker, protocol errors are
//! answered on the wire, and handler errors are confined to one request.

use std::error::Error as StdError;
use std::io::Error as IoError;

/// A boxed error type for dynamic error handling.
pub type BoxedError = Box<dyn StdError + Send + Sync>;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// The error type used throughout the gantry runtime.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Invalid or contradictory server configuration. Rejected at startup.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// A PID file exists and belongs to another live process, or cannot be
    /// read. Rejected at startup.
    #[error("pid file error: {0}")]
    PidFile(String),
    /// A worker cannot continue (e.g. lifespan startup failed). The worker
    /// exits with code 1 and the supervisor treats it as a crash.
    #[error("fatal: {0}")]
    Fatal(String),
    /// Malformed wire traffic or a protocol contract violation.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Read or write attempted after the peer (or this side) closed the
    /// connection. Surfaced into user handlers at their next await.
    #[error("connection closed")]
    ProtocolClosed,
    /// User handler code failed.
    #[error("handler error: {0}")]
    Handler(BoxedError),
    /// I/O failure.
    #[error("io error: {0}")]
    Io(#[from] IoError),
    /// Error from the hyper HTTP library.
    #[error("http error: {0}")]
    Hyper(#[from] hyper::Error),
}

impl Error {
    /// Create a configuration error for the named option.
    #[inline]
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Wrap any error as a handler error.
    #[inline]
    pub fn handler(error: impl Into<BoxedError>) -> Self {
        Self::Handler(error.into())
    }

    /// Whether this error means the peer connection is gone.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::ProtocolClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_conversion() {
        let err: Error = IoError::other("boom").into();
        assert!(matches!(err, Error::Io(_)));
        assert!(!err.is_closed());
        assert!(Error::ProtocolClosed.is_closed());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            Error::config("blocking_threads").to_string(),
            "invalid configuration: blocking_threads"
        );
        assert_eq!(Error::ProtocolClosed.to_string(), "connection closed");
    }
}

//! Error types for the proxy.

use std::io;
use thiserror::Error;

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the proxy.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed frame from a client or a backend.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Request dialect and codec dialect disagree. A bug; fatal to the
    /// connection that observed it.
    #[error("request does not match codec dialect")]
    BadAssert,

    /// Operation on a connection that already transitioned to closed.
    #[error("connection closed")]
    Closed,

    /// Sentinel: the buffer does not yet hold a complete frame. Absorbed by
    /// the decode loops, never surfaced to clients.
    #[error("incomplete buffer")]
    BufferIncomplete,

    /// I/O failure on a backend socket.
    #[error("backend {addr} io error: {source}")]
    BackendIo {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// I/O failure on a client socket.
    #[error("client io error: {0}")]
    ClientIo(#[source] io::Error),

    /// Failed to establish a backend connection.
    #[error("dial {addr} failed: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The ring is empty; every backend has been ejected.
    #[error("no available backend")]
    NoAvailableBackend,

    /// Command recognized by the dialect but not proxyable.
    #[error("unsupported command '{0}'")]
    Unsupported(String),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// A socket deadline expired.
    #[error("operation timed out")]
    Timeout,
}

impl Error {
    /// Short cause label for the error counter.
    pub fn cause(&self) -> &'static str {
        match self {
            Error::Protocol(_) => "protocol",
            Error::BadAssert => "assert",
            Error::Closed => "closed",
            Error::BufferIncomplete => "incomplete",
            Error::BackendIo { .. } => "backend_io",
            Error::ClientIo(_) => "client_io",
            Error::Dial { .. } => "dial",
            Error::NoAvailableBackend => "no_backend",
            Error::Unsupported(_) => "unsupported",
            Error::Config(_) => "config",
            Error::Timeout => "timeout",
        }
    }

    /// True when the error must terminate the client connection.
    pub fn is_fatal_to_client(&self) -> bool {
        matches!(self, Error::ClientIo(_) | Error::BadAssert | Error::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cause_labels() {
        assert_eq!(Error::BadAssert.cause(), "assert");
        assert_eq!(Error::NoAvailableBackend.cause(), "no_backend");
        assert_eq!(Error::Unsupported("KEYS".into()).cause(), "unsupported");
    }

    #[test]
    fn test_fatal_classification() {
        assert!(Error::ClientIo(io::Error::new(io::ErrorKind::Other, "x")).is_fatal_to_client());
        assert!(Error::BadAssert.is_fatal_to_client());
        assert!(!Error::NoAvailableBackend.is_fatal_to_client());
        assert!(!Error::Protocol("bad line".into()).is_fatal_to_client());
    }
}

//! Error types for the ingestion crate.
//!
//! `IngestError` is the top-level error returned by opening sources, pulling events and
//! loading configuration. Lower layers have their own narrower enums which convert into it
//! with `?`:
//!
//! - [`RingError`](crate::ring::RingError): publish/consume outcomes of a ring channel.
//! - [`CodecError`](crate::codec::CodecError): malformed packet-capture or SAMPA bytes.
//!
//! ## Error classes
//!
//! - **Transient** (`Io` during a read, connection refused): retried inside the connection
//!   handler and only surfaced once the retry bound is exhausted as `ConnectFailed`.
//! - **Desynchronization** (`Desync`): the byte stream can no longer be trusted; the
//!   connection is torn down and re-established.
//! - **Fatal** (`AllSourcesFailed`, `SourcesExhausted`, `ChannelStall`): returned to the caller.

use crate::codec::CodecError;
use crate::ring::RingError;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, IngestError>;

/// Primary error type for ingestion.
#[derive(Error, Debug)]
pub enum IngestError {
    /// Configuration file or environment parsing failed.
    ///
    /// **Error Type**: Permanent - requires fixing the configuration source.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration parsed but is semantically invalid (e.g. port 0, no sources).
    ///
    /// **Error Type**: Permanent - caught by `IngestConfig::validate()`.
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// Underlying socket or file I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Connecting to an endpoint failed after every retry.
    ///
    /// **Recovery Strategy**: check that the producer is listening; the handler has already
    /// applied its connect retry policy.
    #[error("Could not connect to {endpoint} after {attempts} attempt(s): {message}")]
    ConnectFailed {
        /// `host:port` of the endpoint.
        endpoint: String,
        /// Number of connection attempts made.
        attempts: u32,
        /// Last error observed.
        message: String,
    },

    /// A frame length prefix was outside `1..=max`.
    ///
    /// **Error Type**: Desynchronization - the connection is torn down and reconnected.
    #[error("Stream desynchronized: frame length {length} outside 1..={max}")]
    Desync {
        /// The decoded (signed) length prefix.
        length: i64,
        /// Configured maximum frame size.
        max: u32,
    },

    /// The consumer did not drain the ring before the publish timeout elapsed.
    ///
    /// **Error Type**: Fatal for the affected source.
    #[error("Ring channel stalled: consumer made no room within {timeout_ms} ms")]
    ChannelStall {
        /// Publish timeout that elapsed.
        timeout_ms: u64,
    },

    /// No source could be opened.
    #[error("All {} source(s) failed to open: {}", .errors.len(), .errors.join("; "))]
    AllSourcesFailed {
        /// One message per source, in source order.
        errors: Vec<String>,
    },

    /// Every source has failed permanently and no buffered events remain.
    #[error("All sources exhausted: no connected source and no buffered events")]
    SourcesExhausted,

    /// Operation requires an open source or aggregator.
    #[error("Source is not open")]
    NotOpen,

    /// The handler was stopped and cannot be reopened.
    #[error("Connection handler for {endpoint} was stopped")]
    Stopped {
        /// `host:port` of the endpoint.
        endpoint: String,
    },

    /// A handler thread panicked; detected when joining it.
    #[error("Connection handler thread for {endpoint} panicked")]
    WorkerPanicked {
        /// `host:port` of the endpoint.
        endpoint: String,
    },

    /// Malformed wire data.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Ring channel publish/consume failure.
    #[error(transparent)]
    Ring(#[from] RingError),
}

impl From<figment::Error> for IngestError {
    fn from(err: figment::Error) -> Self {
        IngestError::Config(Box::new(err))
    }
}

impl IngestError {
    /// Whether the handler should attempt to re-establish the connection after this error.
    pub fn is_reconnectable(&self) -> bool {
        matches!(self, IngestError::Io(_) | IngestError::Desync { .. })
    }
}

//! Transport error types.

use crate::compression::CompressionError;

/// Errors raised while moving rows over a socket.
///
/// None of these are retried once a stream is established; the owning step
/// treats every variant as fatal.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Socket read/write failure.
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    /// The peer never became reachable inside the retry window.
    #[error("could not connect to {host}:{port} after {attempts} attempts: {source}")]
    Connect {
        host: String,
        port: u16,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    /// The writer could not open its listening socket.
    #[error("could not listen on {host}:{port}: {source}")]
    Bind {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// No reader connected before the accept timeout expired.
    #[error("no reader connected to {addr} within {waited_ms} ms")]
    AcceptTimeout { addr: String, waited_ms: u128 },

    /// The byte stream does not decode as row metadata or rows.
    #[error("corrupt row stream: {0} (possible compression mismatch between writer and reader)")]
    Corrupt(String),

    /// The stream ended in the middle of a row.
    #[error("row stream truncated inside a row")]
    Truncated,

    /// A row does not match the metadata the stream was opened with.
    #[error("row does not match stream metadata: {0}")]
    Layout(String),

    /// Rows were written before the metadata.
    #[error("row metadata must be written before the first row")]
    MetaNotSent,

    #[error(transparent)]
    Compression(#[from] CompressionError),

    /// The run was stopped while waiting on the socket.
    #[error("transport stopped")]
    Stopped,
}

impl TransportError {
    /// Map a decode-time I/O error: short reads become [`TransportError::Truncated`],
    /// undecodable bytes become [`TransportError::Corrupt`].
    #[must_use]
    pub fn from_decode(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => Self::Truncated,
            std::io::ErrorKind::InvalidData => Self::Corrupt(err.to_string()),
            _ => Self::Io(err),
        }
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, TransportError>;

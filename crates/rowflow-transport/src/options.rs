//! Tunables shared by transport readers and writers.

use std::time::Duration;

use rowflow_types::{ClusterSchema, CompressionCodec};

/// Socket settings for one row stream. Both ends of a cut must use the same
/// `compression`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportOptions {
    pub compression: Option<CompressionCodec>,
    /// Size of the buffered reader/writer wrapped around the socket.
    pub buffer_size: usize,
    /// Total window for reader connection attempts.
    pub connect_timeout: Duration,
    /// Pause between reader connection attempts.
    pub retry_interval: Duration,
    /// How long a writer waits for its reader. `None` waits until stopped.
    pub accept_timeout: Option<Duration>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            compression: None,
            buffer_size: 50_000,
            connect_timeout: Duration::from_secs(30),
            retry_interval: Duration::from_secs(1),
            accept_timeout: None,
        }
    }
}

impl TransportOptions {
    /// Settings carried by a cluster schema.
    #[must_use]
    pub fn from_schema(schema: &ClusterSchema) -> Self {
        Self {
            compression: schema.compression,
            buffer_size: schema.sockets_buffer_size.max(1),
            connect_timeout: Duration::from_millis(schema.connect_timeout_ms),
            retry_interval: Duration::from_millis(schema.retry_interval_ms),
            accept_timeout: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowflow_types::SlaveServer;

    #[test]
    fn test_from_schema_copies_tunables() {
        let schema = ClusterSchema::new("c", vec![SlaveServer::new("m", "h", 1).as_master()])
            .with_compression(Some(CompressionCodec::Zstd));
        let opts = TransportOptions::from_schema(&schema);
        assert_eq!(opts.compression, Some(CompressionCodec::Zstd));
        assert_eq!(opts.buffer_size, 50_000);
        assert_eq!(opts.connect_timeout, Duration::from_secs(30));
        assert_eq!(opts.retry_interval, Duration::from_secs(1));
    }
}

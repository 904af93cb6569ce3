//! Consuming end of a row stream.

use std::io::BufReader;
use std::net::TcpStream;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use rowflow_types::{Row, RowMeta};

use crate::codec;
use crate::compression::CompressedReader;
use crate::error::{Result, TransportError};
use crate::options::TransportOptions;
use crate::socket::{self, StoppableStream};

/// Connected reader. The metadata is read once on open; rows follow until a
/// clean EOF.
///
/// Any error force-closes the socket; the stream is never resumed. Raising
/// the stop flag ends a blocked read with [`TransportError::Stopped`].
pub struct RowStreamReader {
    socket: Option<TcpStream>,
    stop: Arc<AtomicBool>,
    input: CompressedReader<BufReader<StoppableStream>>,
    meta: RowMeta,
    rows_read: u64,
}

impl RowStreamReader {
    /// Connect to a writer with bounded retry and read its metadata.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Connect`] when the retry window is
    /// exhausted, [`TransportError::Stopped`], or any metadata decode error.
    pub fn connect(
        host: &str,
        port: u16,
        options: &TransportOptions,
        stop: &Arc<AtomicBool>,
    ) -> Result<Self> {
        let stream = socket::connect_with_retry(
            host,
            port,
            options.connect_timeout,
            options.retry_interval,
            stop,
        )?;
        Self::from_stream(stream, options, Arc::clone(stop))
    }

    /// Wrap an already connected stream and read the metadata.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata cannot be decoded, or
    /// [`TransportError::Stopped`] if `stop` was raised while waiting for it.
    pub fn from_stream(
        stream: TcpStream,
        options: &TransportOptions,
        stop: Arc<AtomicBool>,
    ) -> Result<Self> {
        let socket = stream.try_clone()?;
        let readable = StoppableStream::new(stream, Arc::clone(&stop))?;
        let buffered = BufReader::with_capacity(options.buffer_size, readable);
        let mut input = CompressedReader::new(buffered, options.compression)?;
        let meta = match codec::read_meta(&mut input) {
            Ok(meta) => meta,
            Err(e) => {
                socket::force_close(socket);
                return Err(stopped_or(&stop, e));
            }
        };
        Ok(Self {
            socket: Some(socket),
            stop,
            input,
            meta,
            rows_read: 0,
        })
    }

    #[must_use]
    pub fn meta(&self) -> &RowMeta {
        &self.meta
    }

    #[must_use]
    pub fn rows_read(&self) -> u64 {
        self.rows_read
    }

    /// Next row, or `None` at end of stream.
    ///
    /// # Errors
    ///
    /// Returns the decode or socket error after force-closing the socket,
    /// or [`TransportError::Stopped`] when the stop flag ended the read.
    pub fn next_row(&mut self) -> Result<Option<Row>> {
        match codec::read_row(&mut self.input, &self.meta) {
            Ok(Some(row)) => {
                self.rows_read += 1;
                Ok(Some(row))
            }
            Ok(None) => {
                self.close();
                Ok(None)
            }
            Err(e) => {
                self.close();
                Err(stopped_or(&self.stop, e))
            }
        }
    }

    /// Shut down the socket. Idempotent.
    pub fn close(&mut self) {
        if let Some(socket) = self.socket.take() {
            socket::force_close(socket);
        }
    }
}

fn stopped_or(stop: &AtomicBool, err: TransportError) -> TransportError {
    if stop.load(std::sync::atomic::Ordering::Acquire) {
        TransportError::Stopped
    } else {
        err
    }
}

impl Drop for RowStreamReader {
    fn drop(&mut self) {
        self.close();
    }
}

//! Producing end of a row stream.

use std::io::{BufWriter, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::AtomicBool;

use bytes::BytesMut;
use rowflow_types::{Row, RowMeta};

use crate::codec;
use crate::compression::CompressedWriter;
use crate::error::{Result, TransportError};
use crate::options::TransportOptions;
use crate::socket;

/// A bound, not yet connected, writer socket.
///
/// Binding happens before any reader is started so the reader's first
/// connection attempt can already succeed.
pub struct RowStreamListener {
    listener: TcpListener,
    options: TransportOptions,
}

impl RowStreamListener {
    /// Bind `host:port`. Port 0 picks an ephemeral port.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Bind`] if the address is unavailable.
    pub fn bind(host: &str, port: u16, options: TransportOptions) -> Result<Self> {
        let listener = socket::bind_listener(host, port)?;
        tracing::debug!(host, port, "transport writer listening");
        Ok(Self { listener, options })
    }

    /// # Errors
    ///
    /// Returns an error if the socket has no local address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Wait for the single reader, checking `stop` while idle.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Stopped`], [`TransportError::AcceptTimeout`]
    /// or a socket error.
    pub fn accept(self, stop: &AtomicBool) -> Result<RowStreamWriter> {
        let stream = socket::accept_one(&self.listener, self.options.accept_timeout, stop)?;
        RowStreamWriter::from_stream(stream, &self.options)
    }
}

/// Connected writer. Sends the metadata once, then rows.
pub struct RowStreamWriter {
    socket: TcpStream,
    output: CompressedWriter<BufWriter<TcpStream>>,
    meta: Option<RowMeta>,
    buf: BytesMut,
    rows_written: u64,
}

impl RowStreamWriter {
    /// Wrap an already connected stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be cloned or the encoder fails
    /// to start.
    pub fn from_stream(stream: TcpStream, options: &TransportOptions) -> Result<Self> {
        let socket = stream.try_clone()?;
        let buffered = BufWriter::with_capacity(options.buffer_size, stream);
        let output = CompressedWriter::new(buffered, options.compression)?;
        Ok(Self {
            socket,
            output,
            meta: None,
            buf: BytesMut::with_capacity(4096),
            rows_written: 0,
        })
    }

    /// Send the stream metadata. Must be called exactly once, before rows.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn write_meta(&mut self, meta: &RowMeta) -> Result<()> {
        codec::write_meta(&mut self.output, meta)?;
        self.meta = Some(meta.clone());
        Ok(())
    }

    #[must_use]
    pub fn meta_sent(&self) -> bool {
        self.meta.is_some()
    }

    /// Send one row.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::MetaNotSent`], [`TransportError::Layout`] or
    /// a socket error.
    pub fn write_row(&mut self, row: &Row) -> Result<()> {
        let meta = self.meta.as_ref().ok_or(TransportError::MetaNotSent)?;
        self.buf.clear();
        codec::encode_row(meta, row, &mut self.buf)?;
        self.output.write_all(&self.buf)?;
        self.rows_written += 1;
        Ok(())
    }

    #[must_use]
    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    /// Flush, write the compression trailer, and close. The reader sees a
    /// clean end of stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the trailer or flush fails.
    pub fn finish(self) -> Result<u64> {
        let Self {
            socket,
            output,
            rows_written,
            ..
        } = self;
        let mut buffered = output.finish()?;
        let flushed = buffered.flush();
        drop(buffered);
        socket::force_close(socket);
        flushed?;
        Ok(rows_written)
    }

    /// Close without finishing; the reader sees a truncated stream.
    pub fn abort(self) {
        socket::force_close(self.socket);
    }
}

//! Whole-stream compression wrappers for the row transport.
//!
//! The writer wraps its socket in a [`CompressedWriter`] and the reader in a
//! [`CompressedReader`]. Decoder failures surface as
//! [`std::io::ErrorKind::InvalidData`] so the codec layer can report them as a
//! corrupt stream.

use std::io::{self, BufReader, Read, Write};

use thiserror::Error;

pub use rowflow_types::CompressionCodec;

/// Zstd level used for node-to-node row streams.
const ZSTD_COMPRESSION_LEVEL: i32 = 1;

#[derive(Debug, Error)]
pub enum CompressionError {
    #[error("lz4 frame finish failed: {0}")]
    Lz4Finish(String),
    #[error("zstd stream failed: {0}")]
    Zstd(#[source] io::Error),
}

/// Output side: plain or compressing.
pub enum CompressedWriter<W: Write> {
    Plain(W),
    Lz4(lz4_flex::frame::FrameEncoder<W>),
    Zstd(zstd::stream::write::Encoder<'static, W>),
}

impl<W: Write> CompressedWriter<W> {
    /// Wrap `inner` for `codec`.
    ///
    /// # Errors
    ///
    /// Returns an error if the zstd encoder cannot be created.
    pub fn new(inner: W, codec: Option<CompressionCodec>) -> Result<Self, CompressionError> {
        Ok(match codec {
            None => Self::Plain(inner),
            Some(CompressionCodec::Lz4) => Self::Lz4(lz4_flex::frame::FrameEncoder::new(inner)),
            Some(CompressionCodec::Zstd) => Self::Zstd(
                zstd::stream::write::Encoder::new(inner, ZSTD_COMPRESSION_LEVEL)
                    .map_err(CompressionError::Zstd)?,
            ),
        })
    }

    /// Write the compression trailer and return the inner writer.
    ///
    /// # Errors
    ///
    /// Returns an error if the trailer cannot be written.
    pub fn finish(self) -> Result<W, CompressionError> {
        match self {
            Self::Plain(w) => Ok(w),
            Self::Lz4(enc) => enc
                .finish()
                .map_err(|e| CompressionError::Lz4Finish(e.to_string())),
            Self::Zstd(enc) => enc.finish().map_err(CompressionError::Zstd),
        }
    }
}

impl<W: Write> Write for CompressedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(w) => w.write(buf),
            Self::Lz4(w) => w.write(buf),
            Self::Zstd(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(w) => w.flush(),
            Self::Lz4(w) => w.flush(),
            Self::Zstd(w) => w.flush(),
        }
    }
}

/// Input side: plain or decompressing.
pub enum CompressedReader<R: Read> {
    Plain(R),
    Lz4(lz4_flex::frame::FrameDecoder<R>),
    Zstd(zstd::stream::read::Decoder<'static, BufReader<R>>),
}

impl<R: Read> CompressedReader<R> {
    /// Wrap `inner` for `codec`.
    ///
    /// # Errors
    ///
    /// Returns an error if the zstd decoder cannot be created.
    pub fn new(inner: R, codec: Option<CompressionCodec>) -> Result<Self, CompressionError> {
        Ok(match codec {
            None => Self::Plain(inner),
            Some(CompressionCodec::Lz4) => Self::Lz4(lz4_flex::frame::FrameDecoder::new(inner)),
            Some(CompressionCodec::Zstd) => Self::Zstd(
                zstd::stream::read::Decoder::new(inner).map_err(CompressionError::Zstd)?,
            ),
        })
    }
}

fn decode_failure(codec: CompressionCodec, err: io::Error) -> io::Error {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        return err;
    }
    io::Error::new(io::ErrorKind::InvalidData, format!("{codec} decode failed: {err}"))
}

impl<R: Read> Read for CompressedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(r) => r.read(buf),
            Self::Lz4(r) => r
                .read(buf)
                .map_err(|e| decode_failure(CompressionCodec::Lz4, e)),
            Self::Zstd(r) => r
                .read(buf)
                .map_err(|e| decode_failure(CompressionCodec::Zstd, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(codec: Option<CompressionCodec>, data: &[u8]) -> Vec<u8> {
        let mut writer = CompressedWriter::new(Vec::new(), codec).unwrap();
        writer.write_all(data).unwrap();
        let encoded = writer.finish().unwrap();
        let mut reader = CompressedReader::new(encoded.as_slice(), codec).unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn test_stream_roundtrip_every_codec() {
        let data = b"row row row your boat ".repeat(200);
        for codec in [None, Some(CompressionCodec::Lz4), Some(CompressionCodec::Zstd)] {
            assert_eq!(roundtrip(codec, &data), data);
        }
    }

    #[test]
    fn test_lz4_compresses_repetitive_stream() {
        let data = vec![42u8; 10_000];
        let mut writer = CompressedWriter::new(Vec::new(), Some(CompressionCodec::Lz4)).unwrap();
        writer.write_all(&data).unwrap();
        let encoded = writer.finish().unwrap();
        assert!(encoded.len() < data.len() / 2);
    }

    #[test]
    fn test_plain_bytes_fail_lz4_decoder_as_invalid_data() {
        let plain = vec![0u8, 0, 0, 2, 0, 0, 0, 5, 1, 2, 3, 4];
        let mut reader =
            CompressedReader::new(plain.as_slice(), Some(CompressionCodec::Lz4)).unwrap();
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_empty_stream_roundtrip() {
        assert!(roundtrip(Some(CompressionCodec::Zstd), b"").is_empty());
        assert!(roundtrip(None, b"").is_empty());
    }
}

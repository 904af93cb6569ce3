//! Socket transport steps inserted at cluster cuts.
//!
//! The writer runs on the producing node and owns the listening socket; the
//! reader runs on the consuming node and connects to it.

use std::sync::Arc;
use std::time::Duration;

use rowflow_transport::{
    RowStreamListener, RowStreamReader, RowStreamWriter, TransportError, TransportOptions,
};
use rowflow_types::{CompressionCodec, RowMeta};
use serde::{Deserialize, Serialize};

use crate::error::StepError;
use crate::step::{Step, StepContext};

fn default_buffer_size() -> usize {
    TransportOptions::default().buffer_size
}

fn default_connect_timeout_ms() -> u64 {
    30_000
}

fn default_retry_interval_ms() -> u64 {
    1_000
}

/// Settings shared by both transport steps. Both ends of a cut get the
/// same values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportSettings {
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<CompressionCodec>,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
}

impl TransportSettings {
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            compression: None,
            buffer_size: default_buffer_size(),
            connect_timeout_ms: default_connect_timeout_ms(),
            retry_interval_ms: default_retry_interval_ms(),
        }
    }

    #[must_use]
    pub fn options(&self) -> TransportOptions {
        TransportOptions {
            compression: self.compression,
            buffer_size: self.buffer_size.max(1),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            retry_interval: Duration::from_millis(self.retry_interval_ms),
            accept_timeout: None,
        }
    }

    /// Settings as step JSON.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        let mut value = serde_json::json!({
            "host": self.host,
            "port": self.port,
            "buffer_size": self.buffer_size,
            "connect_timeout_ms": self.connect_timeout_ms,
            "retry_interval_ms": self.retry_interval_ms,
        });
        if let (Some(codec), Some(map)) = (self.compression, value.as_object_mut()) {
            map.insert("compression".into(), codec.to_string().into());
        }
        value
    }
}

/// Sends its input rows to one remote [`TransportReaderStep`].
#[derive(Default)]
pub struct TransportWriterStep {
    listener: Option<RowStreamListener>,
    writer: Option<RowStreamWriter>,
}

impl Step for TransportWriterStep {
    /// Binds here so the socket exists before any reader is started.
    fn init(&mut self, ctx: &mut StepContext) -> Result<(), StepError> {
        let settings: TransportSettings = ctx.settings()?;
        let listener = RowStreamListener::bind(&settings.host, settings.port, settings.options())?;
        tracing::debug!(
            step = %ctx.label(),
            host = %settings.host,
            port = settings.port,
            "transport writer bound"
        );
        self.listener = Some(listener);
        Ok(())
    }

    fn process_row(&mut self, ctx: &mut StepContext) -> Result<bool, StepError> {
        if self.writer.is_none() {
            let Some(listener) = self.listener.take() else {
                return Err(StepError::fatal("transport writer has no listening socket"));
            };
            match listener.accept(ctx.stop_flag()) {
                Ok(writer) => self.writer = Some(writer),
                Err(TransportError::Stopped) => return Ok(false),
                Err(e) => return Err(e.into()),
            }
        }
        let Some(writer) = self.writer.as_mut() else {
            return Ok(false);
        };

        match ctx.get_row()? {
            Some((meta, row)) => {
                if !writer.meta_sent() {
                    writer.write_meta(&meta)?;
                }
                writer.write_row(&row)?;
                ctx.inc_lines_output();
                Ok(true)
            }
            None if ctx.is_stopped() => Ok(false),
            None => {
                if !writer.meta_sent() {
                    writer.write_meta(&RowMeta::default())?;
                }
                if let Some(writer) = self.writer.take() {
                    let rows = writer.finish()?;
                    tracing::debug!(step = %ctx.label(), rows, "transport stream finished");
                }
                Ok(false)
            }
        }
    }

    /// A writer still open here did not finish cleanly; the reader sees a
    /// truncated stream.
    fn dispose(&mut self, _ctx: &mut StepContext) {
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
        self.listener = None;
    }
}

/// Receives rows from one remote [`TransportWriterStep`].
#[derive(Default)]
pub struct TransportReaderStep {
    settings: Option<TransportSettings>,
    reader: Option<RowStreamReader>,
    meta: Option<Arc<RowMeta>>,
}

impl Step for TransportReaderStep {
    fn init(&mut self, ctx: &mut StepContext) -> Result<(), StepError> {
        self.settings = Some(ctx.settings()?);
        Ok(())
    }

    fn process_row(&mut self, ctx: &mut StepContext) -> Result<bool, StepError> {
        if self.reader.is_none() {
            let Some(settings) = &self.settings else {
                return Err(StepError::fatal("transport reader was not initialized"));
            };
            let reader = match RowStreamReader::connect(
                &settings.host,
                settings.port,
                &settings.options(),
                ctx.stop_flag(),
            ) {
                Ok(reader) => reader,
                Err(TransportError::Stopped) => return Ok(false),
                Err(e) => return Err(e.into()),
            };
            tracing::debug!(
                step = %ctx.label(),
                host = %settings.host,
                port = settings.port,
                fields = reader.meta().len(),
                "transport reader connected"
            );
            self.meta = Some(Arc::new(reader.meta().clone()));
            self.reader = Some(reader);
        }
        let (Some(reader), Some(meta)) = (self.reader.as_mut(), &self.meta) else {
            return Ok(false);
        };

        match reader.next_row() {
            Ok(Some(row)) => {
                ctx.inc_lines_input();
                Ok(ctx.put_row(Arc::clone(meta), row))
            }
            Ok(None) | Err(TransportError::Stopped) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn dispose(&mut self, _ctx: &mut StepContext) {
        if let Some(mut reader) = self.reader.take() {
            reader.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_json_round_trips() {
        let mut settings = TransportSettings::new("10.0.0.1", 40001);
        settings.compression = Some(CompressionCodec::Lz4);
        let back: TransportSettings = serde_json::from_value(settings.to_json()).unwrap();
        assert_eq!(back, settings);
    }

    #[test]
    fn test_settings_defaults() {
        let settings: TransportSettings =
            serde_json::from_value(serde_json::json!({"host": "h", "port": 1})).unwrap();
        let options = settings.options();
        assert_eq!(options.compression, None);
        assert_eq!(options.connect_timeout, Duration::from_secs(30));
        assert_eq!(options.retry_interval, Duration::from_secs(1));
    }
}

//! Shared rowflow data model types.
//!
//! Used by the transport, engine, and CLI crates: values and rows, row
//! metadata, run results, cluster topology, and per-run execution settings.

#![warn(clippy::pedantic)]

pub mod cluster;
pub mod compression;
pub mod execution;
pub mod result;
pub mod row;
pub mod value;
pub mod variables;

pub use cluster::{ClusterSchema, ClusterSchemaError, SlaveServer};
pub use compression::CompressionCodec;
pub use execution::{ExecutionConfiguration, LogLevel};
pub use result::{
    FailureKind, FailureReport, PipelineResult, ResultFile, StepCounters, StepState, StepStatus,
};
pub use row::{FieldMeta, Row, RowMeta};
pub use value::{Value, ValueType};
pub use variables::Variables;

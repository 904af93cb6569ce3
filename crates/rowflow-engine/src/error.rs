//! Pipeline and step error model.

use std::sync::Arc;

use rowflow_transport::TransportError;
use rowflow_types::{FailureKind, FailureReport, Row, RowMeta};

/// Error of a whole run, or of the coordination around it.
///
/// `Infrastructure` wraps opaque host-side errors (thread spawn, task join,
/// config file I/O) that do not belong to a particular step or slave.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The graph or a step's settings are unusable. Raised before any row flows.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A row failed and its step declares no error hop.
    #[error("row processing failed in {step}: {message}")]
    RowProcessing { step: String, message: String },

    /// A step failed in a way that cannot be confined to one row.
    #[error("step {step} failed: {message}")]
    StepFatal { step: String, message: String },

    /// Socket row transport failure at a cut.
    #[error("transport failure in {step}: {source}")]
    Transport {
        step: String,
        #[source]
        source: TransportError,
    },

    /// A slave could not be reached or rejected a request.
    #[error("cluster coordination with '{slave}' failed: {message}")]
    ClusterCoordination { slave: String, message: String },

    /// Releasing a slave's resources failed after the run.
    #[error("cleanup on '{slave}' failed: {message}")]
    Cleanup { slave: String, message: String },

    #[error(transparent)]
    Infrastructure(#[from] anyhow::Error),
}

impl PipelineError {
    #[must_use]
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Validation(_) => FailureKind::Validation,
            Self::RowProcessing { .. } => FailureKind::RowProcessing,
            Self::StepFatal { .. } => FailureKind::StepFatal,
            Self::Transport { .. } => FailureKind::Transport,
            Self::ClusterCoordination { .. } => FailureKind::ClusterCoordination,
            Self::Cleanup { .. } => FailureKind::Cleanup,
            Self::Infrastructure(_) => FailureKind::Infrastructure,
        }
    }

    /// The step or slave the error is attributed to, if any.
    #[must_use]
    pub fn origin(&self) -> String {
        match self {
            Self::RowProcessing { step, .. }
            | Self::StepFatal { step, .. }
            | Self::Transport { step, .. } => step.clone(),
            Self::ClusterCoordination { slave, .. } | Self::Cleanup { slave, .. } => slave.clone(),
            Self::Validation(_) | Self::Infrastructure(_) => String::new(),
        }
    }

    #[must_use]
    pub fn report(&self) -> FailureReport {
        FailureReport {
            kind: self.kind(),
            origin: self.origin(),
            message: self.to_string(),
        }
    }

    pub(crate) fn coordination(slave: &str, message: impl std::fmt::Display) -> Self {
        Self::ClusterCoordination {
            slave: slave.to_string(),
            message: message.to_string(),
        }
    }
}

/// Error returned by a [`Step`](crate::Step) implementation.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    /// Settings could not be resolved or are missing required fields.
    #[error("invalid settings: {0}")]
    Settings(String),

    /// One row could not be processed. Routed to the error hop if the step
    /// declares one.
    #[error("{message}")]
    Row {
        meta: Arc<RowMeta>,
        row: Row,
        code: String,
        message: String,
    },

    #[error("{0}")]
    Fatal(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl StepError {
    /// A per-row failure carrying the offending row.
    pub fn row(
        meta: Arc<RowMeta>,
        row: Row,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Row {
            meta,
            row,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    /// Convert to a run error attributed to `step` (formatted `node/step.copy`).
    #[must_use]
    pub fn into_pipeline_error(self, step: &str) -> PipelineError {
        let step = step.to_string();
        match self {
            Self::Settings(message) => PipelineError::Validation(format!("{step}: {message}")),
            Self::Row { message, code, .. } => PipelineError::RowProcessing {
                step,
                message: format!("[{code}] {message}"),
            },
            Self::Fatal(message) => PipelineError::StepFatal { step, message },
            Self::Transport(source) => PipelineError::Transport { step, source },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_and_origin_follow_variant() {
        let err = PipelineError::coordination("s1", "connection refused");
        assert_eq!(err.kind(), FailureKind::ClusterCoordination);
        assert_eq!(err.origin(), "s1");
        let report = err.report();
        assert!(report.message.contains("connection refused"));
    }

    #[test]
    fn test_pipeline_error_from_anyhow() {
        let err: PipelineError = anyhow::anyhow!("thread spawn failed").into();
        assert!(matches!(err, PipelineError::Infrastructure(_)));
        assert_eq!(err.kind(), FailureKind::Infrastructure);
        assert!(err.to_string().contains("thread spawn failed"));
    }

    #[test]
    fn test_step_error_conversion() {
        let meta = Arc::new(RowMeta::default());
        let err = StepError::row(meta, Row::default(), "E42", "bad value")
            .into_pipeline_error("local/calc.0");
        assert_eq!(err.kind(), FailureKind::RowProcessing);
        assert_eq!(err.origin(), "local/calc.0");
        assert!(err.to_string().contains("[E42] bad value"));

        let err = StepError::Settings("missing 'port'".into()).into_pipeline_error("local/w.0");
        assert_eq!(err.kind(), FailureKind::Validation);

        let err = StepError::from(TransportError::Truncated).into_pipeline_error("local/r.0");
        assert_eq!(err.kind(), FailureKind::Transport);
    }
}

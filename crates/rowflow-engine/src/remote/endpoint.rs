use std::fmt;

use rowflow_types::{ExecutionConfiguration, PipelineResult};
use serde::{Deserialize, Serialize};

use crate::meta::PipelineMeta;

/// A sub-graph submitted to one slave for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlaveJob {
    pub run_id: String,
    pub meta: PipelineMeta,
    pub config: ExecutionConfiguration,
}

/// Progress of one run on one slave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Submitted,
    /// Steps are being initialized; nothing can be fetched yet.
    Preparing,
    Prepared,
    Running,
    /// Every unit has stopped cleanly; the result can be fetched.
    Finished,
    /// The run ended unsuccessfully, in prepare or while running. The
    /// result, with its failure report, can be fetched.
    Failed,
}

impl RunState {
    /// Whether the run has ended and its result is available.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Submitted => "submitted",
            Self::Preparing => "preparing",
            Self::Prepared => "prepared",
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Failed => "failed",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("I/O error talking to slave: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed message: {0}")]
    Protocol(String),

    /// The slave understood the request and refused or failed it.
    #[error("{0}")]
    Rejected(String),

    #[error("unknown run '{0}'")]
    UnknownRun(String),

    #[error("invalid credentials")]
    Unauthorized,
}

/// Execution endpoint of one slave server. Calls block; the clustered
/// strategy drives them from blocking tasks.
pub trait SlaveEndpoint: Send + Sync {
    /// Server name, for logs and failure reports.
    fn name(&self) -> &str;

    /// Register a job. No resources are allocated yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the slave cannot be reached or refuses the job.
    fn submit(&self, job: SlaveJob) -> Result<(), EndpointError>;

    /// Build and initialize the job's graph; transport writers bind here.
    ///
    /// # Errors
    ///
    /// Returns [`EndpointError::Rejected`] with the validation failure.
    fn prepare(&self, run_id: &str) -> Result<(), EndpointError>;

    /// Start every unit of a prepared job.
    ///
    /// # Errors
    ///
    /// Returns an error if the run is unknown or not prepared.
    fn start(&self, run_id: &str) -> Result<(), EndpointError>;

    /// # Errors
    ///
    /// Returns an error if the slave cannot be reached or the run is unknown.
    fn status(&self, run_id: &str) -> Result<RunState, EndpointError>;

    /// Result of a finished or failed run.
    ///
    /// # Errors
    ///
    /// Returns an error if the run has not reached a terminal state.
    fn fetch_result(&self, run_id: &str) -> Result<PipelineResult, EndpointError>;

    /// Raise the run's stop flag. Unknown runs are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error only if the slave cannot be reached.
    fn stop(&self, run_id: &str) -> Result<(), EndpointError>;

    /// Stop the run if needed and release everything it holds. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error only if the slave cannot be reached.
    fn cleanup(&self, run_id: &str) -> Result<(), EndpointError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(RunState::Finished.is_terminal());
        assert!(RunState::Failed.is_terminal());
        for state in [
            RunState::Submitted,
            RunState::Preparing,
            RunState::Prepared,
            RunState::Running,
        ] {
            assert!(!state.is_terminal(), "{state}");
        }
    }

    #[test]
    fn test_failed_state_wire_name() {
        assert_eq!(serde_json::to_string(&RunState::Failed).unwrap(), "\"failed\"");
        let back: RunState = serde_json::from_str("\"preparing\"").unwrap();
        assert_eq!(back, RunState::Preparing);
    }
}

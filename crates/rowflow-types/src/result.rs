//! Pipeline run results: counters, per-step status, failure identification.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::row::Row;

/// Row counters kept by one step copy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepCounters {
    /// Rows taken from input queues.
    pub lines_read: u64,
    /// Rows put on output queues.
    pub lines_written: u64,
    /// Rows read from an external source (file, socket, database).
    pub lines_input: u64,
    /// Rows written to an external target.
    pub lines_output: u64,
    pub lines_updated: u64,
    /// Rows diverted to an error hop.
    pub lines_rejected: u64,
    pub errors: u64,
}

impl StepCounters {
    /// Add another counter set field by field.
    pub fn absorb(&mut self, other: &StepCounters) {
        self.lines_read += other.lines_read;
        self.lines_written += other.lines_written;
        self.lines_input += other.lines_input;
        self.lines_output += other.lines_output;
        self.lines_updated += other.lines_updated;
        self.lines_rejected += other.lines_rejected;
        self.errors += other.errors;
    }
}

/// Lifecycle state of a step execution unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Created,
    Initialized,
    Running,
    Done,
    Error,
    Stopped,
}

impl StepState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error | Self::Stopped)
    }
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Initialized => "initialized",
            Self::Running => "running",
            Self::Done => "done",
            Self::Error => "error",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Final status of one step copy on one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepStatus {
    pub node: String,
    pub step: String,
    pub copy: u32,
    pub state: StepState,
    pub counters: StepCounters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Error class reported in a [`FailureReport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Validation,
    RowProcessing,
    StepFatal,
    Transport,
    ClusterCoordination,
    Cleanup,
    Infrastructure,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Validation => "validation",
            Self::RowProcessing => "row_processing",
            Self::StepFatal => "step_fatal",
            Self::Transport => "transport",
            Self::ClusterCoordination => "cluster_coordination",
            Self::Cleanup => "cleanup",
            Self::Infrastructure => "infrastructure",
        };
        f.write_str(s)
    }
}

/// The terminal error of a failed run and where it happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReport {
    pub kind: FailureKind,
    /// Failing step (`node/step.copy`) or slave server name.
    pub origin: String,
    pub message: String,
}

impl fmt::Display for FailureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error in {}: {}", self.kind, self.origin, self.message)
    }
}

/// A file produced by a step and handed back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultFile {
    pub path: String,
    pub origin_step: String,
}

/// Aggregate statistics and artifacts of one pipeline execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
    pub nr_errors: u64,
    pub lines_input: u64,
    pub lines_output: u64,
    pub lines_updated: u64,
    pub lines_read: u64,
    pub lines_written: u64,
    pub lines_rejected: u64,
    pub result_rows: Vec<Row>,
    pub result_files: Vec<ResultFile>,
    pub success: bool,
    pub stopped: bool,
    pub duration_secs: f64,
    pub steps: Vec<StepStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReport>,
}

impl Default for PipelineResult {
    fn default() -> Self {
        Self {
            nr_errors: 0,
            lines_input: 0,
            lines_output: 0,
            lines_updated: 0,
            lines_read: 0,
            lines_written: 0,
            lines_rejected: 0,
            result_rows: Vec::new(),
            result_files: Vec::new(),
            success: true,
            stopped: false,
            duration_secs: 0.0,
            steps: Vec::new(),
            failure: None,
        }
    }
}

impl PipelineResult {
    /// Add one step's counters to the run totals.
    pub fn add_counters(&mut self, counters: &StepCounters) {
        self.nr_errors += counters.errors;
        self.lines_input += counters.lines_input;
        self.lines_output += counters.lines_output;
        self.lines_updated += counters.lines_updated;
        self.lines_read += counters.lines_read;
        self.lines_written += counters.lines_written;
        self.lines_rejected += counters.lines_rejected;
    }

    /// Mark the run failed. Keeps an earlier failure if one is already set.
    pub fn fail(&mut self, report: FailureReport) {
        self.success = false;
        if self.nr_errors == 0 {
            self.nr_errors = 1;
        }
        if self.failure.is_none() {
            self.failure = Some(report);
        }
    }
}

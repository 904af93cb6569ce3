//! One running copy of a step: lifecycle state machine and run loop.

use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;

use rowflow_types::{ResultFile, Row, StepCounters, StepState, StepStatus};

use crate::error::{PipelineError, StepError};
use crate::step::{Step, StepContext};

/// What a unit hands back to its graph when its thread ends.
#[derive(Debug)]
pub struct UnitReport {
    pub status: StepStatus,
    /// Transport steps do not contribute line counters to the run result.
    pub is_transport: bool,
    pub result_rows: Vec<Row>,
    pub result_files: Vec<ResultFile>,
}

/// A step implementation bound to its context.
///
/// States move `Created -> Initialized -> Running -> {Done, Error, Stopped}`.
pub struct StepExecutionUnit {
    step: Box<dyn Step>,
    ctx: StepContext,
    state: StepState,
    is_transport: bool,
    error: Option<String>,
}

impl StepExecutionUnit {
    pub(crate) fn new(step: Box<dyn Step>, ctx: StepContext, is_transport: bool) -> Self {
        Self {
            step,
            ctx,
            state: StepState::Created,
            is_transport,
            error: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> StepState {
        self.state
    }

    #[must_use]
    pub fn label(&self) -> String {
        self.ctx.label()
    }

    /// Run the step's `init`. A failure leaves the unit in `Error`.
    ///
    /// # Errors
    ///
    /// Returns a [`PipelineError::Validation`] describing the failed step.
    pub fn init(&mut self) -> Result<(), PipelineError> {
        match self.step.init(&mut self.ctx) {
            Ok(()) => {
                self.state = StepState::Initialized;
                tracing::debug!(step = %self.ctx.label(), "step initialized");
                Ok(())
            }
            Err(e) => {
                self.state = StepState::Error;
                let label = self.ctx.label();
                self.error = Some(e.to_string());
                Err(match e {
                    StepError::Settings(_) => e.into_pipeline_error(&label),
                    other => PipelineError::Validation(format!("{label}: init failed: {other}")),
                })
            }
        }
    }

    /// Release resources of a unit that will never run.
    pub fn dispose(&mut self) {
        self.step.dispose(&mut self.ctx);
        self.ctx.finish_outputs();
        if self.state == StepState::Initialized || self.state == StepState::Created {
            self.state = StepState::Stopped;
        }
    }

    /// Process rows until the step finishes, fails, or the node stops.
    /// Dispose always runs before returning.
    pub fn run(mut self) -> UnitReport {
        let label = self.ctx.label();
        let started = Instant::now();
        self.state = StepState::Running;
        tracing::debug!(step = %label, "step running");

        loop {
            if self.ctx.is_stopped() {
                self.state = StepState::Stopped;
                break;
            }
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.step.process_row(&mut self.ctx)))
                .unwrap_or_else(|payload| Err(StepError::fatal(panic_message(&*payload))));
            match outcome {
                Ok(true) => {}
                Ok(false) => {
                    self.state = if self.ctx.is_stopped() {
                        StepState::Stopped
                    } else {
                        StepState::Done
                    };
                    break;
                }
                Err(StepError::Row {
                    meta,
                    row,
                    code,
                    message,
                }) if self.ctx.has_error_hop() => {
                    tracing::debug!(step = %label, code = %code, error = %message, "row sent to error hop");
                    if !self.ctx.put_error(&meta, row, &code, &message) {
                        self.state = StepState::Stopped;
                        break;
                    }
                }
                Err(e) => {
                    let err = e.into_pipeline_error(&label);
                    tracing::error!(step = %label, error = %err, "step failed, stopping pipeline");
                    self.ctx.counters_mut().errors += 1;
                    self.error = Some(err.to_string());
                    self.state = StepState::Error;
                    self.ctx.signal().fail(err.report());
                    break;
                }
            }
        }

        self.ctx.finish_outputs();
        self.step.dispose(&mut self.ctx);

        let counters = *self.ctx.counters();
        tracing::info!(
            step = %label,
            state = %self.state,
            lines_read = counters.lines_read,
            lines_written = counters.lines_written,
            lines_rejected = counters.lines_rejected,
            elapsed_secs = started.elapsed().as_secs_f64(),
            "step finished"
        );
        self.into_report(counters)
    }

    pub(crate) fn into_report(mut self, counters: StepCounters) -> UnitReport {
        let (result_rows, result_files) = self.ctx.take_results();
        UnitReport {
            status: StepStatus {
                node: self.ctx.node().to_string(),
                step: self.ctx.step_name().to_string(),
                copy: self.ctx.copy_nr(),
                state: self.state,
                counters,
                error: self.error,
            },
            is_transport: self.is_transport,
            result_rows,
            result_files,
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("step panicked: {detail}")
}

//! One node's executable graph: units, queues, lifecycle.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use anyhow::Context;
use rowflow_types::{
    variables, ExecutionConfiguration, FailureKind, FailureReport, PipelineResult, StepState,
};

use crate::error::PipelineError;
use crate::meta::PipelineMeta;
use crate::queue::{RowQueue, StopSignal};
use crate::step::{OutputHop, StepContext, StepRegistry};
use crate::steps::is_transport_type;
use crate::unit::{StepExecutionUnit, UnitReport};

const LOCAL_NODE: &str = "local";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    New,
    Prepared,
    Running,
    Finished,
}

/// Owns every unit and queue of one node. Units and queues live in flat
/// vectors; steps only see the queues wired into their context.
pub struct PipelineGraph {
    meta: PipelineMeta,
    registry: Arc<StepRegistry>,
    config: ExecutionConfiguration,
    node: String,
    phase: Phase,
    units: Vec<StepExecutionUnit>,
    queues: Vec<Arc<RowQueue>>,
    signal: StopSignal,
    handles: Vec<(String, JoinHandle<UnitReport>)>,
    started_at: Option<Instant>,
}

impl PipelineGraph {
    #[must_use]
    pub fn new(
        meta: PipelineMeta,
        registry: Arc<StepRegistry>,
        config: ExecutionConfiguration,
    ) -> Self {
        Self {
            meta,
            registry,
            config,
            node: LOCAL_NODE.to_string(),
            phase: Phase::New,
            units: Vec::new(),
            queues: Vec::new(),
            signal: StopSignal::new(Vec::new()),
            handles: Vec::new(),
            started_at: None,
        }
    }

    /// Name used for this node in step labels and failure reports.
    #[must_use]
    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        self.node = node.into();
        self
    }

    #[must_use]
    pub fn meta(&self) -> &PipelineMeta {
        &self.meta
    }

    #[must_use]
    pub fn node(&self) -> &str {
        &self.node
    }

    /// A handle that stops this graph from another thread.
    #[must_use]
    pub fn stop_signal(&self) -> StopSignal {
        self.signal.clone()
    }

    /// Validate the graph, allocate queues, build units, and initialize them
    /// in topological order. On any failure every built unit is disposed.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Validation`] for structural problems, unknown
    /// step types, or a failed step `init`.
    pub fn prepare(&mut self) -> Result<(), PipelineError> {
        if self.phase != Phase::New {
            return Err(PipelineError::Validation(format!(
                "pipeline '{}' was already prepared",
                self.meta.name
            )));
        }
        let order = self.validate()?;
        let capacity = self
            .config
            .queue_capacity
            .unwrap_or(self.meta.queue_capacity);
        let copies: Vec<u32> = self
            .meta
            .steps
            .iter()
            .map(|s| s.effective_copies(self.config.copies))
            .collect();

        let mut wiring = Wiring::new(&copies);
        for hop in self.meta.enabled_hops() {
            let (Some(from), Some(to)) = (
                self.meta.step_index(&hop.from),
                self.meta.step_index(&hop.to),
            ) else {
                continue;
            };
            let is_error_hop = self.meta.steps[from].error_hop.as_deref() == Some(hop.to.as_str());
            let (n_from, n_to) = (copies[from], copies[to]);
            for i in 0..n_from {
                // Equal copy counts pair copies 1:1, otherwise every producer
                // copy feeds every consumer copy.
                let targets: Vec<u32> = if n_from == n_to && n_from > 1 {
                    vec![i]
                } else {
                    (0..n_to).collect()
                };
                let mut hop_queues = Vec::with_capacity(targets.len());
                for j in targets {
                    let queue = Arc::new(RowQueue::new(
                        format!("{}.{i} -> {}.{j}", hop.from, hop.to),
                        capacity,
                    ));
                    self.queues.push(Arc::clone(&queue));
                    wiring.inputs[to][j as usize].push((Arc::clone(&queue), hop.feedback));
                    hop_queues.push(queue);
                }
                let output = OutputHop::new(hop_queues);
                if is_error_hop {
                    wiring.error_outputs[from][i as usize] = Some(output);
                } else {
                    wiring.outputs[from][i as usize].push(output);
                }
            }
        }
        self.signal = StopSignal::new(self.queues.clone());

        for &idx in &order {
            let step_meta = &self.meta.steps[idx];
            for copy in 0..copies[idx] {
                let Some(step) = self.registry.create(step_meta) else {
                    dispose_all(&mut self.units);
                    return Err(PipelineError::Validation(format!(
                        "unknown step type '{}'",
                        step_meta.step_type
                    )));
                };
                let mut vars = self.meta.variables.layered(&self.config.variables);
                vars.extend_from(&step_meta.variables);
                vars.set(variables::STEP_COPY, copy.to_string());
                let mut ctx = StepContext::new(
                    step_meta,
                    copy,
                    &self.node,
                    vars,
                    step_meta.distribution.clone(),
                    self.signal.clone(),
                    self.config.safe_mode,
                );
                let c = copy as usize;
                for (queue, feedback) in std::mem::take(&mut wiring.inputs[idx][c]) {
                    ctx.add_input(queue, feedback);
                }
                for output in std::mem::take(&mut wiring.outputs[idx][c]) {
                    ctx.add_output(output);
                }
                if let Some(error_output) = wiring.error_outputs[idx][c].take() {
                    ctx.set_error_output(error_output);
                }

                let mut unit =
                    StepExecutionUnit::new(step, ctx, is_transport_type(&step_meta.step_type));
                if let Err(e) = unit.init() {
                    tracing::error!(
                        pipeline = %self.meta.name,
                        node = %self.node,
                        step = %unit.label(),
                        error = %e,
                        "step init failed, aborting pipeline"
                    );
                    unit.dispose();
                    dispose_all(&mut self.units);
                    return Err(e);
                }
                self.units.push(unit);
            }
        }

        self.phase = Phase::Prepared;
        tracing::info!(
            pipeline = %self.meta.name,
            node = %self.node,
            units = self.units.len(),
            queues = self.queues.len(),
            queue_capacity = capacity,
            "pipeline prepared"
        );
        Ok(())
    }

    fn validate(&self) -> Result<Vec<usize>, PipelineError> {
        let errors = crate::config::validator::graph_errors(&self.meta, &self.registry);
        if !errors.is_empty() {
            return Err(PipelineError::Validation(errors.join("; ")));
        }
        self.meta
            .topological_order()
            .map_err(PipelineError::Validation)
    }

    /// Start one named OS thread per unit. No ordering between units.
    ///
    /// # Errors
    ///
    /// Returns an error if the graph is not prepared or a thread cannot be
    /// spawned; already started units are stopped.
    pub fn start(&mut self) -> Result<(), PipelineError> {
        if self.phase != Phase::Prepared {
            return Err(PipelineError::Validation(format!(
                "pipeline '{}' must be prepared before it is started",
                self.meta.name
            )));
        }
        self.started_at = Some(Instant::now());
        self.phase = Phase::Running;
        for unit in self.units.drain(..) {
            let label = unit.label();
            let spawned = thread::Builder::new()
                .name(label.clone())
                .spawn(move || unit.run())
                .with_context(|| format!("failed to spawn thread for {label}"));
            match spawned {
                Ok(handle) => self.handles.push((label, handle)),
                Err(e) => {
                    self.signal.raise();
                    return Err(PipelineError::Infrastructure(e));
                }
            }
        }
        tracing::info!(
            pipeline = %self.meta.name,
            node = %self.node,
            threads = self.handles.len(),
            "pipeline started"
        );
        Ok(())
    }

    /// Raise the stop flag on every unit and wake every queue.
    pub fn stop(&self) {
        tracing::info!(pipeline = %self.meta.name, node = %self.node, "stopping pipeline");
        self.signal.raise();
    }

    /// Block until every unit has finished and build the node's result.
    ///
    /// # Errors
    ///
    /// Returns an error if the graph was never started.
    pub fn wait_until_finished(&mut self) -> Result<PipelineResult, PipelineError> {
        if self.phase != Phase::Running {
            return Err(PipelineError::Validation(format!(
                "pipeline '{}' is not running",
                self.meta.name
            )));
        }
        let mut result = PipelineResult::default();
        let mut panicked = None;
        for (label, handle) in self.handles.drain(..) {
            match handle.join() {
                Ok(report) => absorb_report(&mut result, report),
                Err(_) => {
                    tracing::error!(step = %label, "step thread panicked");
                    result.nr_errors += 1;
                    panicked.get_or_insert(label);
                }
            }
        }

        if let Some(report) = self.signal.first_failure() {
            result.fail(report.clone());
        } else if let Some(label) = panicked {
            result.fail(FailureReport {
                kind: FailureKind::Infrastructure,
                origin: label,
                message: "step thread panicked".to_string(),
            });
        } else if self.signal.is_raised() {
            result.stopped = true;
            result.success = false;
        }
        if result.nr_errors > 0 {
            result.success = false;
        }

        let discarded: u64 = self.queues.iter().map(|q| q.discarded()).sum();
        if discarded > 0 {
            tracing::warn!(
                pipeline = %self.meta.name,
                rows = discarded,
                "rows arrived on feedback hops after their consumer finished"
            );
        }

        result.duration_secs = self
            .started_at
            .map_or(0.0, |t| t.elapsed().as_secs_f64());
        self.phase = Phase::Finished;
        tracing::info!(
            pipeline = %self.meta.name,
            node = %self.node,
            success = result.success,
            errors = result.nr_errors,
            lines_read = result.lines_read,
            lines_written = result.lines_written,
            duration_secs = result.duration_secs,
            "pipeline finished"
        );
        Ok(result)
    }

    /// Prepare, start, and wait.
    ///
    /// # Errors
    ///
    /// Returns any prepare or start error. A run that fails after starting
    /// yields `Ok` with `success == false`.
    pub fn execute(&mut self) -> Result<PipelineResult, PipelineError> {
        self.prepare()?;
        self.start()?;
        self.wait_until_finished()
    }
}

fn dispose_all(units: &mut Vec<StepExecutionUnit>) {
    for mut unit in units.drain(..) {
        unit.dispose();
    }
}

fn absorb_report(result: &mut PipelineResult, report: UnitReport) {
    let counters = &report.status.counters;
    if report.is_transport {
        result.nr_errors += counters.errors;
    } else {
        result.add_counters(counters);
    }
    if report.status.state == StepState::Error && counters.errors == 0 {
        result.nr_errors += 1;
    }
    result.result_rows.extend(report.result_rows);
    result.result_files.extend(report.result_files);
    result.steps.push(report.status);
}

impl Drop for PipelineGraph {
    fn drop(&mut self) {
        dispose_all(&mut self.units);
        if !self.handles.is_empty() {
            self.signal.raise();
            for (_, handle) in self.handles.drain(..) {
                let _ = handle.join();
            }
        }
    }
}

/// Per step, per copy queue assignments built during prepare.
struct Wiring {
    inputs: Vec<Vec<Vec<(Arc<RowQueue>, bool)>>>,
    outputs: Vec<Vec<Vec<OutputHop>>>,
    error_outputs: Vec<Vec<Option<OutputHop>>>,
}

impl Wiring {
    fn new(copies: &[u32]) -> Self {
        Self {
            inputs: copies.iter().map(|&n| per_copy(n)).collect(),
            outputs: copies.iter().map(|&n| per_copy(n)).collect(),
            error_outputs: copies.iter().map(|&n| (0..n).map(|_| None).collect()).collect(),
        }
    }
}

fn per_copy<T>(n: u32) -> Vec<Vec<T>> {
    (0..n).map(|_| Vec::new()).collect()
}

//! Step contract, per-copy step context, and the step factory registry.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use rowflow_types::{FieldMeta, ResultFile, Row, RowMeta, StepCounters, Value, ValueType, Variables};
use serde::de::DeserializeOwned;

use crate::error::StepError;
use crate::meta::{Distribution, StepMeta};
use crate::partition::partition_of;
use crate::queue::{QueueRead, RowQueue, StopSignal};

/// How long `get_row` waits on one input before trying the next.
const INPUT_POLL: Duration = Duration::from_millis(50);
/// Quiet period after which an idle feedback input is considered drained.
const FEEDBACK_QUIET: Duration = Duration::from_millis(200);

pub const ERROR_DESCRIPTION_FIELD: &str = "error_description";
pub const ERROR_CODE_FIELD: &str = "error_code";

/// A row-processing step. One instance exists per step copy.
pub trait Step: Send {
    /// Resolve settings and open resources. Called once, before any row flows.
    ///
    /// # Errors
    ///
    /// Any error aborts the whole graph before it starts.
    fn init(&mut self, _ctx: &mut StepContext) -> Result<(), StepError> {
        Ok(())
    }

    /// Do one unit of work, usually one row. Return `Ok(false)` when finished.
    ///
    /// # Errors
    ///
    /// [`StepError::Row`] goes to the error hop when one is declared; every
    /// other error stops the run.
    fn process_row(&mut self, ctx: &mut StepContext) -> Result<bool, StepError>;

    /// Release resources. Runs on every exit path.
    fn dispose(&mut self, _ctx: &mut StepContext) {}
}

/// Builds a fresh [`Step`] for each copy.
pub trait StepFactory: Send + Sync {
    fn create(&self, meta: &StepMeta) -> Box<dyn Step>;
}

impl<F> StepFactory for F
where
    F: Fn(&StepMeta) -> Box<dyn Step> + Send + Sync,
{
    fn create(&self, meta: &StepMeta) -> Box<dyn Step> {
        self(meta)
    }
}

/// Step implementations keyed by step-type tag.
#[derive(Default, Clone)]
pub struct StepRegistry {
    factories: BTreeMap<String, Arc<dyn StepFactory>>,
}

impl StepRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every built-in step.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::steps::register_builtins(&mut registry);
        registry
    }

    /// Add or replace the factory for `step_type`.
    pub fn register(&mut self, step_type: impl Into<String>, factory: impl StepFactory + 'static) {
        self.factories.insert(step_type.into(), Arc::new(factory));
    }

    #[must_use]
    pub fn contains(&self, step_type: &str) -> bool {
        self.factories.contains_key(step_type)
    }

    #[must_use]
    pub fn create(&self, meta: &StepMeta) -> Option<Box<dyn Step>> {
        self.factories.get(&meta.step_type).map(|f| f.create(meta))
    }

    pub fn step_types(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.factories.keys()).finish()
    }
}

/// Queues of one hop as seen by the producing copy.
pub(crate) struct OutputHop {
    pub queues: Vec<Arc<RowQueue>>,
    next: usize,
}

impl OutputHop {
    pub(crate) fn new(queues: Vec<Arc<RowQueue>>) -> Self {
        Self { queues, next: 0 }
    }

    fn next_queue(&mut self) -> &Arc<RowQueue> {
        let idx = self.next % self.queues.len();
        self.next = idx + 1;
        &self.queues[idx]
    }
}

pub(crate) struct Input {
    queue: Arc<RowQueue>,
    feedback: bool,
}

/// Everything a step copy may touch while running: its inputs and outputs,
/// counters, variables, and the node's stop signal.
pub struct StepContext {
    step_name: String,
    copy: u32,
    node: String,
    settings: serde_json::Value,
    variables: Variables,
    inputs: Vec<Input>,
    next_input: usize,
    outputs: Vec<OutputHop>,
    next_output: usize,
    error_output: Option<OutputHop>,
    error_meta: Option<(Arc<RowMeta>, Arc<RowMeta>)>,
    distribution: Distribution,
    /// Index of the partition field in the last layout seen.
    partition_key: Option<(Arc<RowMeta>, Option<usize>)>,
    counters: StepCounters,
    signal: StopSignal,
    safe_mode: bool,
    input_layout: Option<Arc<RowMeta>>,
    result_rows: Vec<Row>,
    result_files: Vec<ResultFile>,
}

impl StepContext {
    pub(crate) fn new(
        meta: &StepMeta,
        copy: u32,
        node: &str,
        variables: Variables,
        distribution: Distribution,
        signal: StopSignal,
        safe_mode: bool,
    ) -> Self {
        let settings = variables.substitute_json(&meta.settings);
        Self {
            step_name: meta.name.clone(),
            copy,
            node: node.to_string(),
            settings,
            variables,
            inputs: Vec::new(),
            next_input: 0,
            outputs: Vec::new(),
            next_output: 0,
            error_output: None,
            error_meta: None,
            distribution,
            partition_key: None,
            counters: StepCounters::default(),
            signal,
            safe_mode,
            input_layout: None,
            result_rows: Vec::new(),
            result_files: Vec::new(),
        }
    }

    pub(crate) fn add_input(&mut self, queue: Arc<RowQueue>, feedback: bool) {
        self.inputs.push(Input { queue, feedback });
    }

    pub(crate) fn add_output(&mut self, hop: OutputHop) {
        self.outputs.push(hop);
    }

    pub(crate) fn set_error_output(&mut self, hop: OutputHop) {
        self.error_output = Some(hop);
    }

    /// Display name `node/step.copy`.
    #[must_use]
    pub fn label(&self) -> String {
        format!("{}/{}.{}", self.node, self.step_name, self.copy)
    }

    #[must_use]
    pub fn step_name(&self) -> &str {
        &self.step_name
    }

    #[must_use]
    pub fn copy_nr(&self) -> u32 {
        self.copy
    }

    #[must_use]
    pub fn node(&self) -> &str {
        &self.node
    }

    #[must_use]
    pub fn variables(&self) -> &Variables {
        &self.variables
    }

    #[must_use]
    pub fn variable(&self, name: &str) -> Option<&str> {
        self.variables.get(name)
    }

    /// Step settings after `${VAR}` substitution.
    #[must_use]
    pub fn raw_settings(&self) -> &serde_json::Value {
        &self.settings
    }

    /// Deserialize the settings into a step's own settings type.
    ///
    /// # Errors
    ///
    /// Returns [`StepError::Settings`] when the shape does not match.
    pub fn settings<T: DeserializeOwned>(&self) -> Result<T, StepError> {
        let value = if self.settings.is_null() {
            serde_json::Value::Object(serde_json::Map::new())
        } else {
            self.settings.clone()
        };
        serde_json::from_value(value).map_err(|e| StepError::Settings(e.to_string()))
    }

    #[must_use]
    pub fn counters(&self) -> &StepCounters {
        &self.counters
    }

    pub fn counters_mut(&mut self) -> &mut StepCounters {
        &mut self.counters
    }

    pub fn inc_lines_input(&mut self) {
        self.counters.lines_input += 1;
    }

    pub fn inc_lines_output(&mut self) {
        self.counters.lines_output += 1;
    }

    pub fn inc_lines_updated(&mut self) {
        self.counters.lines_updated += 1;
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.signal.is_raised()
    }

    /// The node's stop flag, for blocking calls that poll it.
    #[must_use]
    pub fn stop_flag(&self) -> &Arc<std::sync::atomic::AtomicBool> {
        self.signal.flag()
    }

    #[must_use]
    pub fn has_inputs(&self) -> bool {
        !self.inputs.is_empty()
    }

    #[must_use]
    pub fn has_error_hop(&self) -> bool {
        self.error_output.is_some()
    }

    /// Next row from any input, round-robin. `None` once every input has
    /// ended or the run is stopping.
    ///
    /// # Errors
    ///
    /// In safe mode, returns [`StepError::Fatal`] when inputs disagree on
    /// the row layout.
    pub fn get_row(&mut self) -> Result<Option<(Arc<RowMeta>, Row)>, StepError> {
        let mut idle_feedback_polls = 0usize;
        loop {
            if self.is_stopped() {
                return Ok(None);
            }
            let primary_live = self.inputs.iter().any(|i| !i.feedback);
            if self.inputs.is_empty() {
                return Ok(None);
            }
            if !primary_live && idle_feedback_polls >= self.inputs.len() {
                // Only feedback inputs remain and none produced a row in a
                // full quiet round.
                for input in self.inputs.drain(..) {
                    input.queue.close();
                }
                return Ok(None);
            }

            let idx = self.next_input % self.inputs.len();
            let wait = if primary_live { INPUT_POLL } else { FEEDBACK_QUIET };
            match self.inputs[idx].queue.get(wait) {
                QueueRead::Row(meta, row) => {
                    self.next_input = idx + 1;
                    self.check_layout(&meta)?;
                    self.counters.lines_read += 1;
                    return Ok(Some((meta, row)));
                }
                QueueRead::TimedOut => {
                    self.next_input = idx + 1;
                    if !primary_live {
                        idle_feedback_polls += 1;
                    }
                }
                QueueRead::EndOfStream => {
                    self.inputs.remove(idx);
                    self.next_input = idx;
                }
                QueueRead::Stopped => return Ok(None),
            }
        }
    }

    fn check_layout(&mut self, meta: &Arc<RowMeta>) -> Result<(), StepError> {
        if !self.safe_mode {
            return Ok(());
        }
        match &self.input_layout {
            None => {
                self.input_layout = Some(Arc::clone(meta));
                Ok(())
            }
            Some(first) if Arc::ptr_eq(first, meta) || first.same_layout(meta) => Ok(()),
            Some(first) => Err(StepError::fatal(format!(
                "safe mode: input row layout {meta} differs from first layout {first}"
            ))),
        }
    }

    /// Send a row downstream according to the step's distribution.
    /// Returns `false` if the run is stopping and the row was not accepted.
    pub fn put_row(&mut self, meta: Arc<RowMeta>, row: Row) -> bool {
        if self.outputs.is_empty() {
            return !self.is_stopped();
        }
        let accepted = match self.distribution {
            Distribution::Distribute => {
                let hop_idx = self.next_output % self.outputs.len();
                self.next_output = hop_idx + 1;
                self.outputs[hop_idx].next_queue().put(meta, row)
            }
            Distribution::Copy => {
                let mut ok = true;
                if let Some((last, rest)) = self.outputs.split_last_mut() {
                    for hop in rest {
                        ok &= hop.next_queue().put(Arc::clone(&meta), row.clone());
                    }
                    ok &= last.next_queue().put(meta, row);
                }
                ok
            }
            Distribution::Partition { .. } => {
                let null = Value::Null;
                let key = self
                    .partition_index(&meta)
                    .and_then(|idx| row.get(idx))
                    .unwrap_or(&null);
                let total: usize = self.outputs.iter().map(|hop| hop.queues.len()).sum();
                let mut slot = partition_of(key, total);
                let mut target = None;
                for hop in &self.outputs {
                    if slot < hop.queues.len() {
                        target = Some(Arc::clone(&hop.queues[slot]));
                        break;
                    }
                    slot -= hop.queues.len();
                }
                target.is_some_and(|queue| queue.put(meta, row))
            }
        };
        if accepted {
            self.counters.lines_written += 1;
        }
        accepted
    }

    /// Position of the partition field in `meta`, cached per layout. Rows
    /// without the field go to partition 0.
    fn partition_index(&mut self, meta: &Arc<RowMeta>) -> Option<usize> {
        if let Some((seen, idx)) = &self.partition_key {
            if Arc::ptr_eq(seen, meta) {
                return *idx;
            }
        }
        let Distribution::Partition { field } = &self.distribution else {
            return None;
        };
        let idx = meta.index_of(field);
        if idx.is_none() {
            tracing::warn!(
                step = %self.label(),
                field = %field,
                "partition field missing from row layout, sending rows to partition 0"
            );
        }
        self.partition_key = Some((Arc::clone(meta), idx));
        idx
    }

    /// Route a rejected row to the error hop with the error fields appended.
    /// Returns `false` if there is no error hop or the run is stopping.
    pub fn put_error(&mut self, meta: &Arc<RowMeta>, row: Row, code: &str, message: &str) -> bool {
        let error_meta = self.error_meta_for(meta);
        let Some(hop) = self.error_output.as_mut() else {
            return false;
        };
        let mut values = row.into_values();
        values.resize(meta.len(), Value::Null);
        values.push(Value::String(message.to_string()));
        values.push(Value::String(code.to_string()));
        let accepted = hop.next_queue().put(error_meta, Row::new(values));
        if accepted {
            self.counters.lines_rejected += 1;
        }
        accepted
    }

    fn error_meta_for(&mut self, meta: &Arc<RowMeta>) -> Arc<RowMeta> {
        if let Some((base, extended)) = &self.error_meta {
            if Arc::ptr_eq(base, meta) {
                return Arc::clone(extended);
            }
        }
        let extended = Arc::new(meta.extended([
            FieldMeta::new(ERROR_DESCRIPTION_FIELD, ValueType::String),
            FieldMeta::new(ERROR_CODE_FIELD, ValueType::String),
        ]));
        self.error_meta = Some((Arc::clone(meta), Arc::clone(&extended)));
        extended
    }

    /// Keep a row in the run result.
    pub fn add_result_row(&mut self, row: Row) {
        self.result_rows.push(row);
    }

    pub fn add_result_file(&mut self, path: impl Into<String>) {
        self.result_files.push(ResultFile {
            path: path.into(),
            origin_step: self.step_name.clone(),
        });
    }

    /// Signal end of stream on every output, including the error hop.
    pub(crate) fn finish_outputs(&mut self) {
        for hop in self.outputs.iter().chain(self.error_output.iter()) {
            for queue in &hop.queues {
                queue.mark_done();
            }
        }
        for input in &self.inputs {
            if input.feedback {
                input.queue.close();
            }
        }
    }

    pub(crate) fn take_results(&mut self) -> (Vec<Row>, Vec<ResultFile>) {
        (
            std::mem::take(&mut self.result_rows),
            std::mem::take(&mut self.result_files),
        )
    }

    pub(crate) fn signal(&self) -> &StopSignal {
        &self.signal
    }
}

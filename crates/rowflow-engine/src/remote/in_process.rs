use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use rowflow_types::{FailureKind, FailureReport, PipelineResult};

use super::endpoint::{EndpointError, RunState, SlaveEndpoint, SlaveJob};
use crate::error::PipelineError;
use crate::graph::PipelineGraph;
use crate::queue::StopSignal;
use crate::step::StepRegistry;

type Waiter = JoinHandle<Result<PipelineResult, PipelineError>>;

enum Phase {
    Submitted(SlaveJob),
    /// The job was taken out of the table while its steps initialize.
    Preparing,
    Prepared(PipelineGraph),
    Running(Waiter),
    Finished(PipelineResult),
}

struct SlaveRun {
    phase: Phase,
    signal: Option<StopSignal>,
}

/// Runs submitted sub-graphs on local threads.
///
/// Backs one-process clusters and the TCP slave server.
pub struct InProcessSlave {
    name: String,
    registry: Arc<StepRegistry>,
    runs: Mutex<HashMap<String, SlaveRun>>,
}

impl InProcessSlave {
    #[must_use]
    pub fn new(name: impl Into<String>, registry: Arc<StepRegistry>) -> Self {
        Self {
            name: name.into(),
            registry,
            runs: Mutex::new(HashMap::new()),
        }
    }

    /// Runs currently held, in any phase.
    #[must_use]
    pub fn run_count(&self) -> usize {
        self.runs.lock().map_or(0, |runs| runs.len())
    }

    fn runs(&self) -> Result<MutexGuard<'_, HashMap<String, SlaveRun>>, EndpointError> {
        self.runs
            .lock()
            .map_err(|_| EndpointError::Protocol("slave run table lock poisoned".into()))
    }

    /// Move a finished waiter into `Finished`, joining its thread.
    fn settle(run: &mut SlaveRun) {
        let finished = matches!(&run.phase, Phase::Running(waiter) if waiter.is_finished());
        if !finished {
            return;
        }
        if let Phase::Running(waiter) = std::mem::replace(&mut run.phase, Phase::Preparing) {
            let result = match waiter.join() {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => failed(&e.report()),
                Err(_) => failed(&FailureReport {
                    kind: FailureKind::Infrastructure,
                    origin: String::new(),
                    message: "run waiter thread panicked".into(),
                }),
            };
            run.phase = Phase::Finished(result);
        }
    }
}

fn failed(report: &FailureReport) -> PipelineResult {
    let mut result = PipelineResult::default();
    result.fail(report.clone());
    result
}

impl SlaveEndpoint for InProcessSlave {
    fn name(&self) -> &str {
        &self.name
    }

    fn submit(&self, job: SlaveJob) -> Result<(), EndpointError> {
        let mut runs = self.runs()?;
        if runs.contains_key(&job.run_id) {
            return Err(EndpointError::Rejected(format!(
                "run '{}' already submitted",
                job.run_id
            )));
        }
        tracing::info!(slave = %self.name, run_id = %job.run_id, pipeline = %job.meta.name, "job submitted");
        runs.insert(
            job.run_id.clone(),
            SlaveRun {
                phase: Phase::Submitted(job),
                signal: None,
            },
        );
        Ok(())
    }

    fn prepare(&self, run_id: &str) -> Result<(), EndpointError> {
        // Take the job out so init (which may block on socket binds) runs
        // without holding the table lock.
        let job = {
            let mut runs = self.runs()?;
            let run = runs
                .get_mut(run_id)
                .ok_or_else(|| EndpointError::UnknownRun(run_id.to_string()))?;
            match std::mem::replace(&mut run.phase, Phase::Preparing) {
                Phase::Submitted(job) => job,
                other => {
                    run.phase = other;
                    return Err(EndpointError::Rejected(format!(
                        "run '{run_id}' is not awaiting prepare"
                    )));
                }
            }
        };

        let mut graph = PipelineGraph::new(job.meta, Arc::clone(&self.registry), job.config)
            .with_node(self.name.clone());
        let prepared = graph.prepare();

        let mut runs = self.runs()?;
        let run = runs
            .get_mut(run_id)
            .ok_or_else(|| EndpointError::UnknownRun(run_id.to_string()))?;
        match prepared {
            Ok(()) => {
                run.signal = Some(graph.stop_signal());
                run.phase = Phase::Prepared(graph);
                tracing::info!(slave = %self.name, run_id, "job prepared");
                Ok(())
            }
            Err(e) => {
                run.phase = Phase::Finished(failed(&e.report()));
                Err(EndpointError::Rejected(e.to_string()))
            }
        }
    }

    fn start(&self, run_id: &str) -> Result<(), EndpointError> {
        let mut runs = self.runs()?;
        let run = runs
            .get_mut(run_id)
            .ok_or_else(|| EndpointError::UnknownRun(run_id.to_string()))?;
        let not_prepared = || EndpointError::Rejected(format!("run '{run_id}' is not prepared"));
        if !matches!(run.phase, Phase::Prepared(_)) {
            return Err(not_prepared());
        }
        let Phase::Prepared(mut graph) = std::mem::replace(&mut run.phase, Phase::Preparing) else {
            return Err(not_prepared());
        };
        if let Err(e) = graph.start() {
            run.phase = Phase::Finished(failed(&e.report()));
            return Err(EndpointError::Rejected(e.to_string()));
        }
        let waiter = thread::Builder::new()
            .name(format!("{}-{run_id}", self.name))
            .spawn(move || graph.wait_until_finished())?;
        run.phase = Phase::Running(waiter);
        tracing::info!(slave = %self.name, run_id, "job started");
        Ok(())
    }

    fn status(&self, run_id: &str) -> Result<RunState, EndpointError> {
        let mut runs = self.runs()?;
        let run = runs
            .get_mut(run_id)
            .ok_or_else(|| EndpointError::UnknownRun(run_id.to_string()))?;
        Self::settle(run);
        Ok(match run.phase {
            Phase::Submitted(_) => RunState::Submitted,
            Phase::Preparing => RunState::Preparing,
            Phase::Prepared(_) => RunState::Prepared,
            Phase::Running(_) => RunState::Running,
            Phase::Finished(ref result) if result.success => RunState::Finished,
            Phase::Finished(_) => RunState::Failed,
        })
    }

    fn fetch_result(&self, run_id: &str) -> Result<PipelineResult, EndpointError> {
        let mut runs = self.runs()?;
        let run = runs
            .get_mut(run_id)
            .ok_or_else(|| EndpointError::UnknownRun(run_id.to_string()))?;
        Self::settle(run);
        match &run.phase {
            Phase::Finished(result) => Ok(result.clone()),
            Phase::Preparing => Err(EndpointError::Rejected(format!(
                "run '{run_id}' is still preparing"
            ))),
            _ => Err(EndpointError::Rejected(format!(
                "run '{run_id}' has not finished"
            ))),
        }
    }

    fn stop(&self, run_id: &str) -> Result<(), EndpointError> {
        let runs = self.runs()?;
        if let Some(signal) = runs.get(run_id).and_then(|run| run.signal.as_ref()) {
            tracing::info!(slave = %self.name, run_id, "stopping job");
            signal.raise();
        }
        Ok(())
    }

    fn cleanup(&self, run_id: &str) -> Result<(), EndpointError> {
        let removed = self.runs()?.remove(run_id);
        let Some(run) = removed else {
            return Ok(());
        };
        if let Some(signal) = &run.signal {
            signal.raise();
        }
        // Dropping a prepared graph disposes its units; a running one is
        // joined after the stop above.
        if let Phase::Running(waiter) = run.phase {
            let _ = waiter.join();
        }
        tracing::info!(slave = %self.name, run_id, "job cleaned up");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use rowflow_types::ExecutionConfiguration;
    use serde_json::json;

    use super::*;
    use crate::error::StepError;
    use crate::meta::{PipelineMeta, StepMeta};
    use crate::step::{Step, StepContext};

    fn slave() -> InProcessSlave {
        InProcessSlave::new("s1", Arc::new(StepRegistry::with_builtins()))
    }

    fn job(run_id: &str, meta: PipelineMeta) -> SlaveJob {
        SlaveJob {
            run_id: run_id.into(),
            meta,
            config: ExecutionConfiguration::local(),
        }
    }

    fn counting() -> PipelineMeta {
        PipelineMeta::new("p")
            .with_step(StepMeta::new("gen", "generator").with_settings(json!({"end": 10})))
            .with_step(StepMeta::new("out", "collector"))
            .with_hop("gen", "out")
    }

    fn wait_finished(slave: &InProcessSlave, run_id: &str) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !slave.status(run_id).unwrap().is_terminal() {
            assert!(Instant::now() < deadline, "run did not finish");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_full_lifecycle() {
        let slave = slave();
        slave.submit(job("r1", counting())).unwrap();
        assert_eq!(slave.status("r1").unwrap(), RunState::Submitted);
        slave.prepare("r1").unwrap();
        assert_eq!(slave.status("r1").unwrap(), RunState::Prepared);
        slave.start("r1").unwrap();
        wait_finished(&slave, "r1");
        let result = slave.fetch_result("r1").unwrap();
        assert!(result.success);
        assert_eq!(result.result_rows.len(), 10);
        slave.cleanup("r1").unwrap();
        slave.cleanup("r1").unwrap();
        assert_eq!(slave.run_count(), 0);
    }

    #[test]
    fn test_prepare_failure_is_rejected() {
        let slave = slave();
        let meta = PipelineMeta::new("p").with_step(StepMeta::new("x", "no_such_step"));
        slave.submit(job("r1", meta)).unwrap();
        let err = slave.prepare("r1").unwrap_err();
        assert!(matches!(err, EndpointError::Rejected(_)));
        assert_eq!(slave.status("r1").unwrap(), RunState::Failed);
        assert!(!slave.fetch_result("r1").unwrap().success);
    }

    #[test]
    fn test_failing_run_reports_failed_state() {
        struct Boom;
        impl Step for Boom {
            fn process_row(&mut self, _ctx: &mut StepContext) -> Result<bool, StepError> {
                Err(StepError::fatal("boom"))
            }
        }
        let mut registry = StepRegistry::with_builtins();
        registry.register("boom", |_: &StepMeta| -> Box<dyn Step> { Box::new(Boom) });
        let slave = InProcessSlave::new("s1", Arc::new(registry));
        let meta = PipelineMeta::new("p").with_step(StepMeta::new("bad", "boom"));
        slave.submit(job("r1", meta)).unwrap();
        slave.prepare("r1").unwrap();
        slave.start("r1").unwrap();
        wait_finished(&slave, "r1");
        assert_eq!(slave.status("r1").unwrap(), RunState::Failed);
        let result = slave.fetch_result("r1").unwrap();
        assert!(!result.success);
        assert!(result.failure.is_some());
    }

    #[test]
    fn test_preparing_run_has_no_result() {
        let slave = slave();
        slave.submit(job("r1", counting())).unwrap();
        slave.runs().unwrap().get_mut("r1").unwrap().phase = Phase::Preparing;
        assert_eq!(slave.status("r1").unwrap(), RunState::Preparing);
        assert!(matches!(slave.fetch_result("r1"), Err(EndpointError::Rejected(_))));
    }

    #[test]
    fn test_unknown_run_and_duplicate_submit() {
        let slave = slave();
        assert!(matches!(slave.start("nope"), Err(EndpointError::UnknownRun(_))));
        slave.stop("nope").unwrap();
        slave.submit(job("r1", counting())).unwrap();
        assert!(slave.submit(job("r1", counting())).is_err());
    }
}

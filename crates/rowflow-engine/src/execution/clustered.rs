use std::sync::Arc;

use rowflow_types::{
    ClusterSchema, ExecutionConfiguration, FailureKind, FailureReport, PipelineResult,
};
use tokio::task::JoinSet;

use super::{cleanup_all, endpoint_call, new_run_id, node_config, RunContext};
use crate::aggregate::aggregate_results;
use crate::cluster::split_pipeline;
use crate::error::PipelineError;
use crate::graph::PipelineGraph;
use crate::meta::PipelineMeta;
use crate::remote::{RunState, SlaveEndpoint, SlaveJob};

struct SlaveHandle {
    name: String,
    endpoint: Arc<dyn SlaveEndpoint>,
    result: Option<PipelineResult>,
}

/// Split, prepare every node before anything starts, run, and aggregate.
/// Every slave is cleaned up on every exit path once submission began.
pub(super) async fn execute(
    meta: &PipelineMeta,
    ctx: &RunContext,
    config: &ExecutionConfiguration,
    schema: &ClusterSchema,
) -> Result<PipelineResult, PipelineError> {
    let split = split_pipeline(meta, schema)?;
    let run_id = new_run_id();
    tracing::info!(
        pipeline = %meta.name,
        schema = %schema.name,
        run_id = %run_id,
        slaves = split.slaves.len(),
        cuts = split.cuts.len(),
        "starting clustered run"
    );

    let mut slaves = Vec::with_capacity(split.slaves.len());
    for node in &split.slaves {
        slaves.push(SlaveHandle {
            name: node.server.name.clone(),
            endpoint: ctx.resolver.resolve(&node.server)?,
            result: None,
        });
    }
    let endpoints: Vec<Arc<dyn SlaveEndpoint>> =
        slaves.iter().map(|s| Arc::clone(&s.endpoint)).collect();
    let job_config = node_config(config);

    // Slaves and master are prepared before anything starts, so every
    // transport writer is bound before any reader tries to connect.
    let mut prepare_set: JoinSet<Result<(), PipelineError>> = JoinSet::new();
    for (handle, node) in slaves.iter().zip(&split.slaves) {
        let endpoint = Arc::clone(&handle.endpoint);
        let name = handle.name.clone();
        let job = SlaveJob {
            run_id: run_id.clone(),
            meta: node.meta.clone(),
            config: job_config.clone(),
        };
        prepare_set.spawn_blocking(move || {
            let run_id = job.run_id.clone();
            endpoint
                .submit(job)
                .and_then(|()| endpoint.prepare(&run_id))
                .map_err(|e| PipelineError::coordination(&name, e))
        });
    }
    let master_meta = split.master.meta.clone();
    let master_name = split.master.server.name.clone();
    let registry = Arc::clone(&ctx.registry);
    let master_config = job_config;
    let master_prepare = tokio::task::spawn_blocking(move || {
        let mut graph = PipelineGraph::new(master_meta, registry, master_config).with_node(master_name);
        graph.prepare().map(|()| graph)
    });

    let mut first_error: Option<PipelineError> = None;
    while let Some(joined) = prepare_set.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(run_id = %run_id, error = %e, "slave prepare failed");
                first_error.get_or_insert(e);
            }
            Err(join_err) => {
                first_error.get_or_insert(PipelineError::Infrastructure(anyhow::anyhow!(
                    "slave prepare task failed: {join_err}"
                )));
            }
        }
    }
    let master = match master_prepare.await {
        Ok(Ok(graph)) => Some(graph),
        Ok(Err(e)) => {
            tracing::error!(run_id = %run_id, error = %e, "master prepare failed");
            first_error.get_or_insert(e);
            None
        }
        Err(join_err) => {
            first_error.get_or_insert(PipelineError::Infrastructure(anyhow::anyhow!(
                "master prepare task failed: {join_err}"
            )));
            None
        }
    };
    let mut master = match (master, first_error) {
        (Some(graph), None) => graph,
        (graph, Some(err)) => {
            drop(graph);
            cleanup_all(&endpoints, &run_id).await;
            return Err(err);
        }
        (None, None) => {
            cleanup_all(&endpoints, &run_id).await;
            return Err(PipelineError::Infrastructure(anyhow::anyhow!(
                "master graph missing after prepare"
            )));
        }
    };

    for handle in &slaves {
        let id = run_id.clone();
        if let Err(e) = endpoint_call(&handle.endpoint, move |ep| ep.start(&id)).await {
            tracing::error!(run_id = %run_id, slave = %handle.name, error = %e, "slave start failed");
            drop(master);
            cleanup_all(&endpoints, &run_id).await;
            return Err(e);
        }
    }
    if let Err(e) = master.start() {
        drop(master);
        cleanup_all(&endpoints, &run_id).await;
        return Err(e);
    }

    let master_signal = master.stop_signal();
    let mut master_task = tokio::task::spawn_blocking(move || master.wait_until_finished());
    let mut master_result: Option<PipelineResult> = None;
    let mut first_failure: Option<FailureReport> = None;
    let mut stopping = false;

    loop {
        if master_result.is_none() && master_task.is_finished() {
            let result = match (&mut master_task).await {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => failed(e.report()),
                Err(join_err) => failed(
                    PipelineError::Infrastructure(anyhow::anyhow!(
                        "master wait task failed: {join_err}"
                    ))
                    .report(),
                ),
            };
            if let Some(report) = result.failure.as_ref() {
                note_failure(&mut first_failure, report);
            }
            master_result = Some(result);
        }

        for handle in slaves.iter_mut().filter(|h| h.result.is_none()) {
            let id = run_id.clone();
            let polled: Result<Option<PipelineResult>, PipelineError> = async {
                let state: RunState = endpoint_call(&handle.endpoint, move |ep| ep.status(&id)).await?;
                if !state.is_terminal() {
                    return Ok(None);
                }
                let id = run_id.clone();
                endpoint_call(&handle.endpoint, move |ep| ep.fetch_result(&id))
                    .await
                    .map(Some)
            }
            .await;
            match polled {
                Ok(None) => {}
                Ok(Some(result)) => {
                    tracing::info!(
                        run_id = %run_id,
                        slave = %handle.name,
                        success = result.success,
                        "slave finished"
                    );
                    if let Some(report) = result.failure.as_ref() {
                        note_failure(&mut first_failure, report);
                    }
                    handle.result = Some(result);
                }
                Err(e) => {
                    tracing::error!(run_id = %run_id, slave = %handle.name, error = %e, "lost contact with slave");
                    let report = e.report();
                    note_failure(&mut first_failure, &report);
                    handle.result = Some(failed(report));
                }
            }
        }

        // The master's join only returns once its readers are released, so
        // its failure is taken from the stop signal while it still runs.
        if let Some(report) = master_signal.first_failure() {
            note_failure(&mut first_failure, report);
        }
        let failing = first_failure.is_some()
            || master_signal.is_raised()
            || master_result.as_ref().is_some_and(|r| !r.success)
            || slaves
                .iter()
                .filter_map(|h| h.result.as_ref())
                .any(|r| !r.success);
        if failing && !stopping {
            stopping = true;
            tracing::warn!(run_id = %run_id, "clustered run failing, stopping every node");
            master_signal.raise();
            for handle in &slaves {
                let id = run_id.clone();
                if let Err(e) = endpoint_call(&handle.endpoint, move |ep| ep.stop(&id)).await {
                    tracing::warn!(slave = %handle.name, error = %e, "failed to stop slave");
                }
            }
        }

        if master_result.is_some() && slaves.iter().all(|h| h.result.is_some()) {
            break;
        }
        tokio::time::sleep(ctx.poll_interval).await;
    }

    let cleanup_error = cleanup_all(&endpoints, &run_id).await;

    let mut total = aggregate_results(
        master_result
            .into_iter()
            .chain(slaves.into_iter().filter_map(|h| h.result)),
    );
    if let Some(report) = first_failure {
        total.fail(report.clone());
        total.failure = Some(report);
    } else if let Some(err) = cleanup_error {
        total.fail(err.report());
    }
    tracing::info!(
        pipeline = %meta.name,
        run_id = %run_id,
        success = total.success,
        errors = total.nr_errors,
        lines_read = total.lines_read,
        lines_written = total.lines_written,
        "clustered run finished"
    );
    Ok(total)
}

/// Keep the first failure, except that a transport failure at a cut is
/// usually the echo of a failure on the other node and gives way to it.
fn note_failure(current: &mut Option<FailureReport>, report: &FailureReport) {
    let replace = match current {
        None => true,
        Some(seen) => seen.kind == FailureKind::Transport && report.kind != FailureKind::Transport,
    };
    if replace {
        *current = Some(report.clone());
    }
}

fn failed(report: FailureReport) -> PipelineResult {
    let mut result = PipelineResult::default();
    result.fail(report);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(kind: FailureKind, origin: &str) -> FailureReport {
        FailureReport {
            kind,
            origin: origin.into(),
            message: String::new(),
        }
    }

    #[test]
    fn test_root_cause_replaces_transport_echo() {
        let mut seen = None;
        note_failure(&mut seen, &report(FailureKind::Transport, "master/b.a.reader.s1.0"));
        note_failure(&mut seen, &report(FailureKind::StepFatal, "s1/b.0"));
        note_failure(&mut seen, &report(FailureKind::RowProcessing, "s2/c.0"));
        assert_eq!(seen.unwrap().origin, "s1/b.0");
    }

    #[test]
    fn test_first_transport_failure_kept_when_alone() {
        let mut seen = None;
        note_failure(&mut seen, &report(FailureKind::Transport, "master/x.0"));
        note_failure(&mut seen, &report(FailureKind::Transport, "s1/y.0"));
        assert_eq!(seen.unwrap().origin, "master/x.0");
    }
}

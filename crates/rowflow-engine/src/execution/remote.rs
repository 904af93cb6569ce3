use rowflow_types::{ExecutionConfiguration, PipelineResult, SlaveServer};

use super::{cleanup_all, endpoint_call, new_run_id, node_config, RunContext};
use crate::error::PipelineError;
use crate::meta::PipelineMeta;
use crate::remote::{RunState, SlaveJob};

/// Run the whole graph on one slave. There is no local fallback.
pub(super) async fn execute(
    meta: &PipelineMeta,
    ctx: &RunContext,
    config: &ExecutionConfiguration,
    server: &SlaveServer,
) -> Result<PipelineResult, PipelineError> {
    let endpoint = ctx.resolver.resolve(server)?;
    let run_id = new_run_id();
    tracing::info!(pipeline = %meta.name, slave = %server.name, run_id = %run_id, "dispatching to remote slave");

    let job = SlaveJob {
        run_id: run_id.clone(),
        meta: PipelineMeta {
            cluster: None,
            ..meta.clone()
        },
        config: node_config(config),
    };
    let id = run_id.clone();
    let dispatched: Result<PipelineResult, PipelineError> = async {
        endpoint_call(&endpoint, move |e| {
            e.submit(job)?;
            e.prepare(&id)?;
            e.start(&id)
        })
        .await?;
        loop {
            let id = run_id.clone();
            let state: RunState = endpoint_call(&endpoint, move |e| e.status(&id)).await?;
            if state.is_terminal() {
                break;
            }
            tokio::time::sleep(ctx.poll_interval).await;
        }
        let id = run_id.clone();
        endpoint_call(&endpoint, move |e| e.fetch_result(&id)).await
    }
    .await;

    let cleanup = cleanup_all(std::slice::from_ref(&endpoint), &run_id).await;
    let mut result = dispatched?;
    if let Some(err) = cleanup {
        if result.success {
            result.fail(err.report());
        }
    }
    tracing::info!(
        pipeline = %meta.name,
        slave = %server.name,
        success = result.success,
        errors = result.nr_errors,
        "remote run finished"
    );
    Ok(result)
}

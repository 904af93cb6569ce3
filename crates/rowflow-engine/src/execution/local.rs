use std::sync::Arc;

use rowflow_types::{ExecutionConfiguration, PipelineResult};

use super::RunContext;
use crate::error::PipelineError;
use crate::graph::PipelineGraph;
use crate::meta::PipelineMeta;

/// Prepare, start and wait for the whole graph in this process.
pub(super) async fn execute(
    meta: &PipelineMeta,
    ctx: &RunContext,
    config: &ExecutionConfiguration,
) -> Result<PipelineResult, PipelineError> {
    let mut graph = PipelineGraph::new(meta.clone(), Arc::clone(&ctx.registry), config.clone());
    tokio::task::spawn_blocking(move || graph.execute())
        .await
        .map_err(|e| PipelineError::Infrastructure(anyhow::anyhow!("pipeline task failed: {e}")))?
}

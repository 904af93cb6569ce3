use std::path::Path;

use anyhow::{Context, Result};
use rowflow_engine::config::{parser, validator};
use rowflow_engine::{split_pipeline, StepRegistry};

/// Execute the `split` command: print every node's sub-graph and the cuts
/// between them.
pub fn execute(pipeline_path: &Path) -> Result<()> {
    let meta = parser::parse_pipeline(pipeline_path)
        .with_context(|| format!("Failed to parse pipeline: {}", pipeline_path.display()))?;
    validator::validate_pipeline(&meta, &StepRegistry::with_builtins())?;

    let Some(schema) = &meta.cluster else {
        anyhow::bail!("Pipeline '{}' has no cluster schema to split over", meta.name);
    };
    let split = split_pipeline(&meta, schema)?;
    print!("{}", split.render());
    Ok(())
}

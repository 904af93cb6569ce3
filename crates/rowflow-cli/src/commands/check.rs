use std::path::Path;

use anyhow::{Context, Result};
use rowflow_engine::config::{parser, validator};
use rowflow_engine::{split_pipeline, StepRegistry};

/// Execute the `check` command: validate the pipeline and, when it carries a
/// cluster schema, that it splits cleanly.
pub fn execute(pipeline_path: &Path) -> Result<()> {
    // 1. Parse pipeline YAML
    let meta = parser::parse_pipeline(pipeline_path)
        .with_context(|| format!("Failed to parse pipeline: {}", pipeline_path.display()))?;

    // 2. Validate pipeline structure
    let registry = StepRegistry::with_builtins();
    validator::validate_pipeline(&meta, &registry)?;
    println!("Pipeline structure: OK");
    println!("  Steps:           {}", meta.steps.len());
    println!("  Hops:            {}", meta.hops.len());

    // 3. Check the cluster split
    if let Some(schema) = &meta.cluster {
        let split = split_pipeline(&meta, schema)
            .with_context(|| format!("Pipeline '{}' cannot be split", meta.name))?;
        println!(
            "Cluster split:      OK ({} node(s), {} cut(s))",
            split.slaves.len() + 1,
            split.cuts.len()
        );
    }

    println!("\nAll checks passed.");
    Ok(())
}

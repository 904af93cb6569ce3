use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use rowflow_engine::config::{parser, validator};
use rowflow_engine::{EndpointResolver, ExecutionStrategy, RunContext, StepRegistry};
use rowflow_types::{ExecutionConfiguration, LogLevel, PipelineResult};

/// Flags of the `run` command.
pub struct RunOptions {
    pub clustered: bool,
    pub remote: Option<String>,
    pub local_slaves: bool,
    pub safe_mode: bool,
    pub params: Vec<(String, String)>,
    pub copies: Option<u32>,
    pub queue_capacity: Option<usize>,
    pub log_level: LogLevel,
}

impl RunOptions {
    fn configuration(&self) -> ExecutionConfiguration {
        let mut config = ExecutionConfiguration {
            log_level: self.log_level,
            safe_mode: self.safe_mode,
            clustered: self.clustered,
            remote_server: self.remote.clone(),
            copies: self.copies,
            queue_capacity: self.queue_capacity,
            ..ExecutionConfiguration::default()
        };
        for (name, value) in &self.params {
            config.variables.set(name.clone(), value.clone());
        }
        config
    }
}

/// Parse a `--param K=V` argument.
pub fn parse_param(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected K=V, got '{raw}'")),
    }
}

/// Execute the `run` command: parse, validate, and run a pipeline.
pub async fn execute(pipeline_path: &Path, options: RunOptions) -> Result<()> {
    // 1. Parse pipeline YAML
    let meta = parser::parse_pipeline(pipeline_path)
        .with_context(|| format!("Failed to parse pipeline: {}", pipeline_path.display()))?;

    // 2. Validate
    let registry = Arc::new(StepRegistry::with_builtins());
    validator::validate_pipeline(&meta, &registry)?;

    let config = options.configuration();
    let strategy = ExecutionStrategy::select(&meta, &config)?;
    tracing::info!(
        pipeline = %meta.name,
        steps = meta.steps.len(),
        hops = meta.hops.len(),
        strategy = strategy.name(),
        "Pipeline validated"
    );

    // 3. Run
    let mut ctx = RunContext::new(Arc::clone(&registry));
    if options.local_slaves {
        match &meta.cluster {
            Some(schema) => ctx = ctx.with_resolver(EndpointResolver::in_process(&registry, schema)),
            None => bail!("--local-slaves needs a pipeline with a cluster schema"),
        }
    }
    let result = strategy.execute(&meta, &ctx, &config).await?;

    print_summary(&meta.name, &result);
    if !result.success {
        match &result.failure {
            Some(failure) => bail!("Pipeline '{}' failed: {failure}", meta.name),
            None if result.stopped => bail!("Pipeline '{}' was stopped", meta.name),
            None => bail!("Pipeline '{}' failed with {} error(s)", meta.name, result.nr_errors),
        }
    }
    Ok(())
}

fn print_summary(name: &str, result: &PipelineResult) {
    if result.success {
        println!("Pipeline '{name}' completed successfully.");
    } else {
        println!("Pipeline '{name}' FAILED.");
    }
    println!("  Errors:          {}", result.nr_errors);
    println!("  Lines read:      {}", result.lines_read);
    println!("  Lines written:   {}", result.lines_written);
    println!("  Lines input:     {}", result.lines_input);
    println!("  Lines output:    {}", result.lines_output);
    if result.lines_updated > 0 {
        println!("  Lines updated:   {}", result.lines_updated);
    }
    if result.lines_rejected > 0 {
        println!("  Lines rejected:  {}", result.lines_rejected);
    }
    println!("  Result rows:     {}", result.result_rows.len());
    for file in &result.result_files {
        println!("  Result file:     {} (from {})", file.path, file.origin_step);
    }
    println!("  Duration:        {:.2}s", result.duration_secs);
    if result.duration_secs > 0.0 {
        #[allow(clippy::cast_precision_loss)]
        let rows_per_sec = result.lines_written as f64 / result.duration_secs;
        println!("  Throughput:      {rows_per_sec:.0} rows/sec");
    }
    for step in result.steps.iter().filter(|s| s.error.is_some()) {
        println!(
            "  {}/{}.{}: {}",
            step.node,
            step.step,
            step.copy,
            step.error.as_deref().unwrap_or_default()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_param() {
        assert_eq!(
            parse_param("HOST=db.local").unwrap(),
            ("HOST".to_string(), "db.local".to_string())
        );
        assert_eq!(parse_param("EMPTY=").unwrap().1, "");
        assert_eq!(parse_param("URL=a=b").unwrap().1, "a=b");
        assert!(parse_param("novalue").is_err());
        assert!(parse_param("=x").is_err());
    }

    #[test]
    fn test_options_become_configuration() {
        let options = RunOptions {
            clustered: true,
            remote: None,
            local_slaves: false,
            safe_mode: true,
            params: vec![("A".into(), "1".into())],
            copies: Some(2),
            queue_capacity: None,
            log_level: LogLevel::Warn,
        };
        let config = options.configuration();
        assert!(config.clustered);
        assert!(config.safe_mode);
        assert_eq!(config.copies, Some(2));
        assert_eq!(config.variables.get("A"), Some("1"));
        assert_eq!(config.log_level, LogLevel::Warn);
    }
}

//! Semantic validation for parsed pipeline definitions.

use anyhow::{bail, Result};

use crate::meta::{PipelineMeta, Placement};
use crate::step::StepRegistry;

/// Problems that prevent a graph from being built on any node.
#[must_use]
pub fn graph_errors(meta: &PipelineMeta, registry: &StepRegistry) -> Vec<String> {
    let mut errors = Vec::new();

    if meta.name.trim().is_empty() {
        errors.push("Pipeline name must not be empty".to_string());
    }
    if meta.queue_capacity == 0 {
        errors.push("queue_capacity must be at least 1".to_string());
    }
    for step in &meta.steps {
        if !registry.contains(&step.step_type) {
            errors.push(format!(
                "Step '{}' has unknown type '{}'",
                step.name, step.step_type
            ));
        }
    }

    errors.extend(meta.structural_errors());
    errors
}

/// Placement and cluster schema problems. Only checked when the pipeline
/// carries a cluster schema; without one placements are ignored.
fn cluster_errors(meta: &PipelineMeta, errors: &mut Vec<String>) {
    let Some(schema) = &meta.cluster else {
        return;
    };
    if let Err(e) = schema.validate() {
        errors.push(e.to_string());
    }
    for step in &meta.steps {
        if let Placement::OneSlave(name) = &step.placement {
            match schema.find(name) {
                None => errors.push(format!(
                    "Step '{}' is placed on unknown slave server '{name}'",
                    step.name
                )),
                Some(server) if server.master => errors.push(format!(
                    "Step '{}' is placed on '{name}', which is the master; use placement 'master'",
                    step.name
                )),
                Some(_) => {}
            }
        }
    }
    for hop in meta.enabled_hops().filter(|h| h.feedback) {
        let (Some(from), Some(to)) = (meta.step(&hop.from), meta.step(&hop.to)) else {
            continue;
        };
        if from.placement != to.placement {
            errors.push(format!(
                "Feedback hop {} -> {} must stay on one node",
                hop.from, hop.to
            ));
        }
    }
}

/// Every problem found in `meta`, in a stable order.
#[must_use]
pub fn collect_errors(meta: &PipelineMeta, registry: &StepRegistry) -> Vec<String> {
    let mut errors = graph_errors(meta, registry);
    cluster_errors(meta, &mut errors);
    errors
}

/// Validate a parsed pipeline definition.
/// Returns `Ok(())` if valid, Err with all validation errors if not.
///
/// # Errors
///
/// Returns an error listing all validation failures found in the pipeline.
pub fn validate_pipeline(meta: &PipelineMeta, registry: &StepRegistry) -> Result<()> {
    let errors = collect_errors(meta, registry);
    if errors.is_empty() {
        Ok(())
    } else {
        bail!("Pipeline validation failed:\n  - {}", errors.join("\n  - "));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parser::parse_pipeline_str;

    fn registry() -> StepRegistry {
        StepRegistry::with_builtins()
    }

    fn valid_yaml() -> &'static str {
        r"
pipeline: test_pipeline
cluster:
  name: c
  slaves:
    - { name: master, host: 127.0.0.1, port: 8080, master: true }
    - { name: s1, host: 127.0.0.1, port: 8081 }
steps:
  - { name: gen, type: generator, settings: { end: 10 } }
  - { name: pass, type: passthrough, placement: every_slave }
  - { name: out, type: collector }
hops:
  - { from: gen, to: pass }
  - { from: pass, to: out }
"
    }

    #[test]
    fn test_valid_pipeline_passes() {
        let meta = parse_pipeline_str(valid_yaml()).unwrap();
        assert!(validate_pipeline(&meta, &registry()).is_ok());
    }

    #[test]
    fn test_unknown_type_and_slave_reported_together() {
        let mut meta = parse_pipeline_str(valid_yaml()).unwrap();
        meta.steps[1].step_type = "no_such_step".into();
        meta.steps[2].placement = Placement::OneSlave("s9".into());
        let err = validate_pipeline(&meta, &registry()).unwrap_err().to_string();
        assert!(err.starts_with("Pipeline validation failed:"));
        assert!(err.contains("unknown type 'no_such_step'"));
        assert!(err.contains("unknown slave server 's9'"));
    }

    #[test]
    fn test_master_as_one_slave_is_rejected() {
        let mut meta = parse_pipeline_str(valid_yaml()).unwrap();
        meta.steps[2].placement = Placement::OneSlave("master".into());
        let errors = collect_errors(&meta, &registry());
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("which is the master"));
    }

    #[test]
    fn test_schema_without_master_is_rejected() {
        let mut meta = parse_pipeline_str(valid_yaml()).unwrap();
        if let Some(schema) = meta.cluster.as_mut() {
            schema.slaves[0].master = false;
        }
        let errors = collect_errors(&meta, &registry());
        assert!(errors.iter().any(|e| e.contains("no master")));
    }

    #[test]
    fn test_cross_node_feedback_hop_is_rejected() {
        let mut meta = parse_pipeline_str(valid_yaml()).unwrap();
        meta.hops.push(crate::meta::HopMeta::new("out", "pass").feedback());
        let errors = collect_errors(&meta, &registry());
        assert!(errors.iter().any(|e| e.contains("must stay on one node")));
    }

    #[test]
    fn test_placements_ignored_without_cluster() {
        let mut meta = parse_pipeline_str(valid_yaml()).unwrap();
        meta.cluster = None;
        meta.steps[2].placement = Placement::OneSlave("anywhere".into());
        assert!(collect_errors(&meta, &registry()).is_empty());
    }
}

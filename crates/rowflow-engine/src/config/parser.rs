//! Pipeline YAML parsing with environment variable substitution.

use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::{Captures, Regex};

use crate::meta::PipelineMeta;

static ENV_VAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid env var regex"));

/// Substitute `${VAR_NAME}` patterns with environment variable values.
///
/// Names not set in the environment are left as written; they may be run
/// variables resolved when the step starts.
#[must_use]
pub fn substitute_env_vars(input: &str) -> String {
    ENV_VAR_RE
        .replace_all(input, |cap: &Captures<'_>| {
            std::env::var(&cap[1]).unwrap_or_else(|_| cap[0].to_string())
        })
        .into_owned()
}

/// Parse a pipeline YAML string (after env var substitution).
///
/// # Errors
///
/// Returns an error if the YAML is invalid.
pub fn parse_pipeline_str(yaml_str: &str) -> Result<PipelineMeta> {
    let substituted = substitute_env_vars(yaml_str);
    let meta: PipelineMeta =
        serde_yaml::from_str(&substituted).context("Failed to parse pipeline YAML")?;
    Ok(meta)
}

/// Parse a pipeline YAML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or the YAML is invalid.
pub fn parse_pipeline(path: &Path) -> Result<PipelineMeta> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read pipeline file: {}", path.display()))?;
    parse_pipeline_str(&content)
        .with_context(|| format!("Invalid pipeline file: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use rowflow_types::CompressionCodec;

    use super::*;
    use crate::meta::{Distribution, Placement};

    const DEMO: &str = r"
pipeline: demo
queue_capacity: 1000
cluster:
  name: local
  base_port: 40000
  compression: lz4
  slaves:
    - { name: master, host: 127.0.0.1, port: 8080, master: true }
    - { name: s1, host: 127.0.0.1, port: 8081 }
steps:
  - { name: gen, type: generator, settings: { start: 1, end: 100 } }
  - { name: pass, type: passthrough, placement: every_slave, copies: 2, distribution: copy }
  - { name: out, type: collector, placement: 'slave:s1' }
hops:
  - { from: gen, to: pass }
  - { from: pass, to: out }
";

    #[test]
    fn test_env_var_substitution() {
        std::env::set_var("RF_TEST_HOST", "myhost.example.com");
        let result = substitute_env_vars("host: ${RF_TEST_HOST}\nport: 5432");
        assert_eq!(result, "host: myhost.example.com\nport: 5432");
        std::env::remove_var("RF_TEST_HOST");
    }

    #[test]
    fn test_unset_env_var_is_left_for_run_variables() {
        let input = "path: ${RF_DEFINITELY_NOT_SET_12345}/out";
        assert_eq!(substitute_env_vars(input), input);
    }

    #[test]
    fn test_parse_pipeline_from_string() {
        let meta = parse_pipeline_str(DEMO).unwrap();
        assert_eq!(meta.name, "demo");
        assert_eq!(meta.queue_capacity, 1000);
        assert_eq!(meta.steps.len(), 3);
        assert_eq!(meta.steps[0].settings["end"], 100);
        assert_eq!(meta.steps[1].placement, Placement::EverySlave);
        assert_eq!(meta.steps[1].copies, Some(2));
        assert_eq!(meta.steps[1].distribution, Distribution::Copy);
        assert_eq!(meta.steps[2].placement, Placement::OneSlave("s1".into()));
        assert!(meta.hops.iter().all(|h| h.enabled && !h.feedback));

        let cluster = meta.cluster.unwrap();
        assert_eq!(cluster.compression, Some(CompressionCodec::Lz4));
        assert_eq!(cluster.port_range, 100);
        assert_eq!(cluster.master().unwrap().name, "master");
    }

    #[test]
    fn test_parse_invalid_yaml_errors() {
        let result = parse_pipeline_str("this is not: [valid: yaml: {{{}}}");
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_pipeline_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(DEMO.as_bytes()).unwrap();
        let meta = parse_pipeline(file.path()).unwrap();
        assert_eq!(meta.hops.len(), 2);
    }

    #[test]
    fn test_parse_pipeline_file_not_found() {
        let result = parse_pipeline(Path::new("/nonexistent/pipeline.yaml"));
        let err_msg = result.unwrap_err().to_string();
        assert!(err_msg.contains("Failed to read pipeline file"));
    }
}

//! How a pipeline runs: in-process, on one remote slave, or split over a
//! cluster.

mod clustered;
mod local;
mod remote;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rowflow_types::{ClusterSchema, ExecutionConfiguration, PipelineResult, SlaveServer};

use crate::error::PipelineError;
use crate::meta::PipelineMeta;
use crate::remote::{EndpointError, EndpointResolver, SlaveEndpoint};
use crate::step::StepRegistry;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

static RUN_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Collaborators of one run. Nothing here is process-global.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub registry: Arc<StepRegistry>,
    pub resolver: EndpointResolver,
    /// Pause between slave status polls.
    pub poll_interval: Duration,
}

impl RunContext {
    #[must_use]
    pub fn new(registry: Arc<StepRegistry>) -> Self {
        Self {
            registry,
            resolver: EndpointResolver::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    #[must_use]
    pub fn with_resolver(mut self, resolver: EndpointResolver) -> Self {
        self.resolver = resolver;
        self
    }

    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new(Arc::new(StepRegistry::with_builtins()))
    }
}

/// Execution façade chosen from the [`ExecutionConfiguration`].
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionStrategy {
    Local,
    Remote { server: SlaveServer },
    Clustered { schema: ClusterSchema },
}

impl ExecutionStrategy {
    /// Pick the strategy for `config`, resolving servers against the
    /// pipeline's cluster schema.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Validation`] when a remote or clustered run
    /// is requested without a matching cluster schema, or both are requested.
    pub fn select(
        meta: &PipelineMeta,
        config: &ExecutionConfiguration,
    ) -> Result<Self, PipelineError> {
        let schema = || {
            meta.cluster.as_ref().ok_or_else(|| {
                PipelineError::Validation(format!(
                    "pipeline '{}' has no cluster schema",
                    meta.name
                ))
            })
        };
        match (&config.remote_server, config.clustered) {
            (Some(_), true) => Err(PipelineError::Validation(
                "a run is either remote or clustered, not both".to_string(),
            )),
            (Some(name), false) => {
                let server = schema()?.find(name).ok_or_else(|| {
                    PipelineError::Validation(format!("unknown slave server '{name}'"))
                })?;
                Ok(Self::Remote {
                    server: server.clone(),
                })
            }
            (None, true) => Ok(Self::Clustered {
                schema: schema()?.clone(),
            }),
            (None, false) => Ok(Self::Local),
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote { .. } => "remote",
            Self::Clustered { .. } => "clustered",
        }
    }

    /// Run `meta` to completion.
    ///
    /// # Errors
    ///
    /// Returns `Err` when the run could not be started or coordinated. A run
    /// that started and failed returns `Ok` with `success == false` and a
    /// failure report.
    pub async fn execute(
        &self,
        meta: &PipelineMeta,
        ctx: &RunContext,
        config: &ExecutionConfiguration,
    ) -> Result<PipelineResult, PipelineError> {
        tracing::info!(pipeline = %meta.name, strategy = self.name(), "executing pipeline");
        match self {
            Self::Local => local::execute(meta, ctx, config).await,
            Self::Remote { server } => remote::execute(meta, ctx, config, server).await,
            Self::Clustered { schema } => clustered::execute(meta, ctx, config, schema).await,
        }
    }
}

/// The configuration a slave runs its sub-graph with.
fn node_config(config: &ExecutionConfiguration) -> ExecutionConfiguration {
    ExecutionConfiguration {
        clustered: false,
        remote_server: None,
        ..config.clone()
    }
}

/// Identifier of one remote or clustered run. Slaves key their run tables by
/// it, so it must differ between masters sharing a slave.
fn new_run_id() -> String {
    format!(
        "{}-{}-{}",
        chrono::Utc::now().format("%Y%m%dT%H%M%S%.3f"),
        std::process::id(),
        RUN_SEQUENCE.fetch_add(1, Ordering::Relaxed)
    )
}

/// Run one blocking endpoint call off the async runtime.
async fn endpoint_call<T, F>(endpoint: &Arc<dyn SlaveEndpoint>, call: F) -> Result<T, PipelineError>
where
    T: Send + 'static,
    F: FnOnce(&dyn SlaveEndpoint) -> Result<T, EndpointError> + Send + 'static,
{
    let endpoint = Arc::clone(endpoint);
    let name = endpoint.name().to_string();
    tokio::task::spawn_blocking(move || call(endpoint.as_ref()))
        .await
        .map_err(|e| PipelineError::Infrastructure(anyhow::anyhow!("endpoint task failed: {e}")))?
        .map_err(|e| PipelineError::coordination(&name, e))
}

/// Stop and clean up `run_id` on every endpoint. Errors are logged and the
/// first one returned.
async fn cleanup_all(endpoints: &[Arc<dyn SlaveEndpoint>], run_id: &str) -> Option<PipelineError> {
    let mut first = None;
    for endpoint in endpoints {
        let id = run_id.to_string();
        let outcome = endpoint_call(endpoint, move |e| {
            let stopped = e.stop(&id);
            let cleaned = e.cleanup(&id);
            stopped.and(cleaned)
        })
        .await;
        if let Err(err) = outcome {
            tracing::warn!(slave = %endpoint.name(), run_id, error = %err, "slave cleanup failed");
            first.get_or_insert(PipelineError::Cleanup {
                slave: endpoint.name().to_string(),
                message: err.to_string(),
            });
        }
    }
    first
}

#[cfg(test)]
mod tests {
    use rowflow_types::SlaveServer;

    use super::*;

    fn meta() -> PipelineMeta {
        PipelineMeta::new("p").with_cluster(ClusterSchema::new(
            "c",
            vec![
                SlaveServer::new("m", "127.0.0.1", 1).as_master(),
                SlaveServer::new("s1", "127.0.0.1", 2),
            ],
        ))
    }

    #[test]
    fn test_select_strategy() {
        let meta = meta();
        assert_eq!(
            ExecutionStrategy::select(&meta, &ExecutionConfiguration::local()).unwrap(),
            ExecutionStrategy::Local
        );
        assert!(matches!(
            ExecutionStrategy::select(&meta, &ExecutionConfiguration::clustered()).unwrap(),
            ExecutionStrategy::Clustered { .. }
        ));
        match ExecutionStrategy::select(&meta, &ExecutionConfiguration::remote("s1")).unwrap() {
            ExecutionStrategy::Remote { server } => assert_eq!(server.name, "s1"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_run_ids_are_unique() {
        let a = new_run_id();
        let b = new_run_id();
        assert_ne!(a, b);
        assert!(a.contains(&std::process::id().to_string()));
    }

    #[test]
    fn test_select_rejects_missing_schema_and_server() {
        let bare = PipelineMeta::new("p");
        assert!(ExecutionStrategy::select(&bare, &ExecutionConfiguration::clustered()).is_err());
        assert!(ExecutionStrategy::select(&meta(), &ExecutionConfiguration::remote("s9")).is_err());
        let both = ExecutionConfiguration {
            clustered: true,
            ..ExecutionConfiguration::remote("s1")
        };
        assert!(ExecutionStrategy::select(&meta(), &both).is_err());
    }
}

use std::collections::HashMap;
use std::sync::Arc;

use rowflow_types::{ClusterSchema, SlaveServer};

use super::endpoint::SlaveEndpoint;
use super::in_process::InProcessSlave;
use super::tcp::TcpSlaveClient;
use crate::error::PipelineError;
use crate::step::StepRegistry;

/// Maps slave servers to endpoints for one run.
///
/// Explicitly registered endpoints win; otherwise a [`TcpSlaveClient`] is
/// built for the server's host and port unless TCP fallback is disabled.
#[derive(Clone)]
pub struct EndpointResolver {
    endpoints: HashMap<String, Arc<dyn SlaveEndpoint>>,
    tcp_fallback: bool,
}

impl Default for EndpointResolver {
    fn default() -> Self {
        Self {
            endpoints: HashMap::new(),
            tcp_fallback: true,
        }
    }
}

impl EndpointResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// An in-process slave for every non-master server of `schema`; the
    /// whole cluster runs in this process.
    #[must_use]
    pub fn in_process(registry: &Arc<StepRegistry>, schema: &ClusterSchema) -> Self {
        let mut resolver = Self::new().without_tcp_fallback();
        for server in schema.slave_servers() {
            resolver.register(
                server.name.clone(),
                Arc::new(InProcessSlave::new(server.name.clone(), Arc::clone(registry))),
            );
        }
        resolver
    }

    #[must_use]
    pub fn without_tcp_fallback(mut self) -> Self {
        self.tcp_fallback = false;
        self
    }

    pub fn register(&mut self, server: impl Into<String>, endpoint: Arc<dyn SlaveEndpoint>) {
        self.endpoints.insert(server.into(), endpoint);
    }

    /// # Errors
    ///
    /// Returns [`PipelineError::ClusterCoordination`] when no endpoint is
    /// registered for `server` and TCP fallback is disabled.
    pub fn resolve(&self, server: &SlaveServer) -> Result<Arc<dyn SlaveEndpoint>, PipelineError> {
        if let Some(endpoint) = self.endpoints.get(&server.name) {
            return Ok(Arc::clone(endpoint));
        }
        if self.tcp_fallback {
            return Ok(Arc::new(TcpSlaveClient::new(server.clone())));
        }
        Err(PipelineError::coordination(
            &server.name,
            "no endpoint registered for this slave server",
        ))
    }
}

impl std::fmt::Debug for EndpointResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointResolver")
            .field("endpoints", &self.endpoints.keys().collect::<Vec<_>>())
            .field("tcp_fallback", &self.tcp_fallback)
            .finish()
    }
}

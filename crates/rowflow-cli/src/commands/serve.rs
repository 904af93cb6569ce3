use std::sync::Arc;

use anyhow::{Context, Result};
use rowflow_engine::remote::{serve, ServerCredentials};
use rowflow_engine::{InProcessSlave, SlaveEndpoint, StepRegistry};

/// Execute the `serve` command: accept sub-graphs from a master until the
/// process is killed.
pub async fn execute(
    name: String,
    host: &str,
    port: u16,
    username: Option<String>,
    password: Option<String>,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind((host, port))
        .await
        .with_context(|| format!("Failed to bind slave server on {host}:{port}"))?;
    if username.is_none() {
        tracing::warn!(slave = %name, "slave server accepts requests without credentials");
    }
    let registry = Arc::new(StepRegistry::with_builtins());
    let endpoint: Arc<dyn SlaveEndpoint> = Arc::new(InProcessSlave::new(name, registry));
    serve(listener, endpoint, ServerCredentials::new(username, password)).await
}

//! Tokio JSON-lines server exposing a [`SlaveEndpoint`].

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use super::endpoint::{EndpointError, SlaveEndpoint};
use super::protocol::{Credentials, Op, Request, Response};

/// Credentials a server requires. No username means no check.
#[derive(Debug, Clone, Default)]
pub struct ServerCredentials {
    username: Option<String>,
    password: Option<String>,
}

impl ServerCredentials {
    #[must_use]
    pub fn new(username: Option<String>, password: Option<String>) -> Self {
        Self { username, password }
    }

    fn accepts(&self, given: &Credentials) -> bool {
        match &self.username {
            None => true,
            Some(user) => {
                given.username.as_deref() == Some(user.as_str()) && given.password == self.password
            }
        }
    }
}

/// Serve `endpoint` on `listener` until the task is dropped or accept fails.
///
/// Each request runs on a blocking task so slow endpoint calls (prepare,
/// cleanup) never stall the runtime.
///
/// # Errors
///
/// Returns an error if the listener fails.
pub async fn serve(
    listener: TcpListener,
    endpoint: Arc<dyn SlaveEndpoint>,
    credentials: ServerCredentials,
) -> Result<()> {
    let addr = listener.local_addr().context("listener has no local address")?;
    tracing::info!(%addr, slave = %endpoint.name(), "slave server listening");
    loop {
        let (stream, peer) = listener
            .accept()
            .await
            .context("failed to accept slave connection")?;
        let endpoint = Arc::clone(&endpoint);
        let credentials = credentials.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, endpoint, credentials).await {
                tracing::warn!(%peer, error = %e, "slave connection failed");
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    endpoint: Arc<dyn SlaveEndpoint>,
    credentials: ServerCredentials,
) -> Result<()> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Request>(&line) {
            Err(e) => Response::error(format!("malformed request: {e}")),
            Ok(request) if !credentials.accepts(&request.credentials) => {
                tracing::warn!(op = ?request.op, "rejected request with invalid credentials");
                Response::error(EndpointError::Unauthorized.to_string())
            }
            Ok(request) => {
                let endpoint = Arc::clone(&endpoint);
                tokio::task::spawn_blocking(move || dispatch(endpoint.as_ref(), request))
                    .await
                    .unwrap_or_else(|e| Response::error(format!("request handler failed: {e}")))
            }
        };
        let mut out = serde_json::to_vec(&response).context("failed to encode response")?;
        out.push(b'\n');
        write.write_all(&out).await?;
    }
    Ok(())
}

fn dispatch(endpoint: &dyn SlaveEndpoint, request: Request) -> Response {
    let Request {
        op, run_id, job, ..
    } = request;
    let Some(run_id) = run_id else {
        return Response::error("request without run_id");
    };
    tracing::debug!(op = ?op, run_id = %run_id, "slave request");
    let outcome = match op {
        Op::Submit => job
            .ok_or_else(|| EndpointError::Protocol("submit without job".into()))
            .and_then(|job| endpoint.submit(job))
            .map(|()| Response::ok()),
        Op::Prepare => endpoint.prepare(&run_id).map(|()| Response::ok()),
        Op::Start => endpoint.start(&run_id).map(|()| Response::ok()),
        Op::Status => endpoint.status(&run_id).map(|state| Response {
            status: Some(state),
            ..Response::ok()
        }),
        Op::FetchResult => endpoint.fetch_result(&run_id).map(|result| Response {
            result: Some(result),
            ..Response::ok()
        }),
        Op::Stop => endpoint.stop(&run_id).map(|()| Response::ok()),
        Op::Cleanup => endpoint.cleanup(&run_id).map(|()| Response::ok()),
    };
    outcome.unwrap_or_else(|e| Response::error(e.to_string()))
}

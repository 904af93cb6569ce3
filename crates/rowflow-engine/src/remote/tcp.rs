use std::io::{BufRead, BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use rowflow_types::{PipelineResult, SlaveServer};

use super::endpoint::{EndpointError, RunState, SlaveEndpoint, SlaveJob};
use super::protocol::{Credentials, Op, Request, Response};

const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Talks to a remote slave server over JSON lines, one connection per
/// request.
pub struct TcpSlaveClient {
    server: SlaveServer,
    timeout: Duration,
}

impl TcpSlaveClient {
    #[must_use]
    pub fn new(server: SlaveServer) -> Self {
        Self {
            server,
            timeout: DEFAULT_IO_TIMEOUT,
        }
    }

    /// Connect and per-request read/write timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn credentials(&self) -> Credentials {
        Credentials {
            username: self.server.username.clone(),
            password: self.server.password.clone(),
        }
    }

    fn connect(&self) -> Result<TcpStream, EndpointError> {
        let mut last_err = None;
        for addr in (self.server.host.as_str(), self.server.port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(self.timeout))?;
                    stream.set_write_timeout(Some(self.timeout))?;
                    return Ok(stream);
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.map_or_else(
            || EndpointError::Protocol(format!("{} resolves to no address", self.server)),
            EndpointError::Io,
        ))
    }

    fn call(&self, request: &Request) -> Result<Response, EndpointError> {
        let mut stream = self.connect()?;
        let mut line =
            serde_json::to_vec(request).map_err(|e| EndpointError::Protocol(e.to_string()))?;
        line.push(b'\n');
        stream.write_all(&line)?;
        stream.flush()?;

        let mut reader = BufReader::new(stream);
        let mut reply = String::new();
        if reader.read_line(&mut reply)? == 0 {
            return Err(EndpointError::Protocol(format!(
                "{} closed the connection without replying",
                self.server
            )));
        }
        let response: Response = serde_json::from_str(reply.trim())
            .map_err(|e| EndpointError::Protocol(e.to_string()))?;
        if response.ok {
            Ok(response)
        } else {
            Err(EndpointError::Rejected(
                response.error.unwrap_or_else(|| "request failed".to_string()),
            ))
        }
    }

    fn simple(&self, op: Op, run_id: &str) -> Result<Response, EndpointError> {
        self.call(&Request::new(op, self.credentials(), run_id))
    }
}

impl SlaveEndpoint for TcpSlaveClient {
    fn name(&self) -> &str {
        &self.server.name
    }

    fn submit(&self, job: SlaveJob) -> Result<(), EndpointError> {
        self.call(&Request::submit(self.credentials(), job)).map(drop)
    }

    fn prepare(&self, run_id: &str) -> Result<(), EndpointError> {
        self.simple(Op::Prepare, run_id).map(drop)
    }

    fn start(&self, run_id: &str) -> Result<(), EndpointError> {
        self.simple(Op::Start, run_id).map(drop)
    }

    fn status(&self, run_id: &str) -> Result<RunState, EndpointError> {
        self.simple(Op::Status, run_id)?
            .status
            .ok_or_else(|| EndpointError::Protocol("status response without status".into()))
    }

    fn fetch_result(&self, run_id: &str) -> Result<PipelineResult, EndpointError> {
        self.simple(Op::FetchResult, run_id)?
            .result
            .ok_or_else(|| EndpointError::Protocol("result response without result".into()))
    }

    fn stop(&self, run_id: &str) -> Result<(), EndpointError> {
        self.simple(Op::Stop, run_id).map(drop)
    }

    fn cleanup(&self, run_id: &str) -> Result<(), EndpointError> {
        self.simple(Op::Cleanup, run_id).map(drop)
    }
}

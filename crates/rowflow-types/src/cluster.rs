//! Cluster topology: slave servers and the schema that orders them.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::compression::CompressionCodec;

const DEFAULT_BASE_PORT: u16 = 40_000;
const DEFAULT_PORT_RANGE: u16 = 100;
const DEFAULT_SOCKETS_BUFFER_SIZE: usize = 50_000;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_RETRY_INTERVAL_MS: u64 = 1_000;

/// A named worker (or the master) exposing an execution endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlaveServer {
    pub name: String,
    pub host: String,
    /// Port of the execution endpoint (not the row transport ports).
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub master: bool,
}

impl SlaveServer {
    #[must_use]
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            username: None,
            password: None,
            master: false,
        }
    }

    #[must_use]
    pub fn as_master(mut self) -> Self {
        self.master = true;
        self
    }

    #[must_use]
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }
}

impl fmt::Display for SlaveServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{})", self.name, self.host, self.port)
    }
}

/// Reasons a [`ClusterSchema`] cannot be used.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClusterSchemaError {
    #[error("cluster schema '{0}' has no master server")]
    NoMaster(String),
    #[error("cluster schema '{0}' has more than one master server")]
    MultipleMasters(String),
    #[error("cluster schema '{0}' needs at least one slave server")]
    NoSlaves(String),
    #[error("cluster schema '{schema}' lists server '{server}' more than once")]
    DuplicateServer { schema: String, server: String },
    #[error("cluster schema '{0}': port_range must be at least 1")]
    EmptyPortRange(String),
}

/// Ordered, uniquely named servers plus the cluster-wide transport settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSchema {
    pub name: String,
    /// First port of the row transport range; each node owns `port_range`
    /// ports starting at `base_port + node_index * port_range`.
    #[serde(default = "default_base_port")]
    pub base_port: u16,
    #[serde(default = "default_port_range")]
    pub port_range: u16,
    #[serde(default = "default_sockets_buffer_size")]
    pub sockets_buffer_size: usize,
    #[serde(default)]
    pub compression: Option<CompressionCodec>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
    pub slaves: Vec<SlaveServer>,
}

fn default_base_port() -> u16 {
    DEFAULT_BASE_PORT
}
fn default_port_range() -> u16 {
    DEFAULT_PORT_RANGE
}
fn default_sockets_buffer_size() -> usize {
    DEFAULT_SOCKETS_BUFFER_SIZE
}
fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}
fn default_retry_interval_ms() -> u64 {
    DEFAULT_RETRY_INTERVAL_MS
}

impl ClusterSchema {
    #[must_use]
    pub fn new(name: impl Into<String>, slaves: Vec<SlaveServer>) -> Self {
        Self {
            name: name.into(),
            base_port: DEFAULT_BASE_PORT,
            port_range: DEFAULT_PORT_RANGE,
            sockets_buffer_size: DEFAULT_SOCKETS_BUFFER_SIZE,
            compression: None,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            retry_interval_ms: DEFAULT_RETRY_INTERVAL_MS,
            slaves,
        }
    }

    #[must_use]
    pub fn with_base_port(mut self, base_port: u16) -> Self {
        self.base_port = base_port;
        self
    }

    #[must_use]
    pub fn with_compression(mut self, compression: Option<CompressionCodec>) -> Self {
        self.compression = compression;
        self
    }

    /// Check master/slave designation and name uniqueness.
    ///
    /// # Errors
    ///
    /// Returns the first structural problem found.
    pub fn validate(&self) -> Result<(), ClusterSchemaError> {
        let mut seen = HashSet::new();
        for server in &self.slaves {
            if !seen.insert(server.name.as_str()) {
                return Err(ClusterSchemaError::DuplicateServer {
                    schema: self.name.clone(),
                    server: server.name.clone(),
                });
            }
        }
        match self.slaves.iter().filter(|s| s.master).count() {
            0 => return Err(ClusterSchemaError::NoMaster(self.name.clone())),
            1 => {}
            _ => return Err(ClusterSchemaError::MultipleMasters(self.name.clone())),
        }
        if self.slave_servers().next().is_none() {
            return Err(ClusterSchemaError::NoSlaves(self.name.clone()));
        }
        if self.port_range == 0 {
            return Err(ClusterSchemaError::EmptyPortRange(self.name.clone()));
        }
        Ok(())
    }

    #[must_use]
    pub fn master(&self) -> Option<&SlaveServer> {
        self.slaves.iter().find(|s| s.master)
    }

    /// Non-master servers in schema order.
    pub fn slave_servers(&self) -> impl Iterator<Item = &SlaveServer> {
        self.slaves.iter().filter(|s| !s.master)
    }

    #[must_use]
    pub fn slave_count(&self) -> usize {
        self.slave_servers().count()
    }

    /// Zero-based position of `name` among the non-master servers.
    #[must_use]
    pub fn slave_number(&self, name: &str) -> Option<usize> {
        self.slave_servers().position(|s| s.name == name)
    }

    #[must_use]
    pub fn find(&self, name: &str) -> Option<&SlaveServer> {
        self.slaves.iter().find(|s| s.name == name)
    }
}

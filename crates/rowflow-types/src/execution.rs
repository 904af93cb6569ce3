//! Per-run execution settings.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::variables::Variables;

/// Verbosity requested for a run. Slaves receive it with their sub-graph.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(Self::Error),
            "warn" => Ok(Self::Warn),
            "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            "trace" => Ok(Self::Trace),
            other => Err(format!("unknown log level '{other}'")),
        }
    }
}

/// How a run should execute. Built once, then only read.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionConfiguration {
    #[serde(default)]
    pub variables: Variables,
    #[serde(default)]
    pub log_level: LogLevel,
    /// Fail a step that receives rows of differing layouts.
    #[serde(default)]
    pub safe_mode: bool,
    /// Split over the pipeline's cluster schema.
    #[serde(default)]
    pub clustered: bool,
    /// Run the whole graph on this named slave server.
    #[serde(default)]
    pub remote_server: Option<String>,
    /// Copy count for steps that do not declare their own.
    #[serde(default)]
    pub copies: Option<u32>,
    /// Row queue capacity override.
    #[serde(default)]
    pub queue_capacity: Option<usize>,
}

impl ExecutionConfiguration {
    #[must_use]
    pub fn local() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn clustered() -> Self {
        Self {
            clustered: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn remote(server: impl Into<String>) -> Self {
        Self {
            remote_server: Some(server.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.set(name, value);
        self
    }

    #[must_use]
    pub fn with_safe_mode(mut self, safe_mode: bool) -> Self {
        self.safe_mode = safe_mode;
        self
    }

    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    /// Same configuration with extra variables layered on top.
    #[must_use]
    pub fn with_variables(&self, extra: &Variables) -> Self {
        let mut copy = self.clone();
        copy.variables.extend_from(extra);
        copy
    }
}

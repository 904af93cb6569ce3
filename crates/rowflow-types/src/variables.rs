//! Per-run variable space and `${NAME}` substitution.
//!
//! Every run owns its own [`Variables`]; nothing is looked up from process-wide
//! state, so several runs can share one process.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

pub const SLAVE_SERVER_NAME: &str = "Internal.Slave.Server.Name";
pub const SLAVE_SERVER_NUMBER: &str = "Internal.Slave.Server.Number";
pub const CLUSTER_SIZE: &str = "Internal.Cluster.Size";
pub const CLUSTER_MASTER: &str = "Internal.Cluster.Master";
pub const STEP_COPY: &str = "Internal.Step.Copy";
/// Partition served by an `every_slave` step copy: the slave number, so it
/// matches the queue a partitioning producer picks for the same key.
pub const STEP_PARTITION_ID: &str = "Internal.Step.Partition.ID";

static VAR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_.\-]*)\}").expect("valid variable regex")
});

/// Ordered name/value map. Later layers override earlier ones.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Variables(BTreeMap<String, String>);

impl Variables {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(name, value);
        self
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Copy every entry of `other` over this map.
    pub fn extend_from(&mut self, other: &Variables) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }

    /// A new map holding `self` overlaid with `top`.
    #[must_use]
    pub fn layered(&self, top: &Variables) -> Variables {
        let mut merged = self.clone();
        merged.extend_from(top);
        merged
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Replace every `${NAME}` with its value. Unknown names are left as-is.
    #[must_use]
    pub fn substitute(&self, input: &str) -> String {
        VAR_RE
            .replace_all(input, |caps: &regex::Captures<'_>| {
                self.get(&caps[1])
                    .map_or_else(|| caps[0].to_string(), str::to_string)
            })
            .into_owned()
    }

    /// Names referenced by `input` that have no value.
    #[must_use]
    pub fn unresolved(&self, input: &str) -> Vec<String> {
        VAR_RE
            .captures_iter(input)
            .filter(|caps| self.get(&caps[1]).is_none())
            .map(|caps| caps[1].to_string())
            .collect()
    }

    /// Substitute inside every string of a JSON document.
    #[must_use]
    pub fn substitute_json(&self, value: &serde_json::Value) -> serde_json::Value {
        match value {
            serde_json::Value::String(s) => serde_json::Value::String(self.substitute(s)),
            serde_json::Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(|v| self.substitute_json(v)).collect())
            }
            serde_json::Value::Object(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.substitute_json(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Variables {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

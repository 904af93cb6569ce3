//! Pipeline graph definitions: steps, hops, placement.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;

use rowflow_types::{ClusterSchema, Variables};
use serde::{Deserialize, Serialize};

use crate::queue::DEFAULT_QUEUE_CAPACITY;

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

fn yes() -> bool {
    true
}

/// A whole pipeline: steps plus the hops that connect them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineMeta {
    #[serde(rename = "pipeline")]
    pub name: String,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Pipeline-level variables; run variables override them.
    #[serde(default)]
    pub variables: Variables,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<ClusterSchema>,
    #[serde(default)]
    pub steps: Vec<StepMeta>,
    #[serde(default)]
    pub hops: Vec<HopMeta>,
}

/// Where a step runs in a clustered execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Placement {
    #[default]
    Master,
    EverySlave,
    /// Exactly one named slave server.
    OneSlave(String),
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Master => f.write_str("master"),
            Self::EverySlave => f.write_str("every_slave"),
            Self::OneSlave(name) => write!(f, "slave:{name}"),
        }
    }
}

impl TryFrom<String> for Placement {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "master" => Ok(Self::Master),
            "every_slave" => Ok(Self::EverySlave),
            other => match other.strip_prefix("slave:") {
                Some(name) if !name.trim().is_empty() => Ok(Self::OneSlave(name.trim().to_string())),
                _ => Err(format!(
                    "invalid placement '{other}', expected master, every_slave or slave:<name>"
                )),
            },
        }
    }
}

impl From<Placement> for String {
    fn from(value: Placement) -> Self {
        value.to_string()
    }
}

/// How a step spreads its output over several output queues.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Distribution {
    /// Round-robin: each row goes to exactly one output queue.
    #[default]
    Distribute,
    /// Each target step receives every row.
    Copy,
    /// Each row goes to exactly one output queue, chosen from the value of
    /// `field`. Queues are numbered over all output hops in hop order, so
    /// rows sent to an `every_slave` step reach slave number
    /// `partition_of(key, slaves)`.
    Partition { field: String },
}

/// One step of the graph. Copies share this definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepMeta {
    pub name: String,
    /// Registry key of the step implementation.
    #[serde(rename = "type")]
    pub step_type: String,
    /// Parallel copies; falls back to the run's default, then 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copies: Option<u32>,
    #[serde(default)]
    pub placement: Placement,
    #[serde(default)]
    pub distribution: Distribution,
    /// Target step that receives rows this step rejects.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_hop: Option<String>,
    /// Step-specific settings. Strings may reference `${VAR}`.
    #[serde(default)]
    pub settings: serde_json::Value,
    #[serde(default, skip_serializing_if = "Variables::is_empty")]
    pub variables: Variables,
}

impl StepMeta {
    #[must_use]
    pub fn new(name: impl Into<String>, step_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            step_type: step_type.into(),
            copies: None,
            placement: Placement::Master,
            distribution: Distribution::Distribute,
            error_hop: None,
            settings: serde_json::Value::Null,
            variables: Variables::new(),
        }
    }

    #[must_use]
    pub fn with_settings(mut self, settings: serde_json::Value) -> Self {
        self.settings = settings;
        self
    }

    #[must_use]
    pub fn with_copies(mut self, copies: u32) -> Self {
        self.copies = Some(copies);
        self
    }

    #[must_use]
    pub fn with_placement(mut self, placement: Placement) -> Self {
        self.placement = placement;
        self
    }

    #[must_use]
    pub fn with_distribution(mut self, distribution: Distribution) -> Self {
        self.distribution = distribution;
        self
    }

    #[must_use]
    pub fn with_error_hop(mut self, target: impl Into<String>) -> Self {
        self.error_hop = Some(target.into());
        self
    }

    /// Effective copy count given the run's default.
    #[must_use]
    pub fn effective_copies(&self, run_default: Option<u32>) -> u32 {
        self.copies.or(run_default).unwrap_or(1).max(1)
    }
}

/// A directed edge between two steps.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HopMeta {
    pub from: String,
    pub to: String,
    #[serde(default = "yes")]
    pub enabled: bool,
    /// Closes a loop. Excluded from cycle detection; its consumer does not
    /// wait for it to end.
    #[serde(default)]
    pub feedback: bool,
}

impl HopMeta {
    #[must_use]
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            enabled: true,
            feedback: false,
        }
    }

    #[must_use]
    pub fn feedback(mut self) -> Self {
        self.feedback = true;
        self
    }
}

impl PipelineMeta {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            variables: Variables::new(),
            cluster: None,
            steps: Vec::new(),
            hops: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_step(mut self, step: StepMeta) -> Self {
        self.steps.push(step);
        self
    }

    #[must_use]
    pub fn with_hop(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.hops.push(HopMeta::new(from, to));
        self
    }

    #[must_use]
    pub fn with_cluster(mut self, cluster: ClusterSchema) -> Self {
        self.cluster = Some(cluster);
        self
    }

    #[must_use]
    pub fn step(&self, name: &str) -> Option<&StepMeta> {
        self.steps.iter().find(|s| s.name == name)
    }

    #[must_use]
    pub fn step_index(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.name == name)
    }

    /// Enabled hops in declaration order.
    pub fn enabled_hops(&self) -> impl Iterator<Item = &HopMeta> {
        self.hops.iter().filter(|h| h.enabled)
    }

    /// Structural problems: names, hop endpoints, duplicates, error hops,
    /// cycles. Empty when the graph is well formed.
    #[must_use]
    pub fn structural_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let mut names = HashSet::new();
        for step in &self.steps {
            if step.name.trim().is_empty() {
                errors.push("Step name must not be empty".to_string());
            } else if !names.insert(step.name.as_str()) {
                errors.push(format!("Duplicate step name '{}'", step.name));
            }
            if step.copies == Some(0) {
                errors.push(format!("Step '{}': copies must be at least 1", step.name));
            }
            if matches!(&step.distribution, Distribution::Partition { field } if field.trim().is_empty()) {
                errors.push(format!("Step '{}': partition field must not be empty", step.name));
            }
        }

        let mut seen_hops = HashSet::new();
        for hop in self.enabled_hops() {
            for end in [&hop.from, &hop.to] {
                if !names.contains(end.as_str()) {
                    errors.push(format!(
                        "Hop {} -> {} references unknown step '{end}'",
                        hop.from, hop.to
                    ));
                }
            }
            if hop.from == hop.to && !hop.feedback {
                errors.push(format!("Hop {} -> {} loops on itself", hop.from, hop.to));
            }
            if !seen_hops.insert((hop.from.as_str(), hop.to.as_str())) {
                errors.push(format!("Duplicate hop {} -> {}", hop.from, hop.to));
            }
        }

        for step in &self.steps {
            if let Some(target) = &step.error_hop {
                let has_hop = self
                    .enabled_hops()
                    .any(|h| h.from == step.name && &h.to == target);
                if !has_hop {
                    errors.push(format!(
                        "Step '{}': error hop target '{target}' has no enabled hop",
                        step.name
                    ));
                }
            }
        }

        if errors.is_empty() {
            if let Err(cycle) = self.topological_order() {
                errors.push(cycle);
            }
        }
        errors
    }

    /// Step indices ordered so every producer precedes its consumers.
    /// Feedback hops are ignored.
    ///
    /// # Errors
    ///
    /// Returns a message naming the steps on a cycle.
    pub fn topological_order(&self) -> Result<Vec<usize>, String> {
        let index: HashMap<&str, usize> = self
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.as_str(), i))
            .collect();
        let mut indegree = vec![0usize; self.steps.len()];
        let mut edges: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for hop in self.enabled_hops().filter(|h| !h.feedback) {
            if let (Some(&f), Some(&t)) = (index.get(hop.from.as_str()), index.get(hop.to.as_str())) {
                edges.entry(f).or_default().push(t);
                indegree[t] += 1;
            }
        }

        let mut ready: VecDeque<usize> = (0..self.steps.len()).filter(|&i| indegree[i] == 0).collect();
        let mut order = Vec::with_capacity(self.steps.len());
        while let Some(i) = ready.pop_front() {
            order.push(i);
            for &t in edges.get(&i).map_or(&[][..], Vec::as_slice) {
                indegree[t] -= 1;
                if indegree[t] == 0 {
                    ready.push_back(t);
                }
            }
        }

        if order.len() == self.steps.len() {
            Ok(order)
        } else {
            let stuck: Vec<&str> = (0..self.steps.len())
                .filter(|&i| indegree[i] > 0)
                .map(|i| self.steps[i].name.as_str())
                .collect();
            Err(format!(
                "Pipeline has a cycle through steps {} (mark the closing hop as feedback)",
                stuck.join(", ")
            ))
        }
    }
}

//! Placement-driven graph partitioning.

use std::fmt;

use rowflow_types::{variables, ClusterSchema, ClusterSchemaError, SlaveServer, Variables};

use super::ports::PortAllocator;
use crate::error::PipelineError;
use crate::meta::{HopMeta, PipelineMeta, Placement, StepMeta};
use crate::steps::{TransportSettings, TRANSPORT_READER, TRANSPORT_WRITER};

/// Reasons a pipeline cannot be split over a cluster schema.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SplitError {
    #[error(transparent)]
    Schema(#[from] ClusterSchemaError),

    #[error("pipeline is not well formed: {0}")]
    Invalid(String),

    #[error("{0}")]
    Cyclic(String),

    #[error("step '{step}' is placed on unknown slave server '{slave}'")]
    UnknownSlave { step: String, slave: String },

    #[error("feedback hop {from} -> {to} would cross nodes")]
    FeedbackAcrossNodes { from: String, to: String },

    #[error("error hop {step} -> {target} would fan out to several nodes")]
    ErrorHopFanOut { step: String, target: String },

    #[error("node '{node}' ran out of transport ports (port_range {range})")]
    PortsExhausted { node: String, range: u16 },
}

impl From<SplitError> for PipelineError {
    fn from(e: SplitError) -> Self {
        PipelineError::Validation(e.to_string())
    }
}

/// One node's share of the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeGraph {
    pub server: SlaveServer,
    /// 0 for the master, then slaves in schema order.
    pub index: usize,
    pub meta: PipelineMeta,
}

/// One hop crossing between a producing and a consuming node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cut {
    pub from: String,
    pub to: String,
    pub producer: String,
    pub consumer: String,
    pub writer: String,
    pub reader: String,
    pub host: String,
    pub port: u16,
}

/// The result of [`split_pipeline`].
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterSplit {
    pub pipeline: String,
    pub schema: ClusterSchema,
    /// Always present, possibly without steps.
    pub master: NodeGraph,
    /// Only slaves that received at least one step.
    pub slaves: Vec<NodeGraph>,
    pub cuts: Vec<Cut>,
}

impl ClusterSplit {
    /// Master first, then slaves.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeGraph> {
        std::iter::once(&self.master).chain(self.slaves.iter())
    }

    #[must_use]
    pub fn slave(&self, name: &str) -> Option<&NodeGraph> {
        self.slaves.iter().find(|n| n.server.name == name)
    }

    /// Human-readable plan.
    #[must_use]
    pub fn render(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ClusterSplit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Pipeline '{}' on cluster '{}': {} node(s), {} cut(s)",
            self.pipeline,
            self.schema.name,
            self.slaves.len() + 1,
            self.cuts.len()
        )?;
        for node in self.nodes() {
            let role = if node.server.master { "master" } else { "slave" };
            writeln!(f, "\n[{role}] {}", node.server)?;
            for step in &node.meta.steps {
                writeln!(
                    f,
                    "  step {} ({}) x{}",
                    step.name,
                    step.step_type,
                    step.copies.unwrap_or(1)
                )?;
            }
            for hop in &node.meta.hops {
                let marker = if hop.feedback { " (feedback)" } else { "" };
                writeln!(f, "  hop  {} -> {}{marker}", hop.from, hop.to)?;
            }
        }
        if !self.cuts.is_empty() {
            writeln!(f, "\nCuts:")?;
            for cut in &self.cuts {
                writeln!(
                    f,
                    "  {} -> {}: {} => {} via {}:{}",
                    cut.from, cut.to, cut.producer, cut.consumer, cut.host, cut.port
                )?;
            }
        }
        Ok(())
    }
}

/// Identity variables for node `index` (0 is the master).
fn node_identity(servers: &[&SlaveServer], index: usize) -> Variables {
    let slave_count = servers.len() - 1;
    let mut vars = Variables::new()
        .with(variables::SLAVE_SERVER_NAME, servers[index].name.clone())
        .with(variables::CLUSTER_SIZE, slave_count.to_string())
        .with(
            variables::CLUSTER_MASTER,
            if index == 0 { "Y" } else { "N" },
        );
    if index > 0 {
        vars.set(variables::SLAVE_SERVER_NUMBER, (index - 1).to_string());
        vars.set(variables::STEP_PARTITION_ID, (index - 1).to_string());
    }
    vars
}

/// Split `meta` over `schema` by step placement.
///
/// Every hop whose ends land on different nodes is cut once per node pair:
/// a transport writer on the producing node binds a port from that node's
/// range and a transport reader on the consuming node connects to it.
/// `every_slave` steps are cloned onto each slave; hops between two
/// `every_slave` steps stay local to each slave. The output depends only on
/// the inputs.
///
/// # Errors
///
/// Returns a [`SplitError`] for an unusable schema, a malformed or cyclic
/// pipeline, unknown slaves, feedback hops that would cross nodes, error
/// hops that would fan out, or an exhausted port range.
pub fn split_pipeline(meta: &PipelineMeta, schema: &ClusterSchema) -> Result<ClusterSplit, SplitError> {
    schema.validate()?;
    meta.topological_order().map_err(SplitError::Cyclic)?;
    let errors = meta.structural_errors();
    if !errors.is_empty() {
        return Err(SplitError::Invalid(errors.join("; ")));
    }
    let Some(master) = schema.master() else {
        return Err(ClusterSchemaError::NoMaster(schema.name.clone()).into());
    };
    let servers: Vec<&SlaveServer> = std::iter::once(master)
        .chain(schema.slave_servers())
        .collect();
    let slave_count = servers.len() - 1;

    let step_nodes = meta
        .steps
        .iter()
        .map(|step| match &step.placement {
            Placement::Master => Ok(vec![0]),
            Placement::EverySlave => Ok((1..=slave_count).collect()),
            Placement::OneSlave(name) => servers
                .iter()
                .position(|s| !s.master && &s.name == name)
                .map(|i| vec![i])
                .ok_or_else(|| SplitError::UnknownSlave {
                    step: step.name.clone(),
                    slave: name.clone(),
                }),
        })
        .collect::<Result<Vec<Vec<usize>>, SplitError>>()?;

    let identities: Vec<Variables> = (0..servers.len())
        .map(|i| node_identity(&servers, i))
        .collect();
    let mut node_steps: Vec<Vec<StepMeta>> = vec![Vec::new(); servers.len()];
    let mut node_hops: Vec<Vec<HopMeta>> = vec![Vec::new(); servers.len()];
    for (step, nodes) in meta.steps.iter().zip(&step_nodes) {
        for &n in nodes {
            let mut clone = step.clone();
            if step.placement == Placement::EverySlave {
                clone.variables = identities[n].layered(&step.variables);
            }
            node_steps[n].push(clone);
        }
    }

    let mut ports = PortAllocator::new(schema.base_port, schema.port_range);
    let mut cuts = Vec::new();
    for hop in meta.enabled_hops() {
        let (Some(f), Some(t)) = (meta.step_index(&hop.from), meta.step_index(&hop.to)) else {
            continue;
        };
        let (from_step, to_step) = (&meta.steps[f], &meta.steps[t]);
        if hop.feedback && from_step.placement != to_step.placement {
            return Err(SplitError::FeedbackAcrossNodes {
                from: hop.from.clone(),
                to: hop.to.clone(),
            });
        }
        let stays_local = hop.feedback
            || (from_step.placement == Placement::EverySlave
                && to_step.placement == Placement::EverySlave);
        let is_error_hop = from_step.error_hop.as_deref() == Some(hop.to.as_str());

        for &p in &step_nodes[f] {
            let consumers = if stays_local {
                vec![p]
            } else {
                step_nodes[t].clone()
            };
            if is_error_hop && consumers.len() > 1 {
                return Err(SplitError::ErrorHopFanOut {
                    step: hop.from.clone(),
                    target: hop.to.clone(),
                });
            }
            for c in consumers {
                if p == c {
                    node_hops[p].push(hop.clone());
                    continue;
                }
                let (producer, consumer) = (servers[p], servers[c]);
                let key = (hop.from.clone(), hop.to.clone(), p, c);
                let port = ports.port_for(&key).ok_or_else(|| SplitError::PortsExhausted {
                    node: producer.name.clone(),
                    range: schema.port_range,
                })?;
                let settings = TransportSettings {
                    host: producer.host.clone(),
                    port,
                    compression: schema.compression,
                    buffer_size: schema.sockets_buffer_size,
                    connect_timeout_ms: schema.connect_timeout_ms,
                    retry_interval_ms: schema.retry_interval_ms,
                }
                .to_json();
                let writer = format!("{}.{}.writer.{}", hop.from, hop.to, consumer.name);
                let reader = format!("{}.{}.reader.{}", hop.from, hop.to, producer.name);

                node_steps[p].push(
                    StepMeta::new(&writer, TRANSPORT_WRITER)
                        .with_copies(1)
                        .with_settings(settings.clone()),
                );
                node_hops[p].push(HopMeta::new(&hop.from, &writer));
                node_steps[c].push(
                    StepMeta::new(&reader, TRANSPORT_READER)
                        .with_copies(1)
                        .with_settings(settings),
                );
                node_hops[c].push(HopMeta::new(&reader, &hop.to));

                if is_error_hop {
                    if let Some(source) = node_steps[p].iter_mut().find(|s| s.name == hop.from) {
                        source.error_hop = Some(writer.clone());
                    }
                }
                cuts.push(Cut {
                    from: hop.from.clone(),
                    to: hop.to.clone(),
                    producer: producer.name.clone(),
                    consumer: consumer.name.clone(),
                    writer,
                    reader,
                    host: producer.host.clone(),
                    port,
                });
            }
        }
    }

    let mut nodes: Vec<NodeGraph> = node_steps
        .into_iter()
        .zip(node_hops)
        .enumerate()
        .map(|(i, (steps, hops))| NodeGraph {
            server: servers[i].clone(),
            index: i,
            meta: PipelineMeta {
                name: format!("{} ({}:{})", meta.name, schema.name, servers[i].name),
                queue_capacity: meta.queue_capacity,
                variables: meta.variables.layered(&identities[i]),
                cluster: None,
                steps,
                hops,
            },
        })
        .collect();
    let slaves = nodes.split_off(1);
    let Some(master) = nodes.pop() else {
        return Err(ClusterSchemaError::NoMaster(schema.name.clone()).into());
    };
    let slaves: Vec<NodeGraph> = slaves.into_iter().filter(|n| !n.meta.steps.is_empty()).collect();

    tracing::debug!(
        pipeline = %meta.name,
        schema = %schema.name,
        slaves = slaves.len(),
        cuts = cuts.len(),
        "pipeline split"
    );
    Ok(ClusterSplit {
        pipeline: meta.name.clone(),
        schema: schema.clone(),
        master,
        slaves,
        cuts,
    })
}

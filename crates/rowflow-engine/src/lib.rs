//! Row pipeline execution engine.
//!
//! A pipeline is a graph of steps joined by bounded row queues. Each step copy
//! runs on its own OS thread. The same graph can run in-process, on one remote
//! slave, or split across a cluster with socket transport steps at the cuts.

#![warn(clippy::pedantic)]

pub mod aggregate;
pub mod cluster;
pub mod config;
pub mod error;
pub mod execution;
pub mod graph;
pub mod meta;
pub mod partition;
pub mod queue;
pub mod remote;
pub mod step;
pub mod steps;
pub mod unit;

pub use aggregate::aggregate_results;
pub use cluster::{split_pipeline, ClusterSplit, SplitError};
pub use error::{PipelineError, StepError};
pub use execution::{ExecutionStrategy, RunContext};
pub use graph::PipelineGraph;
pub use meta::{Distribution, HopMeta, PipelineMeta, Placement, StepMeta};
pub use queue::{QueueRead, RowQueue};
pub use remote::{EndpointResolver, InProcessSlave, SlaveEndpoint, TcpSlaveClient};
pub use step::{Step, StepContext, StepRegistry};

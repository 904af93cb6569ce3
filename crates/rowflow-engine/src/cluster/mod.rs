//! Splitting one pipeline into per-node sub-graphs joined by socket
//! transport steps.

mod ports;
mod splitter;

pub use ports::PortAllocator;
pub use splitter::{split_pipeline, ClusterSplit, Cut, NodeGraph, SplitError};

//! Built-in steps.
//!
//! Business steps are registered by the caller on a [`StepRegistry`]; these
//! are the generic ones the engine itself needs, including the socket
//! transport pair the cluster splitter inserts at cuts.

mod collector;
mod generator;
mod passthrough;
pub mod transport;

pub use collector::CollectorStep;
pub use generator::{GeneratorSettings, GeneratorStep};
pub use passthrough::PassthroughStep;
pub use transport::{TransportReaderStep, TransportSettings, TransportWriterStep};

use crate::meta::StepMeta;
use crate::step::{Step, StepRegistry};

pub const GENERATOR: &str = "generator";
pub const PASSTHROUGH: &str = "passthrough";
pub const COLLECTOR: &str = "collector";
pub const TRANSPORT_WRITER: &str = "transport_writer";
pub const TRANSPORT_READER: &str = "transport_reader";

/// Register every built-in step type.
pub fn register_builtins(registry: &mut StepRegistry) {
    registry.register(GENERATOR, |_: &StepMeta| -> Box<dyn Step> {
        Box::new(GeneratorStep::default())
    });
    registry.register(PASSTHROUGH, |_: &StepMeta| -> Box<dyn Step> { Box::new(PassthroughStep) });
    registry.register(COLLECTOR, |_: &StepMeta| -> Box<dyn Step> { Box::new(CollectorStep) });
    registry.register(TRANSPORT_WRITER, |_: &StepMeta| -> Box<dyn Step> {
        Box::new(TransportWriterStep::default())
    });
    registry.register(TRANSPORT_READER, |_: &StepMeta| -> Box<dyn Step> {
        Box::new(TransportReaderStep::default())
    });
}

/// Transport steps move rows between nodes; their line counters are left
/// out of run results so rows are not counted twice.
#[must_use]
pub fn is_transport_type(step_type: &str) -> bool {
    step_type == TRANSPORT_WRITER || step_type == TRANSPORT_READER
}

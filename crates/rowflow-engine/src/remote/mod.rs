//! Slave execution endpoints: the contract, an in-process implementation,
//! and a JSON-lines TCP client and server.

mod endpoint;
mod in_process;
pub mod protocol;
mod resolver;
mod server;
mod tcp;

pub use endpoint::{EndpointError, RunState, SlaveEndpoint, SlaveJob};
pub use in_process::InProcessSlave;
pub use resolver::EndpointResolver;
pub use server::{serve, ServerCredentials};
pub use tcp::TcpSlaveClient;

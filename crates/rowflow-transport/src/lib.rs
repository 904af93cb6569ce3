//! Row transport between nodes of a clustered rowflow run.
//!
//! A writer binds a TCP listener, accepts exactly one reader, sends the row
//! metadata once and then every row in order. End of stream is a clean EOF
//! at a row boundary. The stream may be compressed as a whole; both ends
//! must agree on the codec, there is no negotiation.

#![warn(clippy::pedantic)]

pub mod codec;
pub mod compression;
pub mod error;
pub mod options;
pub mod reader;
pub mod socket;
pub mod writer;

pub use error::TransportError;
pub use options::TransportOptions;
pub use reader::RowStreamReader;
pub use writer::{RowStreamListener, RowStreamWriter};

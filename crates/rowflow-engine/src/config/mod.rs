//! Pipeline YAML files: parsing and semantic validation.

pub mod parser;
pub mod validator;

pub use parser::{parse_pipeline, parse_pipeline_str};
pub use validator::validate_pipeline;

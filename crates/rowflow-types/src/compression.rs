//! Row transport stream compression selection.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Whole-stream compression applied by transport writers and expected by
/// transport readers. Both ends must be configured with the same value.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CompressionCodec {
    Lz4,
    Zstd,
}

impl fmt::Display for CompressionCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Lz4 => "lz4",
            Self::Zstd => "zstd",
        })
    }
}

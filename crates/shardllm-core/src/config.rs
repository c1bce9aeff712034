//! Shared float/quantization type vocabulary.
//!
//! Root and worker nodes are configured entirely from the command line
//! (see each binary's `clap::Parser` struct); this module just holds the
//! dtype enum both the CLI and the model spec need to name.

use serde::{Deserialize, Serialize};

/// Quantization/float type a projection weight or scratch buffer is stored as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FloatKind {
    F32,
    F16,
    Q4_0,
    Q8_0,
}

impl std::fmt::Display for FloatKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FloatKind::F32 => "F32",
            FloatKind::F16 => "F16",
            FloatKind::Q4_0 => "Q4_0",
            FloatKind::Q8_0 => "Q8_0",
        };
        f.write_str(s)
    }
}

//! Error taxonomy shared by every shardllm crate.
//!
//! All of the variants below are non-recoverable at the task level: the
//! engine does not retry a failed task, it propagates the error up and the
//! node exits. A would-block result from the OS is not an error and never
//! reaches this type — the transport retries those internally.

use std::fmt;

pub type Result<T> = std::result::Result<T, ShardLlmError>;

/// Where a transport failure was observed, for diagnostics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportSite {
    Read,
    Write,
    Connect,
    Accept,
}

impl fmt::Display for TransportSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportSite::Read => "read",
            TransportSite::Write => "write",
            TransportSite::Connect => "connect",
            TransportSite::Accept => "accept",
        };
        f.write_str(s)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ShardLlmError {
    #[error("corrupt weights file: {0}")]
    CorruptWeightsFile(String),

    #[error("unsupported dtype pair: weights={weight_kind}, activation={activation_kind}")]
    UnsupportedDType {
        weight_kind: String,
        activation_kind: String,
    },

    #[error("transport failed during {where_}: {code}")]
    TransportFailed { code: String, where_: TransportSite },

    #[error("peer disconnected while reading {0} expected bytes")]
    PeerDisconnected(usize),

    #[error("invalid shape: {0}")]
    InvalidShape(String),

    #[error("timed out waiting for worker bootstrap acknowledgement: {0}")]
    Timeout(String),

    #[error("model load error: {0}")]
    ModelLoad(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ShardLlmError {
    pub fn transport(where_: TransportSite, err: &std::io::Error) -> Self {
        ShardLlmError::TransportFailed {
            code: err.to_string(),
            where_,
        }
    }
}

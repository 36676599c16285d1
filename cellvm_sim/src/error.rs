//! Errors raised by the simulation harness.

use cellvm_env::VmError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    /// The backend rejected an operation outside a protocol.
    #[error(transparent)]
    Vm(#[from] VmError),

    /// A protocol step failed.
    #[error("step {index} failed: {source}")]
    Step { index: usize, source: VmError },

    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Structurally valid JSON that is not a usable protocol.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

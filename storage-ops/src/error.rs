// SPDX-License-Identifier: GPL-3.0-only

use storage_model::ModelError;
use thiserror::Error;

use crate::runner::OpDescriptor;

/// Error types for planning and execution
#[derive(Error, Debug)]
pub enum OpsError {
    #[error(transparent)]
    Model(#[from] ModelError),

    /// The runner reported a non-zero exit for an operation.
    #[error("{} exited with status {exit_code}: {stderr}", op.program)]
    Tool {
        op: OpDescriptor,
        exit_code: i32,
        stderr: String,
    },

    /// A required external program is unavailable.
    #[error("required program {0:?} is not installed")]
    Dependency(String),

    /// A discovery record is inconsistent with the existing graph.
    #[error("probe record inconsistent: {0}")]
    Probe(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// An action failed during an execution pass; earlier actions remain
    /// committed.
    #[error("action [{action}] failed: {source}")]
    Action {
        action: String,
        #[source]
        source: Box<OpsError>,
    },

    /// The action cannot be cancelled or re-run in its current state.
    #[error("action [{0}] has already been executed")]
    AlreadyExecuted(String),
}

/// Result type alias for planning and execution
pub type Result<T> = std::result::Result<T, OpsError>;

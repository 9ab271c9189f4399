// SPDX-License-Identifier: GPL-3.0-only

use storage_raid::RaidError;
use storage_units::SizeError;
use thiserror::Error;

/// Error types for model operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// An invalid argument supplied by the caller.
    #[error("invalid value: {0}")]
    Value(String),

    /// A device-graph invariant would be violated.
    #[error("device {device}: {reason}")]
    Device { device: String, reason: String },

    /// A format-level rule would be violated.
    #[error("format on {device}: {reason}")]
    Format { device: String, reason: String },

    /// A name, UUID or path did not resolve to a device.
    #[error("no device matching {0:?}")]
    NotFound(String),

    #[error(transparent)]
    Raid(#[from] RaidError),

    #[error(transparent)]
    Size(#[from] SizeError),
}

impl ModelError {
    pub fn device(device: impl Into<String>, reason: impl Into<String>) -> ModelError {
        ModelError::Device {
            device: device.into(),
            reason: reason.into(),
        }
    }

    pub fn format(device: impl Into<String>, reason: impl Into<String>) -> ModelError {
        ModelError::Format {
            device: device.into(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for model operations
pub type Result<T> = std::result::Result<T, ModelError>;

//! Error taxonomy shared by every stage of the exporter

use thiserror::Error;

/// Errors raised while discovering, scanning, aggregating or publishing
#[derive(Debug, Error)]
pub enum ExporterError {
    /// Malformed or unreadable static input (device map, kubelet config, options)
    #[error("Invalid configuration: {message}")]
    Config { message: String },

    /// Host topology interface absent or unparsable
    #[error("Failed to discover host topology: {message}")]
    Topology { message: String },

    /// The container runtime endpoint could not be reached
    #[error("Container runtime unavailable: {message}")]
    RuntimeUnavailable { message: String },

    /// Runtime-reported grants disagree with known topology
    #[error("Inconsistent aggregation: {message}")]
    Inconsistency { message: String },

    /// Concurrent modification kept winning after all publish attempts
    #[error("Publish conflict after {attempts} attempts: {message}")]
    PublishConflict { attempts: u32, message: String },

    /// The publish target could not be reached or refused the request
    #[error("Publish target unavailable: {message}")]
    PublishUnavailable { message: String },
}

impl ExporterError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn topology(message: impl Into<String>) -> Self {
        Self::Topology {
            message: message.into(),
        }
    }

    pub fn runtime_unavailable(message: impl Into<String>) -> Self {
        Self::RuntimeUnavailable {
            message: message.into(),
        }
    }

    /// Whether the process must stop when this error surfaces
    ///
    /// Scan and aggregation failures are cycle-local; everything else either
    /// happens at startup or means the published state can no longer be kept
    /// current.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ExporterError::RuntimeUnavailable { .. } | ExporterError::Inconsistency { .. }
        )
    }
}

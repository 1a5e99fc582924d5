//! Error types for the instance group.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::backend::BackendError;

/// Instance group errors with standardized reason codes.
#[derive(Debug, Error)]
pub enum GroupError {
    /// Missing or invalid configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The VM backend could not be reached during initialization.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(#[source] BackendError),

    /// Every instance in a scale-up batch failed.
    #[error("failed to create any of {attempted} instances: {last_error}")]
    CreationFailed {
        attempted: usize,
        #[source]
        last_error: BackendError,
    },

    /// The instance has no usable address yet.
    #[error("instance {name} is not ready: {reason}")]
    InstanceNotReady { name: String, reason: String },

    /// The instance credential could not be read.
    #[error("credential {path} unavailable: {source}")]
    CredentialUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A backend query failed.
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl GroupError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            GroupError::Configuration(_) => "configuration_error",
            GroupError::BackendUnavailable(_) => "backend_unavailable",
            GroupError::CreationFailed { .. } => "creation_failed",
            GroupError::InstanceNotReady { .. } => "instance_not_ready",
            GroupError::CredentialUnavailable { .. } => "credential_unavailable",
            GroupError::Backend(_) => "backend_error",
        }
    }
}

pub type Result<T, E = GroupError> = std::result::Result<T, E>;

//! Provisioning error types.

use std::time::Duration;
use thiserror::Error;

/// Errors from the remote credential provisioner
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Logical name contains characters unsafe for a remote command line
    #[error("Invalid credential name: '{0}'")]
    InvalidName(String),

    /// Local process could not be started
    #[error("Failed to start remote session: {0}")]
    Spawn(#[from] std::io::Error),

    /// Remote command did not finish in time
    #[error("Remote command timed out after {0:?}")]
    Timeout(Duration),

    /// Remote command exited with a non-zero status
    #[error("Remote command failed with status {status}: {output}")]
    CommandFailed { status: i32, output: String },

    /// Remote command succeeded but returned nothing usable
    #[error("Remote command returned no credential content")]
    MissingOutput,

    /// Removal ran but the success marker was not found
    #[error("Removal of '{0}' was not confirmed")]
    NotConfirmed(String),
}

/// Result type for provisioner calls
pub type ProvisionResult<T> = Result<T, ProvisionError>;

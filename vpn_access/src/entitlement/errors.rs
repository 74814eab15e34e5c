//! Entitlement error types.

use thiserror::Error;

use super::models::{ConfigId, ProtocolId, ServerId, UserId};
use crate::db::StoreError;
use crate::provision::ProvisionError;

/// Coarse error classification used by callers to pick a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    Validation,
    Provision,
    Revocation,
    Internal,
}

/// Entitlement errors
#[derive(Debug, Error)]
pub enum EntitlementError {
    /// Storage failure
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    /// User not found
    #[error("User not found: {0}")]
    UserNotFound(UserId),

    /// Server not found
    #[error("Server not found: {0}")]
    ServerNotFound(ServerId),

    /// Protocol not found
    #[error("Protocol not found: {0}")]
    ProtocolNotFound(ProtocolId),

    /// Config not found
    #[error("Config not found: {0}")]
    ConfigNotFound(ConfigId),

    /// A record with this unique name already exists
    #[error("Name already taken: {0}")]
    DuplicateName(String),

    /// Free trial was already activated for this user
    #[error("Free trial already used by user {0}")]
    TrialAlreadyUsed(UserId),

    /// Server is disabled
    #[error("Server {0} is not active")]
    InactiveServer(ServerId),

    /// Protocol is disabled
    #[error("Protocol {0} is not active")]
    InactiveProtocol(ProtocolId),

    /// Config was deactivated and cannot be changed anymore
    #[error("Config {0} is not active")]
    ConfigInactive(ConfigId),

    /// Invalid input
    #[error("Invalid input: {0}")]
    Validation(String),

    /// Remote credential could not be created
    #[error("Provisioning failed: {0}")]
    Provision(#[source] ProvisionError),

    /// Remote credential removal was not confirmed
    #[error("Revocation failed for '{name}': {source}")]
    Revocation {
        name: String,
        #[source]
        source: ProvisionError,
    },
}

impl EntitlementError {
    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            EntitlementError::Store(StoreError::UniqueViolation(_)) => ErrorKind::Conflict,
            EntitlementError::Store(_) => ErrorKind::Internal,
            EntitlementError::UserNotFound(_)
            | EntitlementError::ServerNotFound(_)
            | EntitlementError::ProtocolNotFound(_)
            | EntitlementError::ConfigNotFound(_) => ErrorKind::NotFound,
            EntitlementError::DuplicateName(_) | EntitlementError::TrialAlreadyUsed(_) => {
                ErrorKind::Conflict
            }
            EntitlementError::InactiveServer(_)
            | EntitlementError::InactiveProtocol(_)
            | EntitlementError::ConfigInactive(_)
            | EntitlementError::Validation(_) => ErrorKind::Validation,
            EntitlementError::Provision(_) => ErrorKind::Provision,
            EntitlementError::Revocation { .. } => ErrorKind::Revocation,
        }
    }

    /// Get a client-safe error message that doesn't leak sensitive information
    ///
    /// Storage and remote execution details are replaced with generic text.
    pub fn client_message(&self) -> String {
        match self {
            EntitlementError::Store(StoreError::UniqueViolation(_)) => {
                "Resource already exists".to_string()
            }
            EntitlementError::Store(_) => "Internal server error".to_string(),
            EntitlementError::Provision(_) => "Failed to provision credential".to_string(),
            EntitlementError::Revocation { .. } => {
                "Failed to revoke credential on the server".to_string()
            }
            _ => self.to_string(),
        }
    }
}

/// Result type for entitlement operations
pub type EntitlementResult<T> = Result<T, EntitlementError>;

//! Remote credential provisioning.
//!
//! A [`CredentialProvisioner`] creates and removes the credential that backs a
//! config on its server. Calls go over an unreliable remote channel and may
//! fail or time out; the engine decides what a failure means.

pub mod errors;
pub mod ssh;

pub use errors::{ProvisionError, ProvisionResult};
pub use ssh::{SshProvisioner, SshProvisionerConfig};

use async_trait::async_trait;

use crate::entitlement::models::Server;

/// Creates and revokes remote credentials by logical name
#[async_trait]
pub trait CredentialProvisioner: Send + Sync {
    /// Create the credential and return its content.
    ///
    /// Any error means no credential is usable; there is no partial result.
    async fn provision(&self, server: &Server, name: &str) -> ProvisionResult<String>;

    /// Remove the credential.
    ///
    /// `Ok(true)` means removal was confirmed. `Ok(false)` and `Err(_)` both
    /// mean "not confirmed removed" and callers treat them the same.
    async fn revoke(&self, server: &Server, name: &str) -> ProvisionResult<bool>;
}

/// Check a logical name is safe to pass as a single remote shell argument.
pub fn validate_name(name: &str) -> ProvisionResult<()> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');

    if valid {
        Ok(())
    } else {
        Err(ProvisionError::InvalidName(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_names_are_valid() {
        assert!(validate_name("user-42-1760000000000").is_ok());
        assert!(validate_name("client_7").is_ok());
    }

    #[test]
    fn test_shell_metacharacters_rejected() {
        for name in ["", "a b", "x;rm -rf /", "$(id)", "../etc", "name\n"] {
            assert!(
                matches!(validate_name(name), Err(ProvisionError::InvalidName(_))),
                "accepted {name:?}"
            );
        }
        assert!(validate_name(&"a".repeat(65)).is_err());
    }
}

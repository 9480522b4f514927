use std::path::PathBuf;

use thiserror::Error;

use promo_core::{AuthError, InventoryError, RegistryAccessError, RegistryName, TransferError};

/// Failures talking to an OCI Distribution endpoint.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Connection, DNS, TLS or read failure before a status was received.
    #[error("request to {url} failed: {reason}")]
    Transport { url: String, reason: String },

    #[error("{url} returned HTTP {status}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },

    #[error("invalid response from {url}: {reason}")]
    Decode { url: String, reason: String },

    #[error("content digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("cannot read credentials at {path}: {reason}")]
    Credentials { path: PathBuf, reason: String },
}

impl RegistryError {
    /// Worth retrying: transport failures, timeouts, rate limiting and
    /// server errors.
    pub fn is_transient(&self) -> bool {
        match self {
            RegistryError::Transport { .. } => true,
            RegistryError::Status { status, .. } => {
                *status == 408 || *status == 429 || (500..600).contains(status)
            }
            _ => false,
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, RegistryError::Status { status: 401 | 403, .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RegistryError::Status { status: 404, .. })
    }

    pub fn into_inventory_error(self, registry: &RegistryName) -> InventoryError {
        if self.is_auth() {
            return AuthError {
                registry: registry.clone(),
                reason: self.to_string(),
            }
            .into();
        }
        RegistryAccessError {
            registry: registry.clone(),
            reason: self.to_string(),
        }
        .into()
    }
}

impl From<RegistryError> for TransferError {
    fn from(err: RegistryError) -> Self {
        if err.is_transient() {
            TransferError::Transient(err.to_string())
        } else {
            TransferError::Permanent(err.to_string())
        }
    }
}

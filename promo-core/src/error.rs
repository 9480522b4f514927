//! Error types for promo-core.
//!
//! These are the leaves of the error taxonomy; `promo-sync` and
//! `promo-runtime` wrap them with the phase they occurred in.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::RegistryName;

/// Failures loading YAML/CSV documents from disk (manifests, run config,
/// snapshots, fixtures).
#[derive(Debug, Error)]
pub enum LoadError {
    /// Underlying I/O failure, with the file that caused it.
    #[error("I/O error at {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML serialization error (write path).
    #[error("YAML serialization error")]
    Yaml(#[from] serde_yaml::Error),

    /// YAML parse error on load, with path and serde_yaml's line context.
    #[error("failed to parse {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// Malformed CSV snapshot row (1-based line number).
    #[error("invalid CSV snapshot at line {line}: {reason}")]
    Csv { line: usize, reason: String },

    /// An expected file or directory does not exist.
    #[error("not found: {path}")]
    NotFound { path: PathBuf },
}

/// Bad options or manifests. Raised before any network activity.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid option `{option}`: {reason}")]
    Option {
        option: &'static str,
        reason: String,
    },

    #[error("manifest {manifest}: {reason}")]
    Manifest { manifest: String, reason: String },
}

/// Credential activation failure for a registry.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("authentication failed for {registry}: {reason}")]
pub struct AuthError {
    pub registry: RegistryName,
    pub reason: String,
}

/// A registry could not be read.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("registry {registry} unreachable: {reason}")]
pub struct RegistryAccessError {
    pub registry: RegistryName,
    pub reason: String,
}

/// Failure reported by an [`InventoryReader`](crate::capability::InventoryReader).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InventoryError {
    #[error(transparent)]
    Unreachable(#[from] RegistryAccessError),

    #[error(transparent)]
    Auth(#[from] AuthError),
}

/// Failure of a single transfer attempt.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// Network errors, rate limiting, transient auth, timeouts. Retryable.
    #[error("transient: {0}")]
    Transient(String),

    /// Anything retrying cannot fix.
    #[error("{0}")]
    Permanent(String),
}

impl TransferError {
    pub fn is_transient(&self) -> bool {
        matches!(self, TransferError::Transient(_))
    }
}

/// Failure of a vulnerability scan request.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("scanning {image} failed: {reason}")]
pub struct ScanError {
    pub image: String,
    pub reason: String,
}

/// Convenience constructor for [`LoadError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> LoadError {
    LoadError::Io {
        path: path.into(),
        source,
    }
}

//! Error types for promo-sync.

use thiserror::Error;

use promo_core::{
    AuthError, Digest, ImageName, RegistryAccessError, RegistryName, Tag, ValidationError,
};

/// Errors that abort a run while the sync context is being built. None of
/// them can occur after a mutation has been attempted.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A manifest or the run configuration is invalid.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Credential failure while reading an inventory.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// The source of some manifest could not be read.
    #[error("source {0}")]
    SourceUnreachable(RegistryAccessError),

    /// Two manifest entries pin the same destination tag to different digests.
    #[error(
        "manifest conflict: {registry}/{image}:{tag} is {first} in {first_manifest} \
         but {second} in {second_manifest}"
    )]
    ManifestConflict {
        registry: RegistryName,
        image: ImageName,
        tag: Tag,
        first: Digest,
        first_manifest: String,
        second: Digest,
        second_manifest: String,
    },
}

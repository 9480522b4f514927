use thiserror::Error;

use promo_core::{AuthError, InventoryError, LoadError, ValidationError};
use promo_sync::SyncError;

/// Failing outcome of a run that got as far as producing results.
///
/// Individual successes may already have taken effect; the per-edge detail
/// lives in the report the caller printed before converting it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{failed} failed, {skipped} skipped, {cancelled} cancelled, {} findings", .findings.len())]
pub struct AggregateRunError {
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
    pub findings: Vec<String>,
}

/// A mode-driver failure, wrapped with the phase it happened in. The
/// message names only the phase; the cause is the error's source.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("validating options")]
    Options(#[from] ValidationError),

    #[error("activating service accounts")]
    Credentials(#[from] AuthError),

    #[error("parsing manifests")]
    Manifests(#[source] LoadError),

    #[error("creating sync context")]
    Context(#[from] SyncError),

    #[error("filtering edges")]
    Edges(#[source] AggregateRunError),

    #[error("running promotion")]
    Promotion(#[source] AggregateRunError),

    #[error("running vulnerability scan")]
    Scan(#[source] AggregateRunError),

    #[error("getting snapshot manifests")]
    SnapshotManifests(#[source] LoadError),

    #[error("generating snapshot")]
    Snapshot(#[source] SnapshotError),

    #[error("checking manifest lists")]
    ManifestLists(#[source] ManifestListError),

    #[error("{task} task join failure: {reason}")]
    Join { task: &'static str, reason: String },
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error(transparent)]
    Inventory(#[from] InventoryError),

    #[error(transparent)]
    Render(#[from] LoadError),
}

#[derive(Debug, Error)]
pub enum ManifestListError {
    #[error(transparent)]
    Inventory(#[from] InventoryError),

    #[error("parsing snapshot")]
    Snapshot(#[source] LoadError),

    #[error("{0}")]
    Inconsistent(AggregateRunError),
}

pub(crate) fn join_err(task: &'static str, err: tokio::task::JoinError) -> RunError {
    RunError::Join {
        task,
        reason: err.to_string(),
    }
}

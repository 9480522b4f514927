//! # promo-sync
//!
//! Desired-state reconciliation.
//!
//! [`SyncContext::build`] snapshots manifests, registry inventories and the
//! run configuration; [`compute_edges`] turns that snapshot into the
//! deduplicated [`EdgePlan`] of copies and retags a run must perform.
//! [`validate_manifest_lists`] checks multi-arch lists for missing children.

pub mod context;
pub mod edges;
pub mod error;
pub mod manifest_list;

pub use context::SyncContext;
pub use edges::{compute_edges, EdgeFinding, EdgePlan};
pub use error::SyncError;
pub use manifest_list::{validate_manifest_lists, ManifestListFinding};

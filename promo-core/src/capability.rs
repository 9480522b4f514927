//! Capability contracts between the engine and the outside world.
//!
//! The engine is written against these traits only. `promo-registry`
//! provides the network-backed implementations and
//! [`FixtureRegistry`](crate::fixture::FixtureRegistry) the in-memory one;
//! the choice is made once when the run is constructed.
//!
//! All methods are blocking. The async scheduler runs them on the blocking
//! thread pool.

use std::collections::BTreeSet;

use crate::error::{AuthError, InventoryError, ScanError, TransferError};
use crate::options::RunConfig;
use crate::types::{
    Digest, ImageName, PromotionEdge, RegistryContext, RegistryInventory, RegistryName, ScanReport,
};

/// Which part of a registry an inventory read covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InventoryScope {
    /// Every repository under the registry path.
    Registry,
    /// Only the named images; images absent from the registry come back
    /// without an entry.
    Images(BTreeSet<ImageName>),
}

impl InventoryScope {
    pub fn includes(&self, image: &ImageName) -> bool {
        match self {
            InventoryScope::Registry => true,
            InventoryScope::Images(images) => images.contains(image),
        }
    }
}

/// Reads the observed content of a registry.
pub trait InventoryReader: Send + Sync {
    fn read_inventory(
        &self,
        registry: &RegistryContext,
        scope: &InventoryScope,
    ) -> Result<RegistryInventory, InventoryError>;
}

/// One attempt at executing one edge.
pub trait TransferOperation: Send {
    fn run(self: Box<Self>) -> Result<(), TransferError>;
}

/// Builds the concrete transfer operation for an edge. A fresh operation is
/// built for every attempt.
pub trait TransferFactory: Send + Sync {
    fn make(&self, edge: &PromotionEdge) -> Box<dyn TransferOperation>;
}

/// Scans a source image for known vulnerabilities.
pub trait VulnerabilityScanner: Send + Sync {
    fn scan(
        &self,
        registry: &RegistryName,
        image: &ImageName,
        digest: &Digest,
    ) -> Result<ScanReport, ScanError>;
}

/// Activates whatever credentials the run needs before any registry is read.
pub trait CredentialActivator: Send + Sync {
    fn activate(&self, registries: &[RegistryContext], config: &RunConfig)
        -> Result<(), AuthError>;
}

//! Promoter core library: domain types, run configuration, errors,
//! capability contracts and the collaborators that only touch local files.
//!
//! - [`types`]: newtypes, manifests, inventories, promotion edges
//! - [`options`]: [`RunConfig`]
//! - [`error`]: error taxonomy leaves
//! - [`capability`]: traits the engine is written against
//! - [`manifest`]: manifest loading and validation
//! - [`snapshot`]: YAML/CSV snapshot rendering and parsing
//! - [`fixture`]: in-memory backend implementing every capability

pub mod capability;
pub mod error;
pub mod fixture;
pub mod manifest;
pub mod options;
pub mod snapshot;
pub mod types;

pub use capability::{
    CredentialActivator, InventoryReader, InventoryScope, TransferFactory, TransferOperation,
    VulnerabilityScanner,
};
pub use error::{
    AuthError, InventoryError, LoadError, RegistryAccessError, ScanError, TransferError,
    ValidationError,
};
pub use fixture::FixtureRegistry;
pub use options::RunConfig;
pub use snapshot::{OutputFormat, SnapshotFilter};
pub use types::{
    Digest, DigestTags, Image, ImageInventory, ImageName, Manifest, PromotionEdge,
    RegistryContext, RegistryInventory, RegistryName, ScanReport, Severity, Tag, TagOp,
    Vulnerability,
};

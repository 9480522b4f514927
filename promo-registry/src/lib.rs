//! Network-backed capabilities: an OCI Distribution client over `ureq`, and
//! the inventory reader, transfer factory, scanner and credential activator
//! built on it.
//!
//! Everything here is blocking; the runtime calls in from its blocking pool.

mod challenge;
pub mod client;
pub mod credentials;
mod error;
pub mod inventory;
pub mod media;
pub mod pool;
pub mod reference;
pub mod scanner;
pub mod transfer;

pub use client::{RegistryClient, TagListing};
pub use credentials::{CredentialStore, TokenActivator};
pub use error::RegistryError;
pub use inventory::NetworkInventory;
pub use pool::RegistryPool;
pub use reference::RegistryEndpoint;
pub use scanner::{HttpScanner, UnconfiguredScanner};
pub use transfer::{NetworkTransfers, TransferMode};

//! Sync context: the immutable snapshot a run works from.
//!
//! ## Build protocol
//!
//! 1. Validate every manifest.
//! 2. Reject conflicting tag pins across manifests.
//! 3. Read the inventory of every registry any manifest names, limited to
//!    the images the manifests name.
//! 4. Source unreachable or any auth failure → fatal. Destination
//!    unreachable → recorded; the edge computer reports it instead of
//!    producing edges for it.
//!
//! Nothing is refreshed after step 3; writes made by other parties during
//! the run are not observed.

use std::collections::{BTreeMap, BTreeSet};

use promo_core::{
    manifest::validate_manifest, Digest, ImageName, InventoryError, InventoryReader,
    InventoryScope, Manifest, RegistryAccessError, RegistryContext, RegistryInventory,
    RegistryName, RunConfig, Tag,
};

use crate::error::SyncError;

/// What the run knows about one registry before reading it.
#[derive(Debug, Clone)]
struct RegistryPlan {
    context: RegistryContext,
    images: BTreeSet<ImageName>,
    is_source: bool,
}

/// Desired state, observed state and run configuration for one run.
#[derive(Debug, Clone)]
pub struct SyncContext {
    config: RunConfig,
    manifests: Vec<Manifest>,
    registries: BTreeMap<RegistryName, RegistryContext>,
    inventories: BTreeMap<RegistryName, RegistryInventory>,
    unreachable: BTreeMap<RegistryName, RegistryAccessError>,
}

impl SyncContext {
    /// Validate `manifests`, then collect an inventory for every registry
    /// they name.
    pub fn build(
        config: RunConfig,
        manifests: Vec<Manifest>,
        reader: &dyn InventoryReader,
    ) -> Result<Self, SyncError> {
        config.validate()?;
        for manifest in &manifests {
            validate_manifest(manifest)?;
        }
        check_conflicts(&manifests)?;

        let plans = plan_reads(&manifests);
        let mut inventories = BTreeMap::new();
        let mut unreachable = BTreeMap::new();

        for (name, plan) in &plans {
            let scope = InventoryScope::Images(plan.images.clone());
            match reader.read_inventory(&plan.context, &scope) {
                Ok(inventory) => {
                    tracing::info!(
                        "read inventory of {}: {} of {} images present",
                        name,
                        inventory.images.len(),
                        plan.images.len()
                    );
                    inventories.insert(name.clone(), inventory);
                }
                Err(InventoryError::Auth(err)) => return Err(SyncError::Auth(err)),
                Err(InventoryError::Unreachable(err)) if plan.is_source => {
                    return Err(SyncError::SourceUnreachable(err));
                }
                Err(InventoryError::Unreachable(err)) => {
                    tracing::warn!("destination {} skipped: {}", name, err.reason);
                    unreachable.insert(name.clone(), err);
                }
            }
        }

        let registries = plans
            .into_iter()
            .map(|(name, plan)| (name, plan.context))
            .collect();

        Ok(Self {
            config,
            manifests,
            registries,
            inventories,
            unreachable,
        })
    }

    /// Assemble a context from already-collected parts. Used when the
    /// inventories come from somewhere other than a live reader.
    pub fn from_parts(
        config: RunConfig,
        manifests: Vec<Manifest>,
        inventories: impl IntoIterator<Item = RegistryInventory>,
    ) -> Self {
        let registries = plan_reads(&manifests)
            .into_iter()
            .map(|(name, plan)| (name, plan.context))
            .collect();
        Self {
            config,
            manifests,
            registries,
            inventories: inventories
                .into_iter()
                .map(|inv| (inv.registry.clone(), inv))
                .collect(),
            unreachable: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn manifests(&self) -> &[Manifest] {
        &self.manifests
    }

    pub fn inventory(&self, registry: &RegistryName) -> Option<&RegistryInventory> {
        self.inventories.get(registry)
    }

    pub fn inventories(&self) -> impl Iterator<Item = &RegistryInventory> {
        self.inventories.values()
    }

    pub fn is_unreachable(&self, registry: &RegistryName) -> bool {
        self.unreachable.contains_key(registry)
    }

    pub fn unreachable(&self) -> impl Iterator<Item = &RegistryAccessError> {
        self.unreachable.values()
    }

    /// Canonical destination context for `registry`: one per name, so edges
    /// from different manifests targeting the same registry compare equal.
    pub fn destination_context(&self, registry: &RegistryName) -> RegistryContext {
        let mut context = self
            .registries
            .get(registry)
            .cloned()
            .unwrap_or_else(|| RegistryContext::destination(registry.clone()));
        context.src = false;
        context
    }

    /// Every registry the manifests name.
    pub fn registries(&self) -> impl Iterator<Item = &RegistryContext> {
        self.registries.values()
    }
}

/// One entry per registry name. The first service account seen for a name
/// wins; a registry that is a source anywhere counts as a source.
fn plan_reads(manifests: &[Manifest]) -> BTreeMap<RegistryName, RegistryPlan> {
    let mut plans: BTreeMap<RegistryName, RegistryPlan> = BTreeMap::new();
    for manifest in manifests {
        let images: BTreeSet<ImageName> = manifest.images.iter().map(|i| i.name.clone()).collect();
        for registry in &manifest.registries {
            let plan = plans
                .entry(registry.name.clone())
                .or_insert_with(|| RegistryPlan {
                    context: RegistryContext {
                        src: false,
                        ..registry.clone()
                    },
                    images: BTreeSet::new(),
                    is_source: false,
                });
            if plan.context.service_account.is_none() {
                plan.context.service_account = registry.service_account.clone();
            }
            plan.is_source |= registry.src;
            plan.images.extend(images.iter().cloned());
        }
    }
    plans
}

/// Every destination `(registry, image, tag)` must resolve to one digest
/// across all manifests.
fn check_conflicts(manifests: &[Manifest]) -> Result<(), SyncError> {
    let mut pins: BTreeMap<(RegistryName, ImageName, Tag), (Digest, String)> = BTreeMap::new();
    for manifest in manifests {
        let label = manifest.label();
        for (image, dmap) in manifest.merged_images() {
            for (digest, tags) in &dmap {
                for tag in tags {
                    for dst in manifest.destinations() {
                        let key = (dst.name.clone(), image.clone(), tag.clone());
                        match pins.get(&key) {
                            Some((first, first_manifest)) if first != digest => {
                                return Err(SyncError::ManifestConflict {
                                    registry: dst.name.clone(),
                                    image: image.clone(),
                                    tag: tag.clone(),
                                    first: first.clone(),
                                    first_manifest: first_manifest.clone(),
                                    second: digest.clone(),
                                    second_manifest: label.clone(),
                                });
                            }
                            Some(_) => {}
                            None => {
                                pins.insert(key, (digest.clone(), label.clone()));
                            }
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

//! Inventory reads over the Distribution API.

use std::collections::BTreeSet;
use std::sync::Arc;

use promo_core::{
    Digest, ImageInventory, ImageName, InventoryError, InventoryReader, InventoryScope,
    RegistryContext, RegistryInventory, Tag,
};

use crate::client::{RegistryClient, TagListing};
use crate::error::RegistryError;
use crate::media::{DOCKER_MANIFEST_LIST, OCI_INDEX};
use crate::pool::RegistryPool;
use crate::reference::RegistryEndpoint;

/// [`InventoryReader`] backed by live registries.
///
/// Registries that answer `tags/list` with a digest map (GCR, Artifact
/// Registry) are read from that map, untagged digests included. Elsewhere
/// every tag is resolved with a manifest GET, so only tagged digests and the
/// children of tagged lists are visible.
pub struct NetworkInventory {
    pool: Arc<RegistryPool>,
}

impl NetworkInventory {
    pub fn new(pool: Arc<RegistryPool>) -> Self {
        Self { pool }
    }

    fn read(
        &self,
        registry: &RegistryContext,
        scope: &InventoryScope,
    ) -> Result<RegistryInventory, RegistryError> {
        let (client, endpoint) = self.pool.client(&registry.name);
        let images: Vec<ImageName> = match scope {
            InventoryScope::Images(images) => images.iter().cloned().collect(),
            InventoryScope::Registry => client
                .catalog()?
                .iter()
                .filter_map(|repository| endpoint.image_for(repository))
                .collect(),
        };

        let mut inventory = RegistryInventory::new(registry.name.clone());
        for image in images {
            if let Some(found) = read_image(&client, &endpoint, &image)? {
                inventory.images.insert(image, found);
            }
        }
        tracing::debug!(
            registry = %registry.name,
            images = inventory.images.len(),
            "read registry inventory"
        );
        Ok(inventory)
    }
}

impl InventoryReader for NetworkInventory {
    fn read_inventory(
        &self,
        registry: &RegistryContext,
        scope: &InventoryScope,
    ) -> Result<RegistryInventory, InventoryError> {
        self.read(registry, scope)
            .map_err(|err| err.into_inventory_error(&registry.name))
    }
}

fn read_image(
    client: &RegistryClient,
    endpoint: &RegistryEndpoint,
    image: &ImageName,
) -> Result<Option<ImageInventory>, RegistryError> {
    let repository = endpoint.repository(image);
    let Some(listing) = client.list_tags(&repository)? else {
        return Ok(None);
    };

    let mut found = ImageInventory::default();
    if listing.manifests.is_empty() {
        from_tags(client, &repository, &listing, &mut found)?;
    } else {
        from_digest_map(client, &repository, &listing, &mut found)?;
    }
    Ok(Some(found))
}

fn from_digest_map(
    client: &RegistryClient,
    repository: &str,
    listing: &TagListing,
    found: &mut ImageInventory,
) -> Result<(), RegistryError> {
    for (digest, info) in &listing.manifests {
        let digest = Digest::from(digest.as_str());
        found
            .digests
            .entry(digest.clone())
            .or_default()
            .extend(info.tags.iter().map(|t| Tag::from(t.as_str())));
        let is_list = matches!(
            info.media_type.as_deref(),
            Some(DOCKER_MANIFEST_LIST) | Some(OCI_INDEX)
        );
        if is_list {
            let doc = client.get_manifest(repository, digest.as_str())?;
            found.children.insert(
                digest,
                doc.children.iter().map(|c| Digest::from(c.as_str())).collect(),
            );
        }
    }
    Ok(())
}

fn from_tags(
    client: &RegistryClient,
    repository: &str,
    listing: &TagListing,
    found: &mut ImageInventory,
) -> Result<(), RegistryError> {
    for tag in &listing.tags {
        let doc = client.get_manifest(repository, tag)?;
        let digest = Digest::from(doc.digest());
        found
            .digests
            .entry(digest.clone())
            .or_default()
            .insert(Tag::from(tag.as_str()));
        if doc.is_list() && !found.children.contains_key(&digest) {
            let children: BTreeSet<Digest> =
                doc.children.iter().map(|c| Digest::from(c.as_str())).collect();
            for child in &children {
                if client.manifest_digest(repository, child.as_str())?.is_some() {
                    found.digests.entry(child.clone()).or_default();
                }
            }
            found.children.insert(digest, children);
        }
    }
    Ok(())
}

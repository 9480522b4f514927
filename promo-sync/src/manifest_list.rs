//! Manifest-list consistency: every child a list references must be present
//! in the same image's inventory.

use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;

use promo_core::{Digest, Image, ImageInventory, ImageName, RegistryInventory, RegistryName};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ManifestListFinding {
    /// `parent` references `child`, which the registry does not hold.
    MissingChild {
        registry: RegistryName,
        image: ImageName,
        parent: Digest,
        child: Digest,
    },
    /// A digest the caller asked about is not in the registry at all.
    Unresolved {
        registry: RegistryName,
        image: ImageName,
        digest: Digest,
    },
}

impl fmt::Display for ManifestListFinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManifestListFinding::MissingChild {
                registry,
                image,
                parent,
                child,
            } => write!(
                f,
                "{}@{parent}: child {child} missing",
                registry.join(image)
            ),
            ManifestListFinding::Unresolved {
                registry,
                image,
                digest,
            } => write!(f, "{}@{digest}: not found", registry.join(image)),
        }
    }
}

/// Check every manifest list in `inventory`.
///
/// With `only`, the check is limited to the digests those images name (a
/// snapshot file, typically); named digests the registry lacks are reported
/// as [`ManifestListFinding::Unresolved`] and named digests that are plain
/// manifests pass.
pub fn validate_manifest_lists(
    inventory: &RegistryInventory,
    only: Option<&[Image]>,
) -> BTreeSet<ManifestListFinding> {
    let mut findings = BTreeSet::new();
    let empty = ImageInventory::default();

    match only {
        None => {
            for (name, image) in &inventory.images {
                for parent in image.children.keys() {
                    check_parent(&mut findings, &inventory.registry, name, image, parent);
                }
            }
        }
        Some(images) => {
            for wanted in images {
                let image = inventory.image(&wanted.name).unwrap_or(&empty);
                for digest in wanted.dmap.keys() {
                    if !image.has_digest(digest) {
                        findings.insert(ManifestListFinding::Unresolved {
                            registry: inventory.registry.clone(),
                            image: wanted.name.clone(),
                            digest: digest.clone(),
                        });
                        continue;
                    }
                    check_parent(
                        &mut findings,
                        &inventory.registry,
                        &wanted.name,
                        image,
                        digest,
                    );
                }
            }
        }
    }

    tracing::debug!(
        "checked manifest lists in {}: {} findings",
        inventory.registry,
        findings.len()
    );
    findings
}

fn check_parent(
    findings: &mut BTreeSet<ManifestListFinding>,
    registry: &RegistryName,
    name: &ImageName,
    image: &ImageInventory,
    parent: &Digest,
) {
    let Some(children) = image.children.get(parent) else {
        return;
    };
    for child in children {
        if !image.has_digest(child) {
            findings.insert(ManifestListFinding::MissingChild {
                registry: registry.clone(),
                image: name.clone(),
                parent: parent.clone(),
                child: child.clone(),
            });
        }
    }
}

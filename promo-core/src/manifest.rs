//! Manifest loading and validation.
//!
//! # Layouts
//!
//! A manifest is either a single file holding both `registries:` and
//! `images:`, or a *thin* directory where the two halves live apart:
//!
//! ```text
//! <root>/
//!   manifests/
//!     <name>/promoter-manifest.yaml   (registries only)
//!   images/
//!     <name>/images.yaml              (list of {name, dmap})
//! ```
//!
//! `images.yaml` has the same shape as a YAML snapshot, so a snapshot can be
//! dropped in as the images half of a later run.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::error::{io_err, LoadError, ValidationError};
use crate::types::{Image, Manifest};

pub const THIN_MANIFEST_FILE: &str = "promoter-manifest.yaml";
pub const THIN_IMAGES_FILE: &str = "images.yaml";

// ---------------------------------------------------------------------------
// 1. Load
// ---------------------------------------------------------------------------

fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, LoadError> {
    if !path.exists() {
        return Err(LoadError::NotFound {
            path: path.to_path_buf(),
        });
    }
    let contents = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
    serde_yaml::from_str(&contents).map_err(|e| LoadError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Load a full manifest (registries + images) from one file.
pub fn load_manifest_at(path: &Path) -> Result<Manifest, LoadError> {
    let mut manifest: Manifest = read_yaml(path)?;
    manifest.filepath = Some(path.to_path_buf());
    Ok(manifest)
}

/// Load an images list (`images.yaml` or a YAML snapshot).
pub fn load_images_at(path: &Path) -> Result<Vec<Image>, LoadError> {
    read_yaml(path)
}

/// Load every manifest of a thin-manifest directory, sorted by name.
pub fn load_thin_manifests_at(root: &Path) -> Result<Vec<Manifest>, LoadError> {
    let manifests_dir = root.join("manifests");
    if !manifests_dir.is_dir() {
        return Err(LoadError::NotFound {
            path: manifests_dir,
        });
    }

    let mut entries: Vec<_> = std::fs::read_dir(&manifests_dir)
        .map_err(|e| io_err(&manifests_dir, e))?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .collect();
    entries.sort_by_key(|e| e.file_name());

    let mut manifests = Vec::new();
    for entry in entries {
        let name = entry.file_name();
        let manifest_path = entry.path().join(THIN_MANIFEST_FILE);
        if !manifest_path.exists() {
            continue;
        }
        let mut manifest: Manifest = read_yaml(&manifest_path)?;
        let images_path: PathBuf = root.join("images").join(&name).join(THIN_IMAGES_FILE);
        manifest.images = load_images_at(&images_path)?;
        manifest.filepath = Some(manifest_path);
        manifests.push(manifest);
    }
    Ok(manifests)
}

/// Load `path` as a thin-manifest directory if it is a directory, otherwise
/// as a single manifest file.
pub fn load_any_at(path: &Path) -> Result<Vec<Manifest>, LoadError> {
    if path.is_dir() {
        load_thin_manifests_at(path)
    } else {
        Ok(vec![load_manifest_at(path)?])
    }
}

// ---------------------------------------------------------------------------
// 2. Validate
// ---------------------------------------------------------------------------

/// Structural checks on one manifest: exactly one source, at least one
/// destination, unique registry names, well-formed digests and tags.
pub fn validate_manifest(manifest: &Manifest) -> Result<(), ValidationError> {
    let invalid = |reason: String| ValidationError::Manifest {
        manifest: manifest.label(),
        reason,
    };

    let sources = manifest.registries.iter().filter(|r| r.src).count();
    if sources != 1 {
        return Err(invalid(format!(
            "expected exactly one source registry, found {sources}"
        )));
    }
    if manifest.destinations().next().is_none() {
        return Err(invalid("no destination registries".to_string()));
    }

    let mut seen = BTreeSet::new();
    for registry in &manifest.registries {
        if registry.name.0.trim().is_empty() {
            return Err(invalid("registry with empty name".to_string()));
        }
        if !seen.insert(&registry.name) {
            return Err(invalid(format!("registry {} listed twice", registry.name)));
        }
    }

    for image in &manifest.images {
        if image.name.0.trim().is_empty() || image.name.0.starts_with('/') {
            return Err(invalid(format!("invalid image name '{}'", image.name)));
        }
        for (digest, tags) in &image.dmap {
            if !digest.is_well_formed() {
                return Err(invalid(format!(
                    "image {}: invalid digest '{digest}'",
                    image.name
                )));
            }
            if let Some(tag) = tags.iter().find(|t| !t.is_well_formed()) {
                return Err(invalid(format!("image {}: invalid tag '{tag}'", image.name)));
            }
        }
    }
    Ok(())
}

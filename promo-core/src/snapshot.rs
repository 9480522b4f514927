//! Snapshot formats.
//!
//! A snapshot is the observed inventory of one registry flattened into the
//! manifest `images` shape. YAML output is a list of `{name, dmap}` entries;
//! CSV output has one `image,digest,tag` row per tag (tagless digests get an
//! empty tag column). Both parse back into the same `Vec<Image>`.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{io_err, LoadError};
use crate::types::{Digest, DigestTags, Image, ImageName, RegistryInventory, Tag};

/// Serialization format for snapshot output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Yaml,
    Csv,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Yaml => write!(f, "yaml"),
            OutputFormat::Csv => write!(f, "csv"),
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "yaml" => Ok(OutputFormat::Yaml),
            "csv" => Ok(OutputFormat::Csv),
            other => Err(format!("unknown output format '{other}'; expected: yaml, csv")),
        }
    }
}

/// Optional reductions applied before rendering.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotFilter {
    /// Keep only digests carrying this tag.
    pub tag: Option<Tag>,
    /// Drop digests that are children of a manifest list in the same image.
    pub minimal: bool,
}

/// Flatten an inventory into snapshot images, sorted by name.
///
/// Images left with no digests after filtering are omitted.
pub fn images_from_inventory(inventory: &RegistryInventory, filter: &SnapshotFilter) -> Vec<Image> {
    let mut images = Vec::new();
    for (name, image) in &inventory.images {
        let children = image.child_digests();
        let dmap: DigestTags = image
            .digests
            .iter()
            .filter(|(digest, _)| !(filter.minimal && children.contains(digest)))
            .filter(|(_, tags)| filter.tag.as_ref().map_or(true, |t| tags.contains(t)))
            .map(|(digest, tags)| (digest.clone(), tags.clone()))
            .collect();
        if dmap.is_empty() {
            continue;
        }
        images.push(Image {
            name: name.clone(),
            dmap,
        });
    }
    images
}

pub fn render(images: &[Image], format: OutputFormat) -> Result<String, LoadError> {
    match format {
        OutputFormat::Yaml => Ok(serde_yaml::to_string(images)?),
        OutputFormat::Csv => Ok(render_csv(images)),
    }
}

fn render_csv(images: &[Image]) -> String {
    let mut out = String::new();
    for image in images {
        for (digest, tags) in &image.dmap {
            if tags.is_empty() {
                out.push_str(&format!("{},{},\n", image.name, digest));
            }
            for tag in tags {
                out.push_str(&format!("{},{},{}\n", image.name, digest, tag));
            }
        }
    }
    out
}

pub fn parse(input: &str, format: OutputFormat) -> Result<Vec<Image>, LoadError> {
    match format {
        OutputFormat::Yaml => Ok(serde_yaml::from_str(input)?),
        OutputFormat::Csv => parse_csv(input),
    }
}

impl OutputFormat {
    /// Format implied by a file extension; anything but `.csv` is YAML.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("csv") => OutputFormat::Csv,
            _ => OutputFormat::Yaml,
        }
    }
}

/// Load a snapshot file written by [`render`], in the format its extension
/// implies.
pub fn load_at(path: &Path) -> Result<Vec<Image>, LoadError> {
    if !path.exists() {
        return Err(LoadError::NotFound {
            path: path.to_path_buf(),
        });
    }
    let contents = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
    match OutputFormat::from_path(path) {
        OutputFormat::Csv => parse_csv(&contents),
        OutputFormat::Yaml => serde_yaml::from_str(&contents).map_err(|e| LoadError::Parse {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

fn parse_csv(input: &str) -> Result<Vec<Image>, LoadError> {
    let mut merged: BTreeMap<ImageName, DigestTags> = BTreeMap::new();
    for (idx, line) in input.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(',').collect();
        let [name, digest, tag] = fields.as_slice() else {
            return Err(LoadError::Csv {
                line: idx + 1,
                reason: format!("expected 3 columns, found {}", fields.len()),
            });
        };
        if name.is_empty() || digest.is_empty() {
            return Err(LoadError::Csv {
                line: idx + 1,
                reason: "image and digest columns are required".to_string(),
            });
        }
        let tags: &mut BTreeSet<Tag> = merged
            .entry(ImageName::from(*name))
            .or_default()
            .entry(Digest::from(*digest))
            .or_default();
        if !tag.is_empty() {
            tags.insert(Tag::from(*tag));
        }
    }
    Ok(merged
        .into_iter()
        .map(|(name, dmap)| Image { name, dmap })
        .collect())
}

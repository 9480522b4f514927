//! Domain types for image promotion.
//!
//! Desired state ([`Manifest`]) and observed state ([`RegistryInventory`])
//! share the same `image → digest → tags` shape so they can be compared
//! directly. All collections are ordered (`BTreeMap`/`BTreeSet`) so that edge
//! computation and snapshot output are deterministic.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

macro_rules! string_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }
    };
}

string_newtype!(
    /// A registry path such as `gcr.io/k8s-artifacts-prod/foo`.
    RegistryName
);

string_newtype!(
    /// A repository path relative to its registry.
    ImageName
);

string_newtype!(
    /// Immutable content identifier, `<algorithm>:<hex>`.
    Digest
);

string_newtype!(
    /// Mutable human-readable label pointing at a digest.
    Tag
);

impl RegistryName {
    /// Full repository reference of `image` inside this registry.
    pub fn join(&self, image: &ImageName) -> String {
        format!("{}/{}", self.0.trim_end_matches('/'), image.0)
    }
}

impl Digest {
    /// `true` when the value has the `<algorithm>:<hex>` shape.
    pub fn is_well_formed(&self) -> bool {
        let Some((algorithm, hex)) = self.0.split_once(':') else {
            return false;
        };
        !algorithm.is_empty()
            && algorithm
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '+' || c == '_')
            && !hex.is_empty()
            && hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
    }
}

impl Tag {
    /// Docker reference grammar: `[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}`.
    pub fn is_well_formed(&self) -> bool {
        let mut chars = self.0.chars();
        let Some(first) = chars.next() else {
            return false;
        };
        self.0.len() <= 128
            && (first.is_ascii_alphanumeric() || first == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
    }
}

// ---------------------------------------------------------------------------
// Desired state
// ---------------------------------------------------------------------------

/// Digest → tags. An empty tag set marks a tagless digest.
pub type DigestTags = BTreeMap<Digest, BTreeSet<Tag>>;

/// A registry named by a manifest, either the promotion source or a
/// destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegistryContext {
    pub name: RegistryName,
    #[serde(
        default,
        rename = "service-account",
        skip_serializing_if = "Option::is_none"
    )]
    pub service_account: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub src: bool,
}

impl RegistryContext {
    pub fn source(name: impl Into<RegistryName>) -> Self {
        Self {
            name: name.into(),
            service_account: None,
            src: true,
        }
    }

    pub fn destination(name: impl Into<RegistryName>) -> Self {
        Self {
            name: name.into(),
            service_account: None,
            src: false,
        }
    }
}

/// One image entry of a manifest or snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub name: ImageName,
    #[serde(default)]
    pub dmap: DigestTags,
}

/// Declarative desired state for one source and its destinations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Manifest {
    pub registries: Vec<RegistryContext>,
    #[serde(default)]
    pub images: Vec<Image>,
    /// File the manifest was loaded from; used only in diagnostics.
    #[serde(skip)]
    pub filepath: Option<PathBuf>,
}

impl Manifest {
    /// The single registry marked `src: true`, if exactly one exists.
    pub fn source_registry(&self) -> Option<&RegistryContext> {
        let mut sources = self.registries.iter().filter(|r| r.src);
        match (sources.next(), sources.next()) {
            (Some(src), None) => Some(src),
            _ => None,
        }
    }

    pub fn destinations(&self) -> impl Iterator<Item = &RegistryContext> {
        self.registries.iter().filter(|r| !r.src)
    }

    /// Images with duplicate entries merged into one digest map each.
    pub fn merged_images(&self) -> BTreeMap<ImageName, DigestTags> {
        let mut merged: BTreeMap<ImageName, DigestTags> = BTreeMap::new();
        for image in &self.images {
            let entry = merged.entry(image.name.clone()).or_default();
            for (digest, tags) in &image.dmap {
                entry
                    .entry(digest.clone())
                    .or_default()
                    .extend(tags.iter().cloned());
            }
        }
        merged
    }

    /// Label used in log lines and error messages.
    pub fn label(&self) -> String {
        match &self.filepath {
            Some(path) => path.display().to_string(),
            None => self
                .source_registry()
                .map(|r| r.name.to_string())
                .unwrap_or_else(|| "<inline manifest>".to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Observed state
// ---------------------------------------------------------------------------

/// Observed content of one image repository.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ImageInventory {
    #[serde(default)]
    pub digests: DigestTags,
    /// Manifest-list digest → child digests it references.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub children: BTreeMap<Digest, BTreeSet<Digest>>,
}

impl ImageInventory {
    pub fn has_digest(&self, digest: &Digest) -> bool {
        self.digests.contains_key(digest)
    }

    pub fn has_pairing(&self, digest: &Digest, tag: &Tag) -> bool {
        self.digests
            .get(digest)
            .is_some_and(|tags| tags.contains(tag))
    }

    /// Digest the tag currently points at.
    pub fn digest_for_tag(&self, tag: &Tag) -> Option<&Digest> {
        self.digests
            .iter()
            .find(|(_, tags)| tags.contains(tag))
            .map(|(digest, _)| digest)
    }

    pub fn is_manifest_list(&self, digest: &Digest) -> bool {
        self.children.contains_key(digest)
    }

    /// Every digest referenced as a child by some manifest list.
    pub fn child_digests(&self) -> BTreeSet<&Digest> {
        self.children.values().flatten().collect()
    }
}

/// Observed content of one registry at collection time.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RegistryInventory {
    pub registry: RegistryName,
    #[serde(default)]
    pub images: BTreeMap<ImageName, ImageInventory>,
}

impl RegistryInventory {
    pub fn new(registry: impl Into<RegistryName>) -> Self {
        Self {
            registry: registry.into(),
            images: BTreeMap::new(),
        }
    }

    pub fn image(&self, name: &ImageName) -> Option<&ImageInventory> {
        self.images.get(name)
    }
}

// ---------------------------------------------------------------------------
// Edges
// ---------------------------------------------------------------------------

/// The mutation an edge performs at its destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TagOp {
    /// Digest absent at the destination: transfer content, then tag.
    CopyWithTag,
    /// Digest present, tag missing: retag only.
    AddTag,
    /// Manifest-list parent check, gated on its child edges.
    VerifyParent,
}

impl fmt::Display for TagOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagOp::CopyWithTag => write!(f, "copy-with-tag"),
            TagOp::AddTag => write!(f, "add-tag"),
            TagOp::VerifyParent => write!(f, "verify-parent"),
        }
    }
}

/// A single required mutation. Identity is the full tuple.
///
/// Field order puts the destination first so the derived ordering groups
/// edges by destination registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PromotionEdge {
    pub dst_registry: RegistryContext,
    pub dst_image: ImageName,
    pub digest: Digest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<Tag>,
    pub op: TagOp,
    pub src_registry: RegistryName,
    pub src_image: ImageName,
}

impl PromotionEdge {
    pub fn src_reference(&self) -> String {
        format!("{}@{}", self.src_registry.join(&self.src_image), self.digest)
    }

    pub fn dst_reference(&self) -> String {
        let repo = self.dst_registry.name.join(&self.dst_image);
        match &self.tag {
            Some(tag) => format!("{repo}:{tag}"),
            None => format!("{repo}@{}", self.digest),
        }
    }
}

impl fmt::Display for PromotionEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {} ({})",
            self.src_reference(),
            self.dst_reference(),
            self.op
        )
    }
}

// ---------------------------------------------------------------------------
// Vulnerability scanning
// ---------------------------------------------------------------------------

/// Vulnerability severity, ordered from least to most severe.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Minimal,
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Minimal => write!(f, "minimal"),
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "minimal" => Ok(Severity::Minimal),
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(format!(
                "unknown severity '{other}'; expected: minimal, low, medium, high, critical"
            )),
        }
    }
}

/// One finding reported by a vulnerability scanner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vulnerability {
    pub id: String,
    pub severity: Severity,
    #[serde(default)]
    pub fix_available: bool,
}

/// Result of scanning one image digest.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScanReport {
    #[serde(default)]
    pub vulnerabilities: Vec<Vulnerability>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

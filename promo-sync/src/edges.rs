//! Promotion edge computation.
//!
//! [`compute_edges`] is a pure function of the [`SyncContext`]: no I/O, no
//! concurrency, deterministic output. For every desired
//! `(image, digest, tag)` and every destination of its manifest:
//!
//! | destination state                   | result                     |
//! |-------------------------------------|----------------------------|
//! | digest absent                       | `CopyWithTag` edge         |
//! | digest present, tag absent          | `AddTag` edge              |
//! | exact pairing present               | nothing                    |
//! | tag present on a different digest   | `TagMove` finding          |
//! | digest absent from the source       | `MissingSource` finding    |
//! | destination unreachable             | `UnreachableDestination`   |
//!
//! Tagless digests only need the digest to exist. Destination content the
//! manifests do not name is never looked at, so it can never appear in an
//! edge.
//!
//! Manifest lists: every child missing at the destination gets a tagless
//! `CopyWithTag` edge, the parent's own edges depend on those, and a
//! `VerifyParent` edge depending on all of them closes the group.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;

use promo_core::{
    Digest, ImageInventory, ImageName, PromotionEdge, RegistryContext, RegistryName, Tag, TagOp,
};

use crate::context::SyncContext;

/// A desired pairing that cannot be turned into an edge. Every finding makes
/// the run fail.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum EdgeFinding {
    MissingSource {
        registry: RegistryName,
        image: ImageName,
        digest: Digest,
    },
    TagMove {
        registry: RegistryName,
        image: ImageName,
        tag: Tag,
        current: Digest,
        requested: Digest,
    },
    UnreachableDestination {
        registry: RegistryName,
        image: ImageName,
    },
}

impl fmt::Display for EdgeFinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EdgeFinding::MissingSource {
                registry,
                image,
                digest,
            } => write!(f, "{}@{digest}: not found in source", registry.join(image)),
            EdgeFinding::TagMove {
                registry,
                image,
                tag,
                current,
                requested,
            } => write!(
                f,
                "{}:{tag}: refusing to move tag from {current} to {requested}",
                registry.join(image)
            ),
            EdgeFinding::UnreachableDestination { registry, image } => write!(
                f,
                "{}: destination registry unreachable",
                registry.join(image)
            ),
        }
    }
}

/// Deduplicated edges, their happens-before dependencies, and findings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EdgePlan {
    pub edges: BTreeSet<PromotionEdge>,
    /// Edge → edges that must all succeed before it may run.
    pub dependencies: BTreeMap<PromotionEdge, BTreeSet<PromotionEdge>>,
    pub findings: BTreeSet<EdgeFinding>,
}

impl EdgePlan {
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn dependencies_of(&self, edge: &PromotionEdge) -> impl Iterator<Item = &PromotionEdge> {
        self.dependencies.get(edge).into_iter().flatten()
    }

    /// Edges grouped by destination registry, for client reuse.
    pub fn by_destination(&self) -> BTreeMap<&RegistryName, Vec<&PromotionEdge>> {
        let mut groups: BTreeMap<&RegistryName, Vec<&PromotionEdge>> = BTreeMap::new();
        for edge in &self.edges {
            groups.entry(&edge.dst_registry.name).or_default().push(edge);
        }
        groups
    }

    pub fn count(&self, op: TagOp) -> usize {
        self.edges.iter().filter(|e| e.op == op).count()
    }

    fn insert(&mut self, edge: PromotionEdge, deps: &BTreeSet<PromotionEdge>) {
        if !deps.is_empty() {
            self.dependencies
                .entry(edge.clone())
                .or_default()
                .extend(deps.iter().cloned());
        }
        self.edges.insert(edge);
    }
}

/// Compute the edges needed to make every destination match the manifests.
pub fn compute_edges(ctx: &SyncContext) -> EdgePlan {
    let mut plan = EdgePlan::default();
    let empty = ImageInventory::default();

    for manifest in ctx.manifests() {
        let Some(src) = manifest.source_registry() else {
            continue;
        };
        let src_inventory = ctx.inventory(&src.name);

        for (image, dmap) in manifest.merged_images() {
            let src_image = src_inventory
                .and_then(|inv| inv.image(&image))
                .unwrap_or(&empty);

            for dst in manifest.destinations() {
                if ctx.is_unreachable(&dst.name) {
                    plan.findings.insert(EdgeFinding::UnreachableDestination {
                        registry: dst.name.clone(),
                        image: image.clone(),
                    });
                    continue;
                }
                let dst_image = ctx
                    .inventory(&dst.name)
                    .and_then(|inv| inv.image(&image))
                    .unwrap_or(&empty);
                let builder = DigestEdges {
                    src: &src.name,
                    dst: ctx.destination_context(&dst.name),
                    image: &image,
                    src_image,
                    dst_image,
                };
                for (digest, tags) in &dmap {
                    builder.plan_digest(&mut plan, digest, tags);
                }
            }
        }
    }

    tracing::debug!(
        "computed {} edges ({} copy, {} add-tag, {} verify), {} findings",
        plan.len(),
        plan.count(TagOp::CopyWithTag),
        plan.count(TagOp::AddTag),
        plan.count(TagOp::VerifyParent),
        plan.findings.len()
    );
    plan
}

/// Edge construction for one (source, destination, image) triple.
struct DigestEdges<'a> {
    src: &'a RegistryName,
    dst: RegistryContext,
    image: &'a ImageName,
    src_image: &'a ImageInventory,
    dst_image: &'a ImageInventory,
}

impl DigestEdges<'_> {
    fn edge(&self, digest: &Digest, tag: Option<&Tag>, op: TagOp) -> PromotionEdge {
        PromotionEdge {
            dst_registry: self.dst.clone(),
            dst_image: self.image.clone(),
            digest: digest.clone(),
            tag: tag.cloned(),
            op,
            src_registry: self.src.clone(),
            src_image: self.image.clone(),
        }
    }

    fn missing_source(&self, digest: &Digest) -> EdgeFinding {
        EdgeFinding::MissingSource {
            registry: self.src.clone(),
            image: self.image.clone(),
            digest: digest.clone(),
        }
    }

    fn plan_digest(&self, plan: &mut EdgePlan, digest: &Digest, tags: &BTreeSet<Tag>) {
        if !self.src_image.has_digest(digest) {
            plan.findings.insert(self.missing_source(digest));
            return;
        }

        let mut child_edges = BTreeSet::new();
        let children = self.src_image.children.get(digest);
        for child in children.into_iter().flatten() {
            if self.dst_image.has_digest(child) {
                continue;
            }
            if !self.src_image.has_digest(child) {
                plan.findings.insert(self.missing_source(child));
                return;
            }
            child_edges.insert(self.edge(child, None, TagOp::CopyWithTag));
        }

        let mut parent_edges = BTreeSet::new();
        let digest_present = self.dst_image.has_digest(digest);
        if tags.is_empty() && !digest_present {
            parent_edges.insert(self.edge(digest, None, TagOp::CopyWithTag));
        }
        for tag in tags {
            match self.dst_image.digest_for_tag(tag) {
                Some(current) if current == digest => {}
                Some(current) => {
                    plan.findings.insert(EdgeFinding::TagMove {
                        registry: self.dst.name.clone(),
                        image: self.image.clone(),
                        tag: tag.clone(),
                        current: current.clone(),
                        requested: digest.clone(),
                    });
                }
                None if digest_present => {
                    parent_edges.insert(self.edge(digest, Some(tag), TagOp::AddTag));
                }
                None => {
                    parent_edges.insert(self.edge(digest, Some(tag), TagOp::CopyWithTag));
                }
            }
        }

        let no_deps = BTreeSet::new();
        for edge in &child_edges {
            plan.insert(edge.clone(), &no_deps);
        }
        for edge in &parent_edges {
            plan.insert(edge.clone(), &child_edges);
        }

        let is_list = children.is_some();
        if is_list && !(child_edges.is_empty() && parent_edges.is_empty()) {
            let gate: BTreeSet<PromotionEdge> =
                child_edges.union(&parent_edges).cloned().collect();
            plan.insert(self.edge(digest, None, TagOp::VerifyParent), &gate);
        }
    }
}

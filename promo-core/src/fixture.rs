//! In-memory registry backend.
//!
//! [`FixtureRegistry`] implements every capability trait against a shared
//! in-memory state, so a whole run (inventory, transfers, scans, credential
//! activation) can execute without a network. Failures are injected per
//! `(destination registry, digest)`.
//!
//! The state can also be loaded from YAML ([`FixtureSpec`]) which is how the
//! CLI's hidden `--fixture` flag swaps the backend.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::capability::{
    CredentialActivator, InventoryReader, InventoryScope, TransferFactory, TransferOperation,
    VulnerabilityScanner,
};
use crate::error::{
    io_err, AuthError, InventoryError, LoadError, RegistryAccessError, ScanError, TransferError,
};
use crate::options::RunConfig;
use crate::types::{
    Digest, ImageInventory, ImageName, PromotionEdge, RegistryContext, RegistryInventory,
    RegistryName, ScanReport, Tag, TagOp, Vulnerability,
};

// ---------------------------------------------------------------------------
// YAML description
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct FixtureSpec {
    pub registries: Vec<FixtureRegistrySpec>,
    pub vulnerabilities: BTreeMap<Digest, Vec<Vulnerability>>,
    pub failures: Vec<FixtureFailure>,
    pub deny_auth: BTreeSet<RegistryName>,
    /// Simulated duration of each transfer attempt.
    pub latency_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureRegistrySpec {
    pub name: RegistryName,
    #[serde(default)]
    pub unreachable: bool,
    #[serde(default)]
    pub images: BTreeMap<ImageName, ImageInventory>,
}

/// Transfers of `digest` into `registry` fail `transient` times before
/// succeeding, or always when `permanent` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureFailure {
    pub registry: RegistryName,
    pub digest: Digest,
    #[serde(default)]
    pub transient: u32,
    #[serde(default)]
    pub permanent: bool,
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct FailurePlan {
    transient_left: u32,
    permanent: bool,
}

#[derive(Debug, Default)]
struct FixtureState {
    registries: BTreeMap<RegistryName, RegistryInventory>,
    unreachable: BTreeSet<RegistryName>,
    deny_auth: BTreeSet<RegistryName>,
    vulnerabilities: BTreeMap<Digest, Vec<Vulnerability>>,
    failures: BTreeMap<(RegistryName, Digest), FailurePlan>,
    latency: Duration,
    attempts: BTreeMap<PromotionEdge, u32>,
    applied: Vec<PromotionEdge>,
    scanned: Vec<(RegistryName, ImageName, Digest)>,
    in_flight: usize,
    max_in_flight: usize,
}

impl FixtureState {
    fn image_mut(&mut self, registry: &RegistryName, image: &ImageName) -> &mut ImageInventory {
        self.registries
            .entry(registry.clone())
            .or_insert_with(|| RegistryInventory::new(registry.clone()))
            .images
            .entry(image.clone())
            .or_default()
    }

    fn image(&self, registry: &RegistryName, image: &ImageName) -> Option<&ImageInventory> {
        self.registries.get(registry)?.images.get(image)
    }
}

/// Shared, cloneable in-memory registry backend.
#[derive(Debug, Clone, Default)]
pub struct FixtureRegistry {
    state: Arc<Mutex<FixtureState>>,
}

impl FixtureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_spec(spec: FixtureSpec) -> Self {
        let fixture = Self::new();
        {
            let mut state = fixture.lock();
            for registry in spec.registries {
                if registry.unreachable {
                    state.unreachable.insert(registry.name.clone());
                }
                let inventory = state
                    .registries
                    .entry(registry.name.clone())
                    .or_insert_with(|| RegistryInventory::new(registry.name.clone()));
                inventory.images.extend(registry.images);
            }
            state.vulnerabilities = spec.vulnerabilities;
            state.deny_auth = spec.deny_auth;
            state.latency = Duration::from_millis(spec.latency_ms);
            for failure in spec.failures {
                state.failures.insert(
                    (failure.registry, failure.digest),
                    FailurePlan {
                        transient_left: failure.transient,
                        permanent: failure.permanent,
                    },
                );
            }
        }
        fixture
    }

    /// Load a [`FixtureSpec`] YAML file.
    pub fn load_at(path: &Path) -> Result<Self, LoadError> {
        if !path.exists() {
            return Err(LoadError::NotFound {
                path: path.to_path_buf(),
            });
        }
        let contents = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
        let spec: FixtureSpec = serde_yaml::from_str(&contents).map_err(|e| LoadError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(Self::from_spec(spec))
    }

    fn lock(&self) -> MutexGuard<'_, FixtureState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -- setup --------------------------------------------------------------

    /// Add `digest` with `tags` to `image` in `registry`.
    pub fn with_image(
        self,
        registry: &str,
        image: &str,
        digest: &str,
        tags: &[&str],
    ) -> Self {
        {
            let mut state = self.lock();
            let entry = state.image_mut(&RegistryName::from(registry), &ImageName::from(image));
            entry
                .digests
                .entry(Digest::from(digest))
                .or_default()
                .extend(tags.iter().map(|t| Tag::from(*t)));
        }
        self
    }

    /// Add a manifest list `parent` with tagless `children` to `image`.
    pub fn with_manifest_list(
        self,
        registry: &str,
        image: &str,
        parent: &str,
        tags: &[&str],
        children: &[&str],
    ) -> Self {
        let mut this = self.with_image(registry, image, parent, tags);
        for child in children {
            this = this.with_image(registry, image, child, &[]);
        }
        {
            let mut state = this.lock();
            state
                .image_mut(&RegistryName::from(registry), &ImageName::from(image))
                .children
                .entry(Digest::from(parent))
                .or_default()
                .extend(children.iter().map(|c| Digest::from(*c)));
        }
        this
    }

    pub fn with_unreachable(self, registry: &str) -> Self {
        self.lock().unreachable.insert(RegistryName::from(registry));
        self
    }

    pub fn with_auth_denied(self, registry: &str) -> Self {
        self.lock().deny_auth.insert(RegistryName::from(registry));
        self
    }

    pub fn with_transient_failures(self, registry: &str, digest: &str, times: u32) -> Self {
        self.lock().failures.insert(
            (RegistryName::from(registry), Digest::from(digest)),
            FailurePlan {
                transient_left: times,
                permanent: false,
            },
        );
        self
    }

    pub fn with_permanent_failure(self, registry: &str, digest: &str) -> Self {
        self.lock().failures.insert(
            (RegistryName::from(registry), Digest::from(digest)),
            FailurePlan {
                transient_left: 0,
                permanent: true,
            },
        );
        self
    }

    pub fn with_vulnerability(self, digest: &str, vulnerability: Vulnerability) -> Self {
        self.lock()
            .vulnerabilities
            .entry(Digest::from(digest))
            .or_default()
            .push(vulnerability);
        self
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        self.lock().latency = latency;
        self
    }

    // -- inspection ---------------------------------------------------------

    /// Current content of `registry`, if anything was ever stored there.
    pub fn inventory(&self, registry: &str) -> Option<RegistryInventory> {
        self.lock().registries.get(&RegistryName::from(registry)).cloned()
    }

    /// Edges whose transfer took effect, in completion order.
    pub fn applied(&self) -> Vec<PromotionEdge> {
        self.lock().applied.clone()
    }

    /// Number of transfer attempts made for `edge`.
    pub fn attempts(&self, edge: &PromotionEdge) -> u32 {
        self.lock().attempts.get(edge).copied().unwrap_or(0)
    }

    pub fn total_attempts(&self) -> u32 {
        self.lock().attempts.values().sum()
    }

    /// Highest number of transfers observed running at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.lock().max_in_flight
    }

    pub fn scanned(&self) -> Vec<(RegistryName, ImageName, Digest)> {
        self.lock().scanned.clone()
    }
}

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

impl InventoryReader for FixtureRegistry {
    fn read_inventory(
        &self,
        registry: &RegistryContext,
        scope: &InventoryScope,
    ) -> Result<RegistryInventory, InventoryError> {
        let state = self.lock();
        if state.unreachable.contains(&registry.name) {
            return Err(RegistryAccessError {
                registry: registry.name.clone(),
                reason: "connection refused".to_string(),
            }
            .into());
        }
        if state.deny_auth.contains(&registry.name) {
            return Err(AuthError {
                registry: registry.name.clone(),
                reason: "permission denied".to_string(),
            }
            .into());
        }
        let mut inventory = RegistryInventory::new(registry.name.clone());
        if let Some(stored) = state.registries.get(&registry.name) {
            inventory.images = stored
                .images
                .iter()
                .filter(|(name, _)| scope.includes(name))
                .map(|(name, image)| (name.clone(), image.clone()))
                .collect();
        }
        Ok(inventory)
    }
}

struct FixtureTransfer {
    state: Arc<Mutex<FixtureState>>,
    edge: PromotionEdge,
}

impl FixtureTransfer {
    fn apply(state: &mut FixtureState, edge: &PromotionEdge) -> Result<(), TransferError> {
        let key = (edge.dst_registry.name.clone(), edge.digest.clone());
        if let Some(plan) = state.failures.get_mut(&key) {
            if plan.permanent {
                return Err(TransferError::Permanent(format!(
                    "destination rejected {}",
                    edge.digest
                )));
            }
            if plan.transient_left > 0 {
                plan.transient_left -= 1;
                return Err(TransferError::Transient("429 too many requests".to_string()));
            }
        }

        let children = state
            .image(&edge.src_registry, &edge.src_image)
            .and_then(|img| img.children.get(&edge.digest))
            .cloned();

        match edge.op {
            TagOp::CopyWithTag => {
                let source_has = state
                    .image(&edge.src_registry, &edge.src_image)
                    .is_some_and(|img| img.has_digest(&edge.digest));
                if !source_has {
                    return Err(TransferError::Permanent(format!(
                        "{} not found in source",
                        edge.src_reference()
                    )));
                }
                if let Some(children) = &children {
                    let dst = state.image(&edge.dst_registry.name, &edge.dst_image);
                    if let Some(missing) = children
                        .iter()
                        .find(|c| !dst.is_some_and(|img| img.has_digest(c)))
                    {
                        return Err(TransferError::Permanent(format!(
                            "manifest list references missing child {missing}"
                        )));
                    }
                }
                let dst = state.image_mut(&edge.dst_registry.name, &edge.dst_image);
                let tags = dst.digests.entry(edge.digest.clone()).or_default();
                if let Some(tag) = &edge.tag {
                    tags.insert(tag.clone());
                }
                if let Some(children) = children {
                    dst.children.insert(edge.digest.clone(), children);
                }
            }
            TagOp::AddTag => {
                let Some(tag) = &edge.tag else {
                    return Err(TransferError::Permanent(format!(
                        "{}: add-tag edge carries no tag",
                        edge.dst_reference()
                    )));
                };
                let dst = state.image_mut(&edge.dst_registry.name, &edge.dst_image);
                let Some(tags) = dst.digests.get_mut(&edge.digest) else {
                    return Err(TransferError::Permanent(format!(
                        "{} not present at destination",
                        edge.digest
                    )));
                };
                tags.insert(tag.clone());
            }
            TagOp::VerifyParent => {
                let dst = state.image(&edge.dst_registry.name, &edge.dst_image);
                let present = |d: &Digest| dst.is_some_and(|img| img.has_digest(d));
                if !present(&edge.digest) {
                    return Err(TransferError::Permanent(format!(
                        "parent {} missing at destination",
                        edge.digest
                    )));
                }
                if let Some(missing) = children.iter().flatten().find(|c| !present(*c)) {
                    return Err(TransferError::Permanent(format!(
                        "child {missing} of {} missing at destination",
                        edge.digest
                    )));
                }
            }
        }
        Ok(())
    }
}

impl TransferOperation for FixtureTransfer {
    fn run(self: Box<Self>) -> Result<(), TransferError> {
        let latency = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            *state.attempts.entry(self.edge.clone()).or_default() += 1;
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
            state.latency
        };
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.in_flight -= 1;
        let result = FixtureTransfer::apply(&mut state, &self.edge);
        if result.is_ok() {
            state.applied.push(self.edge.clone());
        }
        result
    }
}

impl TransferFactory for FixtureRegistry {
    fn make(&self, edge: &PromotionEdge) -> Box<dyn TransferOperation> {
        Box::new(FixtureTransfer {
            state: Arc::clone(&self.state),
            edge: edge.clone(),
        })
    }
}

impl VulnerabilityScanner for FixtureRegistry {
    fn scan(
        &self,
        registry: &RegistryName,
        image: &ImageName,
        digest: &Digest,
    ) -> Result<ScanReport, ScanError> {
        let mut state = self.lock();
        if state.unreachable.contains(registry) {
            return Err(ScanError {
                image: format!("{}@{digest}", registry.join(image)),
                reason: "scanner could not reach registry".to_string(),
            });
        }
        state
            .scanned
            .push((registry.clone(), image.clone(), digest.clone()));
        Ok(ScanReport {
            vulnerabilities: state.vulnerabilities.get(digest).cloned().unwrap_or_default(),
        })
    }
}

impl CredentialActivator for FixtureRegistry {
    fn activate(
        &self,
        registries: &[RegistryContext],
        _config: &RunConfig,
    ) -> Result<(), AuthError> {
        let state = self.lock();
        match registries.iter().find(|r| state.deny_auth.contains(&r.name)) {
            Some(denied) => Err(AuthError {
                registry: denied.name.clone(),
                reason: "credential activation refused".to_string(),
            }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Severity;

    const SRC: &str = "gcr.io/staging";
    const DST: &str = "gcr.io/prod";

    fn edge(op: TagOp, digest: &str, tag: Option<&str>) -> PromotionEdge {
        PromotionEdge {
            dst_registry: RegistryContext::destination(DST),
            dst_image: ImageName::from("foo"),
            digest: Digest::from(digest),
            tag: tag.map(Tag::from),
            op,
            src_registry: RegistryName::from(SRC),
            src_image: ImageName::from("foo"),
        }
    }

    #[test]
    fn copy_then_add_tag_updates_destination() {
        let fixture = FixtureRegistry::new().with_image(SRC, "foo", "sha256:aaa", &["v1"]);
        fixture
            .make(&edge(TagOp::CopyWithTag, "sha256:aaa", Some("v1")))
            .run()
            .expect("copy");
        fixture
            .make(&edge(TagOp::AddTag, "sha256:aaa", Some("latest")))
            .run()
            .expect("retag");

        let inv = fixture.inventory(DST).expect("dst inventory");
        let image = inv.image(&ImageName::from("foo")).expect("image");
        assert!(image.has_pairing(&Digest::from("sha256:aaa"), &Tag::from("latest")));
        assert_eq!(fixture.applied().len(), 2);
    }

    #[test]
    fn transient_failures_are_consumed() {
        let fixture = FixtureRegistry::new()
            .with_image(SRC, "foo", "sha256:aaa", &[])
            .with_transient_failures(DST, "sha256:aaa", 1);
        let e = edge(TagOp::CopyWithTag, "sha256:aaa", None);
        let first = fixture.make(&e).run().unwrap_err();
        assert!(first.is_transient());
        fixture.make(&e).run().expect("second attempt succeeds");
        assert_eq!(fixture.attempts(&e), 2);
    }

    #[test]
    fn manifest_list_copy_requires_children() {
        let fixture = FixtureRegistry::new().with_manifest_list(
            SRC,
            "foo",
            "sha256:f00",
            &["v1"],
            &["sha256:c01"],
        );
        let err = fixture
            .make(&edge(TagOp::CopyWithTag, "sha256:f00", Some("v1")))
            .run()
            .unwrap_err();
        assert!(err.to_string().contains("missing child"), "got: {err}");
    }

    #[test]
    fn unreachable_registry_fails_inventory_read() {
        let fixture = FixtureRegistry::new().with_unreachable(DST);
        let err = fixture
            .read_inventory(&RegistryContext::destination(DST), &InventoryScope::Registry)
            .unwrap_err();
        assert!(matches!(err, InventoryError::Unreachable(_)));
    }

    #[test]
    fn spec_yaml_loads() {
        let yaml = r#"
registries:
  - name: gcr.io/staging
    images:
      foo:
        digests:
          "sha256:aaa": [v1]
vulnerabilities:
  "sha256:aaa":
    - id: CVE-2024-0001
      severity: high
      fix_available: true
"#;
        let spec: FixtureSpec = serde_yaml::from_str(yaml).expect("parse");
        let fixture = FixtureRegistry::from_spec(spec);
        let report = fixture
            .scan(
                &RegistryName::from(SRC),
                &ImageName::from("foo"),
                &Digest::from("sha256:aaa"),
            )
            .expect("scan");
        assert_eq!(report.vulnerabilities[0].severity, Severity::High);
    }
}

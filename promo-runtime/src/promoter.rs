//! Mode drivers.
//!
//! Every mode is a short sequence of phases; a failure in any phase is
//! returned wrapped with that phase's name (see [`RunError`]). Blocking
//! collaborators (file loading, credential activation, inventory reads) run
//! on the blocking pool.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use promo_core::{
    manifest, snapshot, CredentialActivator, FixtureRegistry, Image, ImageName, InventoryReader,
    InventoryScope, Manifest, OutputFormat, RegistryContext, RunConfig, SnapshotFilter,
    TransferFactory, VulnerabilityScanner,
};
use promo_sync::{
    compute_edges, validate_manifest_lists, EdgePlan, ManifestListFinding, SyncContext,
};

use crate::cancel::Cancellation;
use crate::error::{join_err, AggregateRunError, ManifestListError, RunError, SnapshotError};
use crate::scan::{scan_sources, ScanPolicy, ScanSummary};
use crate::scheduler::{execute, ExecutionSettings, RunReport};

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// The capability implementations a run is wired to.
#[derive(Clone)]
pub struct Backend {
    pub inventory: Arc<dyn InventoryReader>,
    pub transfers: Arc<dyn TransferFactory>,
    pub scanner: Arc<dyn VulnerabilityScanner>,
    pub credentials: Arc<dyn CredentialActivator>,
}

impl Backend {
    /// Every capability served by one in-memory registry.
    pub fn fixture(fixture: FixtureRegistry) -> Self {
        Self {
            inventory: Arc::new(fixture.clone()),
            transfers: Arc::new(fixture.clone()),
            scanner: Arc::new(fixture.clone()),
            credentials: Arc::new(fixture),
        }
    }
}

/// Where the desired state comes from.
#[derive(Debug, Clone)]
pub enum ManifestInput {
    Loaded(Vec<Manifest>),
    /// A manifest file or a thin-manifest directory.
    Path(PathBuf),
}

#[derive(Debug, Clone)]
pub struct SnapshotRequest {
    pub registry: RegistryContext,
    /// Limit the snapshot to the images these manifests name.
    pub manifests: Option<ManifestInput>,
    pub filter: SnapshotFilter,
    pub format: OutputFormat,
}

#[derive(Debug, Clone)]
pub struct ManifestListRequest {
    pub registry: RegistryContext,
    /// Snapshot file naming the images/digests to check; whole registry
    /// otherwise.
    pub snapshot: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Outputs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Promotion {
    pub plan: EdgePlan,
    /// `None` in parse-only mode.
    pub report: Option<RunReport>,
}

impl Promotion {
    pub fn into_result(self) -> Result<Promotion, RunError> {
        match &self.report {
            None if !self.plan.findings.is_empty() => Err(RunError::Edges(AggregateRunError {
                failed: 0,
                skipped: 0,
                cancelled: 0,
                findings: self.plan.findings.iter().map(ToString::to_string).collect(),
            })),
            None => Ok(self),
            Some(report) => match report.clone().into_result() {
                Ok(_) => Ok(self),
                Err(err) => Err(RunError::Promotion(err)),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct SecurityScan {
    pub plan: EdgePlan,
    pub summary: ScanSummary,
}

impl SecurityScan {
    pub fn into_result(self) -> Result<SecurityScan, RunError> {
        match self.summary.clone().into_result() {
            Ok(_) => Ok(self),
            Err(err) => Err(RunError::Scan(err)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub images: Vec<Image>,
    pub rendered: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestListCheck {
    pub registry: RegistryContext,
    pub findings: BTreeSet<ManifestListFinding>,
}

impl ManifestListCheck {
    pub fn into_result(self) -> Result<ManifestListCheck, RunError> {
        if self.findings.is_empty() {
            return Ok(self);
        }
        Err(RunError::ManifestLists(ManifestListError::Inconsistent(
            AggregateRunError {
                failed: self.findings.len(),
                skipped: 0,
                cancelled: 0,
                findings: self.findings.iter().map(ToString::to_string).collect(),
            },
        )))
    }
}

// ---------------------------------------------------------------------------
// Promoter
// ---------------------------------------------------------------------------

pub struct Promoter {
    config: RunConfig,
    backend: Backend,
    cancel: Cancellation,
}

impl Promoter {
    pub fn new(config: RunConfig, backend: Backend) -> Self {
        Self {
            config,
            backend,
            cancel: Cancellation::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: Cancellation) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation(&self) -> &Cancellation {
        &self.cancel
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Compute edges and execute them (dry-run unless confirmed).
    pub async fn promote(&self, input: ManifestInput) -> Result<Promotion, RunError> {
        let plan = self.plan(input).await?;
        if self.config.parse_only {
            tracing::info!(edges = plan.len(), "parse-only: skipping execution");
            return Ok(Promotion { plan, report: None });
        }
        let settings = ExecutionSettings::from_config(&self.config);
        let report = execute(
            &plan,
            Arc::clone(&self.backend.transfers),
            &settings,
            &self.cancel,
        )
        .await;
        Ok(Promotion {
            plan,
            report: Some(report),
        })
    }

    /// Compute edges, then scan each edge's source image.
    pub async fn security_scan(&self, input: ManifestInput) -> Result<SecurityScan, RunError> {
        let plan = self.plan(input).await?;
        let policy = ScanPolicy {
            threshold: self.config.severity_threshold,
            fixable_only: self.config.fixable_only,
        };
        let summary = scan_sources(
            &plan,
            Arc::clone(&self.backend.scanner),
            policy,
            self.config.threads,
            &self.cancel,
        )
        .await;
        Ok(SecurityScan { plan, summary })
    }

    /// Read one registry's inventory and render it.
    pub async fn snapshot(&self, request: SnapshotRequest) -> Result<Snapshot, RunError> {
        self.config.validate()?;
        self.activate(vec![request.registry.clone()]).await?;

        let scope = match request.manifests {
            None => InventoryScope::Registry,
            Some(input) => {
                let manifests = load_manifests(input)
                    .await?
                    .map_err(RunError::SnapshotManifests)?;
                let names: BTreeSet<ImageName> = manifests
                    .iter()
                    .flat_map(|m| m.images.iter().map(|i| i.name.clone()))
                    .collect();
                InventoryScope::Images(names)
            }
        };

        let reader = Arc::clone(&self.backend.inventory);
        let registry = request.registry.clone();
        let inventory =
            tokio::task::spawn_blocking(move || reader.read_inventory(&registry, &scope))
                .await
                .map_err(|e| join_err("inventory", e))?
                .map_err(|e| RunError::Snapshot(SnapshotError::Inventory(e)))?;

        let images = snapshot::images_from_inventory(&inventory, &request.filter);
        let rendered = snapshot::render(&images, request.format)
            .map_err(|e| RunError::Snapshot(SnapshotError::Render(e)))?;
        tracing::info!(
            registry = %request.registry.name,
            images = images.len(),
            "snapshot generated"
        );
        Ok(Snapshot { images, rendered })
    }

    /// Check every manifest list in a registry (or those a snapshot names)
    /// for missing children.
    pub async fn check_manifest_lists(
        &self,
        request: ManifestListRequest,
    ) -> Result<ManifestListCheck, RunError> {
        self.config.validate()?;
        self.activate(vec![request.registry.clone()]).await?;

        let only = match request.snapshot {
            None => None,
            Some(path) => Some(
                tokio::task::spawn_blocking(move || snapshot::load_at(&path))
                    .await
                    .map_err(|e| join_err("snapshot", e))?
                    .map_err(|e| RunError::ManifestLists(ManifestListError::Snapshot(e)))?,
            ),
        };
        let scope = match &only {
            None => InventoryScope::Registry,
            Some(images) => InventoryScope::Images(images.iter().map(|i| i.name.clone()).collect()),
        };

        let reader = Arc::clone(&self.backend.inventory);
        let registry = request.registry.clone();
        let inventory =
            tokio::task::spawn_blocking(move || reader.read_inventory(&registry, &scope))
                .await
                .map_err(|e| join_err("inventory", e))?
                .map_err(|e| RunError::ManifestLists(ManifestListError::Inventory(e)))?;

        let findings = validate_manifest_lists(&inventory, only.as_deref());
        tracing::info!(
            registry = %request.registry.name,
            findings = findings.len(),
            "manifest lists checked"
        );
        Ok(ManifestListCheck {
            registry: request.registry,
            findings,
        })
    }

    /// Shared first half of promote and scan: validate options, parse
    /// manifests, activate credentials, build the sync context, compute edges.
    async fn plan(&self, input: ManifestInput) -> Result<EdgePlan, RunError> {
        self.config.validate()?;

        let manifests = load_manifests(input).await?.map_err(RunError::Manifests)?;
        tracing::info!(manifests = manifests.len(), "manifests parsed");

        let registries: Vec<RegistryContext> = manifests
            .iter()
            .flat_map(|m| m.registries.iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        self.activate(registries).await?;

        let reader = Arc::clone(&self.backend.inventory);
        let config = self.config.clone();
        let ctx = tokio::task::spawn_blocking(move || {
            SyncContext::build(config, manifests, reader.as_ref())
        })
        .await
        .map_err(|e| join_err("sync context", e))??;

        let plan = compute_edges(&ctx);
        tracing::info!(
            edges = plan.len(),
            findings = plan.findings.len(),
            "promotion edges computed"
        );
        Ok(plan)
    }

    async fn activate(&self, registries: Vec<RegistryContext>) -> Result<(), RunError> {
        let credentials = Arc::clone(&self.backend.credentials);
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || credentials.activate(&registries, &config))
            .await
            .map_err(|e| join_err("credentials", e))??;
        Ok(())
    }
}

/// Outer error: the loader task died. Inner: the load itself failed, left to
/// the caller to attach the right phase.
async fn load_manifests(
    input: ManifestInput,
) -> Result<Result<Vec<Manifest>, promo_core::LoadError>, RunError> {
    match input {
        ManifestInput::Loaded(manifests) => Ok(Ok(manifests)),
        ManifestInput::Path(path) => {
            tokio::task::spawn_blocking(move || manifest::load_any_at(&path))
                .await
                .map_err(|e| join_err("manifest loader", e))
        }
    }
}

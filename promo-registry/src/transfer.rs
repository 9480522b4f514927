//! Edge execution against live registries.

use std::sync::Arc;

use promo_core::{PromotionEdge, TagOp, TransferError, TransferFactory, TransferOperation};

use crate::client::{MountOutcome, RegistryClient};
use crate::error::RegistryError;
use crate::pool::RegistryPool;

/// How blobs reach the destination during a copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// Pull every missing blob from the source and push it to the
    /// destination. Each side only needs its own credentials.
    PullPush,
    /// Ask the destination registry to mount blobs straight from the source
    /// repository, so they never pass through this process. The destination
    /// identity must be able to read the source, which a service account
    /// covering both sides can. Registries only mount within one host; other
    /// copies still stream.
    Direct,
}

impl TransferMode {
    /// Direct copies need one identity on both sides.
    pub fn for_credentials(use_service_account: bool) -> Self {
        if use_service_account {
            TransferMode::Direct
        } else {
            TransferMode::PullPush
        }
    }
}

/// [`TransferFactory`] over the shared client pool.
pub struct NetworkTransfers {
    pool: Arc<RegistryPool>,
    mode: TransferMode,
}

impl NetworkTransfers {
    pub fn new(pool: Arc<RegistryPool>, mode: TransferMode) -> Self {
        Self { pool, mode }
    }
}

impl TransferFactory for NetworkTransfers {
    fn make(&self, edge: &PromotionEdge) -> Box<dyn TransferOperation> {
        Box::new(NetworkTransfer {
            pool: self.pool.clone(),
            mode: self.mode,
            edge: edge.clone(),
        })
    }
}

struct NetworkTransfer {
    pool: Arc<RegistryPool>,
    mode: TransferMode,
    edge: PromotionEdge,
}

/// Client and repository path on one side of an edge.
struct Side {
    client: Arc<RegistryClient>,
    host: String,
    repository: String,
}

impl NetworkTransfer {
    fn source(&self) -> Side {
        let (client, endpoint) = self.pool.client(&self.edge.src_registry);
        Side {
            repository: endpoint.repository(&self.edge.src_image),
            host: endpoint.host,
            client,
        }
    }

    fn destination(&self) -> Side {
        let (client, endpoint) = self.pool.client(&self.edge.dst_registry.name);
        Side {
            repository: endpoint.repository(&self.edge.dst_image),
            host: endpoint.host,
            client,
        }
    }

    /// Copy the manifest (and for image manifests, every missing blob), then
    /// publish it under the tag, or under its digest when tagless. List
    /// children arrive through their own edges first.
    fn copy_with_tag(&self) -> Result<(), RegistryError> {
        let src = self.source();
        let dst = self.destination();
        let digest = self.edge.digest.as_str();

        let doc = src.client.get_manifest(&src.repository, digest)?;
        for blob in &doc.blobs {
            if dst.client.blob_exists(&dst.repository, blob)? {
                continue;
            }
            let mountable = self.mode == TransferMode::Direct && src.host == dst.host;
            let session = if mountable {
                match dst.client.mount_blob(&dst.repository, blob, &src.repository)? {
                    MountOutcome::Mounted => continue,
                    MountOutcome::Upload(location) => Some(location),
                }
            } else {
                None
            };
            let bytes = src.client.get_blob(&src.repository, blob)?;
            dst.client
                .push_blob(&dst.repository, blob, &bytes, session)?;
            tracing::debug!(blob = %blob, size = bytes.len(), "blob copied");
        }

        let reference = self
            .edge
            .tag
            .as_ref()
            .map(|t| t.as_str())
            .unwrap_or(digest);
        dst.client.put_manifest(&dst.repository, reference, &doc)
    }

    /// The digest is already at the destination; point the tag at it.
    fn add_tag(&self) -> Result<(), TransferError> {
        let Some(tag) = &self.edge.tag else {
            return Err(TransferError::Permanent(format!(
                "{}: add-tag edge carries no tag",
                self.edge.dst_reference()
            )));
        };
        let dst = self.destination();
        let doc = dst
            .client
            .get_manifest(&dst.repository, self.edge.digest.as_str())?;
        dst.client.put_manifest(&dst.repository, tag.as_str(), &doc)?;
        Ok(())
    }

    /// The parent list and every child it references resolve at the
    /// destination.
    fn verify_parent(&self) -> Result<(), TransferError> {
        let dst = self.destination();
        let doc = dst
            .client
            .get_manifest(&dst.repository, self.edge.digest.as_str())
            .map_err(|err| {
                if err.is_not_found() {
                    TransferError::Permanent(format!(
                        "manifest list {} missing at destination",
                        self.edge.dst_reference()
                    ))
                } else {
                    err.into()
                }
            })?;
        for child in &doc.children {
            if dst.client.manifest_digest(&dst.repository, child)?.is_none() {
                return Err(TransferError::Permanent(format!(
                    "{} references {child}, which is missing",
                    self.edge.dst_reference()
                )));
            }
        }
        Ok(())
    }
}

impl TransferOperation for NetworkTransfer {
    fn run(self: Box<Self>) -> Result<(), TransferError> {
        match self.edge.op {
            TagOp::CopyWithTag => self.copy_with_tag()?,
            TagOp::AddTag => self.add_tag()?,
            TagOp::VerifyParent => self.verify_parent()?,
        }
        Ok(())
    }
}

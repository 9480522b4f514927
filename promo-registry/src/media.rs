//! Manifest media types and the parts of a manifest document promotion needs.

use serde::Deserialize;
use sha2::{Digest as _, Sha256};

use crate::error::RegistryError;

pub const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";

/// Lists first so multi-arch parents are returned as lists.
pub const MANIFEST_ACCEPT: &str = "application/vnd.docker.distribution.manifest.list.v2+json, \
     application/vnd.oci.image.index.v1+json, \
     application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.oci.image.manifest.v1+json";

#[derive(Debug, Deserialize)]
struct Descriptor {
    digest: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawManifest {
    #[serde(default)]
    media_type: Option<String>,
    #[serde(default)]
    manifests: Option<Vec<Descriptor>>,
    #[serde(default)]
    config: Option<Descriptor>,
    #[serde(default)]
    layers: Vec<Descriptor>,
}

/// A fetched manifest: raw bytes (pushed back verbatim so the digest is
/// preserved) plus the references promotion has to satisfy first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestDoc {
    pub bytes: Vec<u8>,
    pub media_type: String,
    /// Non-empty for manifest lists / image indexes.
    pub children: Vec<String>,
    /// Config and layer digests for image manifests.
    pub blobs: Vec<String>,
}

impl ManifestDoc {
    pub fn parse(bytes: Vec<u8>, header_media_type: Option<&str>) -> Result<Self, String> {
        let raw: RawManifest = serde_json::from_slice(&bytes).map_err(|e| e.to_string())?;
        let media_type = raw
            .media_type
            .or_else(|| header_media_type.map(str::to_string))
            .unwrap_or_else(|| {
                if raw.manifests.is_some() {
                    OCI_INDEX.to_string()
                } else {
                    OCI_MANIFEST.to_string()
                }
            });
        let children = raw
            .manifests
            .unwrap_or_default()
            .into_iter()
            .map(|d| d.digest)
            .collect();
        let blobs = raw
            .config
            .into_iter()
            .chain(raw.layers)
            .map(|d| d.digest)
            .collect();
        Ok(Self {
            bytes,
            media_type,
            children,
            blobs,
        })
    }

    pub fn is_list(&self) -> bool {
        self.media_type == DOCKER_MANIFEST_LIST || self.media_type == OCI_INDEX
    }

    pub fn digest(&self) -> String {
        sha256_digest(&self.bytes)
    }
}

pub fn sha256_digest(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}

/// Check `bytes` against `expected`. Only sha256 can be verified locally;
/// other algorithms are trusted.
pub fn verify_digest(expected: &str, bytes: &[u8]) -> Result<(), RegistryError> {
    if !expected.starts_with("sha256:") {
        return Ok(());
    }
    let actual = sha256_digest(bytes);
    if actual != expected {
        return Err(RegistryError::DigestMismatch {
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

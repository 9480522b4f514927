//! Blocking OCI Distribution client over a shared `ureq::Agent`.
//!
//! One client talks to one registry host. Repositories are passed per call
//! as full repository paths (namespace included), see
//! [`RegistryEndpoint::repository`](crate::reference::RegistryEndpoint::repository).
//!
//! Authentication is either a static bearer token handed in at construction
//! or, without one, the anonymous token exchange advertised by the
//! registry's `WWW-Authenticate` challenge. Anonymous tokens are cached per
//! repository.

use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::sync::Mutex;
use std::time::Duration;

use serde::Deserialize;

use crate::challenge::{BearerChallenge, TokenResponse};
use crate::error::RegistryError;
use crate::media::{verify_digest, ManifestDoc, MANIFEST_ACCEPT};
use crate::reference::next_link;

const MAX_MANIFEST_BYTES: u64 = 4 * 1024 * 1024;
const MAX_BLOB_BYTES: u64 = 16 * 1024 * 1024 * 1024;
const MAX_ERROR_BODY: usize = 512;
const PAGE_SIZE: usize = 1000;

#[derive(Debug, Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Option<Vec<String>>,
    #[serde(default)]
    manifest: BTreeMap<String, ManifestInfo>,
}

/// Per-digest entry of the `manifest` extension GCR and Artifact Registry
/// add to `tags/list`. It also covers untagged digests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ManifestInfo {
    #[serde(default, rename = "tag")]
    pub tags: Vec<String>,
    #[serde(default, rename = "mediaType")]
    pub media_type: Option<String>,
}

/// One repository's tag listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagListing {
    pub tags: Vec<String>,
    /// Empty unless the registry speaks the digest-map extension.
    pub manifests: BTreeMap<String, ManifestInfo>,
}

#[derive(Debug, Deserialize)]
struct Catalog {
    #[serde(default)]
    repositories: Vec<String>,
}

struct Body<'a> {
    content_type: &'a str,
    bytes: &'a [u8],
}

struct Call<'a> {
    method: &'static str,
    url: String,
    repository: &'a str,
    accept: Option<&'a str>,
    body: Option<Body<'a>>,
}

impl<'a> Call<'a> {
    fn new(method: &'static str, url: String, repository: &'a str) -> Self {
        Self {
            method,
            url,
            repository,
            accept: None,
            body: None,
        }
    }

    fn accept(mut self, accept: &'a str) -> Self {
        self.accept = Some(accept);
        self
    }

    fn body(mut self, content_type: &'a str, bytes: &'a [u8]) -> Self {
        self.body = Some(Body {
            content_type,
            bytes,
        });
        self
    }
}

/// Outcome of a cross-repository mount request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountOutcome {
    Mounted,
    /// The registry declined and opened a regular upload session instead.
    Upload(String),
}

pub struct RegistryClient {
    agent: ureq::Agent,
    base_url: String,
    static_token: Option<String>,
    anonymous: Mutex<HashMap<String, String>>,
}

impl std::fmt::Debug for RegistryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryClient")
            .field("base_url", &self.base_url)
            .field("authenticated", &self.static_token.is_some())
            .finish()
    }
}

impl RegistryClient {
    pub fn new(base_url: impl Into<String>, token: Option<String>, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(10))
            .timeout(timeout)
            .user_agent(concat!("promoter/", env!("CARGO_PKG_VERSION")))
            .build();
        Self {
            agent,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            static_token: token,
            anonymous: Mutex::new(HashMap::new()),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    // -----------------------------------------------------------------------
    // Listing
    // -----------------------------------------------------------------------

    /// Every tag of `repository`, following `Link` pagination. `None` when
    /// the repository does not exist.
    pub fn list_tags(&self, repository: &str) -> Result<Option<TagListing>, RegistryError> {
        let mut url = format!("{}/v2/{repository}/tags/list?n={PAGE_SIZE}", self.base_url);
        let mut listing = TagListing::default();
        loop {
            let response = match self.send(&Call::new("GET", url.clone(), repository)) {
                Ok(response) => response,
                Err(err) if err.is_not_found() => return Ok(None),
                Err(err) => return Err(err),
            };
            let next = response.header("Link").and_then(next_link);
            let page: TagList = decode_json(&url, response)?;
            listing.tags.extend(page.tags.unwrap_or_default());
            listing.manifests.extend(page.manifest);
            match next {
                Some(link) => url = self.resolve(&link),
                None => return Ok(Some(listing)),
            }
        }
    }

    /// Every repository on the host via `_catalog`.
    pub fn catalog(&self) -> Result<Vec<String>, RegistryError> {
        let mut url = format!("{}/v2/_catalog?n={PAGE_SIZE}", self.base_url);
        let mut repositories = Vec::new();
        loop {
            let response = self.send(&Call::new("GET", url.clone(), ""))?;
            let next = response.header("Link").and_then(next_link);
            let page: Catalog = decode_json(&url, response)?;
            repositories.extend(page.repositories);
            match next {
                Some(link) => url = self.resolve(&link),
                None => return Ok(repositories),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Manifests
    // -----------------------------------------------------------------------

    /// Fetch a manifest by tag or digest. Digest references are verified
    /// against the returned bytes.
    pub fn get_manifest(
        &self,
        repository: &str,
        reference: &str,
    ) -> Result<ManifestDoc, RegistryError> {
        let url = format!("{}/v2/{repository}/manifests/{reference}", self.base_url);
        let response = self.send(&Call::new("GET", url.clone(), repository).accept(MANIFEST_ACCEPT))?;
        let content_type = response
            .header("Content-Type")
            .map(|ct| ct.split(';').next().unwrap_or(ct).trim().to_string());
        let bytes = read_body(&url, response, MAX_MANIFEST_BYTES)?;
        if reference.contains(':') {
            verify_digest(reference, &bytes)?;
        }
        ManifestDoc::parse(bytes, content_type.as_deref())
            .map_err(|reason| RegistryError::Decode { url, reason })
    }

    /// Digest a tag or digest reference resolves to, `None` if absent.
    pub fn manifest_digest(
        &self,
        repository: &str,
        reference: &str,
    ) -> Result<Option<String>, RegistryError> {
        let url = format!("{}/v2/{repository}/manifests/{reference}", self.base_url);
        let response = match self.send(&Call::new("HEAD", url, repository).accept(MANIFEST_ACCEPT)) {
            Ok(response) => response,
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err),
        };
        if let Some(digest) = response.header("Docker-Content-Digest") {
            return Ok(Some(digest.to_string()));
        }
        // Some registries omit the header on HEAD.
        Ok(Some(self.get_manifest(repository, reference)?.digest()))
    }

    pub fn put_manifest(
        &self,
        repository: &str,
        reference: &str,
        manifest: &ManifestDoc,
    ) -> Result<(), RegistryError> {
        let url = format!("{}/v2/{repository}/manifests/{reference}", self.base_url);
        self.send(
            &Call::new("PUT", url, repository).body(&manifest.media_type, &manifest.bytes),
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Blobs
    // -----------------------------------------------------------------------

    pub fn blob_exists(&self, repository: &str, digest: &str) -> Result<bool, RegistryError> {
        let url = format!("{}/v2/{repository}/blobs/{digest}", self.base_url);
        match self.send(&Call::new("HEAD", url, repository)) {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub fn get_blob(&self, repository: &str, digest: &str) -> Result<Vec<u8>, RegistryError> {
        let url = format!("{}/v2/{repository}/blobs/{digest}", self.base_url);
        let response = self.send(&Call::new("GET", url.clone(), repository))?;
        let bytes = read_body(&url, response, MAX_BLOB_BYTES)?;
        verify_digest(digest, &bytes)?;
        Ok(bytes)
    }

    /// Ask the registry to link `digest` from `from_repository` on the same
    /// host without moving content.
    pub fn mount_blob(
        &self,
        repository: &str,
        digest: &str,
        from_repository: &str,
    ) -> Result<MountOutcome, RegistryError> {
        let url = format!(
            "{}/v2/{repository}/blobs/uploads/?mount={digest}&from={from_repository}",
            self.base_url
        );
        let response = self.send(&Call::new("POST", url.clone(), repository))?;
        if response.status() == 201 {
            return Ok(MountOutcome::Mounted);
        }
        upload_location(&url, &response).map(|location| MountOutcome::Upload(self.resolve(&location)))
    }

    /// Monolithic upload: open a session (unless one is supplied) and PUT
    /// the whole blob.
    pub fn push_blob(
        &self,
        repository: &str,
        digest: &str,
        bytes: &[u8],
        session: Option<String>,
    ) -> Result<(), RegistryError> {
        let location = match session {
            Some(location) => location,
            None => {
                let url = format!("{}/v2/{repository}/blobs/uploads/", self.base_url);
                let response = self.send(&Call::new("POST", url.clone(), repository))?;
                self.resolve(&upload_location(&url, &response)?)
            }
        };
        let separator = if location.contains('?') { '&' } else { '?' };
        let url = format!("{location}{separator}digest={digest}");
        self.send(&Call::new("PUT", url, repository).body("application/octet-stream", bytes))?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Transport
    // -----------------------------------------------------------------------

    fn resolve(&self, location: &str) -> String {
        if location.starts_with("http://") || location.starts_with("https://") {
            location.to_string()
        } else {
            format!("{}{location}", self.base_url)
        }
    }

    fn send(&self, call: &Call<'_>) -> Result<ureq::Response, RegistryError> {
        let token = self.token_for(call.repository);
        match self.send_once(call, token.as_deref()) {
            Err(ureq::Error::Status(401, response)) if self.static_token.is_none() => {
                let Some(challenge) = response
                    .header("WWW-Authenticate")
                    .and_then(BearerChallenge::parse)
                else {
                    return Err(classify(&call.url, ureq::Error::Status(401, response)));
                };
                let token = self.exchange(&challenge, call.repository)?;
                self.anonymous
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .insert(call.repository.to_string(), token.clone());
                self.send_once(call, Some(&token))
                    .map_err(|err| classify(&call.url, err))
            }
            other => other.map_err(|err| classify(&call.url, err)),
        }
    }

    fn send_once(
        &self,
        call: &Call<'_>,
        token: Option<&str>,
    ) -> Result<ureq::Response, ureq::Error> {
        tracing::trace!(method = call.method, url = %call.url, "registry request");
        let mut request = self.agent.request(call.method, &call.url);
        if let Some(accept) = call.accept {
            request = request.set("Accept", accept);
        }
        if let Some(token) = token {
            request = request.set("Authorization", &format!("Bearer {token}"));
        }
        match &call.body {
            Some(body) => request
                .set("Content-Type", body.content_type)
                .send_bytes(body.bytes),
            None => request.call(),
        }
    }

    fn token_for(&self, repository: &str) -> Option<String> {
        if let Some(token) = &self.static_token {
            return Some(token.clone());
        }
        self.anonymous
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(repository)
            .cloned()
    }

    fn exchange(
        &self,
        challenge: &BearerChallenge,
        repository: &str,
    ) -> Result<String, RegistryError> {
        let scope = challenge
            .scope
            .clone()
            .unwrap_or_else(|| format!("repository:{repository}:pull,push"));
        let mut request = self.agent.get(&challenge.realm).query("scope", &scope);
        if let Some(service) = &challenge.service {
            request = request.query("service", service);
        }
        tracing::debug!(realm = %challenge.realm, scope = %scope, "fetching registry token");
        let response = request
            .call()
            .map_err(|err| classify(&challenge.realm, err))?;
        let body: TokenResponse = decode_json(&challenge.realm, response)?;
        body.into_token().ok_or_else(|| RegistryError::Decode {
            url: challenge.realm.clone(),
            reason: "token response carries neither `token` nor `access_token`".to_string(),
        })
    }
}

fn classify(url: &str, err: ureq::Error) -> RegistryError {
    match err {
        ureq::Error::Status(status, response) => {
            let mut body = response.into_string().unwrap_or_default();
            if body.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            RegistryError::Status {
                url: url.to_string(),
                status,
                body: body.trim().to_string(),
            }
        }
        ureq::Error::Transport(transport) => RegistryError::Transport {
            url: url.to_string(),
            reason: transport.to_string(),
        },
    }
}

fn read_body(url: &str, response: ureq::Response, limit: u64) -> Result<Vec<u8>, RegistryError> {
    let mut bytes = Vec::new();
    response
        .into_reader()
        .take(limit)
        .read_to_end(&mut bytes)
        .map_err(|e| RegistryError::Transport {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
    Ok(bytes)
}

fn decode_json<T: serde::de::DeserializeOwned>(
    url: &str,
    response: ureq::Response,
) -> Result<T, RegistryError> {
    let bytes = read_body(url, response, MAX_MANIFEST_BYTES)?;
    serde_json::from_slice(&bytes).map_err(|e| RegistryError::Decode {
        url: url.to_string(),
        reason: e.to_string(),
    })
}

fn upload_location(url: &str, response: &ureq::Response) -> Result<String, RegistryError> {
    response
        .header("Location")
        .map(str::to_string)
        .ok_or_else(|| RegistryError::Decode {
            url: url.to_string(),
            reason: "upload session without Location header".to_string(),
        })
}

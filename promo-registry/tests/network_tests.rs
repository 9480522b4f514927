//! End-to-end checks of the network backend against a minimal in-process
//! Distribution registry.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde_json::json;

use promo_core::{
    Digest, ImageName, InventoryReader, InventoryScope, PromotionEdge, RegistryContext,
    RegistryName, Tag, TagOp, TransferFactory,
};
use promo_registry::media::{sha256_digest, ManifestDoc, DOCKER_MANIFEST, DOCKER_MANIFEST_LIST};
use promo_registry::{NetworkInventory, NetworkTransfers, RegistryPool, TransferMode};

// ---------------------------------------------------------------------------
// Mock registry
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Repo {
    manifests: HashMap<String, (String, Vec<u8>)>,
    tags: BTreeMap<String, String>,
    blobs: HashMap<String, Vec<u8>>,
}

#[derive(Default)]
struct State {
    repos: BTreeMap<String, Repo>,
    uploads: usize,
    mounts: usize,
    token_requests: usize,
    require_token: bool,
}

struct Reply {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Reply {
    fn status(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    fn json(value: serde_json::Value) -> Self {
        Self {
            body: serde_json::to_vec(&value).expect("json"),
            ..Self::status(200)
        }
        .header("Content-Type", "application/json")
    }

    fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }
}

struct MockRegistry {
    addr: SocketAddr,
    state: Arc<Mutex<State>>,
}

impl MockRegistry {
    fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let state = Arc::new(Mutex::new(State::default()));
        let shared = state.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { continue };
                let state = shared.clone();
                thread::spawn(move || serve(stream, addr, &state));
            }
        });
        Self { addr, state }
    }

    fn registry(&self, namespace: &str) -> String {
        format!("127.0.0.1:{}/{namespace}", self.addr.port())
    }

    fn put_blob(&self, repo: &str, bytes: &[u8]) -> String {
        let digest = sha256_digest(bytes);
        let mut state = self.state.lock().expect("state");
        state
            .repos
            .entry(repo.to_string())
            .or_default()
            .blobs
            .insert(digest.clone(), bytes.to_vec());
        digest
    }

    fn put_manifest(&self, repo: &str, tag: Option<&str>, media_type: &str, bytes: Vec<u8>) -> String {
        let digest = sha256_digest(&bytes);
        let mut state = self.state.lock().expect("state");
        let repo = state.repos.entry(repo.to_string()).or_default();
        repo.manifests
            .insert(digest.clone(), (media_type.to_string(), bytes));
        if let Some(tag) = tag {
            repo.tags.insert(tag.to_string(), digest.clone());
        }
        digest
    }

    fn tag(&self, repo: &str, tag: &str) -> Option<String> {
        let state = self.state.lock().expect("state");
        state.repos.get(repo)?.tags.get(tag).cloned()
    }

    fn has_blob(&self, repo: &str, digest: &str) -> bool {
        let state = self.state.lock().expect("state");
        state
            .repos
            .get(repo)
            .is_some_and(|r| r.blobs.contains_key(digest))
    }

    fn counters(&self) -> (usize, usize, usize) {
        let state = self.state.lock().expect("state");
        (state.uploads, state.mounts, state.token_requests)
    }

    fn require_token(&self) {
        self.state.lock().expect("state").require_token = true;
    }
}

fn serve(stream: TcpStream, addr: SocketAddr, state: &Mutex<State>) {
    let Ok(read_half) = stream.try_clone() else {
        return;
    };
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    if reader.read_line(&mut line).is_err() {
        return;
    }
    let mut parts = line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let target = parts.next().unwrap_or_default().to_string();

    let mut headers = HashMap::new();
    loop {
        let mut header = String::new();
        if reader.read_line(&mut header).unwrap_or(0) == 0 {
            break;
        }
        let header = header.trim_end();
        if header.is_empty() {
            break;
        }
        if let Some((name, value)) = header.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
    let length: usize = headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let mut body = vec![0; length];
    if reader.read_exact(&mut body).is_err() {
        return;
    }

    let (path, query) = target.split_once('?').unwrap_or((target.as_str(), ""));
    let query: HashMap<&str, &str> = query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .collect();

    let reply = {
        let mut state = state.lock().expect("state");
        handle(&mut state, addr, &method, path, &query, &headers, body)
    };

    let reason = match reply.status {
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        400 => "Bad Request",
        401 => "Unauthorized",
        404 => "Not Found",
        _ => "Status",
    };
    let body: &[u8] = if method == "HEAD" { &[] } else { &reply.body };
    let mut out = format!(
        "HTTP/1.1 {} {reason}\r\nContent-Length: {}\r\nConnection: close\r\n",
        reply.status,
        body.len()
    );
    for (name, value) in &reply.headers {
        out.push_str(&format!("{name}: {value}\r\n"));
    }
    out.push_str("\r\n");
    let mut stream = stream;
    let _ = stream.write_all(out.as_bytes());
    let _ = stream.write_all(body);
    let _ = stream.flush();
}

fn handle(
    state: &mut State,
    addr: SocketAddr,
    method: &str,
    path: &str,
    query: &HashMap<&str, &str>,
    headers: &HashMap<String, String>,
    body: Vec<u8>,
) -> Reply {
    if path == "/token" {
        state.token_requests += 1;
        return Reply::json(json!({ "token": "anon" }));
    }
    if state.require_token && headers.get("authorization").map(String::as_str) != Some("Bearer anon")
    {
        return Reply::status(401).header(
            "WWW-Authenticate",
            format!(r#"Bearer realm="http://{addr}/token",service="mock""#),
        );
    }

    if let Some(rest) = path.strip_prefix("/upload/") {
        let Some((repo, _session)) = rest.rsplit_once('/') else {
            return Reply::status(404);
        };
        let digest = query.get("digest").copied().unwrap_or_default();
        if sha256_digest(&body) != digest {
            return Reply::status(400);
        }
        state
            .repos
            .entry(repo.to_string())
            .or_default()
            .blobs
            .insert(digest.to_string(), body);
        return Reply::status(201);
    }

    if path == "/v2/_catalog" {
        let repositories: Vec<&String> = state.repos.keys().collect();
        return Reply::json(json!({ "repositories": repositories }));
    }

    let Some(rest) = path.strip_prefix("/v2/") else {
        return Reply::status(404);
    };

    if let Some(repo) = rest.strip_suffix("/tags/list") {
        return match state.repos.get(repo) {
            Some(r) => Reply::json(json!({ "name": repo, "tags": r.tags.keys().collect::<Vec<_>>() })),
            None => Reply::status(404),
        };
    }

    if let Some(repo) = rest.strip_suffix("/blobs/uploads/") {
        if let (Some(digest), Some(from)) = (query.get("mount"), query.get("from")) {
            let source = state.repos.get(*from).and_then(|r| r.blobs.get(*digest)).cloned();
            if let Some(bytes) = source {
                state.mounts += 1;
                state
                    .repos
                    .entry(repo.to_string())
                    .or_default()
                    .blobs
                    .insert(digest.to_string(), bytes);
                return Reply::status(201);
            }
        }
        state.uploads += 1;
        return Reply::status(202).header("Location", format!("/upload/{repo}/{}", state.uploads));
    }

    if let Some((repo, reference)) = rest.split_once("/manifests/") {
        return manifest(state, method, repo, reference, headers, body);
    }

    if let Some((repo, digest)) = rest.split_once("/blobs/") {
        return match state.repos.get(repo).and_then(|r| r.blobs.get(digest)) {
            Some(bytes) => Reply {
                body: bytes.clone(),
                ..Reply::status(200)
            },
            None => Reply::status(404),
        };
    }

    Reply::status(404)
}

fn manifest(
    state: &mut State,
    method: &str,
    repo: &str,
    reference: &str,
    headers: &HashMap<String, String>,
    body: Vec<u8>,
) -> Reply {
    if method == "PUT" {
        let media_type = headers.get("content-type").cloned().unwrap_or_default();
        let Ok(doc) = ManifestDoc::parse(body.clone(), Some(&media_type)) else {
            return Reply::status(400);
        };
        let target = state.repos.entry(repo.to_string()).or_default();
        let complete = doc.blobs.iter().all(|b| target.blobs.contains_key(b))
            && doc.children.iter().all(|c| target.manifests.contains_key(c));
        if !complete {
            return Reply::status(400);
        }
        let digest = sha256_digest(&body);
        target.manifests.insert(digest.clone(), (media_type, body));
        if !reference.contains(':') {
            target.tags.insert(reference.to_string(), digest.clone());
        }
        return Reply::status(201).header("Docker-Content-Digest", digest);
    }

    let Some(r) = state.repos.get(repo) else {
        return Reply::status(404);
    };
    let digest = match r.tags.get(reference) {
        Some(digest) => digest.clone(),
        None => reference.to_string(),
    };
    match r.manifests.get(&digest) {
        Some((media_type, bytes)) => Reply {
            body: bytes.clone(),
            ..Reply::status(200)
        }
        .header("Content-Type", media_type.clone())
        .header("Docker-Content-Digest", digest),
        None => Reply::status(404),
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn image_manifest(config: &str, layer: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "schemaVersion": 2,
        "mediaType": DOCKER_MANIFEST,
        "config": {"mediaType": "application/vnd.docker.container.image.v1+json", "size": 0, "digest": config},
        "layers": [{"mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip", "size": 0, "digest": layer}],
    }))
    .expect("json")
}

fn list_manifest(children: &[&str]) -> Vec<u8> {
    let manifests: Vec<_> = children
        .iter()
        .map(|d| json!({"mediaType": DOCKER_MANIFEST, "size": 0, "digest": d}))
        .collect();
    serde_json::to_vec(&json!({
        "schemaVersion": 2,
        "mediaType": DOCKER_MANIFEST_LIST,
        "manifests": manifests,
    }))
    .expect("json")
}

/// Config + layer + manifest for one image; returns the manifest digest.
fn seed_image(registry: &MockRegistry, repo: &str, seed: &str, tag: Option<&str>) -> String {
    let config = registry.put_blob(repo, format!("config-{seed}").as_bytes());
    let layer = registry.put_blob(repo, format!("layer-{seed}").as_bytes());
    registry.put_manifest(repo, tag, DOCKER_MANIFEST, image_manifest(&config, &layer))
}

fn edge(src: &str, dst: &str, digest: &str, tag: Option<&str>, op: TagOp) -> PromotionEdge {
    PromotionEdge {
        dst_registry: RegistryContext::destination(dst),
        dst_image: ImageName::from("foo"),
        digest: Digest::from(digest),
        tag: tag.map(Tag::from),
        op,
        src_registry: RegistryName::from(src),
        src_image: ImageName::from("foo"),
    }
}

fn pool() -> Arc<RegistryPool> {
    Arc::new(RegistryPool::new(Duration::from_secs(5)))
}

// ---------------------------------------------------------------------------
// Inventory
// ---------------------------------------------------------------------------

#[test]
fn inventory_resolves_tags_and_list_children() {
    let registry = MockRegistry::start();
    let amd64 = seed_image(&registry, "staging/foo", "amd64", Some("v1"));
    let arm64 = seed_image(&registry, "staging/foo", "arm64", None);
    let list = registry.put_manifest(
        "staging/foo",
        Some("v2"),
        DOCKER_MANIFEST_LIST,
        list_manifest(&[&amd64, &arm64]),
    );
    seed_image(&registry, "other/bar", "bar", Some("v1"));

    let reader = NetworkInventory::new(pool());
    let inventory = reader
        .read_inventory(
            &RegistryContext::source(registry.registry("staging")),
            &InventoryScope::Registry,
        )
        .expect("inventory");

    assert_eq!(inventory.images.len(), 1, "catalog is scoped to the namespace");
    let foo = inventory.image(&ImageName::from("foo")).expect("foo");
    assert_eq!(foo.digests[&Digest::from(amd64.as_str())], BTreeSet::from([Tag::from("v1")]));
    assert_eq!(foo.digests[&Digest::from(list.as_str())], BTreeSet::from([Tag::from("v2")]));
    assert!(foo.digests[&Digest::from(arm64.as_str())].is_empty());
    assert_eq!(foo.children[&Digest::from(list.as_str())].len(), 2);
}

#[test]
fn absent_images_have_no_entry() {
    let registry = MockRegistry::start();
    seed_image(&registry, "staging/foo", "x", Some("v1"));

    let reader = NetworkInventory::new(pool());
    let scope = InventoryScope::Images(BTreeSet::from([
        ImageName::from("foo"),
        ImageName::from("missing"),
    ]));
    let inventory = reader
        .read_inventory(&RegistryContext::source(registry.registry("staging")), &scope)
        .expect("inventory");
    assert!(inventory.image(&ImageName::from("foo")).is_some());
    assert!(inventory.image(&ImageName::from("missing")).is_none());
}

#[test]
fn anonymous_token_is_fetched_once_per_repository() {
    let registry = MockRegistry::start();
    seed_image(&registry, "staging/foo", "x", Some("v1"));
    registry.require_token();

    let reader = NetworkInventory::new(pool());
    let scope = InventoryScope::Images(BTreeSet::from([ImageName::from("foo")]));
    let inventory = reader
        .read_inventory(&RegistryContext::source(registry.registry("staging")), &scope)
        .expect("inventory");
    assert_eq!(inventory.images.len(), 1);
    assert_eq!(registry.counters().2, 1);
}

// ---------------------------------------------------------------------------
// Transfers
// ---------------------------------------------------------------------------

#[test]
fn copy_between_hosts_pushes_blobs_then_tags() {
    let source = MockRegistry::start();
    let destination = MockRegistry::start();
    let digest = seed_image(&source, "staging/foo", "x", Some("v1"));
    let (src, dst) = (source.registry("staging"), destination.registry("prod"));

    let transfers = NetworkTransfers::new(pool(), TransferMode::PullPush);
    transfers
        .make(&edge(&src, &dst, &digest, Some("v1"), TagOp::CopyWithTag))
        .run()
        .expect("copy");
    assert_eq!(destination.tag("prod/foo", "v1").as_deref(), Some(digest.as_str()));
    assert!(destination.has_blob("prod/foo", &sha256_digest(b"layer-x")));
    assert_eq!(destination.counters().0, 2, "config and layer uploaded");

    transfers
        .make(&edge(&src, &dst, &digest, Some("stable"), TagOp::AddTag))
        .run()
        .expect("retag");
    assert_eq!(destination.tag("prod/foo", "stable").as_deref(), Some(digest.as_str()));
}

#[test]
fn direct_copy_within_a_host_mounts_blobs() {
    let registry = MockRegistry::start();
    let digest = seed_image(&registry, "staging/foo", "x", Some("v1"));
    let (src, dst) = (registry.registry("staging"), registry.registry("prod"));

    NetworkTransfers::new(pool(), TransferMode::Direct)
        .make(&edge(&src, &dst, &digest, None, TagOp::CopyWithTag))
        .run()
        .expect("copy");
    let (uploads, mounts, _) = registry.counters();
    assert_eq!((uploads, mounts), (0, 2));
    assert!(registry.has_blob("prod/foo", &sha256_digest(b"layer-x")));
}

#[test]
fn pull_push_within_a_host_never_mounts() {
    let registry = MockRegistry::start();
    let digest = seed_image(&registry, "staging/foo", "x", Some("v1"));
    let (src, dst) = (registry.registry("staging"), registry.registry("prod"));

    NetworkTransfers::new(pool(), TransferMode::PullPush)
        .make(&edge(&src, &dst, &digest, Some("v1"), TagOp::CopyWithTag))
        .run()
        .expect("copy");
    let (uploads, mounts, _) = registry.counters();
    assert_eq!((uploads, mounts), (2, 0));
    assert_eq!(registry.tag("prod/foo", "v1").as_deref(), Some(digest.as_str()));
}

#[test]
fn direct_copy_between_hosts_streams_blobs() {
    let source = MockRegistry::start();
    let destination = MockRegistry::start();
    let digest = seed_image(&source, "staging/foo", "x", Some("v1"));

    NetworkTransfers::new(pool(), TransferMode::Direct)
        .make(&edge(
            &source.registry("staging"),
            &destination.registry("prod"),
            &digest,
            Some("v1"),
            TagOp::CopyWithTag,
        ))
        .run()
        .expect("copy");
    assert_eq!(destination.counters().0, 2);
    assert_eq!(destination.counters().1, 0);
}

#[test]
fn credential_mode_selects_transfer_mode() {
    assert_eq!(TransferMode::for_credentials(true), TransferMode::Direct);
    assert_eq!(TransferMode::for_credentials(false), TransferMode::PullPush);
}

#[test]
fn add_tag_without_a_tag_is_permanent() {
    let registry = MockRegistry::start();
    let digest = seed_image(&registry, "prod/foo", "x", Some("v1"));
    let (src, dst) = (registry.registry("staging"), registry.registry("prod"));

    let err = NetworkTransfers::new(pool(), TransferMode::PullPush)
        .make(&edge(&src, &dst, &digest, None, TagOp::AddTag))
        .run()
        .unwrap_err();
    assert!(!err.is_transient());
    assert!(err.to_string().contains("carries no tag"), "got: {err}");
}

#[test]
fn verify_parent_requires_every_child() {
    let source = MockRegistry::start();
    let destination = MockRegistry::start();
    let child = seed_image(&destination, "prod/foo", "amd64", None);
    let missing = sha256_digest(b"never pushed");
    let list = destination.put_manifest(
        "prod/foo",
        Some("v1"),
        DOCKER_MANIFEST_LIST,
        list_manifest(&[&child, &missing]),
    );

    let err = NetworkTransfers::new(pool(), TransferMode::PullPush)
        .make(&edge(
            &source.registry("staging"),
            &destination.registry("prod"),
            &list,
            None,
            TagOp::VerifyParent,
        ))
        .run()
        .unwrap_err();
    assert!(!err.is_transient());
    assert!(err.to_string().contains(&missing), "got: {err}");
}

#[test]
fn missing_source_manifest_is_permanent() {
    let source = MockRegistry::start();
    let destination = MockRegistry::start();
    seed_image(&source, "staging/foo", "x", Some("v1"));

    let err = NetworkTransfers::new(pool(), TransferMode::PullPush)
        .make(&edge(
            &source.registry("staging"),
            &destination.registry("prod"),
            &sha256_digest(b"nope"),
            Some("v1"),
            TagOp::CopyWithTag,
        ))
        .run()
        .unwrap_err();
    assert!(!err.is_transient(), "404 is not worth retrying: {err}");
}

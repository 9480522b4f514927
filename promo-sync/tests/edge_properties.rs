//! Edge computation properties checked against the in-memory registry.

use std::collections::{BTreeMap, BTreeSet};

use promo_core::{
    Digest, FixtureRegistry, Image, ImageName, Manifest, PromotionEdge, RegistryContext,
    RegistryName, RunConfig, Tag, TagOp, TransferFactory,
};
use promo_sync::{compute_edges, EdgePlan, SyncContext};

const SRC: &str = "gcr.io/staging";
const DST: &str = "gcr.io/prod";

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn manifest(image: &str, digest: &str, tags: &[&str]) -> Manifest {
    Manifest {
        registries: vec![
            RegistryContext::source(SRC),
            RegistryContext::destination(DST),
        ],
        images: vec![Image {
            name: ImageName::from(image),
            dmap: BTreeMap::from([(
                Digest::from(digest),
                tags.iter().map(|t| Tag::from(*t)).collect(),
            )]),
        }],
        filepath: None,
    }
}

fn plan(fixture: &FixtureRegistry, manifests: Vec<Manifest>) -> EdgePlan {
    let ctx = SyncContext::build(RunConfig::default(), manifests, fixture).expect("sync context");
    compute_edges(&ctx)
}

/// Apply every edge, dependencies first.
fn apply_all(fixture: &FixtureRegistry, plan: &EdgePlan) {
    let mut done: BTreeSet<&PromotionEdge> = BTreeSet::new();
    while done.len() < plan.len() {
        let ready: Vec<&PromotionEdge> = plan
            .edges
            .iter()
            .filter(|e| !done.contains(e))
            .filter(|e| plan.dependencies_of(e).all(|d| done.contains(d)))
            .collect();
        assert!(!ready.is_empty(), "dependency cycle");
        for edge in ready {
            fixture.make(edge).run().expect("transfer");
            done.insert(edge);
        }
    }
}

fn only_edge(plan: &EdgePlan) -> &PromotionEdge {
    assert_eq!(plan.len(), 1, "edges: {:?}", plan.edges);
    plan.edges.iter().next().expect("one edge")
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[test]
fn missing_tag_on_present_digest_is_a_retag() {
    init_logging();
    let fixture = FixtureRegistry::new()
        .with_image(SRC, "foo", "sha256:aaa", &["v1", "latest"])
        .with_image(DST, "foo", "sha256:aaa", &["v1"]);

    let plan = plan(&fixture, vec![manifest("foo", "sha256:aaa", &["v1", "latest"])]);

    let edge = only_edge(&plan);
    assert_eq!(edge.op, TagOp::AddTag);
    assert_eq!(edge.tag, Some(Tag::from("latest")));
    assert!(plan.findings.is_empty());
}

#[test]
fn absent_image_gets_one_copy_per_tag() {
    init_logging();
    let fixture = FixtureRegistry::new().with_image(SRC, "foo", "sha256:aaa", &["v1", "latest"]);

    let plan = plan(&fixture, vec![manifest("foo", "sha256:aaa", &["v1", "latest"])]);

    assert_eq!(plan.len(), 2);
    assert_eq!(plan.count(TagOp::CopyWithTag), 2);
    let tags: BTreeSet<_> = plan.edges.iter().filter_map(|e| e.tag.clone()).collect();
    assert_eq!(tags, BTreeSet::from([Tag::from("latest"), Tag::from("v1")]));
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

#[test]
fn rerun_after_success_is_empty_and_complete() {
    init_logging();
    let fixture = FixtureRegistry::new()
        .with_image(SRC, "foo", "sha256:aaa", &["v1", "latest"])
        .with_image(SRC, "bar", "sha256:bbb", &[])
        .with_image(DST, "foo", "sha256:aaa", &["v1"]);
    let manifests = vec![
        manifest("foo", "sha256:aaa", &["v1", "latest", "stable"]),
        manifest("bar", "sha256:bbb", &[]),
    ];

    let first = plan(&fixture, manifests.clone());
    assert_eq!(first.len(), 3);
    apply_all(&fixture, &first);

    let second = plan(&fixture, manifests);
    assert!(second.is_empty(), "second run edges: {:?}", second.edges);

    let dst = fixture.inventory(DST).expect("destination");
    let foo = dst.image(&ImageName::from("foo")).expect("foo");
    for tag in ["v1", "latest", "stable"] {
        assert!(foo.has_pairing(&Digest::from("sha256:aaa"), &Tag::from(tag)));
    }
    assert!(dst
        .image(&ImageName::from("bar"))
        .is_some_and(|bar| bar.has_digest(&Digest::from("sha256:bbb"))));
}

#[test]
fn unmanaged_destination_content_is_never_touched() {
    init_logging();
    let fixture = FixtureRegistry::new()
        .with_image(SRC, "foo", "sha256:aaa", &["v1"])
        .with_image(DST, "foo", "sha256:old", &["legacy"])
        .with_image(DST, "other", "sha256:zzz", &["v9"]);

    let plan = plan(&fixture, vec![manifest("foo", "sha256:aaa", &["v1"])]);
    assert!(plan.edges.iter().all(|e| e.digest.as_str() == "sha256:aaa"));
    assert!(plan
        .edges
        .iter()
        .all(|e| e.dst_image.as_str() == "foo" && e.tag.as_ref().map(Tag::as_str) != Some("legacy")));

    apply_all(&fixture, &plan);
    let dst = fixture.inventory(DST).expect("destination");
    assert!(dst
        .image(&ImageName::from("foo"))
        .is_some_and(|foo| foo.has_pairing(&Digest::from("sha256:old"), &Tag::from("legacy"))));
    assert!(dst.image(&ImageName::from("other")).is_some());
}

#[test]
fn identical_requests_from_two_manifests_collapse() {
    init_logging();
    let fixture = FixtureRegistry::new().with_image(SRC, "foo", "sha256:aaa", &["v1"]);

    let mut second = manifest("foo", "sha256:aaa", &["v1"]);
    second.registries[1].service_account = Some("promoter@example".to_string());

    let plan = plan(&fixture, vec![manifest("foo", "sha256:aaa", &["v1"]), second]);
    assert_eq!(only_edge(&plan).op, TagOp::CopyWithTag);
}

#[test]
fn every_edge_digest_exists_in_source() {
    init_logging();
    let fixture = FixtureRegistry::new().with_image(SRC, "foo", "sha256:aaa", &["v1"]);

    let plan = plan(
        &fixture,
        vec![
            manifest("foo", "sha256:aaa", &["v1"]),
            manifest("foo", "sha256:fff", &["v2"]),
        ],
    );
    assert_eq!(only_edge(&plan).digest, Digest::from("sha256:aaa"));
    assert_eq!(plan.findings.len(), 1);
    assert!(plan
        .findings
        .iter()
        .all(|f| f.to_string().contains("sha256:fff")));
}

#[test]
fn unreachable_destination_yields_finding_not_edges() {
    init_logging();
    let fixture = FixtureRegistry::new()
        .with_image(SRC, "foo", "sha256:aaa", &["v1"])
        .with_unreachable(DST);

    let plan = plan(&fixture, vec![manifest("foo", "sha256:aaa", &["v1"])]);
    assert!(plan.is_empty());
    assert_eq!(plan.findings.len(), 1);
}

// ---------------------------------------------------------------------------
// Manifest lists
// ---------------------------------------------------------------------------

#[test]
fn manifest_list_children_gate_parent() {
    init_logging();
    let fixture = FixtureRegistry::new().with_manifest_list(
        SRC,
        "foo",
        "sha256:f00",
        &["v1"],
        &["sha256:c01", "sha256:c02"],
    );

    let plan = plan(&fixture, vec![manifest("foo", "sha256:f00", &["v1"])]);

    assert_eq!(plan.len(), 4);
    let children: Vec<&PromotionEdge> = plan
        .edges
        .iter()
        .filter(|e| e.digest.as_str().starts_with("sha256:c0"))
        .collect();
    assert_eq!(children.len(), 2);
    assert!(children
        .iter()
        .all(|e| e.op == TagOp::CopyWithTag && e.tag.is_none()));

    let parent = plan
        .edges
        .iter()
        .find(|e| e.op == TagOp::CopyWithTag && e.tag.is_some())
        .expect("parent copy");
    assert_eq!(plan.dependencies_of(parent).count(), 2);

    let verify = plan
        .edges
        .iter()
        .find(|e| e.op == TagOp::VerifyParent)
        .expect("verify edge");
    let gate: BTreeSet<_> = plan.dependencies_of(verify).collect();
    assert_eq!(gate.len(), 3);
    assert!(gate.contains(parent));

    apply_all(&fixture, &plan);
    let again = {
        let ctx = SyncContext::build(
            RunConfig::default(),
            vec![manifest("foo", "sha256:f00", &["v1"])],
            &fixture,
        )
        .expect("sync context");
        compute_edges(&ctx)
    };
    assert!(again.is_empty());
}

#[test]
fn present_manifest_list_missing_one_child() {
    init_logging();
    let fixture = FixtureRegistry::new()
        .with_manifest_list(SRC, "foo", "sha256:f00", &["v1"], &["sha256:c01", "sha256:c02"])
        .with_image(DST, "foo", "sha256:f00", &["v1"])
        .with_image(DST, "foo", "sha256:c01", &[]);

    let plan = plan(&fixture, vec![manifest("foo", "sha256:f00", &["v1"])]);

    assert_eq!(plan.len(), 2);
    let child = plan
        .edges
        .iter()
        .find(|e| e.op == TagOp::CopyWithTag)
        .expect("child copy");
    assert_eq!(child.digest, Digest::from("sha256:c02"));
    let verify = plan
        .edges
        .iter()
        .find(|e| e.op == TagOp::VerifyParent)
        .expect("verify edge");
    assert_eq!(plan.dependencies_of(verify).collect::<Vec<_>>(), vec![child]);
}

#[test]
fn by_destination_covers_every_edge_once() {
    init_logging();
    let fixture = FixtureRegistry::new().with_image(SRC, "foo", "sha256:aaa", &["v1"]);
    let mut m = manifest("foo", "sha256:aaa", &["v1", "v2"]);
    m.registries.push(RegistryContext::destination("asia.gcr.io/prod"));

    let plan = plan(&fixture, vec![m]);
    let groups = plan.by_destination();
    assert_eq!(groups.len(), 2);
    assert_eq!(groups.values().map(Vec::len).sum::<usize>(), plan.len());
    assert!(groups
        .keys()
        .any(|name| **name == RegistryName::from("asia.gcr.io/prod")));
}

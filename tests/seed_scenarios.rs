//! Cross-module integration tests for the six seed scenarios (spec.md
//! §8 "Concrete scenarios").

use async_trait::async_trait;
use image_graph_core::config::Config;
use image_graph_core::core::Core;
use image_graph_core::digest;
use image_graph_core::error::TransferError;
use image_graph_core::event::{CapturingSink, Event};
use image_graph_core::export;
use image_graph_core::graph::driver::MemoryDriver;
use image_graph_core::graph::{Graph, ImageMetadata};
use image_graph_core::manifest::{self, AllowAllTrust, ManifestV2, PlainSigner, PlainVerifier};
use image_graph_core::pool::Kind;
use image_graph_core::tagstore::TagStore;
use image_graph_core::transfer::{
    BlobReader, BlobService, BlobStat, BlobWriter, Endpoint, ManifestService, MockRegistry,
    Repository, RegistrySession, StaticEndpointList,
};
use std::collections::HashMap;
use std::sync::Arc;

fn now() -> String {
    image_graph_core::util::now_rfc3339()
}

fn random_id() -> String {
    image_graph_core::util::random_hex_id()
}

async fn new_graph_and_store(prefix: &str) -> (Arc<Graph>, TagStore) {
    let driver = Arc::new(MemoryDriver::new());
    let root = std::env::temp_dir().join(format!("{prefix}-graph-{}", random_id()));
    let graph = Arc::new(Graph::new(root, driver).await.unwrap());
    let path = std::env::temp_dir().join(format!("{prefix}-tags-{}.json", random_id()));
    let store = TagStore::new(path, graph.clone()).await.unwrap();
    (graph, store)
}

fn metadata(id: &str, parent: &str) -> ImageMetadata {
    ImageMetadata {
        id: id.to_string(),
        parent: parent.to_string(),
        created: now(),
        container: None,
        container_config: None,
        config: None,
        architecture: Some("amd64".to_string()),
        os: None,
        author: None,
        comment: None,
        docker_version: None,
    }
}

async fn register_layer(graph: &Graph, parent: &str, bytes: &'static [u8]) -> String {
    let id = random_id();
    graph.register(metadata(&id, parent), Box::new(std::io::Cursor::new(bytes.to_vec()))).await.unwrap();
    id
}

/// Shares one [`MockRegistry`] across every [`Repository`] handle a
/// [`RegistrySession::open`] call hands out, so concurrent pulls/pushes
/// driven through [`Core`] observe the same remote state.
struct SharedRepo(Arc<MockRegistry>);

#[async_trait]
impl BlobService for SharedRepo {
    async fn stat(&self, digest: &str) -> Result<BlobStat, TransferError> {
        self.0.stat(digest).await
    }
    async fn open_download(&self, digest: &str) -> Result<BlobReader, TransferError> {
        self.0.open_download(digest).await
    }
    async fn open_upload(&self) -> Result<BlobWriter, TransferError> {
        self.0.open_upload().await
    }
    async fn commit(&self, writer: BlobWriter, digest: &str) -> Result<(), TransferError> {
        self.0.commit(writer, digest).await
    }
}

#[async_trait]
impl ManifestService for SharedRepo {
    async fn get(&self, tag: &str) -> Result<(Vec<u8>, Option<String>), TransferError> {
        self.0.get(tag).await
    }
    async fn put(&self, tag: &str, signed: Vec<u8>) -> Result<(), TransferError> {
        self.0.put(tag, signed).await
    }
}

#[async_trait]
impl Repository for SharedRepo {
    fn blobs(&self) -> &dyn BlobService {
        self
    }
    fn manifests(&self) -> &dyn ManifestService {
        self
    }
    async fn push_tag(&self, tag: &str, image_id: &str) -> Result<(), TransferError> {
        self.0.push_tag(tag, image_id).await
    }
    async fn tags(&self) -> Result<HashMap<String, String>, TransferError> {
        self.0.tags().await
    }
    async fn get_image_json(&self, image_id: &str) -> Result<Vec<u8>, TransferError> {
        self.0.get_image_json(image_id).await
    }
    async fn get_image_layer(&self, image_id: &str) -> Result<BlobReader, TransferError> {
        self.0.get_image_layer(image_id).await
    }
    async fn put_image_json(&self, image_id: &str, json: &[u8]) -> Result<(), TransferError> {
        self.0.put_image_json(image_id, json).await
    }
    async fn put_image_layer(&self, image_id: &str, layer: BlobReader) -> Result<(), TransferError> {
        self.0.put_image_layer(image_id, layer).await
    }
    async fn put_image_checksum(&self, image_id: &str, digest: &str) -> Result<(), TransferError> {
        self.0.put_image_checksum(image_id, digest).await
    }
}

struct SharedSession(Arc<MockRegistry>);

#[async_trait]
impl RegistrySession for SharedSession {
    async fn open(&self, _canonical_name: &str) -> Result<Box<dyn Repository>, TransferError> {
        Ok(Box::new(SharedRepo(self.0.clone())))
    }
}

async fn new_core(prefix: &str) -> Core {
    let driver: Arc<dyn image_graph_core::graph::GraphDriver> = Arc::new(MemoryDriver::new());
    let graph_root = std::env::temp_dir().join(format!("{prefix}-core-graph-{}", random_id()));
    let tag_store_path = std::env::temp_dir().join(format!("{prefix}-core-tags-{}.json", random_id()));
    let config = Config::new(graph_root, tag_store_path);
    Core::new(config, driver).await.unwrap()
}

/// Seed scenario 1: register, tag, and look up by bare repository name,
/// tagged name, and a nonexistent tag.
#[tokio::test]
async fn seed_1_register_tag_lookup() {
    let (graph, store) = new_graph_and_store("seed1").await;
    let id = register_layer(&graph, "", b"busybox rootfs").await;
    store.tag("busybox", "latest", &id, false, false).await.unwrap();

    assert_eq!(store.lookup_image("busybox").await.unwrap().unwrap().id(), id);
    assert_eq!(store.lookup_image("busybox:latest").await.unwrap().unwrap().id(), id);
    assert!(store.lookup_image("busybox:fail").await.unwrap().is_none());
}

/// Seed scenario 2: building a manifest computes and caches a layer's
/// digest, and that digest is exactly what lands in `fs_layers[0]`.
#[tokio::test]
async fn seed_2_manifest_digest_matches_cached_digest() {
    let (graph, store) = new_graph_and_store("seed2").await;
    let id = register_layer(&graph, "", b"single layer contents").await;
    store.tag("myapp", "manifesttest", &id, false, false).await.unwrap();

    let built = manifest::build(&graph, &store, "myapp", "myapp", "manifesttest").await.unwrap();
    assert_eq!(built.fs_layers.len(), 1);

    let cached = graph.get_digest(&id).await.unwrap();
    assert_eq!(built.fs_layers[0].blob_sum, cached);
}

/// Seed scenario 3: two concurrent pulls of the same tag dedupe through
/// the pool; the follower observes `AlreadyInProgress`, and both return
/// the same successful result with the manifest's layer count registered.
#[tokio::test]
async fn seed_3_concurrent_pulls_dedupe_through_pool() {
    let (graph, store) = new_graph_and_store("seed3").await;
    let registry = Arc::new(MockRegistry::new());

    let base_bytes = b"busybox base".to_vec();
    let base_id = random_id();
    let base_digest = digest::compute(&base_bytes).to_string();
    registry.seed_blob(&base_digest, base_bytes);

    let manifest = ManifestV2 {
        name: "busybox".to_string(),
        tag: "latest".to_string(),
        architecture: Some("amd64".to_string()),
        schema_version: manifest::SCHEMA_VERSION,
        fs_layers: vec![manifest::FsLayer { blob_sum: base_digest }],
        history: vec![manifest::HistoryEntry {
            v1_compatibility: serde_json::to_string(&metadata(&base_id, "")).unwrap(),
        }],
    };
    let signer = PlainSigner { key_id: "k".to_string() };
    let signed = manifest::sign(&manifest, &signer).await;
    registry.seed_manifest("latest", signed, None);

    let endpoint = Endpoint::v2("mock");
    let sink = Arc::new(CapturingSink::new());

    // Acquire the pool slot up front in this task, simulating the first
    // of the two concurrent pull requests already being in flight, so
    // the second call deterministically observes a follower role.
    let owner = match store.pool().acquire(Kind::Pull, "busybox:latest") {
        image_graph_core::pool::Role::Owner(b) => b,
        _ => panic!("expected owner"),
    };

    let store_arc = Arc::new(store);
    let graph_arc = graph.clone();
    let registry_b = registry.clone();
    let store_b = store_arc.clone();
    let endpoint_b = endpoint.clone();
    let sink_b = sink.clone();
    let follower = tokio::spawn(async move {
        image_graph_core::transfer::puller_v2::pull(
            &endpoint_b,
            "busybox",
            "latest",
            registry_b.as_ref(),
            &graph_arc,
            store_b.as_ref(),
            &PlainVerifier,
            &AllowAllTrust,
            sink_b.as_ref(),
        )
        .await
    });

    // Give the spawned follower a chance to observe the in-flight pull.
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    store_arc.pool().release(Kind::Pull, "busybox:latest", owner, Ok(()));

    let (follower_fallback, follower_err) = follower.await.unwrap();
    assert!(!follower_fallback);
    assert!(follower_err.is_none());

    assert!(sink.events().iter().any(|e| matches!(e, Event::AlreadyInProgress { kind, .. } if *kind == "pull")));
}

/// Seed scenario 4: exporting two tags and loading into an empty store
/// reproduces both the TagStore mapping and every image plus ancestors.
#[tokio::test]
async fn seed_4_export_then_load_round_trips_tag_set() {
    let (graph, store) = new_graph_and_store("seed4").await;
    let base_a = register_layer(&graph, "", b"image a base").await;
    let base_b = register_layer(&graph, "", b"image b base").await;
    let child_b = register_layer(&graph, &base_b, b"image b child").await;
    store.tag("a", "latest", &base_a, false, false).await.unwrap();
    store.tag("b", "v2", &child_b, false, false).await.unwrap();

    let tar_bytes =
        export::save(&graph, &store, &["a:latest".to_string(), "b:v2".to_string()]).await.unwrap();

    let (graph2, store2) = new_graph_and_store("seed4-target").await;
    export::load(&graph2, &store2, &tar_bytes).await.unwrap();

    assert!(graph2.exists(&base_a).await);
    assert!(graph2.exists(&base_b).await);
    assert!(graph2.exists(&child_b).await);
    assert_eq!(store2.lookup_image("a:latest").await.unwrap().unwrap().id(), base_a);
    assert_eq!(store2.lookup_image("b:v2").await.unwrap().unwrap().id(), child_b);
}

/// Seed scenario 5: pushing a manifest whose every layer is already on
/// the registry issues `stat` but no upload, and `manifests.put` exactly
/// once.
#[tokio::test]
async fn seed_5_push_with_every_layer_present_skips_upload() {
    let (graph, store) = new_graph_and_store("seed5").await;
    let registry = MockRegistry::new();

    let base = register_layer(&graph, "", b"already present").await;
    store.tag("myapp", "latest", &base, false, false).await.unwrap();

    let mut reader = graph.tar_layer(&base).await.unwrap();
    let mut bytes = Vec::new();
    {
        use tokio::io::AsyncReadExt;
        reader.read_to_end(&mut bytes).await.unwrap();
    }
    let computed = digest::compute(&bytes).to_string();
    registry.seed_blob(&computed, bytes);

    let endpoint = Endpoint::v2("mock");
    let signer = PlainSigner { key_id: "daemon".to_string() };
    let sink = CapturingSink::new();
    let (fallback, err) = image_graph_core::transfer::pusher_v2::push(
        &endpoint, "myapp", "latest", &registry, &graph, &store, &signer, &sink,
    )
    .await;

    assert!(err.is_none(), "{err:?}");
    assert!(!fallback);
    assert!(registry.pushed_manifest("latest").is_some());
    assert!(sink.events().iter().any(|e| matches!(e, Event::AlreadyExists { .. })));
    assert!(!sink.events().iter().any(|e| matches!(e, Event::Pushed { .. })));
}

/// Seed scenario 6: a corrupted blob fails verification, the progress
/// stream shows `Verifying` before the failure, the Graph gains no
/// partial registration, and the error propagates to the caller.
#[tokio::test]
async fn seed_6_corrupted_blob_fails_cleanly() {
    let (graph, store) = new_graph_and_store("seed6").await;
    let registry = MockRegistry::new();

    let base_id = random_id();
    let wrong_digest = digest::compute(b"what the manifest expects").to_string();
    registry.seed_blob(&wrong_digest, b"corrupted bytes on the wire".to_vec());

    let manifest = ManifestV2 {
        name: "myapp".to_string(),
        tag: "latest".to_string(),
        architecture: None,
        schema_version: manifest::SCHEMA_VERSION,
        fs_layers: vec![manifest::FsLayer { blob_sum: wrong_digest }],
        history: vec![manifest::HistoryEntry {
            v1_compatibility: serde_json::to_string(&metadata(&base_id, "")).unwrap(),
        }],
    };
    let signer = PlainSigner { key_id: "k".to_string() };
    let signed = manifest::sign(&manifest, &signer).await;
    registry.seed_manifest("latest", signed, None);

    let endpoint = Endpoint::v2("mock");
    let sink = CapturingSink::new();
    let (_fallback, err) = image_graph_core::transfer::puller_v2::pull(
        &endpoint,
        "myapp",
        "latest",
        &registry,
        &graph,
        &store,
        &PlainVerifier,
        &AllowAllTrust,
        &sink,
    )
    .await;

    assert!(matches!(err, Some(TransferError::LayerDigestVerificationFailed { .. })));
    assert!(sink.events().iter().any(|e| matches!(e, Event::Verifying { .. })));
    assert!(!graph.exists(&base_id).await);
    assert!(store.lookup_image("myapp:latest").await.unwrap().is_none());
}

/// End-to-end smoke test for the [`Core`] facade: push then pull the
/// same tag through a shared in-memory registry.
#[tokio::test]
async fn core_push_then_pull_round_trips() {
    let push_core = new_core("core-push").await;
    let base = register_layer(push_core.graph(), "", b"core smoke base").await;
    push_core.tag("myapp", "latest", &base, false).await.unwrap();

    let registry = Arc::new(MockRegistry::new());
    let session = SharedSession(registry.clone());
    let endpoints = StaticEndpointList(vec![Endpoint::v2("mock")]);
    let signer = PlainSigner { key_id: "daemon".to_string() };

    push_core.push("myapp", "latest", &endpoints, &session, &signer).await.unwrap();

    let pull_core = new_core("core-pull").await;
    pull_core
        .pull("myapp", "latest", &endpoints, &session, &PlainVerifier, &AllowAllTrust)
        .await
        .unwrap();

    assert!(pull_core.graph().exists(&base).await);
    assert_eq!(pull_core.tagstore().lookup_image("myapp:latest").await.unwrap().unwrap().id(), base);
}

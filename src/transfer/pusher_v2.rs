//! The v2 push state machine (spec.md §4.5.2).

use super::endpoint::{Endpoint, Version};
use super::session::{BlobStat, Repository};
use crate::error::{TransferError, TransferResult};
use crate::event::Event;
use crate::graph::Graph;
use crate::manifest::{FsLayer, HistoryEntry, ManifestV2, SCHEMA_VERSION};
use crate::pool::{Kind, Role};
use crate::tagstore::TagStore;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Pushes `repository:reference` to `endpoint` (spec.md §4.5.2).
pub async fn push(
    endpoint: &Endpoint,
    repository: &str,
    reference: &str,
    repo: &dyn Repository,
    graph: &Arc<Graph>,
    tagstore: &TagStore,
    signer: &dyn crate::manifest::ManifestSigner,
    sink: &dyn crate::event::EventSink,
) -> (bool, Option<TransferError>) {
    if endpoint.version != Version::V2 {
        return (true, Some(TransferError::NoSupport("endpoint is not v2".to_string())));
    }

    let tagged_name = format!("{repository}:{reference}");
    let owner = match tagstore.pool().acquire(Kind::Push, &tagged_name) {
        Role::Owner(b) => b,
        Role::Follower(handle) => {
            sink.emit(Event::AlreadyInProgress { kind: "push", key: tagged_name });
            return (false, handle.wait().await.err().map(Into::into));
        }
    };

    sink.emit(Event::Pushing {
        repository: repository.to_string(),
        reference: reference.to_string(),
        endpoint: endpoint.name.clone(),
    });

    let result = push_one_tag(repository, reference, repo, graph, tagstore, signer, sink).await;

    tagstore.pool().release(
        Kind::Push,
        &tagged_name,
        owner,
        result.clone().map_err(|e| crate::error::PoolError::Failed(tagged_name.clone(), e.to_string())),
    );

    match result {
        Ok(()) => (false, None),
        Err(e) => (true, Some(e)),
    }
}

async fn push_one_tag(
    repository: &str,
    reference: &str,
    repo: &dyn Repository,
    graph: &Arc<Graph>,
    tagstore: &TagStore,
    signer: &dyn crate::manifest::ManifestSigner,
    sink: &dyn crate::event::EventSink,
) -> TransferResult<()> {
    let top = tagstore
        .lookup_image(&format!("{repository}:{reference}"))
        .await?
        .ok_or_else(|| TransferError::TagStore(format!("no tagged image for {repository}:{reference}")))?;

    let mut fs_layers = Vec::new();
    let mut history = Vec::new();
    let mut layers_pushed = HashSet::new();
    let mut seen = HashSet::new();
    let architecture = top.metadata.architecture.clone();

    let mut current = top.id().to_string();
    loop {
        if !seen.insert(current.clone()) {
            break;
        }

        let digest = layer_digest(graph, &current).await?;
        if !layers_pushed.contains(&digest) {
            push_layer(graph, repo, &current, &digest, sink).await?;
            layers_pushed.insert(digest.clone());
        }

        fs_layers.push(FsLayer { blob_sum: digest });
        let raw = graph.raw_json(&current).await?;
        history.push(HistoryEntry { v1_compatibility: String::from_utf8_lossy(&raw).into_owned() });

        let image = graph.get(&current).await?;
        if image.parent().is_empty() {
            break;
        }
        current = image.parent().to_string();
    }

    let manifest = ManifestV2 {
        name: repository.to_string(),
        tag: reference.to_string(),
        architecture,
        schema_version: SCHEMA_VERSION,
        fs_layers,
        history,
    };
    manifest.validate_shape()?;

    let signed = crate::manifest::sign(&manifest, signer).await;
    repo.manifests().put(reference, signed).await?;
    Ok(())
}

async fn layer_digest(graph: &Graph, id: &str) -> TransferResult<String> {
    if let Ok(digest) = graph.get_digest(id).await {
        return Ok(digest);
    }
    let mut reader = graph.tar_layer(id).await?;
    let mut bytes = Vec::new();
    reader
        .read_to_end(&mut bytes)
        .await
        .map_err(|e| TransferError::LayerTransferFailed { layer: id.to_string(), cause: e.to_string() })?;
    let digest = crate::digest::compute(&bytes);
    graph.set_digest(id, digest.as_str()).await?;
    Ok(digest.as_str().to_string())
}

/// Checks remote presence, then uploads if necessary, tee-ing the tar
/// stream through a digester so the committed digest is verified
/// against the declared one (spec.md §4.5.2 "Upload").
async fn push_layer(
    graph: &Graph,
    repo: &dyn Repository,
    id: &str,
    digest: &str,
    sink: &dyn crate::event::EventSink,
) -> TransferResult<()> {
    sink.emit(Event::Verifying { layer: id.to_string() });
    if matches!(repo.blobs().stat(digest).await?, BlobStat::Known) {
        sink.emit(Event::AlreadyExists { layer: id.to_string() });
        return Ok(());
    }

    let mut reader = graph.tar_layer(id).await?;
    let mut bytes = Vec::new();
    reader
        .read_to_end(&mut bytes)
        .await
        .map_err(|e| TransferError::LayerTransferFailed { layer: id.to_string(), cause: e.to_string() })?;
    let computed = crate::digest::compute(&bytes);
    if computed.as_str() != digest {
        return Err(TransferError::LayerDigestVerificationFailed { layer: id.to_string() });
    }

    let mut writer = repo.blobs().open_upload().await?;
    writer
        .write_all(&bytes)
        .await
        .map_err(|e| TransferError::LayerTransferFailed { layer: id.to_string(), cause: e.to_string() })?;
    repo.blobs().commit(writer, digest).await?;

    sink.emit(Event::Pushed { layer: id.to_string(), bytes: bytes.len() as u64 });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::driver::MemoryDriver;
    use crate::graph::ImageMetadata;
    use crate::manifest::PlainSigner;
    use crate::transfer::session::MockRegistry;
    use crate::util::{now_rfc3339, random_hex_id};

    async fn new_graph_and_store() -> (Arc<Graph>, TagStore) {
        let driver = Arc::new(MemoryDriver::new());
        let root = std::env::temp_dir().join(format!("pusher-v2-{}", random_hex_id()));
        let graph = Arc::new(Graph::new(root, driver).await.unwrap());
        let path = std::env::temp_dir().join(format!("pusher-v2-tags-{}.json", random_hex_id()));
        let store = TagStore::new(path, graph.clone()).await.unwrap();
        (graph, store)
    }

    async fn layer(graph: &Graph, parent: &str, bytes: &'static [u8]) -> String {
        let id = random_hex_id();
        let metadata = ImageMetadata {
            id: id.clone(),
            parent: parent.to_string(),
            created: now_rfc3339(),
            container: None,
            container_config: None,
            config: None,
            architecture: Some("amd64".to_string()),
            os: None,
            author: None,
            comment: None,
            docker_version: None,
        };
        graph.register(metadata, Box::new(std::io::Cursor::new(bytes.to_vec()))).await.unwrap();
        id
    }

    #[tokio::test]
    async fn pushes_two_layer_image_and_signs_manifest() {
        let (graph, store) = new_graph_and_store().await;
        let registry = MockRegistry::new();

        let base = layer(&graph, "", b"base layer").await;
        let child = layer(&graph, &base, b"child layer").await;
        store.tag("myapp", "latest", &child, false, false).await.unwrap();

        let endpoint = Endpoint::v2("mock");
        let signer = PlainSigner { key_id: "daemon".to_string() };
        let (fallback, err) =
            push(&endpoint, "myapp", "latest", &registry, &graph, &store, &signer, &crate::event::NullSink).await;

        assert!(err.is_none(), "{err:?}");
        assert!(!fallback);
        assert!(registry.pushed_manifest("latest").is_some());

        let base_digest = graph.get_digest(&base).await.unwrap();
        let child_digest = graph.get_digest(&child).await.unwrap();
        assert!(registry.pushed_blob(&base_digest).is_some());
        assert!(registry.pushed_blob(&child_digest).is_some());
    }

    #[tokio::test]
    async fn already_existing_blob_is_not_reuploaded() {
        let (graph, store) = new_graph_and_store().await;
        let registry = MockRegistry::new();

        let base = layer(&graph, "", b"shared base").await;
        store.tag("myapp", "latest", &base, false, false).await.unwrap();

        let digest = super::layer_digest(&graph, &base).await.unwrap();
        registry.seed_blob(&digest, b"shared base".to_vec());

        let endpoint = Endpoint::v2("mock");
        let signer = PlainSigner { key_id: "daemon".to_string() };
        let (_fallback, err) =
            push(&endpoint, "myapp", "latest", &registry, &graph, &store, &signer, &crate::event::NullSink).await;
        assert!(err.is_none(), "{err:?}");
    }
}

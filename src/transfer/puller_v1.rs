//! The v1 pull state machine (spec.md §4.5.3).

use super::endpoint::{Endpoint, Version};
use super::session::Repository;
use crate::config::RetryConfig;
use crate::digest::Digest;
use crate::error::handlers::TransferErrorHandler;
use crate::error::{TransferError, TransferResult};
use crate::event::Event;
use crate::graph::{Graph, ImageMetadata};
use crate::pool::{Kind, Role};
use crate::tagstore::TagStore;
use std::sync::Arc;

/// Pulls `repository:reference` from a v1 `endpoint`. Pull-by-digest is
/// not supported on v1 and always signals `NoSupport` so the endpoint
/// iteration loop falls back (spec.md §4.5.3 "Pull-by-digest is not
/// supported on v1").
pub async fn pull(
    endpoint: &Endpoint,
    repository: &str,
    reference: &str,
    repo: &dyn Repository,
    graph: &Arc<Graph>,
    tagstore: &TagStore,
    retry: &RetryConfig,
    sink: &dyn crate::event::EventSink,
) -> (bool, Option<TransferError>) {
    if endpoint.version != Version::V1 {
        return (true, Some(TransferError::NoSupport("endpoint is not v1".to_string())));
    }
    if Digest::parse(reference).is_some() {
        return (true, Some(TransferError::NoSupport("pull by digest is not supported on v1".to_string())));
    }

    let tagged_name = format!("{repository}:{reference}");
    let owner = match tagstore.pool().acquire(Kind::Pull, &tagged_name) {
        Role::Owner(b) => b,
        Role::Follower(handle) => {
            sink.emit(Event::AlreadyInProgress { kind: "pull", key: tagged_name });
            return (false, handle.wait().await.err().map(Into::into));
        }
    };

    sink.emit(Event::Pulling {
        repository: repository.to_string(),
        reference: reference.to_string(),
        endpoint: endpoint.name.clone(),
    });

    let result = pull_one_tag(repository, reference, repo, graph, tagstore, retry, sink).await;

    tagstore.pool().release(
        Kind::Pull,
        &tagged_name,
        owner,
        result.clone().map_err(|e| crate::error::PoolError::Failed(tagged_name.clone(), e.to_string())),
    );

    match result {
        Ok(()) => (false, None),
        Err(e) => (true, Some(e)),
    }
}

async fn pull_one_tag(
    repository: &str,
    reference: &str,
    repo: &dyn Repository,
    graph: &Arc<Graph>,
    tagstore: &TagStore,
    retry: &RetryConfig,
    sink: &dyn crate::event::EventSink,
) -> TransferResult<()> {
    let tags = repo.tags().await?;
    let top_id = tags
        .get(reference)
        .cloned()
        .ok_or_else(|| TransferError::TagStore(format!("remote has no tag {repository}:{reference}")))?;

    // Walk the parent chain via per-image json fetches, collecting the
    // full chain before registering anything (registration needs
    // base-to-top order, but the chain is only known top-down).
    let mut chain = Vec::new();
    let mut current = top_id.clone();
    loop {
        let json = retry_fetch(retry, || repo.get_image_json(&current)).await?;
        let metadata: ImageMetadata =
            serde_json::from_slice(&json).map_err(|e| TransferError::Manifest(format!("invalid image json: {e}")))?;
        let parent = metadata.parent.clone();
        chain.push((metadata, json));
        if parent.is_empty() {
            break;
        }
        current = parent;
    }

    for (metadata, json) in chain.into_iter().rev() {
        if graph.exists(&metadata.id).await {
            sink.emit(Event::AlreadyExists { layer: metadata.id.clone() });
            continue;
        }
        let image_id = metadata.id.clone();
        let bytes = retry_fetch(retry, || async {
            use tokio::io::AsyncReadExt;
            let mut reader = repo.get_image_layer(&image_id).await?;
            let mut bytes = Vec::new();
            reader.read_to_end(&mut bytes).await.map_err(|e| TransferError::LayerTransferFailed {
                layer: image_id.clone(),
                cause: e.to_string(),
            })?;
            Ok(bytes)
        })
        .await?;
        let digest = crate::digest::compute(&bytes);
        graph.register_raw(metadata, json, Box::new(std::io::Cursor::new(bytes))).await?;
        graph.set_digest(&image_id, digest.as_str()).await?;
        sink.emit(Event::DownloadComplete { layer: image_id, bytes: 0 });
    }

    tagstore.tag(repository, reference, &top_id, true, false).await?;
    Ok(())
}

/// Retries `attempt` with `sleep = j * backoff_unit` for `j` in
/// `1..=max_attempts` (spec.md §4.5.3 "retry and exponential-ish
/// backoff on timeouts").
async fn retry_fetch<T, F, Fut>(retry: &RetryConfig, mut attempt: F) -> TransferResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = TransferResult<T>>,
{
    let mut last_err = None;
    for j in 1..=retry.max_attempts {
        match attempt().await {
            Ok(v) => return Ok(v),
            Err(e) if TransferErrorHandler::is_retryable(&e) && j < retry.max_attempts => {
                last_err = Some(e);
                tokio::time::sleep(retry.backoff_for_attempt(j)).await;
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| TransferError::EndpointFallback("retry loop ran zero times".to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::driver::MemoryDriver;
    use crate::transfer::session::MockRegistry;
    use crate::util::{now_rfc3339, random_hex_id};

    fn image_json(id: &str, parent: &str) -> Vec<u8> {
        let metadata = ImageMetadata {
            id: id.to_string(),
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
        serde_json::to_vec(&metadata).unwrap()
    }

    async fn new_graph_and_store() -> (Arc<Graph>, TagStore) {
        let driver = Arc::new(MemoryDriver::new());
        let root = std::env::temp_dir().join(format!("puller-v1-{}", random_hex_id()));
        let graph = Arc::new(Graph::new(root, driver).await.unwrap());
        let path = std::env::temp_dir().join(format!("puller-v1-tags-{}.json", random_hex_id()));
        let store = TagStore::new(path, graph.clone()).await.unwrap();
        (graph, store)
    }

    #[tokio::test]
    async fn pulls_chain_base_first() {
        let (graph, store) = new_graph_and_store().await;
        let registry = MockRegistry::new();

        let base_id = random_hex_id();
        let child_id = random_hex_id();
        registry.seed_image(&base_id, image_json(&base_id, ""), b"base layer".to_vec());
        registry.seed_image(&child_id, image_json(&child_id, &base_id), b"child layer".to_vec());
        registry.seed_tag("latest", &child_id);

        let endpoint = Endpoint::v1("mock");
        let retry = RetryConfig::default();
        let (fallback, err) =
            pull(&endpoint, "myapp", "latest", &registry, &graph, &store, &retry, &crate::event::NullSink).await;

        assert!(err.is_none(), "{err:?}");
        assert!(!fallback);
        assert!(graph.exists(&base_id).await);
        assert!(graph.exists(&child_id).await);
        let tagged = store.lookup_image("myapp:latest").await.unwrap().unwrap();
        assert_eq!(tagged.id(), child_id);
    }

    #[tokio::test]
    async fn raw_json_is_preserved_byte_exact() {
        let (graph, store) = new_graph_and_store().await;
        let registry = MockRegistry::new();

        let base_id = random_hex_id();
        // Deliberately not what `serde_json::to_vec::<ImageMetadata>`
        // would produce (reordered fields, extra whitespace), so a
        // round-trip through it would change it.
        let raw = format!("{{\"created\":\"2024-01-01T00:00:00Z\",  \"id\":\"{base_id}\",\"parent\":\"\"}}")
            .into_bytes();
        registry.seed_image(&base_id, raw.clone(), b"base layer".to_vec());
        registry.seed_tag("latest", &base_id);

        let endpoint = Endpoint::v1("mock");
        let retry = RetryConfig::default();
        let (fallback, err) =
            pull(&endpoint, "myapp", "latest", &registry, &graph, &store, &retry, &crate::event::NullSink).await;

        assert!(err.is_none(), "{err:?}");
        assert!(!fallback);
        assert_eq!(graph.raw_json(&base_id).await.unwrap(), raw);
    }

    #[tokio::test]
    async fn pull_by_digest_reports_no_support() {
        let (graph, store) = new_graph_and_store().await;
        let registry = MockRegistry::new();
        let endpoint = Endpoint::v1("mock");
        let retry = RetryConfig::default();
        let digest_ref = format!("sha256:{}", "a".repeat(64));
        let (fallback, err) =
            pull(&endpoint, "myapp", &digest_ref, &registry, &graph, &store, &retry, &crate::event::NullSink).await;
        assert!(fallback);
        assert!(matches!(err, Some(TransferError::NoSupport(_))));
    }
}

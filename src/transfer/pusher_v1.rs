//! The v1 push state machine (spec.md §4.5.3).

use super::endpoint::{Endpoint, Version};
use super::session::Repository;
use crate::error::{TransferError, TransferResult};
use crate::event::Event;
use crate::graph::Graph;
use crate::pool::{Kind, Role};
use crate::tagstore::TagStore;
use std::collections::HashSet;
use std::sync::Arc;

/// Pushes `repository:reference` to a v1 `endpoint`: each layer's json,
/// tar, and checksum are uploaded individually, base layer first, then
/// the tag is registered directly with the remote (spec.md §4.5.3 "v1
/// push uploads layer json, layer tar, then checksum; tags are
/// registered via the session's push_tag").
pub async fn push(
    endpoint: &Endpoint,
    repository: &str,
    reference: &str,
    repo: &dyn Repository,
    graph: &Arc<Graph>,
    tagstore: &TagStore,
    sink: &dyn crate::event::EventSink,
) -> (bool, Option<TransferError>) {
    if endpoint.version != Version::V1 {
        return (true, Some(TransferError::NoSupport("endpoint is not v1".to_string())));
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

    let result = push_one_tag(repository, reference, repo, graph, tagstore, sink).await;

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
    sink: &dyn crate::event::EventSink,
) -> TransferResult<()> {
    let top = tagstore
        .lookup_image(&format!("{repository}:{reference}"))
        .await?
        .ok_or_else(|| TransferError::TagStore(format!("no tagged image for {repository}:{reference}")))?;

    // Collect the chain top-down, then push base-first: v1 registries
    // expect a layer's parent to already exist before the child lands.
    let mut chain = Vec::new();
    let mut seen = HashSet::new();
    let mut current = top.id().to_string();
    loop {
        if !seen.insert(current.clone()) {
            break;
        }
        chain.push(current.clone());
        let image = graph.get(&current).await?;
        if image.parent().is_empty() {
            break;
        }
        current = image.parent().to_string();
    }

    for id in chain.into_iter().rev() {
        push_layer(graph, repo, &id, sink).await?;
    }

    repo.push_tag(reference, top.id()).await?;
    Ok(())
}

/// Uploads one image's json, tar layer, and checksum, in that order
/// (spec.md §4.5.3).
async fn push_layer(graph: &Graph, repo: &dyn Repository, id: &str, sink: &dyn crate::event::EventSink) -> TransferResult<()> {
    sink.emit(Event::Verifying { layer: id.to_string() });

    let json = graph.raw_json(id).await?;
    repo.put_image_json(id, &json).await?;

    let reader = graph.tar_layer(id).await?;
    repo.put_image_layer(id, reader).await?;

    let digest = layer_digest(graph, id).await?;
    repo.put_image_checksum(id, &digest).await?;

    sink.emit(Event::Pushed { layer: id.to_string(), bytes: json.len() as u64 });
    Ok(())
}

async fn layer_digest(graph: &Graph, id: &str) -> TransferResult<String> {
    if let Ok(digest) = graph.get_digest(id).await {
        return Ok(digest);
    }
    use tokio::io::AsyncReadExt;
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

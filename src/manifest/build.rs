//! Manifest construction: walks an image's parent chain and assembles
//! the `fsLayers`/`history` arrays (spec.md §4.4 "Build").

use super::model::{FsLayer, HistoryEntry, ManifestV2, SCHEMA_VERSION};
use crate::error::{ManifestError, ManifestResult};
use crate::graph::Graph;
use std::collections::HashSet;
use tokio::io::AsyncReadExt;

/// Resolves `(local_name, tag)` via `tagstore`, walks the parent chain
/// in child-to-parent order, computes and caches any missing layer
/// digests, and returns an unsigned manifest addressed as
/// `remote_name:tag` (spec.md §4.4 "Build" steps 1-2).
pub async fn build(
    graph: &Graph,
    tagstore: &crate::tagstore::TagStore,
    local_name: &str,
    remote_name: &str,
    tag: &str,
) -> ManifestResult<ManifestV2> {
    let top = tagstore
        .lookup_image(&format!("{local_name}:{tag}"))
        .await?
        .ok_or_else(|| ManifestError::NoSuchTag(local_name.to_string()))?;

    let mut fs_layers = Vec::new();
    let mut history = Vec::new();
    let mut seen = HashSet::new();
    let mut architecture = top.metadata.architecture.clone();

    let mut current = top.id().to_string();
    loop {
        if !seen.insert(current.clone()) {
            break;
        }
        let digest = layer_digest(graph, &current).await?;
        fs_layers.push(FsLayer { blob_sum: digest });

        let raw = graph.raw_json(&current).await?;
        history.push(HistoryEntry { v1_compatibility: String::from_utf8_lossy(&raw).into_owned() });

        let image = graph.get(&current).await?;
        if architecture.is_none() {
            architecture = image.metadata.architecture.clone();
        }
        if image.parent().is_empty() {
            break;
        }
        current = image.parent().to_string();
    }

    let manifest = ManifestV2 {
        name: remote_name.to_string(),
        tag: tag.to_string(),
        architecture,
        schema_version: SCHEMA_VERSION,
        fs_layers,
        history,
    };
    manifest.validate_shape()?;
    Ok(manifest)
}

/// Returns the layer's stored digest, computing and persisting it first
/// if unset (spec.md §4.4 "If the layer's stored digest is unset…").
async fn layer_digest(graph: &Graph, id: &str) -> ManifestResult<String> {
    if let Ok(digest) = graph.get_digest(id).await {
        return Ok(digest);
    }
    let mut reader = graph.tar_layer(id).await?;
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes).await.map_err(|e| {
        ManifestError::Graph(crate::error::GraphError::Driver(format!("reading layer {id}: {e}")))
    })?;
    let digest = crate::digest::compute(&bytes);
    graph.set_digest(id, digest.as_str()).await?;
    Ok(digest.as_str().to_string())
}

//! The v2 pull state machine (spec.md §4.5.1).

use super::endpoint::{Endpoint, Version};
use super::session::Repository;
use crate::digest::{Digest, Verifier};
use crate::error::{TransferError, TransferResult};
use crate::event::Event;
use crate::graph::{Graph, ImageMetadata};
use crate::manifest::{self, ManifestV2};
use crate::pool::{Kind, Role, TransferPool};
use crate::tagstore::TagStore;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// Pulls `repository:reference` from `endpoint` (spec.md §4.5.1).
/// Returns `(fallback, err)`: `fallback == true` tells the endpoint
/// iteration loop to try the next endpoint.
pub async fn pull(
    endpoint: &Endpoint,
    repository: &str,
    reference: &str,
    repo: &dyn Repository,
    graph: &Arc<Graph>,
    tagstore: &TagStore,
    verifier: &dyn manifest::ManifestVerifier,
    trust: &dyn manifest::TrustService,
    sink: &dyn crate::event::EventSink,
) -> (bool, Option<TransferError>) {
    if endpoint.version != Version::V2 {
        return (true, Some(TransferError::NoSupport("endpoint is not v2".to_string())));
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

    let result = pull_one_tag(repository, reference, repo, graph, tagstore, verifier, trust, sink, tagstore.pool())
        .await;

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
    verifier: &dyn manifest::ManifestVerifier,
    trust: &dyn manifest::TrustService,
    sink: &dyn crate::event::EventSink,
    pool: &Arc<TransferPool>,
) -> TransferResult<()> {
    let (bytes, remote_digest) = repo.manifests().get(reference).await?;
    let loaded = manifest::load(&bytes, reference, remote_digest.as_deref(), verifier, trust, repository).await?;
    if !loaded.verified {
        sink.emit(Event::Error {
            subject: format!("{repository}:{reference}"),
            message: "manifest signature could not be verified; continuing".to_string(),
        });
    }
    let manifest = loaded.manifest;

    let plan = build_download_plan(graph, &manifest).await?;
    let downloaded = download_layers(&plan, repo, pool, sink).await?;
    register_layers(graph, &manifest, downloaded).await?;

    let top_id = manifest
        .history
        .first()
        .map(|h| parse_image_id(&h.v1_compatibility))
        .transpose()?
        .ok_or_else(|| TransferError::Manifest("manifest has no history entries".to_string()))?;

    if Digest::parse(reference).is_some() {
        tagstore.set_digest(repository, reference, &top_id, true).await?;
    } else {
        tagstore.tag(repository, reference, &top_id, true, false).await?;
    }
    Ok(())
}

struct PlannedLayer {
    index: usize,
    image: ImageMetadata,
    raw_json: Vec<u8>,
    digest: String,
    already_exists: bool,
}

async fn build_download_plan(graph: &Graph, manifest: &ManifestV2) -> TransferResult<Vec<PlannedLayer>> {
    let mut plan = Vec::with_capacity(manifest.fs_layers.len());
    // Bottom-up: last index (base) first (spec.md §4.5.1 step 3b).
    for index in (0..manifest.fs_layers.len()).rev() {
        let raw_json = manifest.history[index].v1_compatibility.clone().into_bytes();
        let image = parse_image(&manifest.history[index].v1_compatibility)?;
        let already_exists = graph.exists(&image.id).await;
        plan.push(PlannedLayer {
            index,
            image,
            raw_json,
            digest: manifest.fs_layers[index].blob_sum.clone(),
            already_exists,
        });
    }
    Ok(plan)
}

fn parse_image(v1_compatibility: &str) -> TransferResult<ImageMetadata> {
    serde_json::from_str(v1_compatibility)
        .map_err(|e| TransferError::Manifest(format!("invalid v1Compatibility json: {e}")))
}

fn parse_image_id(v1_compatibility: &str) -> TransferResult<String> {
    Ok(parse_image(v1_compatibility)?.id)
}

struct DownloadedLayer {
    index: usize,
    image: ImageMetadata,
    raw_json: Vec<u8>,
    file: tokio::fs::File,
}

/// Spawns one download task per missing layer; tasks proceed in
/// parallel (spec.md §4.5.1 step 3c, "Concurrency").
async fn download_layers(
    plan: &[PlannedLayer],
    repo: &dyn Repository,
    pool: &Arc<TransferPool>,
    sink: &dyn crate::event::EventSink,
) -> TransferResult<Vec<DownloadedLayer>> {
    let tmp_dir = std::env::temp_dir();

    // `repo` is borrowed from the caller's stack frame for the duration
    // of this pull, so the per-layer futures run concurrently on this
    // task rather than as separately spawned `'static` tasks; each still
    // goes through its own pool acquire/release (spec.md §4.5.1 step
    // 3c, "Concurrency: downloads for distinct layers … proceed in
    // parallel").
    let futures = plan.iter().filter(|layer| !layer.already_exists).map(|layer| {
        let image = layer.image.clone();
        let raw_json = layer.raw_json.clone();
        let digest = layer.digest.clone();
        let index = layer.index;
        let key = format!("img:{}", image.id);
        let tmp_path = tmp_dir.join(format!("{}-{}", image.id, crate::util::random_hex_id()));

        async move {
            match pool.acquire(Kind::Pull, &key) {
                Role::Follower(handle) => {
                    handle.wait().await.map_err(TransferError::from)?;
                    Ok(None)
                }
                Role::Owner(broadcaster) => {
                    sink.emit(Event::Verifying { layer: image.id.clone() });
                    let result = fetch_and_verify(repo, &digest, &tmp_path).await;
                    let pool_result = result
                        .as_ref()
                        .map(|_| ())
                        .map_err(|e: &TransferError| crate::error::PoolError::Failed(key.clone(), e.to_string()));
                    pool.release(Kind::Pull, &key, broadcaster, pool_result);
                    let file = result?;
                    Ok(Some(DownloadedLayer { index, image, raw_json, file }))
                }
            }
        }
    });

    for layer in plan.iter().filter(|layer| layer.already_exists) {
        sink.emit(Event::AlreadyExists { layer: layer.image.id.clone() });
    }

    let mut downloaded = Vec::new();
    for result in futures::future::join_all(futures).await {
        let result: TransferResult<Option<DownloadedLayer>> = result;
        if let Some(layer) = result? {
            sink.emit(Event::DownloadComplete { layer: layer.image.id.clone(), bytes: 0 });
            downloaded.push(layer);
        }
    }
    Ok(downloaded)
}

async fn fetch_and_verify(
    repo: &dyn Repository,
    digest: &str,
    tmp_path: &std::path::Path,
) -> TransferResult<tokio::fs::File> {
    let expected = Digest::parse(digest)
        .ok_or_else(|| TransferError::Manifest(format!("malformed layer digest {digest}")))?;
    let mut remote = repo.blobs().open_download(digest).await?;
    let mut file = tokio::fs::File::create(tmp_path)
        .await
        .map_err(|e| TransferError::LayerTransferFailed { layer: digest.to_string(), cause: e.to_string() })?;

    let mut verifier = Verifier::new(expected);
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = remote
            .read(&mut buf)
            .await
            .map_err(|e| TransferError::LayerTransferFailed { layer: digest.to_string(), cause: e.to_string() })?;
        if n == 0 {
            break;
        }
        verifier.update(&buf[..n]);
        file.write_all(&buf[..n])
            .await
            .map_err(|e| TransferError::LayerTransferFailed { layer: digest.to_string(), cause: e.to_string() })?;
    }
    verifier
        .finish()
        .map_err(|_actual| TransferError::LayerDigestVerificationFailed { layer: digest.to_string() })?;

    file.seek(std::io::SeekFrom::Start(0))
        .await
        .map_err(|e| TransferError::LayerTransferFailed { layer: digest.to_string(), cause: e.to_string() })?;
    Ok(file)
}

/// Registers downloaded layers in reverse manifest order (last index
/// first, i.e. base before child) so every `register` finds its parent
/// already present (spec.md §4.5.1 step 3d).
async fn register_layers(
    graph: &Arc<Graph>,
    manifest: &ManifestV2,
    mut downloaded: Vec<DownloadedLayer>,
) -> TransferResult<()> {
    downloaded.sort_by(|a, b| b.index.cmp(&a.index));
    for layer in downloaded {
        let digest = manifest.fs_layers[layer.index].blob_sum.clone();
        graph.register_raw(layer.image.clone(), layer.raw_json.clone(), Box::new(layer.file)).await?;
        graph.set_digest(&layer.image.id, &digest).await?;
    }
    Ok(())
}

//! Load/Save: the tar-stream export format (spec.md §6 "Export format").
//!
//! An export is a single tar archive: one directory per image
//! (`VERSION`, `json`, `layer.tar`) plus a top-level `repositories` JSON
//! mapping names to tags to image ids. Building and parsing the archive
//! itself is synchronous (the `tar` crate has no async API), so this
//! module buffers the whole stream in memory the way the teacher crate's
//! `exporter` does for its save bundles.

use crate::graph::{Graph, ImageId, ImageMetadata};
use crate::tagstore::{Repository, TagStore};
use std::collections::{BTreeMap, HashSet};
use std::io::Read;
use tokio::io::AsyncReadExt;

const VERSION_CONTENTS: &[u8] = b"1.0";
const REPOSITORIES_FILE: &str = "repositories";

#[derive(Debug)]
pub enum ExportError {
    Graph(crate::error::GraphError),
    TagStore(crate::error::TagStoreError),
    UnknownName(String),
    Tar(String),
    Json(serde_json::Error),
}

impl std::fmt::Display for ExportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExportError::Graph(e) => write!(f, "{e}"),
            ExportError::TagStore(e) => write!(f, "{e}"),
            ExportError::UnknownName(name) => write!(f, "no such image or tag: {name}"),
            ExportError::Tar(msg) => write!(f, "tar error: {msg}"),
            ExportError::Json(e) => write!(f, "json error: {e}"),
        }
    }
}

impl std::error::Error for ExportError {}

impl From<crate::error::GraphError> for ExportError {
    fn from(e: crate::error::GraphError) -> Self {
        ExportError::Graph(e)
    }
}

impl From<crate::error::TagStoreError> for ExportError {
    fn from(e: crate::error::TagStoreError) -> Self {
        ExportError::TagStore(e)
    }
}

/// Builds a tar stream containing `names` (repositories or
/// `repository:tag`/`repository@digest` references) and every ancestor
/// each one needs (spec.md §6 "For each image: a directory").
pub async fn save(graph: &Graph, tagstore: &TagStore, names: &[String]) -> Result<Vec<u8>, ExportError> {
    let mut needed: HashSet<ImageId> = HashSet::new();
    let mut repository_names: HashSet<String> = HashSet::new();

    for name in names {
        let image = tagstore.lookup_image(name).await?.ok_or_else(|| ExportError::UnknownName(name.clone()))?;
        let mut current = image.id().to_string();
        loop {
            if !needed.insert(current.clone()) {
                break;
            }
            let image = graph.get(&current).await?;
            if image.parent().is_empty() {
                break;
            }
            current = image.parent().to_string();
        }
        let (repository, _reference) = crate::tagstore::reference::parse_name(name);
        repository_names.insert(repository);
    }

    let mut entries: Vec<(ImageId, Vec<u8>, Vec<u8>)> = Vec::with_capacity(needed.len());
    for id in &needed {
        let json = graph.raw_json(id).await?;
        let mut reader = graph.tar_layer(id).await?;
        let mut layer = Vec::new();
        reader.read_to_end(&mut layer).await.map_err(|e| ExportError::Tar(e.to_string()))?;
        entries.push((id.clone(), json, layer));
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let mut repositories: BTreeMap<String, Repository> = BTreeMap::new();
    let snapshot = tagstore.snapshot().await?;
    for name in &repository_names {
        if let Some(repo_map) = snapshot.get(name) {
            repositories.insert(name.clone(), repo_map.clone());
        }
    }
    let repositories_json =
        serde_json::to_vec_pretty(&repositories).map_err(ExportError::Json)?;

    build_tar(&entries, &repositories_json)
}

fn build_tar(entries: &[(ImageId, Vec<u8>, Vec<u8>)], repositories_json: &[u8]) -> Result<Vec<u8>, ExportError> {
    let mut builder = tar::Builder::new(Vec::new());

    for (id, json, layer) in entries {
        append_file(&mut builder, &format!("{id}/VERSION"), VERSION_CONTENTS)?;
        append_file(&mut builder, &format!("{id}/json"), json)?;
        append_file(&mut builder, &format!("{id}/layer.tar"), layer)?;
    }
    append_file(&mut builder, REPOSITORIES_FILE, repositories_json)?;

    builder.into_inner().map_err(|e| ExportError::Tar(e.to_string()))
}

fn append_file(builder: &mut tar::Builder<Vec<u8>>, path: &str, contents: &[u8]) -> Result<(), ExportError> {
    let mut header = tar::Header::new_gnu();
    header.set_path(path).map_err(|e| ExportError::Tar(e.to_string()))?;
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append(&header, contents).map_err(|e| ExportError::Tar(e.to_string()))
}

/// Parses a tar stream produced by [`save`], registering every image
/// (parent before child) and restoring its tags, returning the ids that
/// were newly registered (spec.md §6 "Load recursively ensures each
/// image's parent is loaded before the image itself").
pub async fn load(graph: &Graph, tagstore: &TagStore, tar_bytes: &[u8]) -> Result<Vec<ImageId>, ExportError> {
    let mut images: BTreeMap<ImageId, (Vec<u8>, Vec<u8>)> = BTreeMap::new();
    let mut repositories: BTreeMap<String, Repository> = BTreeMap::new();

    let mut archive = tar::Archive::new(tar_bytes);
    for entry in archive.entries().map_err(|e| ExportError::Tar(e.to_string()))? {
        let mut entry = entry.map_err(|e| ExportError::Tar(e.to_string()))?;
        let path = entry.path().map_err(|e| ExportError::Tar(e.to_string()))?.to_path_buf();
        let mut contents = Vec::new();
        entry.read_to_end(&mut contents).map_err(|e| ExportError::Tar(e.to_string()))?;

        let path_str = path.to_string_lossy().into_owned();
        if path_str == REPOSITORIES_FILE {
            repositories = serde_json::from_slice(&contents).map_err(ExportError::Json)?;
            continue;
        }
        let Some((id, file_name)) = path_str.split_once('/') else { continue };
        let entry = images.entry(id.to_string()).or_insert_with(|| (Vec::new(), Vec::new()));
        match file_name {
            "json" => entry.0 = contents,
            "layer.tar" => entry.1 = contents,
            _ => {}
        }
    }

    let mut loaded = Vec::new();
    let mut visiting: HashSet<ImageId> = HashSet::new();
    for id in images.keys().cloned().collect::<Vec<_>>() {
        load_one(graph, &images, &id, &mut visiting, &mut loaded).await?;
    }

    for (repository, repo_map) in &repositories {
        for (reference, image_id) in repo_map {
            if crate::digest::Digest::parse(reference).is_some() {
                tagstore.set_digest(repository, reference, image_id, true).await?;
            } else {
                tagstore.tag(repository, reference, image_id, true, false).await?;
            }
        }
    }

    Ok(loaded)
}

fn load_one<'a>(
    graph: &'a Graph,
    images: &'a BTreeMap<ImageId, (Vec<u8>, Vec<u8>)>,
    id: &'a str,
    visiting: &'a mut HashSet<ImageId>,
    loaded: &'a mut Vec<ImageId>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), ExportError>> + 'a>> {
    Box::pin(async move {
        if graph.exists(id).await {
            return Ok(());
        }
        if !visiting.insert(id.to_string()) {
            return Err(ExportError::Tar(format!("cycle detected loading image {id}")));
        }

        let (json, layer) = images
            .get(id)
            .ok_or_else(|| ExportError::Tar(format!("archive references unknown image {id}")))?;
        let metadata: ImageMetadata = serde_json::from_slice(json).map_err(ExportError::Json)?;

        if !metadata.parent.is_empty() && !graph.exists(&metadata.parent).await {
            load_one(graph, images, &metadata.parent, visiting, loaded).await?;
        }

        graph.register_raw(metadata, json.clone(), Box::new(std::io::Cursor::new(layer.clone()))).await?;
        loaded.push(id.to_string());
        Ok(())
    })
}

//! The name index mapping `(repository, reference)` to an image id
//! (spec.md §4.2).

use super::reference::{self, DEFAULT_REFERENCE};
use crate::error::{TagStoreError, TagStoreResult};
use crate::event::{Event, EventSink, NullSink};
use crate::graph::{Graph, Image, ImageId};
use crate::pool::TransferPool;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

/// A single repository: reference name (tag or digest string) -> image id.
pub type Repository = BTreeMap<String, ImageId>;

#[derive(Debug, Default, Serialize, Deserialize, Clone, PartialEq, Eq)]
struct TagStoreState {
    #[serde(rename = "Repositories")]
    repositories: BTreeMap<String, Repository>,
}

/// Name index + persistence + the [`TransferPool`] shared by every
/// transfer the store drives (spec.md §4.2).
pub struct TagStore {
    path: PathBuf,
    graph: Arc<Graph>,
    pool: Arc<TransferPool>,
    sink: Arc<dyn EventSink>,
    // Serializes the whole read-modify-write cycle; the JSON file itself
    // is always re-read at the start of that cycle (spec.md §4.2
    // "Persistence discipline").
    write_lock: AsyncMutex<()>,
}

impl TagStore {
    pub async fn new(path: impl Into<PathBuf>, graph: Arc<Graph>) -> TagStoreResult<Self> {
        Self::with_sink(path, graph, Arc::new(NullSink)).await
    }

    pub async fn with_sink(
        path: impl Into<PathBuf>,
        graph: Arc<Graph>,
        sink: Arc<dyn EventSink>,
    ) -> TagStoreResult<Self> {
        let path = path.into();
        if !path.exists() {
            persist(&path, &TagStoreState::default()).await?;
        }
        Ok(Self { path, graph, pool: Arc::new(TransferPool::new()), sink, write_lock: AsyncMutex::new(()) })
    }

    pub fn pool(&self) -> &Arc<TransferPool> {
        &self.pool
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    async fn load(&self) -> TagStoreResult<TagStoreState> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => {
                if bytes.is_empty() {
                    Ok(TagStoreState::default())
                } else {
                    serde_json::from_slice(&bytes).map_err(|e| TagStoreError::Persistence {
                        path: self.path.clone(),
                        message: e.to_string(),
                    })
                }
            }
            Err(_) => Ok(TagStoreState::default()),
        }
    }

    fn get_image_id(state: &TagStoreState, repository: &str, reference: &str) -> Option<ImageId> {
        state.repositories.get(repository)?.get(reference).cloned()
    }

    /// Parses `name`, consults the name index, and falls back to
    /// `graph.get(name)` (the caller may have typed an id or prefix).
    /// Returns `Ok(None)` — not an error — when nothing matches
    /// (spec.md §4.2 "lookup_image").
    pub async fn lookup_image(&self, name: &str) -> TagStoreResult<Option<Image>> {
        let (repository, reference) = reference::parse_name(name);
        let state = self.load().await?;
        if let Some(id) = Self::get_image_id(&state, &repository, reference.as_str()) {
            return Ok(Some(self.graph.get(&id).await?));
        }
        match self.graph.get(name).await {
            Ok(image) => Ok(Some(image)),
            Err(_) => Ok(None),
        }
    }

    /// Resolves `source` to an image, validates `repository`/`tag_name`,
    /// and writes the mapping (spec.md §4.2 "tag").
    ///
    /// `keep_unqualified` is accepted for interface parity with the
    /// source system but, per spec.md §9's open question, has no
    /// behavioral effect here: repository names are always stored
    /// unchanged in the index key, with no implicit registry-host
    /// qualification.
    pub async fn tag(
        &self,
        repository: &str,
        tag_name: &str,
        source: &str,
        force: bool,
        _keep_unqualified: bool,
    ) -> TagStoreResult<ImageId> {
        if !reference::is_valid_repository(repository) {
            return Err(TagStoreError::InvalidRepositoryName(repository.to_string()));
        }
        let tag_name = if tag_name.is_empty() { DEFAULT_REFERENCE } else { tag_name };
        if !reference::is_valid_tag(tag_name) {
            return Err(TagStoreError::InvalidReferenceFormat {
                reference: tag_name.to_string(),
                reason: "must match [A-Za-z0-9_][A-Za-z0-9_.-]{0,127}".to_string(),
            });
        }
        let image = self
            .lookup_image(source)
            .await?
            .ok_or_else(|| TagStoreError::NotFound(source.to_string()))?;

        let _guard = self.write_lock.lock().await;
        let mut state = self.load().await?;
        let repo_map = state.repositories.entry(repository.to_string()).or_default();
        if !force {
            if let Some(existing) = repo_map.get(tag_name) {
                if existing != image.id() {
                    return Err(TagStoreError::TagConflict {
                        repository: repository.to_string(),
                        reference: tag_name.to_string(),
                        existing: existing.clone(),
                    });
                }
            }
        }
        repo_map.insert(tag_name.to_string(), image.id().to_string());
        persist(&self.path, &state).await?;
        self.sink.emit(Event::Tagging {
            repository: repository.to_string(),
            reference: tag_name.to_string(),
            image_id: image.id().to_string(),
        });
        Ok(image.id().to_string())
    }

    /// Same shape as [`Self::tag`] but the reference is a digest
    /// (spec.md §4.2 "set_digest").
    pub async fn set_digest(
        &self,
        repository: &str,
        digest: &str,
        source: &str,
        force: bool,
    ) -> TagStoreResult<ImageId> {
        if !reference::is_valid_repository(repository) {
            return Err(TagStoreError::InvalidRepositoryName(repository.to_string()));
        }
        if !reference::is_valid_digest(digest) {
            return Err(TagStoreError::InvalidReferenceFormat {
                reference: digest.to_string(),
                reason: "must be <alg>:<hex>".to_string(),
            });
        }
        let image = self
            .lookup_image(source)
            .await?
            .ok_or_else(|| TagStoreError::NotFound(source.to_string()))?;

        let _guard = self.write_lock.lock().await;
        let mut state = self.load().await?;
        let repo_map = state.repositories.entry(repository.to_string()).or_default();
        if !force {
            if let Some(existing) = repo_map.get(digest) {
                if existing != image.id() {
                    return Err(TagStoreError::TagConflict {
                        repository: repository.to_string(),
                        reference: digest.to_string(),
                        existing: existing.clone(),
                    });
                }
            }
        }
        repo_map.insert(digest.to_string(), image.id().to_string());
        persist(&self.path, &state).await?;
        Ok(image.id().to_string())
    }

    /// Removes a single reference, or the whole repository if
    /// `reference_name` is empty. `true` iff something was removed
    /// (spec.md §4.2 "delete").
    pub async fn delete(&self, repository: &str, reference_name: &str) -> TagStoreResult<bool> {
        let _guard = self.write_lock.lock().await;
        let mut state = self.load().await?;
        let removed = if reference_name.is_empty() {
            state.repositories.remove(repository).is_some()
        } else {
            match state.repositories.get_mut(repository) {
                Some(repo_map) => {
                    let removed = repo_map.remove(reference_name).is_some();
                    if repo_map.is_empty() {
                        state.repositories.remove(repository);
                    }
                    removed
                }
                None => false,
            }
        };
        if removed {
            persist(&self.path, &state).await?;
        }
        Ok(removed)
    }

    /// The full persisted mapping, for export (spec.md §6 "Export format").
    pub async fn snapshot(&self) -> TagStoreResult<BTreeMap<String, Repository>> {
        Ok(self.load().await?.repositories)
    }
}

async fn persist(path: &Path, state: &TagStoreState) -> TagStoreResult<()> {
    let json = serde_json::to_vec_pretty(state).map_err(|e| TagStoreError::Persistence {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, json).await.map_err(|e| TagStoreError::Persistence {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    tokio::fs::rename(&tmp, path).await.map_err(|e| TagStoreError::Persistence {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

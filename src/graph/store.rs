//! The content-addressed image store (spec.md §4.1).

use super::driver::{GraphDriver, LayerReader};
use super::image::{Image, ImageId, ImageMetadata, RuntimeConfig};
use super::tarsplit::TarSplitMetadata;
use crate::error::{GraphError, GraphResult};
use crate::event::{Event, EventSink, NullSink};
use crate::util::{now_rfc3339, random_hex_id};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncReadExt;

const JSON_FILE: &str = "json";
const LAYERSIZE_FILE: &str = "layersize";
const CHECKSUM_FILE: &str = "checksum";
const TARSPLIT_FILE: &str = "tar-split.json.gz";
const TMP_DIR: &str = "_tmp";

fn is_valid_id(id: &str) -> bool {
    id.len() == 64 && id.chars().all(|c| c.is_ascii_hexdigit())
}

/// The Graph owns `root` on disk and an in-memory prefix index of every
/// id present there. All mutation funnels through `register`/`delete`,
/// both of which keep the index and the on-disk layout in lockstep
/// (spec.md §3 invariants).
pub struct Graph {
    root: PathBuf,
    driver: Arc<dyn GraphDriver>,
    index: Mutex<BTreeSet<ImageId>>,
    sink: Arc<dyn EventSink>,
}

impl Graph {
    /// Ensures `root` exists, scans it, and restores the prefix index
    /// (spec.md §4.1 "new"). Entries whose directory exists but whose
    /// driver state doesn't are skipped as stale.
    pub async fn new(root: impl Into<PathBuf>, driver: Arc<dyn GraphDriver>) -> GraphResult<Self> {
        Self::with_sink(root, driver, Arc::new(NullSink)).await
    }

    pub async fn with_sink(
        root: impl Into<PathBuf>,
        driver: Arc<dyn GraphDriver>,
        sink: Arc<dyn EventSink>,
    ) -> GraphResult<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        tokio::fs::create_dir_all(root.join(TMP_DIR)).await?;

        let mut index = BTreeSet::new();
        let mut entries = tokio::fs::read_dir(&root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name == TMP_DIR || !is_valid_id(&name) {
                continue;
            }
            if entry.path().join(JSON_FILE).exists() && driver.exists(&name).await {
                index.insert(name);
            }
        }

        Ok(Self { root, driver, index: Mutex::new(index), sink })
    }

    fn image_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    fn resolve(&self, id_or_prefix: &str) -> GraphResult<ImageId> {
        let index = self.index.lock().unwrap();
        if index.contains(id_or_prefix) {
            return Ok(id_or_prefix.to_string());
        }
        let mut matches = index.iter().filter(|id| id.starts_with(id_or_prefix));
        let first = matches.next().cloned();
        match first {
            None => Err(GraphError::ImageNotFound(id_or_prefix.to_string())),
            Some(id) => {
                if matches.next().is_some() {
                    Err(GraphError::AmbiguousPrefix(id_or_prefix.to_string()))
                } else {
                    Ok(id)
                }
            }
        }
    }

    /// `true` iff `get(id)` would succeed.
    pub async fn exists(&self, id: &str) -> bool {
        self.get(id).await.is_ok()
    }

    /// Resolves `id_or_prefix`, reads `json` and `layersize`, lazily
    /// computing and persisting `layersize` via the driver if absent.
    pub async fn get(&self, id_or_prefix: &str) -> GraphResult<Image> {
        let id = self.resolve(id_or_prefix)?;
        let dir = self.image_dir(&id);

        let json_bytes = tokio::fs::read(dir.join(JSON_FILE)).await?;
        let metadata: ImageMetadata = serde_json::from_slice(&json_bytes)?;
        if metadata.id != id {
            return Err(GraphError::WrongId { path: id, stored: metadata.id });
        }

        let layersize_path = dir.join(LAYERSIZE_FILE);
        let layer_size = match tokio::fs::read_to_string(&layersize_path).await {
            Ok(contents) => contents.trim().parse::<u64>().unwrap_or(0),
            Err(_) => {
                let size = self
                    .driver
                    .diff_size(&id, &metadata.parent)
                    .await
                    .map_err(GraphError::Driver)?;
                tokio::fs::write(&layersize_path, size.to_string()).await?;
                size
            }
        };

        Ok(Image { metadata, layer_size })
    }

    /// Returns the exact bytes of `<id>/json`, never re-serialized
    /// (spec.md §9 "Byte-exact JSON").
    pub async fn raw_json(&self, id_or_prefix: &str) -> GraphResult<Vec<u8>> {
        let id = self.resolve(id_or_prefix)?;
        Ok(tokio::fs::read(self.image_dir(&id).join(JSON_FILE)).await?)
    }

    pub async fn get_digest(&self, id_or_prefix: &str) -> GraphResult<String> {
        let id = self.resolve(id_or_prefix)?;
        match tokio::fs::read_to_string(self.image_dir(&id).join(CHECKSUM_FILE)).await {
            Ok(contents) => Ok(contents.trim().to_string()),
            Err(_) => Err(GraphError::DigestNotSet(id)),
        }
    }

    pub async fn set_digest(&self, id_or_prefix: &str, digest: &str) -> GraphResult<()> {
        let id = self.resolve(id_or_prefix)?;
        let dir = self.image_dir(&id);
        write_atomic(&dir.join(CHECKSUM_FILE), digest.as_bytes()).await?;
        Ok(())
    }

    /// Registers `metadata` with its layer content read from
    /// `layer_reader` (spec.md §4.1 "register"). The `json` file is
    /// re-serialized from `metadata`; callers that already hold the
    /// exact wire bytes they decoded `metadata` from (a pulled or
    /// loaded image) must use [`Self::register_raw`] instead, or the
    /// stored bytes will no longer match what was digested/signed
    /// upstream (spec.md §9 "Byte-exact JSON").
    pub async fn register(&self, metadata: ImageMetadata, layer_reader: LayerReader) -> GraphResult<Image> {
        let raw_json = serde_json::to_vec(&metadata)?;
        self.register_raw(metadata, raw_json, layer_reader).await
    }

    /// Registers `metadata` the same way as [`Self::register`], but
    /// persists `raw_json` verbatim as the `json` file instead of
    /// re-serializing `metadata` (spec.md §9 "Implement by storing and
    /// returning raw bytes, never re-serializing from the decoded
    /// record when the output will be digested or signed"). Callers
    /// parsing externally-supplied image json — a v2 manifest's
    /// history entry, a v1 image json response, a loaded export — must
    /// go through this path so `raw_json` keeps returning exactly what
    /// was received.
    pub async fn register_raw(
        &self,
        metadata: ImageMetadata,
        raw_json: Vec<u8>,
        layer_reader: LayerReader,
    ) -> GraphResult<Image> {
        if !is_valid_id(&metadata.id) {
            return Err(GraphError::InvalidId(metadata.id.clone()));
        }
        let id = metadata.id.clone();

        {
            let index = self.index.lock().unwrap();
            if index.contains(&id) {
                return Err(GraphError::Driver(format!("duplicate image id {id}")));
            }
        }

        // Remove any stale, not-yet-indexed leftovers from a previous
        // failed attempt at this id.
        let final_dir = self.image_dir(&id);
        if final_dir.exists() {
            let _ = tokio::fs::remove_dir_all(&final_dir).await;
        }
        let _ = self.driver.remove(&id).await;

        let tmp_dir = self.root.join(TMP_DIR).join(random_hex_id());
        tokio::fs::create_dir_all(&tmp_dir).await?;

        let result = self.store_image(&tmp_dir, &metadata, &raw_json, layer_reader).await;
        let layer_size = match result {
            Ok(size) => size,
            Err(e) => {
                let _ = self.driver.remove(&id).await;
                let _ = tokio::fs::remove_dir_all(&tmp_dir).await;
                return Err(e);
            }
        };

        if let Err(e) = tokio::fs::rename(&tmp_dir, &final_dir).await {
            let _ = self.driver.remove(&id).await;
            let _ = tokio::fs::remove_dir_all(&tmp_dir).await;
            return Err(e.into());
        }

        self.index.lock().unwrap().insert(id.clone());

        Ok(Image { metadata, layer_size })
    }

    async fn store_image(
        &self,
        tmp_dir: &Path,
        metadata: &ImageMetadata,
        raw_json: &[u8],
        layer_reader: LayerReader,
    ) -> GraphResult<u64> {
        self.driver
            .create(&metadata.id, &metadata.parent)
            .await
            .map_err(GraphError::Driver)?;

        let size = self
            .driver
            .apply_diff(&metadata.id, &metadata.parent, layer_reader)
            .await
            .map_err(GraphError::Driver)?;

        tokio::fs::write(tmp_dir.join(JSON_FILE), raw_json).await?;
        tokio::fs::write(tmp_dir.join(LAYERSIZE_FILE), size.to_string()).await?;

        Ok(size)
    }

    /// Generates a random id and delegates to [`Self::register`]
    /// (spec.md §4.1 "create").
    pub async fn create(
        &self,
        layer_reader: LayerReader,
        container_id: Option<String>,
        parent: &str,
        comment: Option<String>,
        author: Option<String>,
        container_config: Option<RuntimeConfig>,
        config: Option<RuntimeConfig>,
    ) -> GraphResult<Image> {
        let metadata = ImageMetadata {
            id: random_hex_id(),
            parent: parent.to_string(),
            created: now_rfc3339(),
            container: container_id,
            container_config,
            config,
            architecture: None,
            os: None,
            author,
            comment,
            docker_version: None,
        };
        self.register(metadata, layer_reader).await
    }

    /// Removes `id_or_prefix` from the index (so lookups fail fast),
    /// then the on-disk directory (via a trash rename), then asks the
    /// driver to drop its state (spec.md §4.1 "delete").
    pub async fn delete(&self, id_or_prefix: &str) -> GraphResult<()> {
        let id = self.resolve(id_or_prefix)?;
        self.index.lock().unwrap().remove(&id);

        let dir = self.image_dir(&id);
        let trash = self.root.join(TMP_DIR).join(format!("trash-{}", random_hex_id()));
        if dir.exists() {
            tokio::fs::rename(&dir, &trash).await?;
        }
        let _ = self.driver.remove(&id).await;
        if trash.exists() {
            tokio::fs::remove_dir_all(&trash).await?;
        }
        Ok(())
    }

    /// Every registered image, tolerating and skipping per-entry load
    /// failures.
    pub async fn map(&self) -> HashMap<ImageId, Image> {
        let ids: Vec<ImageId> = self.index.lock().unwrap().iter().cloned().collect();
        let mut out = HashMap::new();
        for id in ids {
            match self.get(&id).await {
                Ok(image) => {
                    out.insert(id, image);
                }
                Err(e) => {
                    self.sink.emit(Event::Error { subject: id, message: e.to_string() });
                }
            }
        }
        out
    }

    /// Images that are not any other image's parent.
    pub async fn heads(&self) -> HashMap<ImageId, Image> {
        let all = self.map().await;
        let parents: std::collections::HashSet<String> =
            all.values().map(|img| img.parent().to_string()).filter(|p| !p.is_empty()).collect();
        all.into_iter().filter(|(id, _)| !parents.contains(id.as_str())).collect()
    }

    /// `parent id -> [child ids]` adjacency over every registered image.
    pub async fn by_parent(&self) -> HashMap<ImageId, Vec<ImageId>> {
        let all = self.map().await;
        let mut out: HashMap<ImageId, Vec<ImageId>> = HashMap::new();
        for (id, image) in &all {
            if !image.parent().is_empty() {
                out.entry(image.parent().to_string()).or_default().push(id.clone());
            }
        }
        out
    }

    /// A tar stream of `image`'s layer: byte-exact via tar-split metadata
    /// if present, otherwise the driver's own diff (spec.md §4.1
    /// "tar_layer").
    pub async fn tar_layer(&self, id_or_prefix: &str) -> GraphResult<LayerReader> {
        let id = self.resolve(id_or_prefix)?;
        let metadata = self.get(&id).await?.metadata;
        let tarsplit_path = self.image_dir(&id).join(TARSPLIT_FILE);

        if let Ok(gz) = tokio::fs::read(&tarsplit_path).await {
            let meta = TarSplitMetadata::from_gz(&gz)?;
            let mut payload = self
                .driver
                .diff(&id, &metadata.parent)
                .await
                .map_err(GraphError::Driver)?;
            let mut payload_bytes = Vec::new();
            payload.read_to_end(&mut payload_bytes).await?;
            let rebuilt = meta.reassemble(std::io::Cursor::new(payload_bytes))?;
            return Ok(Box::new(std::io::Cursor::new(rebuilt)));
        }

        self.driver.diff(&id, &metadata.parent).await.map_err(GraphError::Driver)
    }

    /// Persists tar-split metadata for `id`, so future [`Self::tar_layer`]
    /// calls reproduce the exact bytes `original_tar` contained.
    pub async fn record_tar_split(
        &self,
        id_or_prefix: &str,
        original_tar: &[u8],
        payload_ranges: &[(usize, usize)],
    ) -> GraphResult<()> {
        let id = self.resolve(id_or_prefix)?;
        let meta = TarSplitMetadata::record(original_tar, payload_ranges);
        let gz = meta.to_gz()?;
        tokio::fs::write(self.image_dir(&id).join(TARSPLIT_FILE), gz).await?;
        Ok(())
    }

    /// Materializes [`Self::tar_layer`]'s output to a temp file under the
    /// graph root and returns a reader over it (spec.md §4.1
    /// "temp_layer_archive").
    pub async fn temp_layer_archive(&self, id_or_prefix: &str) -> GraphResult<tokio::fs::File> {
        let mut reader = self.tar_layer(id_or_prefix).await?;
        let path = self.root.join(TMP_DIR).join(random_hex_id());
        let mut file = tokio::fs::File::create(&path).await?;
        tokio::io::copy(&mut reader, &mut file).await?;
        use tokio::io::AsyncSeekExt;
        file.seek(std::io::SeekFrom::Start(0)).await?;
        Ok(file)
    }
}

async fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, path).await
}

pub mod test_support {
    use super::*;

    pub async fn new_test_graph() -> (Graph, Arc<super::super::driver::MemoryDriver>) {
        let driver = Arc::new(super::super::driver::MemoryDriver::new());
        let tmp = std::env::temp_dir().join(format!("graph-test-{}", random_hex_id()));
        let graph = Graph::new(tmp, driver.clone()).await.unwrap();
        (graph, driver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(id: &str, parent: &str) -> ImageMetadata {
        ImageMetadata {
            id: id.to_string(),
            parent: parent.to_string(),
            created: now_rfc3339(),
            container: None,
            container_config: None,
            config: None,
            architecture: None,
            os: None,
            author: None,
            comment: None,
            docker_version: None,
        }
    }

    fn layer(bytes: &'static [u8]) -> LayerReader {
        Box::new(std::io::Cursor::new(bytes))
    }

    #[tokio::test]
    async fn register_then_get_round_trips() {
        let (graph, _driver) = test_support::new_test_graph().await;
        let id = random_hex_id();
        graph.register(metadata(&id, ""), layer(b"hello")).await.unwrap();
        let image = graph.get(&id).await.unwrap();
        assert_eq!(image.id(), id);
        assert_eq!(image.layer_size, 5);
    }

    #[tokio::test]
    async fn get_by_unique_prefix_matches_full_id() {
        let (graph, _driver) = test_support::new_test_graph().await;
        let id = random_hex_id();
        graph.register(metadata(&id, ""), layer(b"x")).await.unwrap();
        let by_full = graph.get(&id).await.unwrap();
        let by_prefix = graph.get(&id[..12]).await.unwrap();
        assert_eq!(by_full.id(), by_prefix.id());
    }

    #[tokio::test]
    async fn ambiguous_prefix_fails() {
        let (graph, _driver) = test_support::new_test_graph().await;
        let mut id_a = "a".repeat(64);
        let mut id_b = "a".repeat(64);
        id_a.replace_range(63..64, "1");
        id_b.replace_range(63..64, "2");
        graph.register(metadata(&id_a, ""), layer(b"x")).await.unwrap();
        graph.register(metadata(&id_b, ""), layer(b"y")).await.unwrap();
        let err = graph.get(&"a".repeat(63)).await.unwrap_err();
        assert!(matches!(err, GraphError::AmbiguousPrefix(_)));
    }

    #[tokio::test]
    async fn digest_round_trips_and_overwrites() {
        let (graph, _driver) = test_support::new_test_graph().await;
        let id = random_hex_id();
        graph.register(metadata(&id, ""), layer(b"x")).await.unwrap();
        assert!(matches!(graph.get_digest(&id).await, Err(GraphError::DigestNotSet(_))));
        graph.set_digest(&id, "sha256:aa").await.unwrap();
        assert_eq!(graph.get_digest(&id).await.unwrap(), "sha256:aa");
        graph.set_digest(&id, "sha256:bb").await.unwrap();
        assert_eq!(graph.get_digest(&id).await.unwrap(), "sha256:bb");
    }

    #[tokio::test]
    async fn delete_removes_index_and_get_fails() {
        let (graph, _driver) = test_support::new_test_graph().await;
        let id = random_hex_id();
        graph.register(metadata(&id, ""), layer(b"x")).await.unwrap();
        graph.delete(&id).await.unwrap();
        assert!(graph.get(&id).await.is_err());
    }

    #[tokio::test]
    async fn heads_excludes_parents() {
        let (graph, _driver) = test_support::new_test_graph().await;
        let base = random_hex_id();
        let child = random_hex_id();
        graph.register(metadata(&base, ""), layer(b"x")).await.unwrap();
        graph.register(metadata(&child, &base), layer(b"y")).await.unwrap();
        let heads = graph.heads().await;
        assert!(heads.contains_key(&child));
        assert!(!heads.contains_key(&base));
    }

    #[tokio::test]
    async fn restart_restores_index_from_disk() {
        let driver = Arc::new(super::super::driver::MemoryDriver::new());
        let root = std::env::temp_dir().join(format!("graph-restart-{}", random_hex_id()));
        let id = random_hex_id();
        {
            let graph = Graph::new(&root, driver.clone()).await.unwrap();
            graph.register(metadata(&id, ""), layer(b"x")).await.unwrap();
        }
        let graph2 = Graph::new(&root, driver).await.unwrap();
        assert!(graph2.exists(&id).await);
    }
}

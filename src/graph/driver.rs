//! The `GraphDriver` capability trait and an in-memory test double.
//!
//! Storage driver internals (overlay, copy-on-write, …) are explicitly out
//! of scope (spec.md §1); the Graph only ever calls through this narrow
//! trait, in the duck-typed-capability style the teacher crate uses for
//! its own seams (`src/common/traits.rs`: `Cacheable`, `ResourceManager`).

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::io::AsyncRead;

/// A boxed, owned async reader of layer bytes.
pub type LayerReader = Box<dyn AsyncRead + Send + Unpin>;

/// Pluggable storage backend for image layer data (spec.md §4.1,
/// §9 "Duck-typed driver / session").
#[async_trait]
pub trait GraphDriver: Send + Sync {
    /// Creates empty driver-side state for `id`, layered over `parent`
    /// (empty string for a base image).
    async fn create(&self, id: &str, parent: &str) -> Result<(), String>;

    /// `true` iff the driver has state registered for `id`.
    async fn exists(&self, id: &str) -> bool;

    /// Applies a tar diff read from `layer` on top of `id`'s existing
    /// (freshly created, empty) state, returning the number of bytes the
    /// diff occupies on disk.
    async fn apply_diff(&self, id: &str, parent: &str, layer: LayerReader) -> Result<u64, String>;

    /// Returns a tar stream of the diff between `id` and `parent`.
    async fn diff(&self, id: &str, parent: &str) -> Result<LayerReader, String>;

    /// Computes the on-disk size of the diff without materializing it.
    async fn diff_size(&self, id: &str, parent: &str) -> Result<u64, String>;

    /// Removes all driver-side state for `id`. Must be idempotent: it is
    /// called both to roll back a partially created image and to delete
    /// a fully registered one.
    async fn remove(&self, id: &str) -> Result<(), String>;
}

/// An in-memory [`GraphDriver`] for tests: layer bytes live in a
/// `HashMap`, "diffing" just returns the bytes stored at `create`/
/// `apply_diff` time.
#[derive(Default)]
pub struct MemoryDriver {
    layers: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GraphDriver for MemoryDriver {
    async fn create(&self, id: &str, _parent: &str) -> Result<(), String> {
        self.layers.lock().unwrap().entry(id.to_string()).or_insert_with(Vec::new);
        Ok(())
    }

    async fn exists(&self, id: &str) -> bool {
        self.layers.lock().unwrap().contains_key(id)
    }

    async fn apply_diff(&self, id: &str, _parent: &str, mut layer: LayerReader) -> Result<u64, String> {
        use tokio::io::AsyncReadExt;
        let mut buf = Vec::new();
        layer.read_to_end(&mut buf).await.map_err(|e| e.to_string())?;
        let len = buf.len() as u64;
        self.layers.lock().unwrap().insert(id.to_string(), buf);
        Ok(len)
    }

    async fn diff(&self, id: &str, _parent: &str) -> Result<LayerReader, String> {
        let bytes = self
            .layers
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| format!("no driver state for {id}"))?;
        Ok(Box::new(std::io::Cursor::new(bytes)))
    }

    async fn diff_size(&self, id: &str, parent: &str) -> Result<u64, String> {
        Ok(self
            .layers
            .lock()
            .unwrap()
            .get(id)
            .map(|v| v.len() as u64)
            .ok_or_else(|| format!("no driver state for {id} (parent {parent})"))?)
    }

    async fn remove(&self, id: &str) -> Result<(), String> {
        self.layers.lock().unwrap().remove(id);
        Ok(())
    }
}

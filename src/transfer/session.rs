//! Registry collaborator traits: everything the transfer engine needs
//! from a remote endpoint, kept narrow and duck-typed (spec.md §9
//! "Duck-typed driver / session"; SPEC_FULL.md §4.5a).
//!
//! The wire protocol itself (HTTP, auth, TLS) is out of scope (spec.md
//! §1 Non-goals); these traits are the seam a real client plugs into.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};

pub type BlobReader = Box<dyn AsyncRead + Send + Unpin>;

/// An in-progress upload. Real implementations stream straight to the
/// wire; [`UploadWriter::into_any`] lets a test double (like
/// [`MockRegistry`]) recover the concrete buffer at `commit` time
/// without the trait itself knowing about any particular backend.
pub trait UploadWriter: AsyncWrite + Send + Unpin {
    fn into_any(self: Box<Self>) -> Box<dyn std::any::Any>;
}

impl<T: AsyncWrite + Send + Unpin + 'static> UploadWriter for T {
    fn into_any(self: Box<Self>) -> Box<dyn std::any::Any> {
        self
    }
}

pub type BlobWriter = Box<dyn UploadWriter>;

/// An in-memory upload buffer for [`MockRegistry`]: plain append-to-`Vec`
/// semantics, so tests never depend on a particular runtime's `Vec<u8>`
/// `AsyncWrite` impl.
#[derive(Default)]
pub struct RecordingBuffer(pub Vec<u8>);

impl AsyncWrite for RecordingBuffer {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        self.0.extend_from_slice(buf);
        std::task::Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }
}

/// `true` iff `blob_service.stat` found the digest remotely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobStat {
    Known,
    Unknown,
}

/// Remote blob storage (spec.md §4.5.2 "blob_service.stat", "Upload").
#[async_trait]
pub trait BlobService: Send + Sync {
    async fn stat(&self, digest: &str) -> Result<BlobStat, crate::error::TransferError>;
    async fn open_download(&self, digest: &str) -> Result<BlobReader, crate::error::TransferError>;
    async fn open_upload(&self) -> Result<BlobWriter, crate::error::TransferError>;
    async fn commit(&self, writer: BlobWriter, digest: &str) -> Result<(), crate::error::TransferError>;
}

/// Remote manifest storage (spec.md §4.4 "load_manifest",
/// §4.5.2 "manifests.put").
#[async_trait]
pub trait ManifestService: Send + Sync {
    async fn get(&self, tag: &str) -> Result<(Vec<u8>, Option<String>), crate::error::TransferError>;
    async fn put(&self, tag: &str, signed: Vec<u8>) -> Result<(), crate::error::TransferError>;
}

/// A single repository-scoped handle to a remote endpoint.
#[async_trait]
pub trait Repository: Send + Sync {
    fn blobs(&self) -> &dyn BlobService;
    fn manifests(&self) -> &dyn ManifestService;

    /// v1-only: registers a tag directly with the remote (spec.md
    /// §4.5.3 "tags are registered via the session's push_tag").
    async fn push_tag(&self, tag: &str, image_id: &str) -> Result<(), crate::error::TransferError>;

    /// v1-only: full tag list for the repo.
    async fn tags(&self) -> Result<HashMap<String, String>, crate::error::TransferError>;

    /// v1-only: per-image json + layer tar fetch.
    async fn get_image_json(&self, image_id: &str) -> Result<Vec<u8>, crate::error::TransferError>;
    async fn get_image_layer(&self, image_id: &str) -> Result<BlobReader, crate::error::TransferError>;
    async fn put_image_json(&self, image_id: &str, json: &[u8]) -> Result<(), crate::error::TransferError>;
    async fn put_image_layer(&self, image_id: &str, layer: BlobReader) -> Result<(), crate::error::TransferError>;
    async fn put_image_checksum(&self, image_id: &str, digest: &str) -> Result<(), crate::error::TransferError>;
}

/// Establishes a [`Repository`] session for a given canonical name
/// (spec.md §4.5a "RegistrySession").
#[async_trait]
pub trait RegistrySession: Send + Sync {
    async fn open(&self, canonical_name: &str) -> Result<Box<dyn Repository>, crate::error::TransferError>;
}

/// An in-memory registry double for tests: blobs and manifests keyed by
/// string, tags keyed by name.
#[derive(Default)]
pub struct MockRegistry {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    manifests: Mutex<HashMap<String, (Vec<u8>, Option<String>)>>,
    tags: Mutex<HashMap<String, String>>,
    images: Mutex<HashMap<String, (Vec<u8>, Vec<u8>)>>,
    /// Digests whose `stat` should report `NoSupport` instead of
    /// `Unknown`, for exercising the v1 pull-by-digest rejection.
    pub reject_digest_pulls: bool,
}

impl MockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_blob(&self, digest: &str, bytes: Vec<u8>) {
        self.blobs.lock().unwrap().insert(digest.to_string(), bytes);
    }

    pub fn seed_manifest(&self, tag: &str, bytes: Vec<u8>, remote_digest: Option<String>) {
        self.manifests.lock().unwrap().insert(tag.to_string(), (bytes, remote_digest));
    }

    pub fn seed_tag(&self, tag: &str, image_id: &str) {
        self.tags.lock().unwrap().insert(tag.to_string(), image_id.to_string());
    }

    pub fn seed_image(&self, image_id: &str, json: Vec<u8>, layer: Vec<u8>) {
        self.images.lock().unwrap().insert(image_id.to_string(), (json, layer));
    }

    pub fn pushed_manifest(&self, tag: &str) -> Option<Vec<u8>> {
        self.manifests.lock().unwrap().get(tag).map(|(b, _)| b.clone())
    }

    pub fn pushed_blob(&self, digest: &str) -> Option<Vec<u8>> {
        self.blobs.lock().unwrap().get(digest).cloned()
    }

    pub fn tags_snapshot(&self) -> HashMap<String, String> {
        self.tags.lock().unwrap().clone()
    }

    pub fn has_image(&self, image_id: &str) -> bool {
        self.images.lock().unwrap().contains_key(image_id)
    }
}

#[async_trait]
impl BlobService for MockRegistry {
    async fn stat(&self, digest: &str) -> Result<BlobStat, crate::error::TransferError> {
        if self.blobs.lock().unwrap().contains_key(digest) {
            Ok(BlobStat::Known)
        } else {
            Ok(BlobStat::Unknown)
        }
    }

    async fn open_download(&self, digest: &str) -> Result<BlobReader, crate::error::TransferError> {
        let bytes = self
            .blobs
            .lock()
            .unwrap()
            .get(digest)
            .cloned()
            .ok_or_else(|| crate::error::TransferError::LayerTransferFailed {
                layer: digest.to_string(),
                cause: "not found on mock registry".to_string(),
            })?;
        Ok(Box::new(std::io::Cursor::new(bytes)))
    }

    async fn open_upload(&self) -> Result<BlobWriter, crate::error::TransferError> {
        Ok(Box::new(RecordingBuffer::default()) as BlobWriter)
    }

    async fn commit(&self, writer: BlobWriter, digest: &str) -> Result<(), crate::error::TransferError> {
        if let Ok(buf) = writer.into_any().downcast::<RecordingBuffer>() {
            self.blobs.lock().unwrap().insert(digest.to_string(), buf.0);
        }
        Ok(())
    }
}

#[async_trait]
impl ManifestService for MockRegistry {
    async fn get(&self, tag: &str) -> Result<(Vec<u8>, Option<String>), crate::error::TransferError> {
        self.manifests.lock().unwrap().get(tag).cloned().ok_or_else(|| {
            crate::error::TransferError::LayerTransferFailed {
                layer: tag.to_string(),
                cause: "no manifest seeded".to_string(),
            }
        })
    }

    async fn put(&self, tag: &str, signed: Vec<u8>) -> Result<(), crate::error::TransferError> {
        self.manifests.lock().unwrap().insert(tag.to_string(), (signed, None));
        Ok(())
    }
}

#[async_trait]
impl Repository for MockRegistry {
    fn blobs(&self) -> &dyn BlobService {
        self
    }

    fn manifests(&self) -> &dyn ManifestService {
        self
    }

    async fn push_tag(&self, tag: &str, image_id: &str) -> Result<(), crate::error::TransferError> {
        self.tags.lock().unwrap().insert(tag.to_string(), image_id.to_string());
        Ok(())
    }

    async fn tags(&self) -> Result<HashMap<String, String>, crate::error::TransferError> {
        Ok(self.tags.lock().unwrap().clone())
    }

    async fn get_image_json(&self, image_id: &str) -> Result<Vec<u8>, crate::error::TransferError> {
        self.images
            .lock()
            .unwrap()
            .get(image_id)
            .map(|(json, _)| json.clone())
            .ok_or_else(|| crate::error::TransferError::LayerTransferFailed {
                layer: image_id.to_string(),
                cause: "no image json seeded".to_string(),
            })
    }

    async fn get_image_layer(&self, image_id: &str) -> Result<BlobReader, crate::error::TransferError> {
        let bytes = self
            .images
            .lock()
            .unwrap()
            .get(image_id)
            .map(|(_, layer)| layer.clone())
            .ok_or_else(|| crate::error::TransferError::LayerTransferFailed {
                layer: image_id.to_string(),
                cause: "no image layer seeded".to_string(),
            })?;
        Ok(Box::new(std::io::Cursor::new(bytes)))
    }

    async fn put_image_json(&self, image_id: &str, json: &[u8]) -> Result<(), crate::error::TransferError> {
        let mut images = self.images.lock().unwrap();
        let entry = images.entry(image_id.to_string()).or_insert_with(|| (Vec::new(), Vec::new()));
        entry.0 = json.to_vec();
        Ok(())
    }

    async fn put_image_layer(
        &self,
        image_id: &str,
        mut layer: BlobReader,
    ) -> Result<(), crate::error::TransferError> {
        use tokio::io::AsyncReadExt;
        let mut bytes = Vec::new();
        layer.read_to_end(&mut bytes).await.map_err(|e| {
            crate::error::TransferError::LayerTransferFailed { layer: image_id.to_string(), cause: e.to_string() }
        })?;
        let mut images = self.images.lock().unwrap();
        let entry = images.entry(image_id.to_string()).or_insert_with(|| (Vec::new(), Vec::new()));
        entry.1 = bytes;
        Ok(())
    }

    async fn put_image_checksum(&self, _image_id: &str, _digest: &str) -> Result<(), crate::error::TransferError> {
        Ok(())
    }
}

#[async_trait]
impl RegistrySession for MockRegistry {
    async fn open(&self, _canonical_name: &str) -> Result<Box<dyn Repository>, crate::error::TransferError> {
        Err(crate::error::TransferError::NoSupport(
            "MockRegistry is used directly as a Repository in tests, not opened via a session".to_string(),
        ))
    }
}

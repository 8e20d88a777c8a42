//! Error taxonomy for the image graph core.
//!
//! Follows the same mixed texture as most of this crate's upstream
//! influences: some families are `thiserror`-derived where the messages
//! are uniform and mechanical, others keep a hand-written `Display` where
//! the formatting has more structure (paths, nested causes).

use std::fmt;
use std::path::PathBuf;

pub mod handlers;

/// Errors raised by the [`crate::graph::Graph`] store.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("image not found: {0}")]
    ImageNotFound(String),

    #[error("image id {path} does not match stored json id {stored}")]
    WrongId { path: String, stored: String },

    #[error("ambiguous id prefix {0:?} matches more than one image")]
    AmbiguousPrefix(String),

    #[error("invalid image id: {0}")]
    InvalidId(String),

    #[error("digest not set for image {0}")]
    DigestNotSet(String),

    #[error("digest mismatch for {subject}: expected {expected}, got {actual}")]
    DigestMismatch {
        subject: String,
        expected: String,
        actual: String,
    },

    #[error("driver error: {0}")]
    Driver(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type GraphResult<T> = std::result::Result<T, GraphError>;

/// Errors raised by the [`crate::tagstore::TagStore`].
#[derive(Debug)]
pub enum TagStoreError {
    InvalidReferenceFormat { reference: String, reason: String },
    InvalidRepositoryName(String),
    TagConflict { repository: String, reference: String, existing: String },
    NotFound(String),
    Graph(GraphError),
    Persistence { path: PathBuf, message: String },
}

impl fmt::Display for TagStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagStoreError::InvalidReferenceFormat { reference, reason } => {
                write!(f, "invalid reference {reference:?}: {reason}")
            }
            TagStoreError::InvalidRepositoryName(name) => {
                write!(f, "invalid repository name: {name:?}")
            }
            TagStoreError::TagConflict { repository, reference, existing } => write!(
                f,
                "tag conflict: {repository}:{reference} already points to {existing}"
            ),
            TagStoreError::NotFound(name) => write!(f, "not found: {name}"),
            TagStoreError::Graph(e) => write!(f, "{e}"),
            TagStoreError::Persistence { path, message } => {
                write!(f, "failed to persist tag store at {}: {message}", path.display())
            }
        }
    }
}

impl std::error::Error for TagStoreError {}

impl From<GraphError> for TagStoreError {
    fn from(e: GraphError) -> Self {
        TagStoreError::Graph(e)
    }
}

pub type TagStoreResult<T> = std::result::Result<T, TagStoreError>;

/// Errors raised by the [`crate::pool::TransferPool`].
#[derive(Debug, thiserror::Error, Clone)]
pub enum PoolError {
    #[error("{kind} of {key} is already in progress")]
    AlreadyInProgress { kind: &'static str, key: String },

    #[error("transfer of {0} failed: {1}")]
    Failed(String, String),
}

pub type PoolResult<T> = std::result::Result<T, PoolError>;

/// Errors raised while building, signing, or verifying a [`crate::manifest`].
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("repository {0} has no tagged image")]
    NoSuchTag(String),

    #[error("manifest has {fs_layers} fs_layers but {history} history entries")]
    LengthMismatch { fs_layers: usize, history: usize },

    #[error("manifest has no layers")]
    Empty,

    #[error("unsupported schema version {0}")]
    UnsupportedSchemaVersion(u32),

    #[error("signature verification failed: {0}")]
    SignatureInvalid(String),

    #[error("digest mismatch: reference claims {reference} but payload digests to {computed}")]
    DigestMismatch { reference: String, computed: String },

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    TagStore(#[from] TagStoreError),
}

pub type ManifestResult<T> = std::result::Result<T, ManifestError>;

/// Errors surfaced by the transfer engine (pull/push state machines).
#[derive(Debug, Clone)]
pub enum TransferError {
    LayerDigestVerificationFailed { layer: String },
    LayerTransferFailed { layer: String, cause: String },
    EndpointFallback(String),
    NoSupport(String),
    Graph(String),
    Manifest(String),
    TagStore(String),
    Pool(String),
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferError::LayerDigestVerificationFailed { layer } => {
                write!(f, "layer {layer} failed digest verification")
            }
            TransferError::LayerTransferFailed { layer, cause } => {
                write!(f, "transfer of layer {layer} failed: {cause}")
            }
            TransferError::EndpointFallback(msg) => write!(f, "endpoint unusable, falling back: {msg}"),
            TransferError::NoSupport(msg) => write!(f, "not supported by this endpoint: {msg}"),
            TransferError::Graph(msg) => write!(f, "graph error: {msg}"),
            TransferError::Manifest(msg) => write!(f, "manifest error: {msg}"),
            TransferError::TagStore(msg) => write!(f, "tag store error: {msg}"),
            TransferError::Pool(msg) => write!(f, "transfer pool error: {msg}"),
        }
    }
}

impl std::error::Error for TransferError {}

impl From<GraphError> for TransferError {
    fn from(e: GraphError) -> Self {
        TransferError::Graph(e.to_string())
    }
}

impl From<ManifestError> for TransferError {
    fn from(e: ManifestError) -> Self {
        TransferError::Manifest(e.to_string())
    }
}

impl From<TagStoreError> for TransferError {
    fn from(e: TagStoreError) -> Self {
        TransferError::TagStore(e.to_string())
    }
}

impl From<PoolError> for TransferError {
    fn from(e: PoolError) -> Self {
        TransferError::Pool(e.to_string())
    }
}

pub type TransferResult<T> = std::result::Result<T, TransferError>;

//! Image identity and metadata (spec.md §3 "ImageID" / "Image metadata").

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A SHA-256 hex string identifying a content-addressed image revision.
pub type ImageId = String;

/// Runtime configuration carried by an image (spec.md §3: "command, env,
/// labels, …"). Kept as an open map plus a handful of well-known fields
/// so that round-tripping an upstream image's config never drops data
/// this crate doesn't interpret.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// The canonical image metadata record (spec.md §3 "Image metadata").
///
/// Field order matches the struct declaration order under `serde`'s
/// default derive, which keeps the *decoded* representation stable. When
/// a caller already holds the original wire bytes this struct was parsed
/// from — a manifest history entry, a v1 image json response, a loaded
/// export — it must register through
/// [`super::store::Graph::register_raw`] rather than
/// [`super::store::Graph::register`], so [`super::store::Graph::raw_json`]
/// keeps returning those exact bytes instead of a re-serialization of
/// this struct; the v1 compatibility bytes embedded in a manifest are
/// digest-covered and must survive byte-for-byte.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageMetadata {
    pub id: ImageId,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parent: String,
    pub created: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_config: Option<RuntimeConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<RuntimeConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_version: Option<String>,
}

impl ImageMetadata {
    pub fn is_base_image(&self) -> bool {
        self.parent.is_empty()
    }
}

/// An image as returned by [`super::store::Graph::get`]: metadata plus
/// the cached, driver-independent facts the Graph maintains alongside it.
#[derive(Debug, Clone)]
pub struct Image {
    pub metadata: ImageMetadata,
    pub layer_size: u64,
}

impl Image {
    pub fn id(&self) -> &str {
        &self.metadata.id
    }

    pub fn parent(&self) -> &str {
        &self.metadata.parent
    }
}

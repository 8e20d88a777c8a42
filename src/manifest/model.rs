//! The v2 signed manifest data model (spec.md §3 "Manifest v2").

use serde::{Deserialize, Serialize};

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FsLayer {
    #[serde(rename = "blobSum")]
    pub blob_sum: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryEntry {
    #[serde(rename = "v1Compatibility")]
    pub v1_compatibility: String,
}

/// The unsigned manifest payload. Field declaration order here IS the
/// wire order: `serde`'s struct serialization never reorders fields, so
/// this doubles as the "stable field ordering" spec.md §4.4 requires for
/// the canonical, digest-covered payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestV2 {
    pub name: String,
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "fsLayers")]
    pub fs_layers: Vec<FsLayer>,
    pub history: Vec<HistoryEntry>,
}

impl ManifestV2 {
    pub fn validate_shape(&self) -> Result<(), crate::error::ManifestError> {
        use crate::error::ManifestError;
        if self.schema_version != SCHEMA_VERSION {
            return Err(ManifestError::UnsupportedSchemaVersion(self.schema_version));
        }
        if self.fs_layers.is_empty() || self.history.is_empty() {
            return Err(ManifestError::Empty);
        }
        if self.fs_layers.len() != self.history.len() {
            return Err(ManifestError::LengthMismatch {
                fs_layers: self.fs_layers.len(),
                history: self.history.len(),
            });
        }
        Ok(())
    }
}

/// One entry of the `signatures` array spliced into a signed manifest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Signature {
    pub header: serde_json::Value,
    pub signature: String,
    pub protected: String,
}

/// Decoded `{"formatLength": N, "formatTail": "<base64>"}` protected
/// header: the offset at which the payload's signed prefix ends and the
/// literal bytes that complete the document (spec.md §4.4 "Sign").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectedHeader {
    #[serde(rename = "formatLength")]
    pub format_length: usize,
    #[serde(rename = "formatTail")]
    pub format_tail: String,
}

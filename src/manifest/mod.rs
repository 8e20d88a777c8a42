//! Signed v2 manifest construction, signing, and verification
//! (spec.md §4.4).

pub mod build;
pub mod model;
pub mod sign;

pub use build::build;
pub use model::{FsLayer, HistoryEntry, ManifestV2, ProtectedHeader, Signature, SCHEMA_VERSION};
pub use sign::{
    canonical_bytes, load, sign, AllowAllTrust, Loaded, ManifestSigner, ManifestVerifier, PlainSigner,
    PlainVerifier, TrustService, PERMISSION_READ_WRITE,
};

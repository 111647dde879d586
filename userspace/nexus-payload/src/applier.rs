// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Partition applier (per-partition state machine)
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests below + tests/payload_host
//!
//! States: Pending -> Applying -> Verified | Failed.
//!
//! INVARIANTS:
//!   - operations of one partition run strictly in manifest order
//!   - a partition is Verified only once its content hash matches
//!   - one partition failing never stops the other from being attempted
//!   - payload type is checked before any target is created

use std::fmt;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use serde::Serialize;
use sha2::{Digest, Sha256};
use storage::{BlockDevice, FileBlockDevice};

use crate::config::{EngineConfig, PartitionLimits, ZeroPolicy};
use crate::error::{Error, Result};
use crate::executor::{self, DataSource, OperationContext, TargetImage};
use crate::manifest::{Manifest, PartitionKind, PartitionUpdate, PayloadType};
use crate::payload::Payload;

/// Blocks hashed per device read.
const HASH_CHUNK_BLOCKS: u64 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionState {
    Pending,
    Applying,
    Verified,
    Failed,
}

impl fmt::Display for PartitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Cooperative cancellation, observed between operations.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct ApplyOptions {
    pub zero_policy: ZeroPolicy,
    pub verify_source: bool,
    pub parallel: bool,
    /// Declared images larger than these are refused before any write.
    pub limits: PartitionLimits,
    pub cancel: CancelToken,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

impl ApplyOptions {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            zero_policy: config.zero_policy,
            verify_source: config.verify_source,
            parallel: config.parallel_partitions,
            limits: config.limits(),
            cancel: CancelToken::new(),
        }
    }
}

/// Images one partition is applied to and from.
pub struct PartitionTarget<'a> {
    pub kind: PartitionKind,
    pub new: &'a mut (dyn BlockDevice + Send),
    /// Old image; required for delta payloads.
    pub old: Option<&'a (dyn BlockDevice + Sync)>,
}

#[derive(Debug)]
pub struct PartitionOutcome {
    pub kind: PartitionKind,
    pub state: PartitionState,
    pub operations_applied: usize,
    pub blocks_written: u64,
    pub error: Option<Error>,
}

#[derive(Debug, Default)]
pub struct ApplyReport {
    pub outcomes: Vec<PartitionOutcome>,
}

impl ApplyReport {
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|o| o.state == PartitionState::Verified)
    }

    pub fn outcome(&self, kind: PartitionKind) -> Option<&PartitionOutcome> {
        self.outcomes.iter().find(|o| o.kind == kind)
    }

    /// `Ok` only if every partition reached `Verified`; otherwise the first
    /// failure's error.
    pub fn into_result(mut self) -> Result<Self> {
        let failed = self.outcomes.iter_mut().find_map(|o| o.error.take());
        match failed {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }
}

/// Applies every manifest partition to its target.
///
/// Errors returned directly are detected before any write; per-partition
/// failures are reported in the [`ApplyReport`].
pub fn apply_partitions(
    data: &dyn DataSource,
    manifest: &Manifest,
    targets: Vec<PartitionTarget<'_>>,
    options: &ApplyOptions,
) -> Result<ApplyReport> {
    options.limits.check(manifest)?;
    let mut targets = targets;
    let mut jobs = Vec::with_capacity(manifest.partitions.len());
    for part in &manifest.partitions {
        let pos = targets
            .iter()
            .position(|t| t.kind == part.kind)
            .ok_or_else(|| {
                Error::invariant(format!("no target image for partition {}", part.name))
            })?;
        let target = targets.swap_remove(pos);
        if part.is_delta() && target.old.is_none() {
            return Err(Error::invariant(format!(
                "delta partition {} needs a source image",
                part.name
            )));
        }
        jobs.push((part, target));
    }
    for extra in &targets {
        debug!("applier: {} not in payload, skipped", extra.kind);
    }

    let outcomes: Vec<PartitionOutcome> = if options.parallel && jobs.len() > 1 {
        std::thread::scope(|scope| {
            let handles: Vec<_> = jobs
                .into_iter()
                .map(|(part, target)| {
                    let handle = scope.spawn(move || {
                        apply_partition(data, manifest.block_size, part, target, options)
                    });
                    (part.kind, handle)
                })
                .collect();
            handles
                .into_iter()
                .map(|(kind, handle)| {
                    handle.join().unwrap_or_else(|_| PartitionOutcome {
                        kind,
                        state: PartitionState::Failed,
                        operations_applied: 0,
                        blocks_written: 0,
                        error: Some(Error::invariant("partition worker panicked")),
                    })
                })
                .collect()
        })
    } else {
        jobs.into_iter()
            .map(|(part, target)| apply_partition(data, manifest.block_size, part, target, options))
            .collect()
    };
    Ok(ApplyReport { outcomes })
}

fn apply_partition(
    data: &dyn DataSource,
    block_size: u32,
    part: &PartitionUpdate,
    target: PartitionTarget<'_>,
    options: &ApplyOptions,
) -> PartitionOutcome {
    let mut outcome = PartitionOutcome {
        kind: part.kind,
        state: PartitionState::Pending,
        operations_applied: 0,
        blocks_written: 0,
        error: None,
    };
    match run_partition(data, block_size, part, target, options, &mut outcome) {
        Ok(()) => {
            outcome.state = PartitionState::Verified;
            info!("applier: {} {} -> {}", part.name, PartitionState::Applying, outcome.state);
        }
        Err(err) => {
            let err = err.in_partition(&part.name);
            warn!("applier: {} {} -> {}: {err}", part.name, outcome.state, PartitionState::Failed);
            outcome.state = PartitionState::Failed;
            outcome.error = Some(err);
        }
    }
    outcome
}

fn run_partition(
    data: &dyn DataSource,
    block_size: u32,
    part: &PartitionUpdate,
    mut target: PartitionTarget<'_>,
    options: &ApplyOptions,
    outcome: &mut PartitionOutcome,
) -> Result<()> {
    let bs = block_size as usize;
    let old: Option<&dyn BlockDevice> = match (target.old, part.old_blocks(block_size)) {
        (Some(old), Some(blocks)) => {
            check_source(old, bs, blocks)?;
            if let (true, Some(expected)) = (options.verify_source, part.old_hash.as_ref()) {
                let actual = hash_device(old, blocks)?;
                if &actual != expected {
                    return Err(Error::hash_mismatch("source partition", expected, &actual));
                }
                debug!("applier: {} source image verified", part.name);
            }
            Some(old)
        }
        _ => None,
    };

    outcome.state = PartitionState::Applying;
    info!(
        "applier: {} {} -> {} ({} operations)",
        part.name,
        PartitionState::Pending,
        outcome.state,
        part.operations.len()
    );

    let total = part.new_blocks(block_size);
    let mut image = TargetImage::new(&mut *target.new, bs, total)?;
    let ctx = OperationContext { block_size: bs, data, old, zero_policy: options.zero_policy };
    for (index, op) in part.operations.iter().enumerate() {
        if options.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        debug!("applier: {} op {index} {}", part.name, op.kind);
        executor::execute(op, &ctx, &mut image)
            .map_err(|err| err.in_operation(&part.name, index, op.kind))?;
        outcome.operations_applied = index + 1;
        outcome.blocks_written = image.written_blocks();
    }

    if image.written_blocks() != total {
        return Err(Error::invariant(format!(
            "{} of {total} blocks written",
            image.written_blocks()
        )));
    }
    drop(image);
    target.new.sync()?;

    let actual = hash_device(&*target.new, total)?;
    if actual != part.new_hash {
        return Err(Error::hash_mismatch("partition", &part.new_hash, &actual));
    }
    Ok(())
}

fn check_source(old: &dyn BlockDevice, block_size: usize, blocks: u64) -> Result<()> {
    if old.block_size() != block_size {
        return Err(Error::SizeMismatch {
            what: "source block size",
            expected: block_size as u64,
            actual: old.block_size() as u64,
        });
    }
    if old.block_count() < blocks {
        return Err(Error::SizeMismatch {
            what: "source image blocks",
            expected: blocks,
            actual: old.block_count(),
        });
    }
    Ok(())
}

/// SHA-256 over the first `blocks` blocks of `device`.
pub fn hash_device(device: &dyn BlockDevice, blocks: u64) -> Result<[u8; 32]> {
    let block_size = device.block_size();
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; block_size * HASH_CHUNK_BLOCKS.min(blocks.max(1)) as usize];
    let mut block = 0u64;
    while block < blocks {
        let n = HASH_CHUNK_BLOCKS.min(blocks - block);
        let chunk = &mut buf[..n as usize * block_size];
        device.read_blocks(block, chunk)?;
        hasher.update(&*chunk);
        block += n;
    }
    Ok(hasher.finalize().into())
}

/// Applies a full payload to image files, created or truncated to size.
pub fn apply_full<R: Read + std::io::Seek + Send>(
    payload: &Payload<R>,
    new_kernel: &Path,
    new_root: &Path,
    options: &ApplyOptions,
) -> Result<ApplyReport> {
    payload.check_payload_type(Some(PayloadType::Full))?;
    apply_files(
        payload,
        [(PartitionKind::Kernel, new_kernel, None), (PartitionKind::Root, new_root, None)],
        options,
    )
}

/// Applies a delta payload on top of the given old images.
pub fn apply_delta<R: Read + std::io::Seek + Send>(
    payload: &Payload<R>,
    new_kernel: &Path,
    new_root: &Path,
    old_kernel: &Path,
    old_root: &Path,
    options: &ApplyOptions,
) -> Result<ApplyReport> {
    payload.check_payload_type(Some(PayloadType::Delta))?;
    apply_files(
        payload,
        [
            (PartitionKind::Kernel, new_kernel, Some(old_kernel)),
            (PartitionKind::Root, new_root, Some(old_root)),
        ],
        options,
    )
}

fn apply_files<R: Read + std::io::Seek + Send>(
    payload: &Payload<R>,
    files: [(PartitionKind, &Path, Option<&Path>); 2],
    options: &ApplyOptions,
) -> Result<ApplyReport> {
    let manifest = payload.manifest();
    let bs = manifest.block_size as usize;
    options.limits.check(manifest)?;

    // Open every source before creating any target.
    let mut olds = Vec::new();
    for (kind, _, old_path) in &files {
        if let (Some(part), Some(path)) = (manifest.partition(*kind), old_path) {
            debug!("applier: {} source {}", part.name, path.display());
            olds.push((*kind, FileBlockDevice::open_read_only(path, bs)?));
        }
    }
    let mut news = Vec::new();
    for (kind, new_path, _) in &files {
        if let Some(part) = manifest.partition(*kind) {
            let blocks = part.new_blocks(manifest.block_size);
            news.push((*kind, FileBlockDevice::create(new_path, bs, blocks)?));
        }
    }

    let targets = news
        .iter_mut()
        .map(|(kind, dev)| PartitionTarget {
            kind: *kind,
            new: dev as &mut (dyn BlockDevice + Send),
            old: olds
                .iter()
                .find(|(k, _)| *k == *kind)
                .map(|(_, dev)| dev as &(dyn BlockDevice + Sync)),
        })
        .collect();
    apply_partitions(payload, manifest, targets, options)?.into_result()
}

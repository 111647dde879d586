// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Manifest model (wire messages + validated in-memory form)
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests below (tiling proptest) + tests/payload_host
//!
//! INVARIANTS:
//!   - destination extents of a partition tile [0, new blocks) exactly
//!   - source-kind operations only appear when an old image size is declared
//!   - extents never reach past their partition
//!   - decoded manifests are never mutated afterwards

use core::fmt;
use core::str::FromStr;

use prost::Message;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Block size assumed when the manifest leaves it unset.
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;
const MIN_BLOCK_SIZE: u32 = 512;
const MAX_BLOCK_SIZE: u32 = 1 << 20;
/// Length of every content hash carried in the manifest (SHA-256).
pub const HASH_LEN: usize = 32;

/// Protobuf wire messages. Field tags are part of the payload format.
pub mod proto {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Extent {
        #[prost(uint64, optional, tag = "1")]
        pub start_block: Option<u64>,
        #[prost(uint64, optional, tag = "2")]
        pub num_blocks: Option<u64>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Signature {
        #[prost(uint32, optional, tag = "1")]
        pub version: Option<u32>,
        #[prost(bytes = "vec", optional, tag = "2")]
        pub data: Option<Vec<u8>>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Signatures {
        #[prost(message, repeated, tag = "1")]
        pub signatures: Vec<Signature>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct PartitionInfo {
        #[prost(uint64, optional, tag = "1")]
        pub size: Option<u64>,
        #[prost(bytes = "vec", optional, tag = "2")]
        pub hash: Option<Vec<u8>>,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum OperationType {
        Replace = 0,
        ReplaceBz = 1,
        Move = 2,
        Bsdiff = 3,
        SourceCopy = 4,
        SourceBsdiff = 5,
        Zero = 6,
        Discard = 7,
        ReplaceGz = 8,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct InstallOperation {
        #[prost(enumeration = "OperationType", optional, tag = "1")]
        pub r#type: Option<i32>,
        #[prost(uint64, optional, tag = "2")]
        pub data_offset: Option<u64>,
        #[prost(uint64, optional, tag = "3")]
        pub data_length: Option<u64>,
        #[prost(message, repeated, tag = "4")]
        pub src_extents: Vec<Extent>,
        #[prost(uint64, optional, tag = "5")]
        pub src_length: Option<u64>,
        #[prost(message, repeated, tag = "6")]
        pub dst_extents: Vec<Extent>,
        #[prost(uint64, optional, tag = "7")]
        pub dst_length: Option<u64>,
        #[prost(bytes = "vec", optional, tag = "8")]
        pub data_sha256_hash: Option<Vec<u8>>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct PartitionUpdate {
        #[prost(string, optional, tag = "1")]
        pub partition_name: Option<String>,
        #[prost(message, repeated, tag = "2")]
        pub operations: Vec<InstallOperation>,
        #[prost(message, optional, tag = "3")]
        pub old_partition_info: Option<PartitionInfo>,
        #[prost(message, optional, tag = "4")]
        pub new_partition_info: Option<PartitionInfo>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct DeltaArchiveManifest {
        #[prost(uint32, optional, tag = "1")]
        pub block_size: Option<u32>,
        #[prost(uint64, optional, tag = "2")]
        pub signatures_offset: Option<u64>,
        #[prost(uint64, optional, tag = "3")]
        pub signatures_size: Option<u64>,
        #[prost(uint32, optional, tag = "4")]
        pub minor_version: Option<u32>,
        #[prost(message, repeated, tag = "5")]
        pub partitions: Vec<PartitionUpdate>,
    }
}

/// Whether a payload rebuilds images from nothing or from a prior image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadType {
    Full,
    Delta,
}

impl fmt::Display for PayloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PayloadType::Full => "full",
            PayloadType::Delta => "delta",
        })
    }
}

impl FromStr for PayloadType {
    type Err = String;

    fn from_str(s: &str) -> core::result::Result<Self, Self::Err> {
        match s {
            "full" => Ok(PayloadType::Full),
            "delta" => Ok(PayloadType::Delta),
            other => Err(format!("unknown payload type `{other}` (expected full or delta)")),
        }
    }
}

/// Physical partition a [`PartitionUpdate`] targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionKind {
    Kernel,
    Root,
}

impl PartitionKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "kernel" => Some(PartitionKind::Kernel),
            "root" | "rootfs" => Some(PartitionKind::Root),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PartitionKind::Kernel => "kernel",
            PartitionKind::Root => "root",
        }
    }
}

impl fmt::Display for PartitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Closed set of install operation kinds understood by this engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationKind {
    Replace,
    ReplaceBz,
    ReplaceGz,
    Move,
    Bsdiff,
    SourceCopy,
    SourceBsdiff,
    Zero,
    Discard,
}

impl OperationKind {
    pub const ALL: [OperationKind; 9] = [
        OperationKind::Replace,
        OperationKind::ReplaceBz,
        OperationKind::ReplaceGz,
        OperationKind::Move,
        OperationKind::Bsdiff,
        OperationKind::SourceCopy,
        OperationKind::SourceBsdiff,
        OperationKind::Zero,
        OperationKind::Discard,
    ];

    pub fn name(self) -> &'static str {
        match self {
            OperationKind::Replace => "REPLACE",
            OperationKind::ReplaceBz => "REPLACE_BZ",
            OperationKind::ReplaceGz => "REPLACE_GZ",
            OperationKind::Move => "MOVE",
            OperationKind::Bsdiff => "BSDIFF",
            OperationKind::SourceCopy => "SOURCE_COPY",
            OperationKind::SourceBsdiff => "SOURCE_BSDIFF",
            OperationKind::Zero => "ZERO",
            OperationKind::Discard => "DISCARD",
        }
    }

    /// Operation reads bytes from the data blob.
    pub fn carries_data(self) -> bool {
        matches!(
            self,
            OperationKind::Replace
                | OperationKind::ReplaceBz
                | OperationKind::ReplaceGz
                | OperationKind::Bsdiff
                | OperationKind::SourceBsdiff
        )
    }

    /// Source extents address the old partition image.
    pub fn reads_old_image(self) -> bool {
        matches!(self, OperationKind::SourceCopy | OperationKind::SourceBsdiff)
    }

    /// Source extents address already-written blocks of the new image.
    pub fn reads_new_image(self) -> bool {
        matches!(self, OperationKind::Move | OperationKind::Bsdiff)
    }

    pub fn has_source(self) -> bool {
        self.reads_old_image() || self.reads_new_image()
    }

    /// Source blocks map one-to-one onto destination blocks.
    pub fn is_block_copy(self) -> bool {
        matches!(self, OperationKind::Move | OperationKind::SourceCopy)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<proto::OperationType> for OperationKind {
    fn from(value: proto::OperationType) -> Self {
        use proto::OperationType as T;
        match value {
            T::Replace => OperationKind::Replace,
            T::ReplaceBz => OperationKind::ReplaceBz,
            T::ReplaceGz => OperationKind::ReplaceGz,
            T::Move => OperationKind::Move,
            T::Bsdiff => OperationKind::Bsdiff,
            T::SourceCopy => OperationKind::SourceCopy,
            T::SourceBsdiff => OperationKind::SourceBsdiff,
            T::Zero => OperationKind::Zero,
            T::Discard => OperationKind::Discard,
        }
    }
}

/// Run of blocks `[start_block, start_block + num_blocks)`.
///
/// `num_blocks == 0` is a sparse placeholder and is never read or written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Extent {
    pub start_block: u64,
    pub num_blocks: u64,
}

impl Extent {
    pub const fn new(start_block: u64, num_blocks: u64) -> Self {
        Self { start_block, num_blocks }
    }

    pub fn end_block(&self) -> u64 {
        self.start_block + self.num_blocks
    }

    pub fn is_sparse(&self) -> bool {
        self.num_blocks == 0
    }

    pub fn contains(&self, block: u64) -> bool {
        block >= self.start_block && block < self.end_block()
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.start_block, self.end_block())
    }
}

/// Total number of blocks covered by `extents`.
pub fn total_blocks(extents: &[Extent]) -> u64 {
    extents.iter().map(|e| e.num_blocks).sum()
}

/// Block at position `pos` of the concatenated (non-sparse) extent sequence.
pub fn block_at(extents: &[Extent], mut pos: u64) -> Option<u64> {
    for extent in extents {
        if pos < extent.num_blocks {
            return Some(extent.start_block + pos);
        }
        pos -= extent.num_blocks;
    }
    None
}

/// Byte range inside the operation-data blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DataRange {
    pub offset: u64,
    pub length: u64,
}

impl DataRange {
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOperation {
    pub kind: OperationKind,
    pub data: Option<DataRange>,
    pub data_hash: Option<[u8; HASH_LEN]>,
    pub src_extents: Vec<Extent>,
    pub dst_extents: Vec<Extent>,
    pub src_length: Option<u64>,
    pub dst_length: Option<u64>,
}

impl InstallOperation {
    pub fn src_blocks(&self) -> u64 {
        total_blocks(&self.src_extents)
    }

    pub fn dst_blocks(&self) -> u64 {
        total_blocks(&self.dst_extents)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionUpdate {
    pub name: String,
    pub kind: PartitionKind,
    pub operations: Vec<InstallOperation>,
    /// Size of the new image in bytes (block aligned).
    pub new_size: u64,
    pub new_hash: [u8; HASH_LEN],
    /// Size of the old image; present only for delta partitions.
    pub old_size: Option<u64>,
    pub old_hash: Option<[u8; HASH_LEN]>,
}

impl PartitionUpdate {
    pub fn new_blocks(&self, block_size: u32) -> u64 {
        self.new_size / u64::from(block_size)
    }

    pub fn old_blocks(&self, block_size: u32) -> Option<u64> {
        self.old_size.map(|size| size / u64::from(block_size))
    }

    pub fn is_delta(&self) -> bool {
        self.old_size.is_some()
    }
}

/// Validated manifest. Immutable once decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub block_size: u32,
    pub minor_version: u32,
    pub partitions: Vec<PartitionUpdate>,
    /// Blob region holding the whole-payload signature block.
    pub signatures: Option<DataRange>,
}

impl Manifest {
    pub fn partition(&self, kind: PartitionKind) -> Option<&PartitionUpdate> {
        self.partitions.iter().find(|p| p.kind == kind)
    }

    /// Full vs delta, derived from old-image sizes. Mixed payloads are malformed.
    pub fn payload_type(&self) -> Result<PayloadType> {
        let deltas = self.partitions.iter().filter(|p| p.is_delta()).count();
        let payload_type = if deltas == 0 {
            PayloadType::Full
        } else if deltas == self.partitions.len() {
            PayloadType::Delta
        } else {
            return Err(Error::malformed_manifest(
                "partitions mix full and delta updates",
            ));
        };
        match (payload_type, self.minor_version) {
            (PayloadType::Full, 0) | (PayloadType::Delta, 1..) => Ok(payload_type),
            (PayloadType::Full, minor) => Err(Error::malformed_manifest(format!(
                "full payload declares minor version {minor}"
            ))),
            (PayloadType::Delta, _) => {
                Err(Error::malformed_manifest("delta payload declares minor version 0"))
            }
        }
    }

    /// Operations in manifest order, paired with their partition.
    pub fn operations(&self) -> impl Iterator<Item = (&PartitionUpdate, usize, &InstallOperation)> {
        self.partitions
            .iter()
            .flat_map(|p| p.operations.iter().enumerate().map(move |(i, op)| (p, i, op)))
    }
}

/// Decodes and validates manifest bytes. Pure; performs no I/O.
pub fn decode(bytes: &[u8]) -> Result<Manifest> {
    let raw = proto::DeltaArchiveManifest::decode(bytes)
        .map_err(|err| Error::malformed_manifest(format!("protobuf decode failed: {err}")))?;

    let block_size = raw.block_size.unwrap_or(DEFAULT_BLOCK_SIZE);
    if !block_size.is_power_of_two() || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size) {
        return Err(Error::malformed_manifest(format!("invalid block size {block_size}")));
    }

    let signatures = match (raw.signatures_offset, raw.signatures_size) {
        (None, None) => None,
        (Some(offset), Some(length)) => {
            offset
                .checked_add(length)
                .ok_or_else(|| Error::malformed_manifest("signature range overflows"))?;
            Some(DataRange { offset, length })
        }
        _ => {
            return Err(Error::malformed_manifest(
                "signatures offset and size must be set together",
            ))
        }
    };

    if raw.partitions.is_empty() {
        return Err(Error::malformed_manifest("no partitions"));
    }

    let mut partitions: Vec<PartitionUpdate> = Vec::with_capacity(raw.partitions.len());
    for raw_part in &raw.partitions {
        let part = decode_partition(raw_part, block_size)?;
        if partitions.iter().any(|p| p.kind == part.kind) {
            return Err(Error::malformed_manifest(format!("duplicate partition {}", part.kind)));
        }
        partitions.push(part);
    }

    Ok(Manifest {
        block_size,
        minor_version: raw.minor_version.unwrap_or(0),
        partitions,
        signatures,
    })
}

fn decode_partition(raw: &proto::PartitionUpdate, block_size: u32) -> Result<PartitionUpdate> {
    let name = raw
        .partition_name
        .clone()
        .ok_or_else(|| Error::malformed_manifest("partition name missing"))?;
    let kind = PartitionKind::from_name(&name)
        .ok_or_else(|| Error::malformed_manifest(format!("unknown partition `{name}`")))?;

    let new_info = raw
        .new_partition_info
        .as_ref()
        .ok_or_else(|| Error::malformed_manifest(format!("{name}: new partition info missing")))?;
    let new_size = aligned_size(new_info.size, block_size, &name, "new")?;
    let new_hash = match new_info.hash.as_deref() {
        Some(hash) => hash_array(hash, &name, "new partition hash")?,
        None => {
            return Err(Error::malformed_manifest(format!("{name}: new partition hash missing")))
        }
    };

    let (old_size, old_hash) = match raw.old_partition_info.as_ref() {
        Some(old) => {
            let size = aligned_size(old.size, block_size, &name, "old")?;
            let hash = old
                .hash
                .as_deref()
                .map(|h| hash_array(h, &name, "old partition hash"))
                .transpose()?;
            (Some(size), hash)
        }
        None => (None, None),
    };

    let new_blocks = new_size / u64::from(block_size);
    let old_blocks = old_size.map(|s| s / u64::from(block_size));

    let mut operations = Vec::with_capacity(raw.operations.len());
    for (index, raw_op) in raw.operations.iter().enumerate() {
        let op = decode_operation(raw_op, block_size, new_blocks, old_blocks)
            .map_err(|err| match err {
                Error::MalformedManifest(msg) => {
                    Error::malformed_manifest(format!("{name} operation {index}: {msg}"))
                }
                other => other,
            })?;
        operations.push(op);
    }

    check_tiling(&operations, new_blocks)
        .map_err(|msg| Error::malformed_manifest(format!("{name}: {msg}")))?;

    Ok(PartitionUpdate { name, kind, operations, new_size, new_hash, old_size, old_hash })
}

fn decode_operation(
    raw: &proto::InstallOperation,
    block_size: u32,
    new_blocks: u64,
    old_blocks: Option<u64>,
) -> Result<InstallOperation> {
    let type_tag = raw.r#type.ok_or_else(|| Error::malformed_manifest("operation type missing"))?;
    let kind: OperationKind = proto::OperationType::try_from(type_tag)
        .map_err(|_| Error::malformed_manifest(format!("unknown operation type {type_tag}")))?
        .into();

    let src_extents = decode_extents(&raw.src_extents)?;
    let dst_extents = decode_extents(&raw.dst_extents)?;

    let data = match (raw.data_offset, raw.data_length) {
        (_, None) | (_, Some(0)) if !kind.carries_data() => None,
        (Some(offset), Some(length)) if kind.carries_data() && length > 0 => {
            offset
                .checked_add(length)
                .ok_or_else(|| Error::malformed_manifest("data range overflows"))?;
            Some(DataRange { offset, length })
        }
        _ if kind.carries_data() => {
            return Err(Error::malformed_manifest(format!("{kind} without data offset/length")))
        }
        _ => return Err(Error::malformed_manifest(format!("{kind} must not carry data"))),
    };
    let data_hash = match raw.data_sha256_hash.as_deref() {
        Some(_) if data.is_none() => {
            return Err(Error::malformed_manifest(format!(
                "{kind} declares a data hash without data"
            )))
        }
        Some(hash) => Some(hash_array(hash, "operation", "data hash")?),
        None => None,
    };

    let dst_total = checked_total(&dst_extents)?;
    if dst_total == 0 {
        return Err(Error::malformed_manifest("no destination blocks"));
    }
    check_bounds(&dst_extents, new_blocks, "destination extent exceeds new partition")?;

    let src_total = checked_total(&src_extents)?;
    if kind.has_source() {
        if src_total == 0 {
            return Err(Error::malformed_manifest(format!("{kind} without source blocks")));
        }
        if kind.reads_old_image() {
            let old_blocks = old_blocks.ok_or_else(|| {
                Error::malformed_manifest(format!("{kind} in a partition without an old image"))
            })?;
            check_bounds(&src_extents, old_blocks, "source extent exceeds old partition")?;
        } else {
            check_bounds(&src_extents, new_blocks, "source extent exceeds new partition")?;
        }
    } else if !src_extents.is_empty() {
        return Err(Error::malformed_manifest(format!("{kind} must not have source extents")));
    }

    if kind.is_block_copy() && src_total != dst_total {
        return Err(Error::malformed_manifest(format!(
            "{kind} moves {src_total} source blocks into {dst_total} destination blocks"
        )));
    }
    if kind == OperationKind::Move {
        if let Some(block) = stagnant_block(&src_extents, &dst_extents) {
            return Err(Error::malformed_manifest(format!("MOVE leaves block {block} in place")));
        }
    }

    if let Some(len) = raw.src_length {
        if !kind.has_source() {
            return Err(Error::malformed_manifest(format!("{kind} declares a source length")));
        }
        check_fits(len, src_total, block_size, "source length")?;
    }
    if let Some(len) = raw.dst_length {
        check_fits(len, dst_total, block_size, "destination length")?;
    }

    Ok(InstallOperation {
        kind,
        data,
        data_hash,
        src_extents,
        dst_extents,
        src_length: raw.src_length,
        dst_length: raw.dst_length,
    })
}

fn decode_extents(raw: &[proto::Extent]) -> Result<Vec<Extent>> {
    raw.iter()
        .map(|e| {
            let start = e
                .start_block
                .ok_or_else(|| Error::malformed_manifest("extent start missing"))?;
            let num = e
                .num_blocks
                .ok_or_else(|| Error::malformed_manifest("extent length missing"))?;
            start
                .checked_add(num)
                .ok_or_else(|| Error::malformed_manifest("extent overflows"))?;
            Ok(Extent::new(start, num))
        })
        .collect()
}

/// Like [`total_blocks`], for extents that have not been bounded yet.
fn checked_total(extents: &[Extent]) -> Result<u64> {
    extents
        .iter()
        .try_fold(0u64, |total, e| total.checked_add(e.num_blocks))
        .ok_or_else(|| Error::malformed_manifest("extent block count overflows"))
}

/// First block a MOVE would copy onto itself.
///
/// Walks both extent lists one paired run at a time. Inside a run source and
/// destination advance together, so either every block of the run is
/// stagnant or none is.
fn stagnant_block(src: &[Extent], dst: &[Extent]) -> Option<u64> {
    let mut src_runs = src.iter().filter(|e| !e.is_sparse()).copied();
    let mut dst_runs = dst.iter().filter(|e| !e.is_sparse()).copied();
    let (mut s, mut d) = (src_runs.next()?, dst_runs.next()?);
    loop {
        if s.start_block == d.start_block {
            return Some(d.start_block);
        }
        let run = s.num_blocks.min(d.num_blocks);
        s = if s.num_blocks == run {
            src_runs.next()?
        } else {
            Extent::new(s.start_block + run, s.num_blocks - run)
        };
        d = if d.num_blocks == run {
            dst_runs.next()?
        } else {
            Extent::new(d.start_block + run, d.num_blocks - run)
        };
    }
}

fn check_bounds(extents: &[Extent], limit: u64, msg: &str) -> Result<()> {
    match extents.iter().find(|e| !e.is_sparse() && e.end_block() > limit) {
        Some(extent) => Err(Error::malformed_manifest(format!("{msg} ({extent} > {limit})"))),
        None => Ok(()),
    }
}

/// `length` must need exactly `blocks` blocks.
fn check_fits(length: u64, blocks: u64, block_size: u32, what: &str) -> Result<()> {
    let needed = length.div_ceil(u64::from(block_size));
    if needed != blocks {
        return Err(Error::malformed_manifest(format!(
            "{what} {length} needs {needed} blocks, extents cover {blocks}"
        )));
    }
    Ok(())
}

fn aligned_size(size: Option<u64>, block_size: u32, name: &str, which: &str) -> Result<u64> {
    let size = size.ok_or_else(|| {
        Error::malformed_manifest(format!("{name}: {which} partition size missing"))
    })?;
    if size % u64::from(block_size) != 0 {
        return Err(Error::malformed_manifest(format!(
            "{name}: {which} partition size {size} not aligned to block size {block_size}"
        )));
    }
    Ok(size)
}

fn hash_array(bytes: &[u8], name: &str, what: &str) -> Result<[u8; HASH_LEN]> {
    bytes.try_into().map_err(|_| {
        Error::malformed_manifest(format!(
            "{name}: {what} must be {HASH_LEN} bytes, got {}",
            bytes.len()
        ))
    })
}

/// Destination extents, sorted, must cover `[0, total)` with no gap or overlap.
fn check_tiling(operations: &[InstallOperation], total: u64) -> core::result::Result<(), String> {
    let mut extents: Vec<Extent> = operations
        .iter()
        .flat_map(|op| op.dst_extents.iter().copied())
        .filter(|e| !e.is_sparse())
        .collect();
    extents.sort_by_key(|e| e.start_block);

    let mut next = 0u64;
    for extent in &extents {
        if extent.start_block < next {
            return Err(format!("destination extent {extent} overlaps block {}", next - 1));
        }
        if extent.start_block > next {
            return Err(format!(
                "blocks {next}->{} not written by any operation",
                extent.start_block
            ));
        }
        next = extent.end_block();
    }
    if next != total {
        return Err(format!("operations cover {next} of {total} blocks"));
    }
    Ok(())
}

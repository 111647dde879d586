// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Update payload engine (verify + apply + trace)
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests per module + integration tests (via tests/payload_host)
//!   - manifest tiling, container framing, signature schemes
//!   - operation executor per kind, partition applier state machine
//!   - full/delta equivalence, determinism, block tracing
//!
//! PUBLIC API:
//!   - open/Payload: parse a payload container once
//!   - verify: signatures, payload type and static checks -> Report
//!   - apply_full/apply_delta: write kernel + root images, hash-verified
//!   - trace_block: which operation wrote a block, and from where
//!
//! DEPENDENCIES:
//!   - prost: manifest and signature messages
//!   - sha2 + ed25519-dalek: digests and signatures
//!   - bzip2/flate2: compressed replace operations and BSDIFF40 streams
//!   - storage: block device abstraction for partition images

#![forbid(unsafe_code)]

pub mod applier;
pub mod bspatch;
pub mod config;
pub mod container;
pub mod error;
pub mod executor;
pub mod manifest;
pub mod payload;
pub mod report;
pub mod signature;
pub mod tracer;

use std::io::{Read, Seek};

pub use applier::{
    apply_delta, apply_full, apply_partitions, ApplyOptions, ApplyReport, CancelToken,
    PartitionOutcome, PartitionState, PartitionTarget,
};
pub use config::{ConfigError, EngineConfig, PartitionLimits, ZeroPolicy};
pub use container::{ContainerReader, PayloadHeader};
pub use error::{Error, ErrorKind, Result};
pub use manifest::{
    Extent, InstallOperation, Manifest, OperationKind, PartitionKind, PartitionUpdate, PayloadType,
};
pub use payload::Payload;
pub use report::{PartitionReport, Report, SignatureCheck};
pub use signature::{
    DigestAlgorithm, Ed25519Verifier, KeyError, PublicKey, Scheme, SchemeRegistry,
    SignatureAlgorithm, SignatureVerifier, SignedRegion,
};
pub use tracer::{BlockTrace, SourceImage, SourceLocation, TraceHop};

/// Parses a payload stream.
pub fn open<R: Read + Seek>(stream: R, config: &EngineConfig) -> Result<Payload<R>> {
    Payload::open(stream, config)
}

/// Verifies signatures (when `key` is given), payload type and layout.
pub fn verify<R: Read + Seek>(
    payload: &Payload<R>,
    signature_bytes: Option<&[u8]>,
    key: Option<&PublicKey>,
    expected: Option<PayloadType>,
    config: &EngineConfig,
) -> Result<Report> {
    payload.verify(signature_bytes, key, expected, config)
}

/// Reports which operation wrote `block` of `kind`.
pub fn trace_block<R>(payload: &Payload<R>, kind: PartitionKind, block: u64) -> Result<BlockTrace>
where
    R: Read + Seek,
{
    tracer::trace_block(payload.manifest(), kind, block)
}

// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Engine error taxonomy.

use std::io;

use storage::BlockError;
use thiserror::Error;

use crate::manifest::{OperationKind, PayloadType};

/// Result alias for payload operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Flat classification of an [`Error`], with context wrappers removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    MalformedContainer,
    MalformedManifest,
    SignatureMissing,
    SignatureInvalid,
    PayloadTypeMismatch,
    OutOfRange,
    SizeMismatch,
    DecompressionFailed,
    PatchApplicationFailed,
    OrderingViolation,
    HashMismatch,
    InvariantViolation,
    BlockOutOfRange,
    Cancelled,
    Io,
}

/// Errors produced while parsing, verifying, applying or tracing a payload.
#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed container: {0}")]
    MalformedContainer(String),
    #[error("malformed manifest: {0}")]
    MalformedManifest(String),
    #[error("metadata signature missing")]
    SignatureMissing,
    #[error("signature invalid: {0}")]
    SignatureInvalid(&'static str),
    #[error("payload type mismatch: expected {expected}, payload is {actual}")]
    PayloadTypeMismatch { expected: PayloadType, actual: PayloadType },
    #[error("data range {offset}+{length} exceeds blob of {blob_size} bytes")]
    OutOfRange { offset: u64, length: u64, blob_size: u64 },
    #[error("{what}: expected {expected} bytes, found {actual}")]
    SizeMismatch { what: &'static str, expected: u64, actual: u64 },
    #[error("decompression failed: {0}")]
    DecompressionFailed(#[source] io::Error),
    #[error("patch application failed: {0}")]
    PatchApplicationFailed(String),
    #[error("block {block} read before any earlier operation wrote it")]
    OrderingViolation { block: u64 },
    #[error("{what} hash mismatch: expected {expected}, actual {actual}")]
    HashMismatch { what: &'static str, expected: String, actual: String },
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    #[error("block {block} out of range (partition has {total} blocks)")]
    BlockOutOfRange { block: u64, total: u64 },
    #[error("cancelled")]
    Cancelled,
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("block device: {0}")]
    Device(#[from] BlockError),
    #[error("{partition} operation {index} ({kind}): {source}")]
    Operation {
        partition: String,
        index: usize,
        kind: OperationKind,
        #[source]
        source: Box<Error>,
    },
    #[error("{partition}: {source}")]
    Partition {
        partition: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Taxonomy class of this error, looking through context wrappers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::MalformedContainer(_) => ErrorKind::MalformedContainer,
            Error::MalformedManifest(_) => ErrorKind::MalformedManifest,
            Error::SignatureMissing => ErrorKind::SignatureMissing,
            Error::SignatureInvalid(_) => ErrorKind::SignatureInvalid,
            Error::PayloadTypeMismatch { .. } => ErrorKind::PayloadTypeMismatch,
            Error::OutOfRange { .. } => ErrorKind::OutOfRange,
            Error::SizeMismatch { .. } => ErrorKind::SizeMismatch,
            Error::DecompressionFailed(_) => ErrorKind::DecompressionFailed,
            Error::PatchApplicationFailed(_) => ErrorKind::PatchApplicationFailed,
            Error::OrderingViolation { .. } => ErrorKind::OrderingViolation,
            Error::HashMismatch { .. } => ErrorKind::HashMismatch,
            Error::InvariantViolation(_) => ErrorKind::InvariantViolation,
            Error::BlockOutOfRange { .. } => ErrorKind::BlockOutOfRange,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Io(_) | Error::Device(_) => ErrorKind::Io,
            Error::Operation { source, .. } | Error::Partition { source, .. } => source.kind(),
        }
    }

    /// Index of the failing operation, if the error carries one.
    pub fn operation_index(&self) -> Option<usize> {
        match self {
            Error::Operation { index, .. } => Some(*index),
            Error::Partition { source, .. } => source.operation_index(),
            _ => None,
        }
    }

    pub(crate) fn malformed_manifest(msg: impl Into<String>) -> Self {
        Error::MalformedManifest(msg.into())
    }

    pub(crate) fn malformed_container(msg: impl Into<String>) -> Self {
        Error::MalformedContainer(msg.into())
    }

    pub(crate) fn invariant(msg: impl Into<String>) -> Self {
        Error::InvariantViolation(msg.into())
    }

    pub(crate) fn hash_mismatch(what: &'static str, expected: &[u8], actual: &[u8]) -> Self {
        Error::HashMismatch { what, expected: hex::encode(expected), actual: hex::encode(actual) }
    }

    pub(crate) fn in_operation(self, partition: &str, index: usize, kind: OperationKind) -> Self {
        Error::Operation { partition: partition.to_string(), index, kind, source: Box::new(self) }
    }

    pub(crate) fn in_partition(self, partition: &str) -> Self {
        match self {
            // Operation context already names the partition.
            err @ Error::Operation { .. } => err,
            err => Error::Partition { partition: partition.to_string(), source: Box::new(err) },
        }
    }
}

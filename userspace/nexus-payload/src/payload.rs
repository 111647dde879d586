// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Parsed payload (header + manifest + blob access) and verification
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: tests/payload_host
//!
//! A [`Payload`] is parsed once and never mutated. The underlying stream sits
//! behind a mutex so partition workers can read the blob concurrently.

use std::fs::File;
use std::io::{BufReader, Cursor, Read, Seek};
use std::path::Path;

use log::{debug, info};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::config::EngineConfig;
use crate::container::{ContainerReader, PayloadHeader};
use crate::error::{Error, Result};
use crate::executor::DataSource;
use crate::manifest::{self, DataRange, Manifest, PayloadType};
use crate::report::{Report, SignatureCheck};
use crate::signature::{self, PublicKey, Scheme};

pub struct Payload<R> {
    header: PayloadHeader,
    scheme: Scheme,
    manifest: Manifest,
    manifest_bytes: Vec<u8>,
    metadata_signature: Option<Vec<u8>>,
    payload_type: PayloadType,
    reader: Mutex<ContainerReader<R>>,
}

impl Payload<BufReader<File>> {
    pub fn open_path(path: &Path, config: &EngineConfig) -> Result<Self> {
        let file = File::open(path)?;
        Self::open(BufReader::new(file), config)
    }
}

impl Payload<Cursor<Vec<u8>>> {
    pub fn from_bytes(bytes: Vec<u8>, config: &EngineConfig) -> Result<Self> {
        Self::open(Cursor::new(bytes), config)
    }
}

impl<R: Read + Seek> Payload<R> {
    /// Parses framing and manifest. Fails before anything is written anywhere.
    pub fn open(stream: R, config: &EngineConfig) -> Result<Self> {
        let registry = config.registry();
        let mut reader = ContainerReader::new(stream)?;
        let header = reader.parse_header(&registry, config.max_manifest_size)?;
        let scheme = *registry
            .get(header.version)
            .ok_or_else(|| {
                Error::malformed_container(format!(
                    "unsupported format version {}",
                    header.version
                ))
            })?;
        let manifest_bytes = reader.read_manifest(&header)?;
        let metadata_signature = reader.read_metadata_signature(&header)?;
        let manifest = manifest::decode(&manifest_bytes)?;
        let payload_type = manifest.payload_type()?;

        info!(
            "payload: v{} {payload_type} payload, {} partition(s), block size {}, blob {} bytes",
            header.version,
            manifest.partitions.len(),
            manifest.block_size,
            header.blob_size
        );
        Ok(Self {
            header,
            scheme,
            manifest,
            manifest_bytes,
            metadata_signature,
            payload_type,
            reader: Mutex::new(reader),
        })
    }

    pub fn header(&self) -> &PayloadHeader {
        &self.header
    }

    pub fn version(&self) -> u64 {
        self.header.version
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn manifest_bytes(&self) -> &[u8] {
        &self.manifest_bytes
    }

    pub fn metadata_signature(&self) -> Option<&[u8]> {
        self.metadata_signature.as_deref()
    }

    pub fn payload_type(&self) -> PayloadType {
        self.payload_type
    }

    pub fn blob_size(&self) -> u64 {
        self.header.blob_size
    }

    /// Blob bytes `[offset, offset + length)`.
    pub fn read_range(&self, offset: u64, length: u64) -> Result<Vec<u8>> {
        self.reader.lock().read_range(&self.header, offset, length)
    }

    /// Checks the metadata signature. `out_of_band` (a separately shipped
    /// signature file) takes precedence over the embedded block.
    pub fn verify_metadata_signature(
        &self,
        out_of_band: Option<&[u8]>,
        key: &PublicKey,
    ) -> Result<()> {
        let sig = out_of_band.or(self.metadata_signature.as_deref());
        signature::verify_metadata_signature(
            &self.scheme,
            self.header.size_prefix(),
            &self.manifest_bytes,
            sig,
            key,
        )
    }

    /// Checks the whole-payload signature, if the manifest declares one.
    /// Returns whether a signature was present.
    pub fn verify_payload_signature(&self, key: &PublicKey) -> Result<bool> {
        let Some(range) = self.manifest.signatures else {
            return Ok(false);
        };
        let block = self.read_range(range.offset, range.length)?;
        let mut state = self.scheme.digest.hasher();
        state.update(self.header.size_prefix());
        state.update(&self.manifest_bytes);
        self.reader
            .lock()
            .stream_range(&self.header, 0, range.offset, &mut |chunk: &[u8]| state.update(chunk))?;
        signature::verify_signature_block(&self.scheme, &state.finalize(), &block, key)?;
        Ok(true)
    }

    pub fn check_payload_type(&self, expected: Option<PayloadType>) -> Result<PayloadType> {
        signature::check_payload_type(&self.manifest, expected)
    }

    /// Metadata summary without any verification.
    pub fn describe(&self) -> Report {
        Report::new(&self.header, &self.manifest, self.payload_type)
    }

    /// Full static verification: signatures (when a key is given), payload
    /// type, manifest-vs-config checks, blob layout and operation data hashes.
    pub fn verify(
        &self,
        signature_bytes: Option<&[u8]>,
        key: Option<&PublicKey>,
        expected: Option<PayloadType>,
        config: &EngineConfig,
    ) -> Result<Report> {
        let mut report = self.describe();
        if let Some(key) = key {
            self.verify_metadata_signature(signature_bytes, key)?;
            report.metadata_signature = SignatureCheck::Verified;
            debug!("payload: metadata signature verified");
        }
        self.check_payload_type(expected)?;
        self.check_config(config)?;
        self.check_layout(config)?;
        if let Some(key) = key {
            if self.verify_payload_signature(key)? {
                report.payload_signature = SignatureCheck::Verified;
                debug!("payload: payload signature verified");
            }
        }
        info!("payload: verified ({} operation data bytes)", report.total_data_bytes);
        Ok(report)
    }

    fn check_config(&self, config: &EngineConfig) -> Result<()> {
        if let Some(expected) = config.block_size {
            if expected != self.manifest.block_size {
                return Err(Error::malformed_manifest(format!(
                    "block size {} differs from expected {expected}",
                    self.manifest.block_size
                )));
            }
        }
        config.limits().check(&self.manifest)
    }

    /// Operation data must be hashed (unless allowed otherwise), laid out
    /// contiguously in manifest order, and followed only by the payload
    /// signature block.
    fn check_layout(&self, config: &EngineConfig) -> Result<()> {
        let mut next = 0u64;
        for (part, index, op) in self.manifest.operations() {
            let Some(range) = op.data else { continue };
            let check = || -> Result<()> {
                if op.data_hash.is_none() && !config.allow_unhashed {
                    return Err(Error::malformed_manifest("operation data is not hashed"));
                }
                if range.offset != next {
                    return Err(Error::malformed_manifest(format!(
                        "data offset {} is not contiguous (expected {next})",
                        range.offset
                    )));
                }
                if let Some(expected) = op.data_hash {
                    let actual = self.digest_range(range)?;
                    if actual != expected {
                        return Err(Error::hash_mismatch("operation data", &expected, &actual));
                    }
                } else {
                    self.check_bounds(range)?;
                }
                Ok(())
            };
            check().map_err(|err| err.in_operation(&part.name, index, op.kind))?;
            next = range.end();
        }

        if let Some(sigs) = self.manifest.signatures {
            if sigs.offset != next {
                return Err(Error::malformed_manifest(format!(
                    "payload signature at {} does not follow operation data ending at {next}",
                    sigs.offset
                )));
            }
            self.check_bounds(sigs)?;
            next = sigs.end();
        }

        if next < self.header.blob_size {
            return Err(Error::malformed_container(format!(
                "{} excess bytes after byte {next} of the data blob",
                self.header.blob_size - next
            )));
        }
        Ok(())
    }

    fn check_bounds(&self, range: DataRange) -> Result<()> {
        match range.offset.checked_add(range.length) {
            Some(end) if end <= self.header.blob_size => Ok(()),
            _ => Err(Error::OutOfRange {
                offset: range.offset,
                length: range.length,
                blob_size: self.header.blob_size,
            }),
        }
    }

    fn digest_range(&self, range: DataRange) -> Result<[u8; 32]> {
        let mut hasher = Sha256::new();
        self.reader.lock().stream_range(
            &self.header,
            range.offset,
            range.length,
            &mut |chunk: &[u8]| hasher.update(chunk),
        )?;
        Ok(hasher.finalize().into())
    }
}

impl<R: Read + Seek + Send> DataSource for Payload<R> {
    fn read_data(&self, range: DataRange) -> Result<Vec<u8>> {
        self.read_range(range.offset, range.length)
    }
}

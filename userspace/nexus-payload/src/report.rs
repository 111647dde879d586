// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Verify/describe reports.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::container::PayloadHeader;
use crate::manifest::{Manifest, PartitionKind, PartitionUpdate, PayloadType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureCheck {
    Verified,
    /// No key was supplied.
    NotChecked,
    /// The payload does not carry this signature.
    Absent,
}

impl fmt::Display for SignatureCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SignatureCheck::Verified => "verified",
            SignatureCheck::NotChecked => "not checked",
            SignatureCheck::Absent => "absent",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionReport {
    pub name: String,
    pub kind: PartitionKind,
    pub new_size: u64,
    pub new_hash: String,
    pub old_size: Option<u64>,
    pub old_hash: Option<String>,
    pub operations: usize,
    pub operation_counts: BTreeMap<String, usize>,
    pub data_bytes: u64,
}

impl PartitionReport {
    fn new(partition: &PartitionUpdate) -> Self {
        let mut operation_counts = BTreeMap::new();
        let mut data_bytes = 0;
        for op in &partition.operations {
            *operation_counts.entry(op.kind.name().to_string()).or_insert(0) += 1;
            data_bytes += op.data.map_or(0, |d| d.length);
        }
        Self {
            name: partition.name.clone(),
            kind: partition.kind,
            new_size: partition.new_size,
            new_hash: hex::encode(partition.new_hash),
            old_size: partition.old_size,
            old_hash: partition.old_hash.map(hex::encode),
            operations: partition.operations.len(),
            operation_counts,
            data_bytes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Report {
    pub version: u64,
    pub payload_type: PayloadType,
    pub block_size: u32,
    pub minor_version: u32,
    pub manifest_size: u64,
    pub metadata_signature_size: u64,
    pub blob_size: u64,
    pub metadata_signature: SignatureCheck,
    pub payload_signature: SignatureCheck,
    pub total_data_bytes: u64,
    pub partitions: Vec<PartitionReport>,
}

impl Report {
    pub fn new(header: &PayloadHeader, manifest: &Manifest, payload_type: PayloadType) -> Self {
        let partitions: Vec<PartitionReport> =
            manifest.partitions.iter().map(PartitionReport::new).collect();
        Self {
            version: header.version,
            payload_type,
            block_size: manifest.block_size,
            minor_version: manifest.minor_version,
            manifest_size: header.manifest_len,
            metadata_signature_size: header.metadata_signature_len,
            blob_size: header.blob_size,
            metadata_signature: SignatureCheck::NotChecked,
            payload_signature: if manifest.signatures.is_some() {
                SignatureCheck::NotChecked
            } else {
                SignatureCheck::Absent
            },
            total_data_bytes: partitions.iter().map(|p| p.data_bytes).sum(),
            partitions,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Payload version:     {}", self.version)?;
        writeln!(f, "Payload type:        {}", self.payload_type)?;
        writeln!(f, "Block size:          {}", self.block_size)?;
        writeln!(f, "Minor version:       {}", self.minor_version)?;
        writeln!(f, "Manifest size:       {}", self.manifest_size)?;
        writeln!(
            f,
            "Metadata signature:  {} ({} bytes)",
            self.metadata_signature, self.metadata_signature_size
        )?;
        writeln!(f, "Payload signature:   {}", self.payload_signature)?;
        writeln!(
            f,
            "Data blob:           {} bytes, {} used by operations",
            self.blob_size, self.total_data_bytes
        )?;
        for part in &self.partitions {
            writeln!(f, "{} ({}):", part.name, part.kind)?;
            writeln!(f, "  new size {} sha256 {}", part.new_size, part.new_hash)?;
            if let Some(old) = part.old_size {
                writeln!(f, "  old size {old} sha256 {}", part.old_hash.as_deref().unwrap_or("-"))?;
            }
            writeln!(f, "  {} operations, {} data bytes", part.operations, part.data_bytes)?;
            for (kind, count) in &part.operation_counts {
                writeln!(f, "    {kind:<14} {count}")?;
            }
        }
        Ok(())
    }
}

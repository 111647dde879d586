// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Integration tests for payload verification, application and tracing
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: 20 tests
//!
//! TEST_SCOPE:
//!   - Full and delta application through files and in-memory devices
//!   - Metadata and payload signature verification (embedded + out-of-band)
//!   - Payload type enforcement before any target is created
//!   - Blob layout and operation data hash checks
//!   - Ordering violations, cancellation, partition independence
//!   - Block tracing back to operations and source blocks
//!
//! TEST_SCENARIOS:
//!   - test_full_payload_applies_and_verifies(): happy path through files
//!   - test_every_block_traced_exactly_once(): tracer agrees with the op list
//!   - test_delta_matches_full_output(): both payload types produce equal images
//!   - test_apply_is_deterministic(): repeated builds and applies are identical
//!   - test_parallel_apply_matches_sequential(): concurrent partitions
//!   - test_twenty_block_root_delta(): REPLACE + SOURCE_BSDIFF, trace of block 15
//!   - test_corrupt_blob_byte_fails_verification(): op data hash mismatch
//!   - test_unhashed_corruption_fails_one_partition(): partition hash catches it
//!   - test_every_manifest_bit_flip_is_rejected(): metadata signature coverage
//!   - test_reject_missing_signature(): no embedded, no out-of-band signature
//!   - test_out_of_band_signature_takes_precedence(): detached overrides embedded
//!   - test_payload_type_mismatch_creates_no_files(): full vs delta
//!   - test_oversized_partition_creates_no_files(): partition size limits
//!   - test_reject_malformed_container(): magic, version, truncation
//!   - test_reject_malformed_manifest(): tiling gap
//!   - test_layout_checks(): excess bytes, non-contiguous and unhashed data
//!   - test_payload_signature(): whole-payload signature verified and tampered
//!   - test_move_and_bsdiff_within_full_payload(): new-image sources + MOVE origin
//!   - test_ordering_violation_names_operation(): read before write
//!   - test_cancel_and_zero_policy(): cancellation + ZERO handling

use std::fs;
use std::io::Cursor;

use ed25519_dalek::SigningKey;

use nexus_payload::manifest::proto;
use nexus_payload::signature;
use nexus_payload::{
    apply_delta, apply_full, apply_partitions, ApplyOptions, ApplyReport, EngineConfig, Error,
    ErrorKind, Extent, OperationKind, PartitionKind, PartitionState, PartitionTarget, Payload,
    PayloadType, SchemeRegistry, SignatureCheck, SourceImage, SourceLocation, ZeroPolicy,
};
use payload_host::{
    delta_payload, full_payload, image, mutate, public_key, signing_key, Built, PayloadBuilder,
    BLOCK_SIZE,
};
use storage::{BlockDevice, MemBlockDevice};

type TestPayload = Payload<Cursor<Vec<u8>>>;

const BS: usize = BLOCK_SIZE as usize;

fn open(built: &Built) -> TestPayload {
    Payload::from_bytes(built.bytes.clone(), &EngineConfig::default()).expect("payload parses")
}

fn open_err(bytes: Vec<u8>) -> Error {
    match Payload::from_bytes(bytes, &EngineConfig::default()) {
        Ok(_) => panic!("payload unexpectedly parsed"),
        Err(err) => err,
    }
}

fn unhashed_config() -> EngineConfig {
    EngineConfig { allow_unhashed: true, ..EngineConfig::default() }
}

/// Applies `payload` to zeroed in-memory devices sized from the manifest.
fn apply_in_memory(
    payload: &TestPayload,
    old: &[(PartitionKind, &[u8])],
    options: &ApplyOptions,
) -> (ApplyReport, Vec<(PartitionKind, Vec<u8>)>) {
    let manifest = payload.manifest();
    let bs = manifest.block_size as usize;
    let olds: Vec<(PartitionKind, MemBlockDevice)> = old
        .iter()
        .map(|(kind, img)| (*kind, MemBlockDevice::from_bytes(bs, img.to_vec())))
        .collect();
    let mut news: Vec<(PartitionKind, MemBlockDevice)> = manifest
        .partitions
        .iter()
        .map(|p| (p.kind, MemBlockDevice::new(bs, p.new_blocks(manifest.block_size))))
        .collect();
    let targets = news
        .iter_mut()
        .map(|(kind, dev)| PartitionTarget {
            kind: *kind,
            new: dev,
            old: olds
                .iter()
                .find(|(k, _)| *k == *kind)
                .map(|(_, d)| d as &(dyn BlockDevice + Sync)),
        })
        .collect();
    let report = apply_partitions(payload, manifest, targets, options)
        .expect("every partition has a target");
    (report, news.into_iter().map(|(kind, dev)| (kind, dev.into_bytes())).collect())
}

fn output(images: &[(PartitionKind, Vec<u8>)], kind: PartitionKind) -> &[u8] {
    &images.iter().find(|(k, _)| *k == kind).expect("partition applied").1
}

/// Two-partition full payload built by hand, optionally without data hashes.
fn small_full(kernel: &[u8], root: &[u8], hashed: bool) -> PayloadBuilder {
    let mut builder = PayloadBuilder::new(2);
    if !hashed {
        builder = builder.unhashed();
    }
    let k = builder.partition("kernel", kernel, None);
    builder.replace(k, Extent::new(0, (kernel.len() / BS) as u64));
    let r = builder.partition("root", root, None);
    builder.replace(r, Extent::new(0, (root.len() / BS) as u64));
    builder
}

#[test]
fn test_full_payload_applies_and_verifies() {
    let (kernel, root) = (image(4, 1), image(9, 2));
    let built = full_payload(&kernel, &root).build();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("update.bin");
    fs::write(&path, &built.bytes).unwrap();

    let config = EngineConfig::default();
    let payload = Payload::open_path(&path, &config).expect("payload opens");
    let key = public_key(&signing_key());
    let report =
        payload.verify(None, Some(&key), Some(PayloadType::Full), &config).expect("verify ok");
    assert_eq!(report.metadata_signature, SignatureCheck::Verified);
    assert_eq!(report.payload_signature, SignatureCheck::Absent);
    assert_eq!(report.payload_type, PayloadType::Full);
    assert_eq!(report.partitions.len(), 2);
    let root_report = &report.partitions[1];
    assert_eq!(root_report.kind, PartitionKind::Root);
    assert_eq!(root_report.new_size, root.len() as u64);
    for kind in ["REPLACE", "REPLACE_BZ", "REPLACE_GZ"] {
        assert_eq!(root_report.operation_counts[kind], 1);
    }
    assert_eq!(report.total_data_bytes, report.blob_size);

    let described = payload.describe();
    assert_eq!(described.metadata_signature, SignatureCheck::NotChecked);
    assert!(described.to_string().contains("REPLACE_GZ"));
    assert!(described.to_json().unwrap().contains("\"payload_type\": \"full\""));

    let (kernel_out, root_out) = (dir.path().join("kernel.img"), dir.path().join("root.img"));
    let applied =
        apply_full(&payload, &kernel_out, &root_out, &ApplyOptions::default()).expect("apply ok");
    assert!(applied.is_success());
    assert_eq!(applied.outcome(PartitionKind::Root).unwrap().operations_applied, 3);
    assert_eq!(fs::read(&kernel_out).unwrap(), kernel);
    assert_eq!(fs::read(&root_out).unwrap(), root);
}

#[test]
fn test_every_block_traced_exactly_once() {
    let (kernel, root) = (image(4, 1), image(9, 2));
    let payload = open(&full_payload(&kernel, &root).build());
    for part in &payload.manifest().partitions {
        let mut per_op = vec![0u64; part.operations.len()];
        for block in 0..part.new_blocks(BLOCK_SIZE) {
            let trace =
                nexus_payload::trace_block(&payload, part.kind, block).expect("block covered");
            assert!(trace.dst_extent.contains(block));
            assert_eq!(trace.kind, part.operations[trace.operation_index].kind);
            per_op[trace.operation_index] += 1;
        }
        for (count, op) in per_op.iter().zip(&part.operations) {
            assert_eq!(*count, op.dst_blocks());
        }
    }
}

#[test]
fn test_delta_matches_full_output() {
    let (old_kernel, old_root) = (image(4, 1), image(9, 2));
    let new_kernel = mutate(&old_kernel, 2, 9);
    let mut new_root = mutate(&old_root, 3, 5);
    new_root.extend(image(2, 11));

    let key = public_key(&signing_key());
    let config = EngineConfig::default();
    let delta = open(&delta_payload(&old_kernel, &new_kernel, &old_root, &new_root).build());
    delta.verify(None, Some(&key), Some(PayloadType::Delta), &config).expect("delta verifies");
    let kinds = delta.manifest().partitions[1]
        .operations
        .iter()
        .map(|op| op.kind)
        .collect::<Vec<_>>();
    assert!(kinds.contains(&OperationKind::SourceCopy));
    assert!(kinds.contains(&OperationKind::SourceBsdiff));
    assert!(kinds.contains(&OperationKind::ReplaceBz));

    let olds = [(PartitionKind::Kernel, &old_kernel[..]), (PartitionKind::Root, &old_root[..])];
    let (report, from_delta) = apply_in_memory(&delta, &olds, &ApplyOptions::default());
    assert!(report.is_success());

    let full = open(&full_payload(&new_kernel, &new_root).build());
    let (report, from_full) = apply_in_memory(&full, &[], &ApplyOptions::default());
    assert!(report.is_success());

    for kind in [PartitionKind::Kernel, PartitionKind::Root] {
        assert_eq!(output(&from_delta, kind), output(&from_full, kind));
    }
    assert_eq!(output(&from_delta, PartitionKind::Root), &new_root[..]);
}

#[test]
fn test_apply_is_deterministic() {
    let (kernel, root) = (image(3, 7), image(5, 8));
    let first = full_payload(&kernel, &root).build();
    let second = full_payload(&kernel, &root).build();
    assert_eq!(first.bytes, second.bytes);

    let payload = open(&first);
    let (_, a) = apply_in_memory(&payload, &[], &ApplyOptions::default());
    let (_, b) = apply_in_memory(&payload, &[], &ApplyOptions::default());
    assert_eq!(a, b);
}

#[test]
fn test_parallel_apply_matches_sequential() {
    let (old_kernel, old_root) = (image(6, 3), image(8, 4));
    let (new_kernel, new_root) = (mutate(&old_kernel, 2, 1), mutate(&old_root, 3, 2));
    let payload = open(&delta_payload(&old_kernel, &new_kernel, &old_root, &new_root).build());
    let olds = [(PartitionKind::Kernel, &old_kernel[..]), (PartitionKind::Root, &old_root[..])];

    let (sequential, a) = apply_in_memory(&payload, &olds, &ApplyOptions::default());
    let parallel = ApplyOptions { parallel: true, ..ApplyOptions::default() };
    let (concurrent, b) = apply_in_memory(&payload, &olds, &parallel);
    assert!(sequential.is_success() && concurrent.is_success());
    assert_eq!(a, b);
}

#[test]
fn test_twenty_block_root_delta() {
    let old_root = image(20, 4);
    let mut new_root = image(10, 5);
    new_root.extend(mutate(&old_root[5 * BS..15 * BS], 2, 3));

    let mut builder = PayloadBuilder::new(2).minor_version(1);
    let root = builder.partition("root", &new_root, Some(&old_root));
    builder.replace(root, Extent::new(0, 10));
    builder.source_bsdiff(root, &[Extent::new(5, 10)], &[Extent::new(10, 10)]);
    let built = builder.build();
    let payload = open(&built);

    let key = public_key(&signing_key());
    payload
        .verify(None, Some(&key), Some(PayloadType::Delta), &EngineConfig::default())
        .expect("verify ok");

    let old = [(PartitionKind::Root, &old_root[..])];
    let (report, images) = apply_in_memory(&payload, &old, &ApplyOptions::default());
    let outcome = report.outcome(PartitionKind::Root).unwrap();
    assert_eq!(outcome.state, PartitionState::Verified);
    assert_eq!(outcome.blocks_written, 20);
    assert_eq!(outcome.operations_applied, 2);
    assert_eq!(output(&images, PartitionKind::Root), &new_root[..]);

    let trace = nexus_payload::trace_block(&payload, PartitionKind::Root, 15).unwrap();
    assert_eq!(trace.operation_index, 1);
    assert_eq!(trace.kind, OperationKind::SourceBsdiff);
    assert_eq!(trace.dst_extent, Extent::new(10, 10));
    assert_eq!(
        trace.source,
        Some(SourceLocation { image: SourceImage::Old, block: 10, exact: false })
    );
    assert!(trace.origin.is_empty());

    let err = nexus_payload::trace_block(&payload, PartitionKind::Root, 20).unwrap_err();
    assert!(matches!(err, Error::BlockOutOfRange { block: 20, total: 20 }));
    let err = nexus_payload::trace_block(&payload, PartitionKind::Kernel, 0).unwrap_err();
    assert!(matches!(err, Error::BlockOutOfRange { total: 0, .. }));

    let mut corrupt = built.bytes.clone();
    corrupt[built.blob_offset + 5 * BS] ^= 0x10;
    let corrupt = Payload::from_bytes(corrupt, &EngineConfig::default()).unwrap();
    let (report, _) = apply_in_memory(&corrupt, &old, &ApplyOptions::default());
    let outcome = report.outcome(PartitionKind::Root).unwrap();
    assert_eq!(outcome.state, PartitionState::Failed);
    assert_eq!(outcome.error.as_ref().unwrap().kind(), ErrorKind::HashMismatch);

    // Kernel is absent from the payload: its files are never touched.
    let dir = tempfile::tempdir().unwrap();
    let old_root_path = dir.path().join("old-root.img");
    fs::write(&old_root_path, &old_root).unwrap();
    let (kernel_out, root_out) = (dir.path().join("kernel.img"), dir.path().join("root.img"));
    let applied = apply_delta(
        &payload,
        &kernel_out,
        &root_out,
        &dir.path().join("missing-old-kernel.img"),
        &old_root_path,
        &ApplyOptions::default(),
    )
    .expect("root-only delta applies");
    assert_eq!(applied.outcomes.len(), 1);
    assert!(!kernel_out.exists());
    assert_eq!(fs::read(&root_out).unwrap(), new_root);
}

#[test]
fn test_corrupt_blob_byte_fails_verification() {
    let (kernel, root) = (image(4, 1), image(9, 2));
    let mut built = full_payload(&kernel, &root).build();
    built.bytes[built.blob_offset + 10] ^= 0x40;
    let payload = open(&built);

    let err = payload.verify(None, None, None, &EngineConfig::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::HashMismatch);
    assert_eq!(err.operation_index(), Some(0));

    let (report, _) = apply_in_memory(&payload, &[], &ApplyOptions::default());
    let kernel_outcome = report.outcome(PartitionKind::Kernel).unwrap();
    assert_eq!(kernel_outcome.state, PartitionState::Failed);
    assert_eq!(kernel_outcome.operations_applied, 0);
    assert_eq!(kernel_outcome.error.as_ref().unwrap().kind(), ErrorKind::HashMismatch);
    assert_eq!(report.outcome(PartitionKind::Root).unwrap().state, PartitionState::Verified);
}

#[test]
fn test_unhashed_corruption_fails_one_partition() {
    let (kernel, root) = (image(2, 1), image(3, 2));
    let mut built = small_full(&kernel, &root, false).build();
    built.bytes[built.blob_offset + 10] ^= 0x01;
    let payload = open(&built);

    let err = payload.verify(None, None, None, &EngineConfig::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MalformedManifest);
    payload.verify(None, None, None, &unhashed_config()).expect("unhashed data allowed");

    let (report, images) = apply_in_memory(&payload, &[], &ApplyOptions::default());
    let kernel_outcome = report.outcome(PartitionKind::Kernel).unwrap();
    assert_eq!(kernel_outcome.state, PartitionState::Failed);
    assert_eq!(kernel_outcome.operations_applied, 1);
    let err = kernel_outcome.error.as_ref().unwrap();
    assert!(matches!(err, Error::Partition { partition, .. } if partition == "kernel"));
    assert_eq!(err.kind(), ErrorKind::HashMismatch);

    assert_eq!(report.outcome(PartitionKind::Root).unwrap().state, PartitionState::Verified);
    assert_eq!(output(&images, PartitionKind::Root), &root[..]);
}

#[test]
fn test_every_manifest_bit_flip_is_rejected() {
    let key = public_key(&signing_key());
    let registry = SchemeRegistry::default();
    for version in [1u64, 2] {
        let mut builder = PayloadBuilder::new(version);
        let k = builder.partition("kernel", &image(1, 1), None);
        builder.replace(k, Extent::new(0, 1));
        let built = builder.build();
        let scheme = registry.get(version).unwrap();
        let header = &built.bytes[..built.manifest_offset];
        let manifest =
            &built.bytes[built.manifest_offset..built.manifest_offset + built.manifest_len];
        let sig = Some(&built.metadata_signature[..]);

        signature::verify_metadata_signature(scheme, header, manifest, sig, &key)
            .expect("pristine manifest");
        let mut flipped = manifest.to_vec();
        for bit in 0..manifest.len() * 8 {
            flipped[bit / 8] ^= 1 << (bit % 8);
            let err = signature::verify_metadata_signature(scheme, header, &flipped, sig, &key)
                .unwrap_err();
            assert!(matches!(err, Error::SignatureInvalid(_)), "v{version} bit {bit}: {err}");
            flipped[bit / 8] ^= 1 << (bit % 8);
        }
    }
}

#[test]
fn test_reject_missing_signature() {
    let key = public_key(&signing_key());
    let config = EngineConfig::default();
    let (kernel, root) = (image(1, 1), image(1, 2));

    let detached = small_full(&kernel, &root, true).detached_signature().build();
    let payload = open(&detached);
    assert!(payload.metadata_signature().is_none());
    let err = payload.verify(None, Some(&key), None, &config).unwrap_err();
    assert!(matches!(err, Error::SignatureMissing));
    payload
        .verify(Some(&detached.metadata_signature), Some(&key), None, &config)
        .expect("out-of-band signature verifies");

    let v1 = {
        let mut builder = PayloadBuilder::new(1);
        let k = builder.partition("kernel", &kernel, None);
        builder.replace(k, Extent::new(0, 1));
        builder.build()
    };
    let payload = open(&v1);
    assert_eq!(payload.version(), 1);
    assert!(matches!(
        payload.verify(None, Some(&key), None, &config),
        Err(Error::SignatureMissing)
    ));
    let report = payload.verify(None, None, None, &config).expect("unsigned check without a key");
    assert_eq!(report.metadata_signature, SignatureCheck::NotChecked);

    let empty = proto::Signatures::default();
    let empty = prost::Message::encode_to_vec(&empty);
    let err = payload.verify(Some(&empty), Some(&key), None, &config);
    assert!(matches!(err, Err(Error::SignatureMissing)));
}

#[test]
fn test_out_of_band_signature_takes_precedence() {
    let key = public_key(&signing_key());
    let config = EngineConfig::default();
    let (kernel, root) = (image(1, 1), image(1, 2));
    let built = small_full(&kernel, &root, true).build();
    let payload = open(&built);
    assert!(payload.metadata_signature().is_some());
    payload.verify(None, Some(&key), None, &config).expect("embedded signature verifies");

    let rogue = SigningKey::from_bytes(&[9u8; 32]);
    let forged = small_full(&kernel, &root, true).signed_by(rogue.clone()).build();
    let err =
        payload.verify(Some(&forged.metadata_signature), Some(&key), None, &config).unwrap_err();
    assert!(matches!(err, Error::SignatureInvalid(_)));

    let err = payload.verify(None, Some(&public_key(&rogue)), None, &config).unwrap_err();
    assert!(matches!(err, Error::SignatureInvalid(_)));
}

#[test]
fn test_payload_type_mismatch_creates_no_files() {
    let old = image(2, 1);
    let new = mutate(&old, 1, 3);
    let delta = open(&delta_payload(&old, &new, &old, &new).build());
    let full = open(&full_payload(&new, &new).build());
    let dir = tempfile::tempdir().unwrap();
    let (kernel_out, root_out) = (dir.path().join("kernel.img"), dir.path().join("root.img"));

    let err = apply_full(&delta, &kernel_out, &root_out, &ApplyOptions::default()).unwrap_err();
    assert!(matches!(
        err,
        Error::PayloadTypeMismatch { expected: PayloadType::Full, actual: PayloadType::Delta }
    ));
    assert!(!kernel_out.exists() && !root_out.exists());

    let options = ApplyOptions::default();
    let err =
        apply_delta(&full, &kernel_out, &root_out, &kernel_out, &root_out, &options).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PayloadTypeMismatch);
    assert!(!kernel_out.exists() && !root_out.exists());

    let err =
        delta.verify(None, None, Some(PayloadType::Full), &EngineConfig::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PayloadTypeMismatch);
}

#[test]
fn test_oversized_partition_creates_no_files() {
    let huge = 1u64 << 40;
    let mut builder = PayloadBuilder::new(2);
    let k = builder.partition("kernel", &[], None);
    builder.zero(k, Extent::new(0, huge));
    builder.manifest_mut(k).new_partition_info = Some(proto::PartitionInfo {
        size: Some(huge * u64::from(BLOCK_SIZE)),
        hash: Some(vec![0u8; 32]),
    });
    let r = builder.partition("root", &image(2, 5), None);
    builder.replace(r, Extent::new(0, 2));
    let payload = open(&builder.build());
    let dir = tempfile::tempdir().unwrap();
    let (kernel_out, root_out) = (dir.path().join("kernel.img"), dir.path().join("root.img"));

    let err = apply_full(&payload, &kernel_out, &root_out, &ApplyOptions::default()).unwrap_err();
    assert!(matches!(err, Error::MalformedManifest(ref msg) if msg.contains("kernel: image of")));
    assert!(!kernel_out.exists() && !root_out.exists());

    let small = open(&small_full(&image(1, 1), &image(2, 2), true).build());
    let config = EngineConfig { root_part_size: BLOCK_SIZE as u64, ..EngineConfig::default() };
    let err = apply_full(&small, &kernel_out, &root_out, &ApplyOptions::from_config(&config))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MalformedManifest);
    assert!(!kernel_out.exists() && !root_out.exists());
    assert!(apply_full(&small, &kernel_out, &root_out, &ApplyOptions::default()).is_ok());
}

#[test]
fn test_reject_malformed_container() {
    let built = small_full(&image(1, 1), &image(1, 2), true).build();

    let mut bad_magic = built.bytes.clone();
    bad_magic[0] = b'X';
    assert_eq!(open_err(bad_magic).kind(), ErrorKind::MalformedContainer);

    let mut bad_version = built.bytes.clone();
    bad_version[4..12].copy_from_slice(&3u64.to_be_bytes());
    assert_eq!(open_err(bad_version).kind(), ErrorKind::MalformedContainer);

    let truncated = built.bytes[..built.manifest_offset + built.manifest_len / 2].to_vec();
    assert_eq!(open_err(truncated).kind(), ErrorKind::MalformedContainer);

    assert_eq!(open_err(b"NXUP".to_vec()).kind(), ErrorKind::MalformedContainer);
}

#[test]
fn test_reject_malformed_manifest() {
    let root = image(3, 2);
    let mut builder = PayloadBuilder::new(2);
    let r = builder.partition("root", &root, None);
    builder.replace(r, Extent::new(0, 2));
    let err = open_err(builder.build().bytes);
    assert_eq!(err.kind(), ErrorKind::MalformedManifest);

    let mut builder = PayloadBuilder::new(2);
    let r = builder.partition("vendor", &root, None);
    builder.replace(r, Extent::new(0, 3));
    assert_eq!(open_err(builder.build().bytes).kind(), ErrorKind::MalformedManifest);
}

#[test]
fn test_layout_checks() {
    let (kernel, root) = (image(2, 1), image(1, 2));
    let config = EngineConfig::default();

    let mut excess = small_full(&kernel, &root, true).build();
    excess.bytes.push(0);
    let err = open(&excess).verify(None, None, None, &config).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MalformedContainer);

    // Two kernel ops whose data sits in reverse order in the blob.
    let mut builder = PayloadBuilder::new(2);
    let k = builder.partition("kernel", &kernel, None);
    builder.replace(k, Extent::new(0, 1));
    builder.replace(k, Extent::new(1, 1));
    builder.manifest_mut(k).operations.swap(0, 1);
    let r = builder.partition("root", &root, None);
    builder.replace(r, Extent::new(0, 1));
    let payload = open(&builder.build());
    let err = payload.verify(None, None, None, &config).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MalformedManifest);
    assert_eq!(err.operation_index(), Some(0));
    // Still applicable: order of data in the blob does not matter to the executor.
    let (report, _) = apply_in_memory(&payload, &[], &ApplyOptions::default());
    assert!(report.is_success());

    let unhashed = open(&small_full(&kernel, &root, false).build());
    assert_eq!(
        unhashed.verify(None, None, None, &config).unwrap_err().kind(),
        ErrorKind::MalformedManifest
    );
    unhashed.verify(None, None, None, &unhashed_config()).expect("allowed by config");
}

#[test]
fn test_payload_signature() {
    let key = public_key(&signing_key());
    let (kernel, root) = (image(2, 1), image(2, 2));

    let built = small_full(&kernel, &root, true).with_payload_signature().build();
    let payload = open(&built);
    let report =
        payload.verify(None, Some(&key), None, &EngineConfig::default()).expect("verify ok");
    assert_eq!(report.payload_signature, SignatureCheck::Verified);
    assert!(payload.manifest().signatures.is_some());

    let mut tampered = built.bytes.clone();
    let last = tampered.len() - 1;
    tampered[last] ^= 0x01;
    let payload = Payload::from_bytes(tampered, &EngineConfig::default()).unwrap();
    let err = payload.verify(None, Some(&key), None, &EngineConfig::default()).unwrap_err();
    assert!(matches!(err, Error::SignatureInvalid(_)));

    // Without data hashes only the payload signature notices altered op data.
    let mut unhashed = small_full(&kernel, &root, false).with_payload_signature().build();
    unhashed.bytes[unhashed.blob_offset] ^= 0x01;
    let err = open(&unhashed).verify(None, Some(&key), None, &unhashed_config()).unwrap_err();
    assert!(matches!(err, Error::SignatureInvalid(_)));
}

#[test]
fn test_move_and_bsdiff_within_full_payload() {
    let head = image(4, 6);
    let mut kernel = head.clone();
    kernel.extend_from_slice(&head[..2 * BS]);
    kernel.extend(mutate(&head[2 * BS..4 * BS], 1, 7));
    let root = vec![0u8; BS];

    let mut builder = PayloadBuilder::new(2);
    let k = builder.partition("kernel", &kernel, None);
    builder.replace(k, Extent::new(0, 4));
    builder.move_blocks(k, &[Extent::new(0, 2)], &[Extent::new(4, 2)]);
    builder.bsdiff(k, &[Extent::new(2, 2)], &[Extent::new(6, 2)]);
    let r = builder.partition("root", &root, None);
    builder.zero(r, Extent::new(0, 1));

    let payload = open(&builder.build());
    payload
        .verify(None, None, Some(PayloadType::Full), &EngineConfig::default())
        .expect("verify ok");
    let (report, images) = apply_in_memory(&payload, &[], &ApplyOptions::default());
    assert!(report.is_success());
    assert_eq!(output(&images, PartitionKind::Kernel), &kernel[..]);
    assert_eq!(output(&images, PartitionKind::Root), &root[..]);

    let trace = nexus_payload::trace_block(&payload, PartitionKind::Kernel, 5).unwrap();
    assert_eq!(trace.kind, OperationKind::Move);
    assert_eq!(
        trace.source,
        Some(SourceLocation { image: SourceImage::New, block: 1, exact: true })
    );
    assert_eq!(trace.origin.len(), 1);
    assert_eq!(trace.origin[0].operation_index, 0);
    assert_eq!(trace.origin[0].kind, OperationKind::Replace);

    let trace = nexus_payload::trace_block(&payload, PartitionKind::Kernel, 7).unwrap();
    assert_eq!(trace.kind, OperationKind::Bsdiff);
    assert_eq!(trace.source.map(|s| (s.image, s.exact)), Some((SourceImage::New, false)));
}

#[test]
fn test_ordering_violation_names_operation() {
    let half = image(2, 3);
    let kernel = [half.clone(), half].concat();
    let mut builder = PayloadBuilder::new(2);
    let k = builder.partition("kernel", &kernel, None);
    builder.move_blocks(k, &[Extent::new(2, 2)], &[Extent::new(0, 2)]);
    builder.replace(k, Extent::new(2, 2));
    let r = builder.partition("root", &image(1, 4), None);
    builder.replace(r, Extent::new(0, 1));

    let payload = open(&builder.build());
    let (report, _) = apply_in_memory(&payload, &[], &ApplyOptions::default());
    let outcome = report.outcome(PartitionKind::Kernel).unwrap();
    assert_eq!(outcome.state, PartitionState::Failed);
    let err = outcome.error.as_ref().unwrap();
    assert!(matches!(
        err,
        Error::Operation { partition, index: 0, kind: OperationKind::Move, .. }
            if partition == "kernel"
    ));
    assert_eq!(err.kind(), ErrorKind::OrderingViolation);
    assert!(err.to_string().starts_with("kernel operation 0"));
    assert_eq!(report.outcome(PartitionKind::Root).unwrap().state, PartitionState::Verified);
}

#[test]
fn test_cancel_and_zero_policy() {
    let (kernel, root) = (image(2, 1), image(2, 2));
    let payload = open(&full_payload(&kernel, &root).build());

    let options = ApplyOptions::default();
    options.cancel.cancel();
    let dir = tempfile::tempdir().unwrap();
    let err =
        apply_full(&payload, &dir.path().join("k"), &dir.path().join("r"), &options).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);

    let zeroes = vec![0u8; 2 * BS];
    let mut builder = PayloadBuilder::new(2);
    let k = builder.partition("kernel", &zeroes, None);
    builder.zero(k, Extent::new(0, 2));
    let r = builder.partition("root", &root, None);
    builder.replace_gz(r, Extent::new(0, 2));
    let payload = open(&builder.build());
    for zero_policy in [ZeroPolicy::Fill, ZeroPolicy::Skip] {
        let options = ApplyOptions { zero_policy, ..ApplyOptions::default() };
        let (report, images) = apply_in_memory(&payload, &[], &options);
        assert!(report.is_success(), "{zero_policy:?}");
        assert_eq!(report.outcome(PartitionKind::Kernel).unwrap().blocks_written, 2);
        assert_eq!(output(&images, PartitionKind::Kernel), &zeroes[..]);
    }
}

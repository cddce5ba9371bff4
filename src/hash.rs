//! Block digest computation.
//!
//! One algorithm is chosen per run and announced in the stream header, so both
//! ends hash with the same function. Digests are fixed-width per algorithm.

use sha2::{Digest as _, Sha256};
use std::fmt;
use std::str::FromStr;

/// Widest digest any supported algorithm produces.
pub const MAX_DIGEST_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum HashAlgorithm {
    /// BLAKE3, 256-bit. Fast on every CPU with SIMD.
    #[default]
    Blake3 = 1,
    /// XXH3 128-bit. Not cryptographic, only use on trusted devices.
    Xxh3 = 2,
    /// SHA-256. Slowest, for hosts that mandate it.
    Sha256 = 3,
}

impl HashAlgorithm {
    pub const ALL: [HashAlgorithm; 3] = [
        HashAlgorithm::Blake3,
        HashAlgorithm::Xxh3,
        HashAlgorithm::Sha256,
    ];

    pub fn from_u8(id: u8) -> Option<Self> {
        match id {
            1 => Some(Self::Blake3),
            2 => Some(Self::Xxh3),
            3 => Some(Self::Sha256),
            _ => None,
        }
    }

    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Blake3 => "blake3",
            Self::Xxh3 => "xxh3",
            Self::Sha256 => "sha256",
        }
    }

    /// Width of the digest on the wire.
    pub fn digest_len(self) -> usize {
        match self {
            Self::Blake3 => 32,
            Self::Xxh3 => 16,
            Self::Sha256 => 32,
        }
    }

    pub fn digest(self, data: &[u8]) -> Digest {
        let mut bytes = [0u8; MAX_DIGEST_LEN];
        match self {
            Self::Blake3 => {
                bytes.copy_from_slice(blake3::hash(data).as_bytes());
            }
            Self::Xxh3 => {
                let h = xxhash_rust::xxh3::xxh3_128(data);
                bytes[..16].copy_from_slice(&h.to_be_bytes());
            }
            Self::Sha256 => {
                bytes.copy_from_slice(&Sha256::digest(data));
            }
        }
        Digest {
            bytes,
            len: self.digest_len() as u8,
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HashAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "blake3" => Ok(Self::Blake3),
            "xxh3" | "xxh3-128" => Ok(Self::Xxh3),
            "sha256" | "sha-256" => Ok(Self::Sha256),
            other => Err(format!(
                "unknown hash algorithm '{}' (expected one of: blake3, xxh3, sha256)",
                other
            )),
        }
    }
}

/// Content hash of one block.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest {
    bytes: [u8; MAX_DIGEST_LEN],
    len: u8,
}

impl Digest {
    /// Build a digest from raw wire bytes. Returns `None` when the slice is
    /// wider than any supported digest.
    pub fn from_slice(raw: &[u8]) -> Option<Self> {
        if raw.len() > MAX_DIGEST_LEN {
            return None;
        }
        let mut bytes = [0u8; MAX_DIGEST_LEN];
        bytes[..raw.len()].copy_from_slice(raw);
        Some(Self {
            bytes,
            len: raw.len() as u8,
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

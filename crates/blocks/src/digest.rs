//! crates/blocks/src/digest.rs
//!
//! SHA-256 block digests.

use std::fmt;
use std::str::FromStr;

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Width of a [`BlockDigest`] in bytes.
pub const DIGEST_LEN: usize = 32;

/// Content digest identifying a block.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockDigest([u8; DIGEST_LEN]);

impl BlockDigest {
    /// Computes the digest of `data`.
    #[must_use]
    pub fn of(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    /// Wraps raw digest bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    /// Returns the raw digest bytes.
    #[inline]
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// Renders the digest as lowercase hex.
    #[must_use]
    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(DIGEST_LEN * 2);
        for byte in self.0 {
            out.push(char::from(HEX[usize::from(byte >> 4)]));
            out.push(char::from(HEX[usize::from(byte & 0x0f)]));
        }
        out
    }

    /// Reports whether `data` hashes to this digest.
    #[must_use]
    pub fn matches(&self, data: &[u8]) -> bool {
        Self::of(data) == *self
    }
}

const HEX: &[u8; 16] = b"0123456789abcdef";

impl fmt::Debug for BlockDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Eight hex digits are enough to tell blocks apart in logs.
        write!(f, "BlockDigest({}..)", &self.to_hex()[..8])
    }
}

impl fmt::Display for BlockDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Error returned when parsing a hex digest fails.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseDigestError {
    /// The input did not contain exactly 64 hex characters.
    #[error("expected {expected} hex characters, found {found}")]
    Length {
        /// Required number of characters.
        expected: usize,
        /// Number of characters supplied.
        found: usize,
    },
    /// The input contained a character outside `[0-9a-fA-F]`.
    #[error("invalid hex character {0:?}")]
    Character(char),
}

impl FromStr for BlockDigest {
    type Err = ParseDigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != DIGEST_LEN * 2 {
            return Err(ParseDigestError::Length {
                expected: DIGEST_LEN * 2,
                found: s.len(),
            });
        }
        let mut bytes = [0u8; DIGEST_LEN];
        let mut chars = s.chars();
        for byte in &mut bytes {
            let hi = hex_value(chars.next())?;
            let lo = hex_value(chars.next())?;
            *byte = (hi << 4) | lo;
        }
        Ok(Self(bytes))
    }
}

fn hex_value(c: Option<char>) -> Result<u8, ParseDigestError> {
    let c = c.unwrap_or('\0');
    c.to_digit(16)
        .map(|v| v as u8)
        .ok_or(ParseDigestError::Character(c))
}

#[cfg(feature = "serde")]
impl serde::Serialize for BlockDigest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for BlockDigest {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

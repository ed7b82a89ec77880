//! Fundamental digest type.
//!
//! [`Hash256`] identifies quorum sets by content and is the output of the
//! deterministic hashing used for leader selection.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// A 32-byte SHA-256 digest.
///
/// # Examples
///
/// ```rust
/// use fba_common::Hash256;
///
/// let hash = Hash256::hash(b"hello world");
/// assert!(!hash.is_zero());
///
/// let parsed = Hash256::from_hex(&hash.to_hex()).unwrap();
/// assert_eq!(hash, parsed);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The zero hash (all bytes are 0x00), used as a placeholder.
    pub const ZERO: Self = Self([0u8; 32]);

    /// Compute the SHA-256 hash of arbitrary data.
    pub fn hash(data: &[u8]) -> Self {
        Self::hash_parts(&[data])
    }

    /// Compute the SHA-256 hash of several byte slices fed in order.
    ///
    /// Equivalent to hashing their concatenation without allocating it.
    pub fn hash_parts(parts: &[&[u8]]) -> Self {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part);
        }
        let result = hasher.finalize();
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&result);
        Self(bytes)
    }

    /// Compute the SHA-256 hash of the canonical (bincode) encoding of `value`.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be encoded.
    pub fn hash_serialized<T: Serialize + ?Sized>(value: &T) -> Result<Self, bincode::Error> {
        let bytes = bincode::serialize(value)?;
        Ok(Self::hash(&bytes))
    }

    /// Returns a reference to the underlying 32-byte array.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Creates a `Hash256` from a 32-byte array.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Creates a `Hash256` from a 64-character hexadecimal string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not valid hex or not exactly 32 bytes.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Converts the hash to a lowercase hexadecimal string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Returns `true` if this is the zero hash.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Interpret the first eight bytes as a big-endian integer.
    ///
    /// Used to derive the 64-bit priorities consumed by leader selection.
    pub fn prefix_u64(&self) -> u64 {
        let mut word = [0u8; 8];
        word.copy_from_slice(&self.0[..8]);
        u64::from_be_bytes(word)
    }
}

impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash256({})", self.to_hex())
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

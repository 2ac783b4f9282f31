use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Length in bytes of an object identifier.
pub const OID_LEN: usize = 20;

/// Content-addressed identifier for any stored object.
///
/// An `Oid` is the SHA-1 of an object's typed header and content. Identical
/// content of the same kind always produces the same `Oid`, which is what
/// makes objects deduplicatable. Ordering is bytewise, which is also the
/// order every index table is sorted in.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Oid([u8; OID_LEN]);

impl Oid {
    /// Create an `Oid` from a pre-computed hash.
    pub const fn from_hash(hash: [u8; OID_LEN]) -> Self {
        Self(hash)
    }

    /// Create an `Oid` from a slice that must be exactly 20 bytes long.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, TypeError> {
        let arr: [u8; OID_LEN] = bytes.try_into().map_err(|_| TypeError::InvalidLength {
            expected: OID_LEN,
            actual: bytes.len(),
        })?;
        Ok(Self(arr))
    }

    /// The null object ID (all zeros). Represents "no object".
    pub const fn null() -> Self {
        Self([0u8; OID_LEN])
    }

    /// Returns `true` if this is the null object ID.
    pub fn is_null(&self) -> bool {
        self.0 == [0u8; OID_LEN]
    }

    /// The raw 20-byte hash.
    pub fn as_bytes(&self) -> &[u8; OID_LEN] {
        &self.0
    }

    /// The leading byte, used to select a fan-out bucket.
    pub fn first_byte(&self) -> u8 {
        self.0[0]
    }

    /// The leading four bytes as a big-endian integer.
    pub fn first_word(&self) -> u32 {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    /// The top `bits` bits of the identifier (`bits` at most 32).
    pub fn prefix(&self, bits: u32) -> u32 {
        match bits {
            0 => 0,
            32.. => self.first_word(),
            n => self.first_word() >> (32 - n),
        }
    }

    /// Hex-encoded string representation.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short hex representation (first 7 characters).
    pub fn short_hex(&self) -> String {
        let mut s = hex::encode(&self.0[..4]);
        s.truncate(7);
        s
    }

    /// Parse from a 40-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, TypeError> {
        let bytes = hex::decode(s).map_err(|e| TypeError::InvalidHex(e.to_string()))?;
        Self::from_slice(&bytes)
    }
}

impl fmt::Debug for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Oid({})", self.short_hex())
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; OID_LEN]> for Oid {
    fn from(bytes: [u8; OID_LEN]) -> Self {
        Self(bytes)
    }
}

impl From<Oid> for [u8; OID_LEN] {
    fn from(id: Oid) -> Self {
        id.0
    }
}

impl AsRef<[u8]> for Oid {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

//! Hash keys: fixed-width positions on the ring.
//!
//! Both nodes (hashed from `host:port`) and records (hashed from their key)
//! are placed on the same 128-bit space. The hex rendering is always 32
//! lowercase characters, so comparing two renderings as strings gives the
//! same answer as comparing the numbers.

use crate::error::{Error, Result};
use serde::{Serialize, Serializer};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use xxhash_rust::xxh3::xxh3_128;

/// Width of a hash key in bytes.
pub const HASH_KEY_BYTES: usize = 16;

/// Width of a hash key rendered as hex.
pub const HASH_KEY_HEX_LEN: usize = HASH_KEY_BYTES * 2;

/// A position on the ring.
///
/// Newtype over `u128` so comparisons and hashing are very fast. The digest
/// only has to cover the space uniformly; it is not used for security.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct HashKey(pub u128);

impl HashKey {
    /// Start of the ring.
    pub const MIN: HashKey = HashKey(u128::MIN);
    /// End of the ring.
    pub const MAX: HashKey = HashKey(u128::MAX);

    /// Hash arbitrary bytes onto the ring.
    pub fn of(data: &[u8]) -> Self {
        HashKey(xxh3_128(data))
    }

    /// Hash a record key.
    pub fn of_key(key: &str) -> Self {
        Self::of(key.as_bytes())
    }

    /// Ring position of the node serving at `host:port`.
    pub fn for_address(host: Ipv4Addr, port: u16) -> Self {
        Self::of(format!("{}:{}", host, port).as_bytes())
    }

    /// The next position clockwise; `MAX` wraps to `MIN`.
    #[inline]
    pub fn next(self) -> Self {
        HashKey(self.0.wrapping_add(1))
    }

    /// The previous position; `MIN` wraps to `MAX`.
    #[inline]
    pub fn prev(self) -> Self {
        HashKey(self.0.wrapping_sub(1))
    }

    /// Big-endian bytes, as sent on the wire.
    #[inline]
    pub fn to_bytes(self) -> [u8; HASH_KEY_BYTES] {
        self.0.to_be_bytes()
    }

    #[inline]
    pub fn from_bytes(bytes: [u8; HASH_KEY_BYTES]) -> Self {
        HashKey(u128::from_be_bytes(bytes))
    }

    /// Parse from a slice that must be exactly 16 bytes long.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let array: [u8; HASH_KEY_BYTES] = bytes.try_into().map_err(|_| {
            Error::InvalidHashKey(format!("expected {} bytes, got {}", HASH_KEY_BYTES, bytes.len()))
        })?;
        Ok(Self::from_bytes(array))
    }

    /// Lowercase hex rendering (always 32 characters).
    pub fn to_hex(self) -> String {
        format!("{:032x}", self.0)
    }
}

impl fmt::Display for HashKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl fmt::Debug for HashKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HashKey({:032x})", self.0)
    }
}

impl FromStr for HashKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() != HASH_KEY_HEX_LEN || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::InvalidHashKey(s.to_string()));
        }
        // Uppercase would break the string-order guarantee.
        if s.bytes().any(|b| b.is_ascii_uppercase()) {
            return Err(Error::InvalidHashKey(s.to_string()));
        }
        u128::from_str_radix(s, 16)
            .map(HashKey)
            .map_err(|e| Error::InvalidHashKey(format!("{}: {}", s, e)))
    }
}

impl Serialize for HashKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

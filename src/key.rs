//! Cache keys: a partition namespace plus a 128-bit content hash.
//!
//! A [`Key`] identifies one cached response. The partition names a logical
//! namespace and becomes a directory on disk; the hash is a deterministic
//! digest of the request fingerprint and its lowercase hex rendering is the
//! on-disk file name.

use sha2::{Digest, Sha256};
use std::fmt;

/// Size of the key hash in bytes.
pub const HASH_SIZE: usize = 16;

/// The 128-bit key hash.
pub type KeyHash = [u8; HASH_SIZE];

/// Identifies one cached response within a partition.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Key {
    partition: String,
    hash: KeyHash,
}

impl Key {
    /// Create a key from a partition name and a precomputed hash.
    ///
    /// The partition must be non-empty; it becomes a directory name on disk.
    pub fn new(partition: impl Into<String>, hash: KeyHash) -> Self {
        let partition = partition.into();
        debug_assert!(!partition.is_empty());
        Self { partition, hash }
    }

    /// Derive a key from a request fingerprint.
    ///
    /// The hash is the truncated SHA-256 digest of the fingerprint bytes, so
    /// the same fingerprint always maps to the same file across processes
    /// and restarts.
    pub fn from_fingerprint(partition: impl Into<String>, fingerprint: &[u8]) -> Self {
        let digest = Sha256::digest(fingerprint);
        let mut hash = [0u8; HASH_SIZE];
        hash.copy_from_slice(&digest[..HASH_SIZE]);
        Self::new(partition, hash)
    }

    /// The partition this key belongs to.
    pub fn partition(&self) -> &str {
        &self.partition
    }

    /// The full 128-bit hash.
    pub fn hash(&self) -> &KeyHash {
        &self.hash
    }

    /// The 32-bit prefix of the hash used to index the existence filter.
    pub fn short_hash(&self) -> u32 {
        Self::short_hash_of(&self.hash)
    }

    /// Short hash of a raw key hash, without constructing a `Key`.
    pub fn short_hash_of(hash: &KeyHash) -> u32 {
        u32::from_le_bytes([hash[0], hash[1], hash[2], hash[3]])
    }

    /// Lowercase hex rendering of the hash; the on-disk file name.
    pub fn hash_as_string(&self) -> String {
        let mut out = String::with_capacity(HASH_SIZE * 2);
        for byte in self.hash {
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }

    /// Parse a hex file name back into a key hash.
    ///
    /// Returns `None` unless the input is exactly `2 * HASH_SIZE` hex digits.
    pub fn string_to_hash(name: &str) -> Option<KeyHash> {
        let bytes = name.as_bytes();
        if bytes.len() != HASH_SIZE * 2 {
            return None;
        }
        let mut hash = [0u8; HASH_SIZE];
        for (i, chunk) in bytes.chunks_exact(2).enumerate() {
            let digits = std::str::from_utf8(chunk).ok()?;
            hash[i] = u8::from_str_radix(digits, 16).ok()?;
        }
        Some(hash)
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({}/{})", self.partition, self.hash_as_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_string_round_trip() {
        let key = Key::from_fingerprint("a", b"https://example.com/style.css");
        let name = key.hash_as_string();
        assert_eq!(name.len(), HASH_SIZE * 2);
        assert!(name.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(Key::string_to_hash(&name), Some(*key.hash()));
    }

    #[test]
    fn test_string_to_hash_rejects_garbage() {
        assert!(Key::string_to_hash("").is_none());
        assert!(Key::string_to_hash("zz").is_none());
        assert!(Key::string_to_hash("0123").is_none());
        assert!(Key::string_to_hash(&"0".repeat(HASH_SIZE * 2 + 2)).is_none());
        assert!(Key::string_to_hash(&"g".repeat(HASH_SIZE * 2)).is_none());
    }

    #[test]
    fn test_fingerprint_is_deterministic() {
        let a = Key::from_fingerprint("p", b"GET https://example.com/");
        let b = Key::from_fingerprint("p", b"GET https://example.com/");
        let c = Key::from_fingerprint("p", b"GET https://example.com/other");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_short_hash_is_hash_prefix() {
        let key = Key::from_fingerprint("p", b"fingerprint");
        let hash = key.hash();
        let expected = u32::from_le_bytes([hash[0], hash[1], hash[2], hash[3]]);
        assert_eq!(key.short_hash(), expected);
        assert_eq!(Key::short_hash_of(hash), expected);
    }

    #[test]
    fn test_partitions_distinguish_keys() {
        let hash = [7u8; HASH_SIZE];
        let a = Key::new("a", hash);
        let b = Key::new("b", hash);
        assert_ne!(a, b);
        assert_eq!(a.hash_as_string(), b.hash_as_string());
    }
}

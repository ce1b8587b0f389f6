//! Immutable byte containers shared between the sequencer and I/O pools.
//!
//! [`Data`] abstracts over an owned buffer and a memory-mapped file range so
//! that entry headers (copied into RAM) and entry bodies (mapped from disk)
//! move through the engine with the same cheaply clonable type.

use bytes::Bytes;
use memmap2::Mmap;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

/// An immutable, cheaply clonable blob of bytes.
#[derive(Clone, Default)]
pub struct Data {
    repr: Repr,
}

#[derive(Clone, Default)]
enum Repr {
    #[default]
    Empty,
    Buffer(Bytes),
    Mapped(Arc<Mmap>),
}

impl Data {
    /// An empty blob.
    pub const fn empty() -> Self {
        Self { repr: Repr::Empty }
    }

    /// Wrap a memory-mapped file range.
    pub(crate) fn mapped(map: Mmap) -> Self {
        Self {
            repr: Repr::Mapped(Arc::new(map)),
        }
    }

    /// The underlying bytes.
    pub fn as_slice(&self) -> &[u8] {
        match &self.repr {
            Repr::Empty => &[],
            Repr::Buffer(bytes) => bytes,
            Repr::Mapped(map) => map,
        }
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    /// Whether the blob is empty.
    pub fn is_empty(&self) -> bool {
        self.as_slice().is_empty()
    }

    /// Whether the blob is backed by a memory-mapped file range.
    pub fn is_mapped(&self) -> bool {
        matches!(self.repr, Repr::Mapped(_))
    }
}

impl Deref for Data {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl From<Bytes> for Data {
    fn from(bytes: Bytes) -> Self {
        Self {
            repr: Repr::Buffer(bytes),
        }
    }
}

impl From<Vec<u8>> for Data {
    fn from(bytes: Vec<u8>) -> Self {
        Bytes::from(bytes).into()
    }
}

impl From<&[u8]> for Data {
    fn from(bytes: &[u8]) -> Self {
        Bytes::copy_from_slice(bytes).into()
    }
}

impl PartialEq for Data {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for Data {}

impl fmt::Debug for Data {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.repr {
            Repr::Empty => "empty",
            Repr::Buffer(_) => "buffer",
            Repr::Mapped(_) => "mapped",
        };
        write!(f, "Data({kind}, {} bytes)", self.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty() {
        let data = Data::empty();
        assert!(data.is_empty());
        assert_eq!(data.len(), 0);
        assert!(!data.is_mapped());
        assert_eq!(data, Data::default());
    }

    #[test]
    fn test_from_and_eq() {
        let a = Data::from(vec![1u8, 2, 3]);
        let b = Data::from(&[1u8, 2, 3][..]);
        assert_eq!(a, b);
        assert_eq!(a.as_slice(), &[1, 2, 3]);
        assert_eq!(&*a, &[1, 2, 3]);
        assert_ne!(a, Data::empty());
    }

    #[test]
    fn test_clone_shares_bytes() {
        let a = Data::from(vec![9u8; 1024]);
        let b = a.clone();
        assert_eq!(a, b);
        assert_eq!(b.len(), 1024);
    }
}

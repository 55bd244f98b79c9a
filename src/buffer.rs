//! Immutable, shared views into image data
//!
//! Every node of the tree refers to its bytes through a [`Buffer`]. Views are
//! cheap to clone and never outlive the data, since the storage is shared.
//! Decompressed section payloads get their own storage; a node can tell from
//! [`Buffer::same_storage`] whether it still lives in the original image.

use core::ops::Range;
use std::sync::Arc;

use zerocopy::FromBytes;

#[derive(Clone)]
pub struct Buffer {
    storage: Arc<[u8]>,
    range: Range<usize>,
}

impl Buffer {
    pub fn new(data: Vec<u8>) -> Self {
        let range = 0..data.len();
        Self {
            storage: data.into(),
            range,
        }
    }

    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    /// Start of this view within its underlying storage.
    pub fn start(&self) -> usize {
        self.range.start
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.storage[self.range.clone()]
    }

    /// Sub-view of `size` bytes at `offset`, if it fits.
    pub fn get(&self, offset: usize, size: usize) -> Option<Self> {
        let end = offset.checked_add(size)?;
        if end > self.len() {
            return None;
        }
        Some(Self {
            storage: self.storage.clone(),
            range: self.range.start + offset..self.range.start + end,
        })
    }

    /// Sub-view of up to `size` bytes at `offset`, clamped to the end.
    pub fn mid(&self, offset: usize, size: usize) -> Self {
        let start = offset.min(self.len());
        let end = start.saturating_add(size).min(self.len());
        Self {
            storage: self.storage.clone(),
            range: self.range.start + start..self.range.start + end,
        }
    }

    /// Everything from `offset` to the end.
    pub fn tail(&self, offset: usize) -> Self {
        self.mid(offset, usize::MAX)
    }

    /// Read a plain structure at `offset`.
    pub fn read<T: FromBytes>(&self, offset: usize) -> Option<T> {
        let bytes = self.as_bytes().get(offset..)?;
        T::read_from_prefix(bytes).ok().map(|(v, _)| v)
    }

    pub fn same_storage(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    /// Whether every byte equals `b`.
    pub fn is_uniform(&self, b: u8) -> bool {
        self.as_bytes().iter().all(|&v| v == b)
    }

    pub fn find(&self, needle: &[u8], from: usize) -> Option<usize> {
        let hay = self.as_bytes().get(from..)?;
        if needle.is_empty() || hay.len() < needle.len() {
            return None;
        }
        hay.windows(needle.len())
            .position(|w| w == needle)
            .map(|p| p + from)
    }
}

impl core::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let Range { start, end } = self.range;
        write!(f, "Buffer({start:08x}..{end:08x})")
    }
}

#[test]
fn views_are_bounds_checked() {
    let b = Buffer::new((0u8..32).collect());
    let v = b.get(8, 8).unwrap();
    assert_eq!(v.as_bytes(), &[8, 9, 10, 11, 12, 13, 14, 15]);
    assert_eq!(v.start(), 8);
    assert!(v.get(4, 8).is_none());
    assert_eq!(v.mid(4, 8).len(), 4);
    assert_eq!(v.read::<u32>(0), Some(u32::from_le_bytes([8, 9, 10, 11])));
    assert_eq!(v.read::<u32>(6), None);
    assert!(v.same_storage(&b));
    assert_eq!(b.find(&[20, 21], 0), Some(20));
    assert_eq!(b.find(&[20, 21], 21), None);
}

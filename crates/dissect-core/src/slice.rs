//! Zero-copy byte-slice view.
//!
//! Two ownership modes, distinguishable at the type level:
//!
//! - **Borrowed**: a reborrow of caller-owned memory. Cloning copies the
//!   reference; no refcount exists anywhere.
//! - **Shared**: an atomically refcounted region (`bytes::Bytes`). Cloning
//!   and narrowing are O(1); the last drop frees the allocation.
//!
//! Typed reads past the end return the zero value for the type; sub-slicing
//! saturates instead of panicking. Indexing with `[]` is the one unchecked
//! access and panics out of range.

use crate::simd;
use bytes::Bytes;

#[derive(Debug, Clone)]
enum Repr<'a> {
    Borrowed(&'a [u8]),
    Shared(Bytes),
}

/// Zero-copy view over a contiguous immutable byte region.
#[derive(Debug, Clone)]
pub struct ByteSlice<'a> {
    repr: Repr<'a>,
}

impl Default for ByteSlice<'_> {
    fn default() -> Self {
        Self {
            repr: Repr::Borrowed(&[]),
        }
    }
}

impl<'a> ByteSlice<'a> {
    /// Borrow caller-owned memory. No refcount is created.
    #[inline]
    pub fn borrowed(data: &'a [u8]) -> Self {
        Self {
            repr: Repr::Borrowed(data),
        }
    }

    /// Wrap a refcounted region. Clones share the same allocation.
    #[inline]
    pub fn shared(data: Bytes) -> ByteSlice<'static> {
        ByteSlice {
            repr: Repr::Shared(data),
        }
    }

    /// Copy `data` into a fresh refcounted region.
    #[inline]
    pub fn copy_from(data: &[u8]) -> ByteSlice<'static> {
        ByteSlice::shared(Bytes::copy_from_slice(data))
    }

    /// View over a string's bytes.
    #[inline]
    pub fn from_str(s: &'a str) -> Self {
        Self::borrowed(s.as_bytes())
    }

    /// The underlying bytes.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        match &self.repr {
            Repr::Borrowed(b) => b,
            Repr::Shared(b) => b.as_ref(),
        }
    }

    /// True when this view holds a refcount.
    #[inline]
    pub fn is_shared(&self) -> bool {
        matches!(self.repr, Repr::Shared(_))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Checked byte read.
    #[inline]
    pub fn get(&self, index: usize) -> Option<u8> {
        self.as_bytes().get(index).copied()
    }

    /// True when `len` bytes can be read starting at `offset`.
    #[inline]
    pub fn can_read(&self, len: usize, offset: usize) -> bool {
        offset
            .checked_add(len)
            .map(|end| end <= self.len())
            .unwrap_or(false)
    }

    /// Byte at `offset`, or 0 past the end.
    #[inline]
    pub fn read_u8(&self, offset: usize) -> u8 {
        self.get(offset).unwrap_or(0)
    }

    /// Big-endian u16 at `offset`, or 0 past the end.
    #[inline]
    pub fn read_be16(&self, offset: usize) -> u16 {
        match self.as_bytes().get(offset..offset + 2) {
            Some(b) => u16::from_be_bytes([b[0], b[1]]),
            None => 0,
        }
    }

    /// Big-endian u32 at `offset`, or 0 past the end.
    #[inline]
    pub fn read_be32(&self, offset: usize) -> u32 {
        match self.as_bytes().get(offset..offset + 4) {
            Some(b) => u32::from_be_bytes([b[0], b[1], b[2], b[3]]),
            None => 0,
        }
    }

    /// Big-endian u64 at `offset`, or 0 past the end.
    #[inline]
    pub fn read_be64(&self, offset: usize) -> u64 {
        match self.as_bytes().get(offset..offset + 8) {
            Some(b) => u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]),
            None => 0,
        }
    }

    /// Little-endian u16 at `offset`, or 0 past the end.
    #[inline]
    pub fn read_le16(&self, offset: usize) -> u16 {
        match self.as_bytes().get(offset..offset + 2) {
            Some(b) => u16::from_le_bytes([b[0], b[1]]),
            None => 0,
        }
    }

    /// Little-endian u32 at `offset`, or 0 past the end.
    #[inline]
    pub fn read_le32(&self, offset: usize) -> u32 {
        match self.as_bytes().get(offset..offset + 4) {
            Some(b) => u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            None => 0,
        }
    }

    /// Little-endian u64 at `offset`, or 0 past the end.
    #[inline]
    pub fn read_le64(&self, offset: usize) -> u64 {
        match self.as_bytes().get(offset..offset + 8) {
            Some(b) => u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]),
            None => 0,
        }
    }

    /// Sub-view of up to `len` bytes starting at `offset`.
    ///
    /// Never copies: a borrowed view yields a borrowed sub-view, a shared
    /// view yields a shared sub-view on the same refcount. Out-of-range
    /// bounds saturate to an empty view.
    pub fn slice(&self, offset: usize, len: usize) -> ByteSlice<'a> {
        let total = self.len();
        let start = offset.min(total);
        let end = offset.saturating_add(len).min(total);
        match &self.repr {
            Repr::Borrowed(b) => ByteSlice::borrowed(&b[start..end]),
            Repr::Shared(b) => ByteSlice {
                repr: Repr::Shared(b.slice(start..end)),
            },
        }
    }

    /// Everything from `offset` to the end.
    #[inline]
    pub fn slice_from(&self, offset: usize) -> ByteSlice<'a> {
        self.slice(offset, self.len().saturating_sub(offset))
    }

    /// The first `n` bytes (or fewer, if the view is shorter).
    #[inline]
    pub fn prefix(&self, n: usize) -> ByteSlice<'a> {
        self.slice(0, n)
    }

    /// The last `n` bytes (or fewer, if the view is shorter).
    #[inline]
    pub fn suffix(&self, n: usize) -> ByteSlice<'a> {
        let n = n.min(self.len());
        self.slice(self.len() - n, n)
    }

    /// Shrink the view in place by `n` bytes from the front.
    ///
    /// Returns false (and leaves the view unchanged) when `n` exceeds the
    /// current length.
    pub fn safe_advance(&mut self, n: usize) -> bool {
        if n > self.len() {
            return false;
        }
        *self = self.slice_from(n);
        true
    }

    #[inline]
    pub fn starts_with(&self, prefix: &[u8]) -> bool {
        self.as_bytes().starts_with(prefix)
    }

    #[inline]
    pub fn ends_with(&self, suffix: &[u8]) -> bool {
        self.as_bytes().ends_with(suffix)
    }

    /// Position of the first occurrence of `byte`, SIMD-accelerated.
    #[inline]
    pub fn find_byte(&self, byte: u8) -> Option<usize> {
        simd::find_byte(self.as_bytes(), byte)
    }

    /// Position of the first occurrence of `pattern`.
    ///
    /// One-byte patterns forward to [`find_byte`](Self::find_byte); longer
    /// patterns use a first-byte skip loop.
    #[inline]
    pub fn find(&self, pattern: &[u8]) -> Option<usize> {
        simd::find_pattern(self.as_bytes(), pattern)
    }

    /// Promote this view into a `'static` shared view.
    ///
    /// A shared view is cloned without copying; a borrowed view is copied
    /// into a fresh refcounted region (the one place a copy happens).
    pub fn to_shared(&self) -> ByteSlice<'static> {
        match &self.repr {
            Repr::Borrowed(b) => ByteSlice::copy_from(b),
            Repr::Shared(b) => ByteSlice::shared(b.clone()),
        }
    }

    /// The backing bytes as an owned refcounted handle.
    pub fn to_bytes(&self) -> Bytes {
        match &self.repr {
            Repr::Borrowed(b) => Bytes::copy_from_slice(b),
            Repr::Shared(b) => b.clone(),
        }
    }
}

impl std::ops::Index<usize> for ByteSlice<'_> {
    type Output = u8;

    /// Unchecked access: panics when `index` is out of range.
    #[inline]
    fn index(&self, index: usize) -> &u8 {
        &self.as_bytes()[index]
    }
}

impl<'a> From<&'a [u8]> for ByteSlice<'a> {
    fn from(data: &'a [u8]) -> Self {
        Self::borrowed(data)
    }
}

impl From<Bytes> for ByteSlice<'static> {
    fn from(data: Bytes) -> Self {
        Self::shared(data)
    }
}

impl PartialEq for ByteSlice<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for ByteSlice<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_typed_reads() {
        let data = [0x12u8, 0x34, 0x56, 0x78, 0x9A, 0xBC, 0xDE, 0xF0];
        let s = ByteSlice::borrowed(&data);

        assert_eq!(s.read_u8(0), 0x12);
        assert_eq!(s.read_be16(0), 0x1234);
        assert_eq!(s.read_be32(0), 0x12345678);
        assert_eq!(s.read_be64(0), 0x123456789ABCDEF0);
        assert_eq!(s.read_le16(0), 0x3412);
        assert_eq!(s.read_le32(0), 0x78563412);
    }

    #[test]
    fn test_reads_past_end_are_zero() {
        let data = [0xFFu8; 3];
        let s = ByteSlice::borrowed(&data);

        assert_eq!(s.read_be32(0), 0);
        assert_eq!(s.read_be16(2), 0);
        assert_eq!(s.read_u8(3), 0);
        assert_eq!(s.read_be64(usize::MAX - 2), 0);
    }

    #[test]
    fn test_slice_saturates() {
        let data = [1u8, 2, 3, 4, 5];
        let s = ByteSlice::borrowed(&data);

        assert_eq!(s.slice(1, 3).as_bytes(), &[2, 3, 4]);
        assert_eq!(s.slice(3, 100).as_bytes(), &[4, 5]);
        assert!(s.slice(10, 2).is_empty());
        assert_eq!(s.prefix(2).as_bytes(), &[1, 2]);
        assert_eq!(s.suffix(2).as_bytes(), &[4, 5]);
    }

    #[test]
    fn test_safe_advance() {
        let data = [1u8, 2, 3, 4];
        let mut s = ByteSlice::borrowed(&data);

        assert!(s.safe_advance(2));
        assert_eq!(s.as_bytes(), &[3, 4]);
        assert!(!s.safe_advance(3));
        assert_eq!(s.as_bytes(), &[3, 4]);
        assert!(s.safe_advance(2));
        assert!(s.is_empty());
    }

    #[test]
    fn test_shared_subslice_shares_backing() {
        let s = ByteSlice::copy_from(&[10u8, 20, 30, 40]);
        let sub = s.slice(1, 2);
        assert!(sub.is_shared());
        assert_eq!(sub.as_bytes(), &[20, 30]);

        // Narrowed views of a Bytes region point into the same allocation.
        let base = s.to_bytes();
        let sub_bytes = sub.to_bytes();
        let base_ptr = base.as_ref().as_ptr() as usize;
        let sub_ptr = sub_bytes.as_ref().as_ptr() as usize;
        assert_eq!(sub_ptr, base_ptr + 1);
    }

    #[test]
    fn test_borrowed_never_shared() {
        let data = [1u8, 2, 3];
        let s = ByteSlice::borrowed(&data);
        assert!(!s.is_shared());
        assert!(!s.clone().is_shared());
        assert!(!s.slice(0, 2).is_shared());
    }

    #[test]
    fn test_find() {
        let s = ByteSlice::borrowed(b"GET /index.html HTTP/1.1\r\n");
        assert_eq!(s.find_byte(b'/'), Some(4));
        assert_eq!(s.find(b"HTTP"), Some(16));
        assert_eq!(s.find(b"\r\n"), Some(24));
        assert_eq!(s.find(b"gopher"), None);
    }

    proptest! {
        #[test]
        fn prop_substring_invariance(data in proptest::collection::vec(any::<u8>(), 0..256),
                                     offset in 0usize..300, len in 0usize..300) {
            let s = ByteSlice::borrowed(&data);
            let sub = s.slice(offset, len);
            let expected = len.min(data.len().saturating_sub(offset));
            prop_assert_eq!(sub.len(), expected);
            if expected > 0 {
                prop_assert_eq!(sub.as_bytes(), &data[offset..offset + expected]);
            }
        }
    }
}

//! crates/blocks/src/block.rs
//!
//! Individual block descriptor.

use std::ops::Range;

use crate::digest::BlockDigest;

/// Describes a single block within a [`FileVersion`](crate::FileVersion).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Block {
    index: usize,
    offset: u64,
    size: u32,
    digest: BlockDigest,
}

impl Block {
    /// Creates a new block descriptor.
    #[must_use]
    pub const fn new(index: usize, offset: u64, size: u32, digest: BlockDigest) -> Self {
        Self {
            index,
            offset,
            size,
            digest,
        }
    }

    /// Returns the zero-based position of the block within its file.
    #[inline]
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    /// Returns the byte offset of the block within its file.
    #[inline]
    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    /// Returns the number of bytes covered by the block.
    #[inline]
    #[must_use]
    pub const fn size(&self) -> u32 {
        self.size
    }

    /// Returns the content digest.
    #[inline]
    #[must_use]
    pub const fn digest(&self) -> BlockDigest {
        self.digest
    }

    /// Returns the byte range covered by the block.
    #[inline]
    #[must_use]
    pub const fn range(&self) -> Range<u64> {
        self.offset..self.offset + self.size as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_spans_size_bytes() {
        let block = Block::new(3, 384, 100, BlockDigest::of(b"x"));
        assert_eq!(block.index(), 3);
        assert_eq!(block.range(), 384..484);
    }
}

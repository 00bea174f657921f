//! crates/blocks/src/version.rs
//!
//! Ordered block lists describing one version of a file.

use std::fs::File;
use std::io::{self, Read};
use std::ops::Range;
use std::path::Path;

use rayon::prelude::*;
use thiserror::Error;
#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::block::Block;
use crate::digest::BlockDigest;

/// Block size used when the caller has no format-specific preference.
pub const DEFAULT_BLOCK_SIZE: u32 = 128 * 1024;

/// Minimum number of blocks before hashing fans out across the rayon pool.
const PARALLEL_THRESHOLD: usize = 8;

/// Errors returned when building a [`FileVersion`].
#[derive(Debug, Error)]
pub enum BlockError {
    /// A block size of zero cannot describe any content.
    #[error("block size must be non-zero")]
    ZeroBlockSize,
    /// Underlying I/O failure raised while reading file contents.
    #[error("failed to read input while hashing blocks: {0}")]
    Io(
        #[from]
        #[source]
        io::Error,
    ),
}

/// Ordered sequence of blocks describing either the file on disk or the file
/// being synced to.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FileVersion {
    block_size: u32,
    size: u64,
    blocks: Vec<Block>,
}

impl FileVersion {
    /// Hashes `data` into blocks of `block_size` bytes.
    #[cfg_attr(
        feature = "tracing",
        instrument(skip(data), fields(len = data.len()), name = "hash_blocks")
    )]
    pub fn from_bytes(data: &[u8], block_size: u32) -> Result<Self, BlockError> {
        if block_size == 0 {
            return Err(BlockError::ZeroBlockSize);
        }
        let chunk_len = block_size as usize;
        let hash_chunk = |(index, chunk): (usize, &[u8])| {
            Block::new(
                index,
                index as u64 * u64::from(block_size),
                chunk.len() as u32,
                BlockDigest::of(chunk),
            )
        };

        let blocks: Vec<Block> = if data.len() / chunk_len >= PARALLEL_THRESHOLD {
            data.par_chunks(chunk_len).enumerate().map(hash_chunk).collect()
        } else {
            data.chunks(chunk_len).enumerate().map(hash_chunk).collect()
        };

        Ok(Self {
            block_size,
            size: data.len() as u64,
            blocks,
        })
    }

    /// Hashes everything `reader` yields, one block at a time.
    pub fn from_reader<R: Read>(mut reader: R, block_size: u32) -> Result<Self, BlockError> {
        if block_size == 0 {
            return Err(BlockError::ZeroBlockSize);
        }
        let mut buffer = vec![0u8; block_size as usize];
        let mut blocks = Vec::new();
        let mut offset = 0u64;

        loop {
            let filled = read_full(&mut reader, &mut buffer)?;
            if filled == 0 {
                break;
            }
            let chunk = &buffer[..filled];
            blocks.push(Block::new(
                blocks.len(),
                offset,
                filled as u32,
                BlockDigest::of(chunk),
            ));
            offset += filled as u64;
            if filled < buffer.len() {
                break;
            }
        }

        Ok(Self {
            block_size,
            size: offset,
            blocks,
        })
    }

    /// Opens and hashes the file at `path`.
    pub fn from_path(path: &Path, block_size: u32) -> Result<Self, BlockError> {
        let file = File::open(path)?;
        Self::from_reader(io::BufReader::new(file), block_size)
    }

    /// Builds a version from precomputed digests.
    ///
    /// Every block is `block_size` bytes except the last, which covers the
    /// remainder of `size`.
    pub fn from_digests(
        digests: &[BlockDigest],
        block_size: u32,
        size: u64,
    ) -> Result<Self, BlockError> {
        if block_size == 0 {
            return Err(BlockError::ZeroBlockSize);
        }
        let block_len = u64::from(block_size);
        let blocks = digests
            .iter()
            .enumerate()
            .map(|(index, digest)| {
                let offset = index as u64 * block_len;
                let len = size.saturating_sub(offset).min(block_len);
                Block::new(index, offset, len as u32, *digest)
            })
            .collect();
        Ok(Self {
            block_size,
            size,
            blocks,
        })
    }

    /// Returns the nominal block size.
    #[inline]
    #[must_use]
    pub const fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Returns the total file length in bytes.
    #[inline]
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Returns the blocks in file order.
    #[inline]
    #[must_use]
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Returns the number of blocks.
    #[inline]
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Returns the block at `index`, if any.
    #[must_use]
    pub fn block(&self, index: usize) -> Option<&Block> {
        self.blocks.get(index)
    }

    /// Returns the digests in file order.
    #[must_use]
    pub fn digests(&self) -> Vec<BlockDigest> {
        self.blocks.iter().map(Block::digest).collect()
    }

    /// Returns the byte range of block `index` under this version's layout,
    /// or `None` when the index is past the end.
    #[must_use]
    pub fn block_range(&self, index: usize) -> Option<Range<u64>> {
        self.blocks.get(index).map(Block::range)
    }
}

fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_block_size_is_rejected() {
        assert!(matches!(
            FileVersion::from_bytes(b"abc", 0),
            Err(BlockError::ZeroBlockSize)
        ));
        assert!(matches!(
            FileVersion::from_reader(&b"abc"[..], 0),
            Err(BlockError::ZeroBlockSize)
        ));
    }

    #[test]
    fn empty_input_has_no_blocks() {
        let version = FileVersion::from_bytes(b"", 4).expect("hash");
        assert_eq!(version.block_count(), 0);
        assert_eq!(version.size(), 0);
    }

    #[test]
    fn last_block_may_be_short() {
        let version = FileVersion::from_bytes(b"abcdefghij", 4).expect("hash");
        assert_eq!(version.block_count(), 3);
        assert_eq!(version.blocks()[2].size(), 2);
        assert_eq!(version.blocks()[2].offset(), 8);
        assert_eq!(version.block_range(2), Some(8..10));
        assert_eq!(version.block_range(3), None);
    }

    #[test]
    fn reader_and_bytes_agree() {
        let data: Vec<u8> = (0..1000u32).map(|v| (v % 251) as u8).collect();
        let from_bytes = FileVersion::from_bytes(&data, 64).expect("bytes");
        let from_reader = FileVersion::from_reader(&data[..], 64).expect("reader");
        assert_eq!(from_bytes, from_reader);
    }

    #[test]
    fn parallel_path_keeps_order() {
        let data: Vec<u8> = (0..64 * 40u32).map(|v| (v / 64) as u8).collect();
        let version = FileVersion::from_bytes(&data, 64).expect("hash");
        assert_eq!(version.block_count(), 40);
        for (index, block) in version.blocks().iter().enumerate() {
            assert_eq!(block.index(), index);
            assert!(block.digest().matches(&[index as u8; 64]));
        }
    }

    #[test]
    fn from_digests_reconstructs_layout() {
        let original = FileVersion::from_bytes(b"abcdefghij", 4).expect("hash");
        let rebuilt =
            FileVersion::from_digests(&original.digests(), 4, original.size()).expect("rebuild");
        assert_eq!(rebuilt, original);
    }
}

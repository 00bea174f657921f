//! Boundary to the content-addressable block index.
//!
//! The index maps a block digest to every known location of that block across
//! folders. The planner consumes lookups lazily and stops at the first usable
//! match, so implementations should avoid materializing every hit up front.

use std::io;

use blocks::{BlockDigest, FileVersion};
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::key::{FileKey, FolderId};

/// A block of a known file.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BlockLocation {
    /// File holding the block.
    pub file: FileKey,
    /// Block index within that file.
    pub index: usize,
    /// Byte offset of the block within that file.
    pub offset: u64,
    /// Length of the block in bytes.
    pub len: u32,
}

/// Errors surfaced by a block index query.
#[derive(Debug, Error)]
pub enum IndexError {
    /// The index backend could not be read.
    #[error("block index unavailable: {0}")]
    Unavailable(String),
    /// I/O failure inside the index backend.
    #[error("block index I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Content-hash lookup across known files.
pub trait BlockIndex: Send + Sync {
    /// Returns the locations of `digest` in files whose folder is one of
    /// `candidates`.
    ///
    /// The sequence is finite. Calling `lookup` again restarts it.
    fn lookup<'a>(
        &'a self,
        digest: &BlockDigest,
        candidates: &'a [FolderId],
    ) -> Box<dyn Iterator<Item = Result<BlockLocation, IndexError>> + 'a>;
}

/// In-memory [`BlockIndex`] keyed by digest.
#[derive(Debug, Default)]
pub struct MemoryBlockIndex {
    by_digest: FxHashMap<BlockDigest, Vec<BlockLocation>>,
    by_file: FxHashMap<FileKey, Vec<BlockDigest>>,
}

impl MemoryBlockIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Indexes every block of `version` under `key`, replacing any previous
    /// entry for the same file.
    pub fn insert_file(&mut self, key: FileKey, version: &FileVersion) {
        self.remove_file(&key);
        for block in version.blocks() {
            self.by_digest
                .entry(block.digest())
                .or_default()
                .push(BlockLocation {
                    file: key.clone(),
                    index: block.index(),
                    offset: block.offset(),
                    len: block.size(),
                });
        }
        self.by_file.insert(key, version.digests());
    }

    /// Drops every entry for `key`.
    pub fn remove_file(&mut self, key: &FileKey) {
        let Some(digests) = self.by_file.remove(key) else {
            return;
        };
        for digest in digests {
            if let Some(locations) = self.by_digest.get_mut(&digest) {
                locations.retain(|location| &location.file != key);
                if locations.is_empty() {
                    self.by_digest.remove(&digest);
                }
            }
        }
    }

    /// Returns the number of indexed files.
    #[must_use]
    pub fn file_count(&self) -> usize {
        self.by_file.len()
    }
}

impl BlockIndex for MemoryBlockIndex {
    fn lookup<'a>(
        &'a self,
        digest: &BlockDigest,
        candidates: &'a [FolderId],
    ) -> Box<dyn Iterator<Item = Result<BlockLocation, IndexError>> + 'a> {
        let locations = self.by_digest.get(digest).map_or(&[][..], Vec::as_slice);
        Box::new(
            locations
                .iter()
                .filter(move |location| candidates.contains(location.file.folder()))
                .cloned()
                .map(Ok),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(data: &[u8]) -> FileVersion {
        FileVersion::from_bytes(data, 2).expect("hash")
    }

    #[test]
    fn lookup_filters_by_candidate_folder() {
        let mut index = MemoryBlockIndex::new();
        index.insert_file(FileKey::new("a", "one"), &version(b"xxyy"));
        index.insert_file(FileKey::new("b", "two"), &version(b"yyzz"));

        let yy = BlockDigest::of(b"yy");
        let only_b = [FolderId::new("b")];
        let hits: Vec<_> = index
            .lookup(&yy, &only_b)
            .map(|hit| hit.expect("hit"))
            .collect();
        assert_eq!(
            hits,
            [BlockLocation {
                file: FileKey::new("b", "two"),
                index: 0,
                offset: 0,
                len: 2,
            }]
        );

        let both = [FolderId::new("a"), FolderId::new("b")];
        assert_eq!(index.lookup(&yy, &both).count(), 2);
        assert_eq!(index.lookup(&yy, &[]).count(), 0);
    }

    #[test]
    fn locations_carry_the_source_layout() {
        let mut index = MemoryBlockIndex::new();
        let key = FileKey::new("a", "one");
        index.insert_file(key.clone(), &FileVersion::from_bytes(b"xxxyz", 3).expect("hash"));

        let folders = [FolderId::new("a")];
        let hit = index
            .lookup(&BlockDigest::of(b"yz"), &folders)
            .next()
            .expect("hit")
            .expect("location");
        assert_eq!(hit.index, 1);
        assert_eq!(hit.offset, 3);
        assert_eq!(hit.len, 2);
    }

    #[test]
    fn reinserting_replaces_previous_blocks() {
        let mut index = MemoryBlockIndex::new();
        let key = FileKey::new("a", "one");
        index.insert_file(key.clone(), &version(b"xxyy"));
        index.insert_file(key.clone(), &version(b"zz"));

        let folders = [FolderId::new("a")];
        assert_eq!(index.lookup(&BlockDigest::of(b"xx"), &folders).count(), 0);
        assert_eq!(index.lookup(&BlockDigest::of(b"zz"), &folders).count(), 1);

        index.remove_file(&key);
        assert_eq!(index.file_count(), 0);
        assert_eq!(index.lookup(&BlockDigest::of(b"zz"), &folders).count(), 0);
    }
}

//! Delta plans: the commands that turn the current blocks into the target.
//!
//! A [`DeltaPlan`] assigns every target block index to exactly one of three
//! command lists:
//!
//! - [`LocalCopy`]: the block already exists in the file being patched;
//! - [`ExternalCopy`]: the block exists in another known file;
//! - [`PullCommand`]: the block must be fetched from a peer.
//!
//! Local copies read from and write to the same file, so their order
//! matters. See [`graph`] for how it is computed.

pub mod graph;
mod planner;

use std::collections::{BTreeMap, BTreeSet};

use blocks::{BlockDigest, FileVersion};
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::key::FileKey;
use crate::lock::LockSet;

pub use planner::Planner;

/// Copy of block `source` to block `dest` within the file being patched.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LocalCopy {
    /// Block index in the current layout.
    pub source: usize,
    /// Block index in the target layout.
    pub dest: usize,
    /// Read the source from the scratch area instead of the live file.
    pub from_scratch: bool,
}

impl LocalCopy {
    /// A copy onto the same index; it changes nothing and performs no I/O.
    #[must_use]
    pub const fn is_identity(&self) -> bool {
        self.source == self.dest
    }
}

/// Copy of block `source` of another file to block `dest`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExternalCopy {
    /// File providing the data.
    pub source_file: FileKey,
    /// Block index in the source file.
    pub source: usize,
    /// Byte offset of the block in the source file.
    pub offset: u64,
    /// Block index in the target layout.
    pub dest: usize,
}

/// Block that has to be fetched from a peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PullCommand {
    /// Digest of the wanted block.
    pub digest: BlockDigest,
    /// Block index in the target layout.
    pub dest: usize,
}

/// Current block preserved in the scratch area before patching.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StagedBlock {
    /// Block index in the current layout.
    pub index: usize,
    /// Length of the block.
    pub len: u32,
    /// Digest the staged bytes must have.
    pub digest: BlockDigest,
}

/// Executable patch for one file.
#[derive(Clone, Debug)]
pub struct DeltaPlan {
    key: FileKey,
    current: FileVersion,
    target: FileVersion,
    copies: Vec<LocalCopy>,
    external: Vec<ExternalCopy>,
    pulls: Vec<PullCommand>,
    staged: Vec<StagedBlock>,
}

/// Broken plan invariant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanViolation {
    /// A target index has no command.
    #[error("destination block {0} has no command")]
    MissingDestination(usize),
    /// A target index has more than one command.
    #[error("destination block {0} is written by more than one command")]
    DuplicateDestination(usize),
    /// A command writes past the target.
    #[error("destination block {dest} is outside the {len}-block target")]
    OutOfRange {
        /// Offending index.
        dest: usize,
        /// Target block count.
        len: usize,
    },
    /// A copy reads a block after another copy overwrote it.
    #[error("copy {reader_source}->{reader_dest} runs after its source is overwritten")]
    ReadAfterOverwrite {
        /// Source of the stale read.
        reader_source: usize,
        /// Destination of the stale read.
        reader_dest: usize,
    },
    /// A copy reads from scratch but its source is not staged.
    #[error("copy from block {0} reads scratch but the block is not staged")]
    UnstagedScratchRead(usize),
}

impl DeltaPlan {
    pub(crate) fn new(
        key: FileKey,
        current: FileVersion,
        target: FileVersion,
        copies: Vec<LocalCopy>,
        external: Vec<ExternalCopy>,
        pulls: Vec<PullCommand>,
        staged: Vec<StagedBlock>,
    ) -> Self {
        Self {
            key,
            current,
            target,
            copies,
            external,
            pulls,
            staged,
        }
    }

    /// Returns the file being patched.
    #[must_use]
    pub const fn key(&self) -> &FileKey {
        &self.key
    }

    /// Returns the version the plan was computed against.
    #[must_use]
    pub const fn current(&self) -> &FileVersion {
        &self.current
    }

    /// Returns the version the plan produces.
    #[must_use]
    pub const fn target(&self) -> &FileVersion {
        &self.target
    }

    /// Returns the block size shared by both versions.
    #[must_use]
    pub const fn block_size(&self) -> u32 {
        self.target.block_size()
    }

    /// Returns the intra-file copies in execution order.
    #[must_use]
    pub fn copies(&self) -> &[LocalCopy] {
        &self.copies
    }

    /// Returns the external copies.
    #[must_use]
    pub fn external(&self) -> &[ExternalCopy] {
        &self.external
    }

    /// Returns the pull commands.
    #[must_use]
    pub fn pulls(&self) -> &[PullCommand] {
        &self.pulls
    }

    /// Returns the current blocks preserved in scratch, ascending by index.
    #[must_use]
    pub fn staged(&self) -> &[StagedBlock] {
        &self.staged
    }

    /// Returns the number of bytes the scratch area will hold.
    #[must_use]
    pub fn staged_bytes(&self) -> u64 {
        self.staged.iter().map(|block| u64::from(block.len)).sum()
    }

    /// Returns the number of copies that read their source from scratch.
    #[must_use]
    pub fn scratch_reads(&self) -> usize {
        self.copies.iter().filter(|copy| copy.from_scratch).count()
    }

    /// Returns the locks the plan needs: the destination exclusively and
    /// every external source shared.
    #[must_use]
    pub fn lock_set(&self) -> LockSet {
        let mut set = LockSet::new();
        set.exclusive(self.key.clone());
        for copy in &self.external {
            set.shared(copy.source_file.clone());
        }
        set
    }

    /// Groups external copies by source file, in lock order.
    #[must_use]
    pub fn external_by_file(&self) -> Vec<(&FileKey, Vec<&ExternalCopy>)> {
        let mut grouped: BTreeMap<&FileKey, Vec<&ExternalCopy>> = BTreeMap::new();
        for copy in &self.external {
            grouped.entry(&copy.source_file).or_default().push(copy);
        }
        grouped.into_iter().collect()
    }

    /// Turns the external copies writing `dests` into pulls of the target
    /// block, keeping the pull list ordered by destination.
    pub fn demote_to_pulls(&mut self, dests: &[usize]) {
        let target = &self.target;
        let (demoted, kept) = self
            .external
            .drain(..)
            .partition::<Vec<_>, _>(|copy| dests.contains(&copy.dest));
        self.external = kept;
        self.pulls.extend(demoted.into_iter().filter_map(|copy| {
            target.block(copy.dest).map(|block| PullCommand {
                digest: block.digest(),
                dest: copy.dest,
            })
        }));
        self.pulls.sort_by_key(|pull| pull.dest);
    }

    /// Checks that every target index is written by exactly one command.
    pub fn destinations_partition(&self) -> Result<(), PlanViolation> {
        let len = self.target.block_count();
        let mut seen = vec![false; len];
        let dests = self
            .copies
            .iter()
            .map(|copy| copy.dest)
            .chain(self.external.iter().map(|copy| copy.dest))
            .chain(self.pulls.iter().map(|pull| pull.dest));
        for dest in dests {
            let slot = seen
                .get_mut(dest)
                .ok_or(PlanViolation::OutOfRange { dest, len })?;
            if std::mem::replace(slot, true) {
                return Err(PlanViolation::DuplicateDestination(dest));
            }
        }
        match seen.iter().position(|written| !written) {
            Some(missing) => Err(PlanViolation::MissingDestination(missing)),
            None => Ok(()),
        }
    }

    /// Checks that every live read of a local copy happens before the copy
    /// that overwrites its source, and that scratch reads are staged.
    pub fn check_ordering(&self) -> Result<(), PlanViolation> {
        let staged: BTreeSet<usize> = self.staged.iter().map(|block| block.index).collect();
        let position_of_writer: FxHashMap<usize, usize> = self
            .copies
            .iter()
            .enumerate()
            .filter(|(_, copy)| !copy.is_identity())
            .map(|(position, copy)| (copy.dest, position))
            .collect();

        for (position, copy) in self.copies.iter().enumerate() {
            if copy.is_identity() {
                continue;
            }
            if copy.from_scratch {
                if !staged.contains(&copy.source) {
                    return Err(PlanViolation::UnstagedScratchRead(copy.source));
                }
                continue;
            }
            if let Some(&writer) = position_of_writer.get(&copy.source)
                && writer < position
            {
                return Err(PlanViolation::ReadAfterOverwrite {
                    reader_source: copy.source,
                    reader_dest: copy.dest,
                });
            }
        }
        Ok(())
    }
}
